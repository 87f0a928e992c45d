//! Shared helpers for bbs-common integration tests.

#![allow(dead_code)]

pub mod fixtures;
pub mod logging;

pub use logging::init_test_logging;
