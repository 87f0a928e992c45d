//! End-to-end flows through the public bbs-common API.

#[path = "../common/mod.rs"]
mod common;

mod discovery_tests;
mod webhook_flow_tests;
