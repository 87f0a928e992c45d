//! Error catalog and definitions for the branch source
//!
//! This module provides an error catalog with unique error codes,
//! categorized by subsystem. Each error includes remediation steps.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                          |
//! |------------|-------------|--------------------------------------|
//! | E001-E099  | Config      | Configuration and setup errors       |
//! | E100-E199  | Webhook     | Webhook ingestion and authentication |
//! | E200-E299  | Host        | Repository host API failures         |
//! | E300-E399  | Discovery   | Scan and reconciliation errors       |
//! | E400-E499  | Remote      | Clone endpoint resolution errors     |
//! | E500-E599  | Internal    | Internal/unexpected errors           |

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};
