//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `popmq` application.
//!
//! It centralizes the error types and logging setup so every layer reports
//! failures and events the same way.

pub mod error;
pub mod logging;

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
