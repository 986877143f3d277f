//! ferroxfer integration test support
//!
//! This crate hosts the end-to-end tests and transfer benchmarks for the
//! ferroxfer crates together with the doubles they share.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Control connection double
pub mod control;

/// Loopback peers
pub mod peer;

/// Unified test utilities
///
/// This module provides common utilities used across all test files
/// to ensure consistency and reduce code duplication.
pub mod test_utils;

pub use control::TestControl;
pub use test_utils::{create_test_file, generate_test_data, init_tracing, TestDataPattern};
