//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - A wiremock-backed tenant speaking the platform's HTTP API
//! - A connector wrapper that fails the first N connects per tenant
//! - Rule and config fixtures

pub mod flaky_connector;
pub mod mock_platform;

pub use flaky_connector::*;
pub use mock_platform::*;
