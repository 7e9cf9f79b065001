// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for policy replication.
//!
//! Errors are categorized by where they surface (remote gateway, audit
//! report, snapshot store, configuration) and carry the tenant and rule
//! context needed to diagnose a failure from the logs alone.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Description |
//! |------------|-----------|-------|-------------|
//! | `Gateway` | Yes | No | Transport failure, unexpected HTTP status, auth failure |
//! | `RemoteRejected` | No | No | Remote refused a single write (`code` + `message`) |
//! | `AuditReport` | No | Yes | Audit report generation errored |
//! | `ReportTimeout` | No | Yes | Audit report never reached a terminal state |
//! | `SnapshotStore` | Yes (busy only) | No | SQLite errors |
//! | `StoreCollision` | No | No | Pre-existing store with an incompatible layout |
//! | `BootstrapExhausted` | No | Yes | Store bootstrap kept colliding |
//! | `Serialization` | No | No | JSON encode/decode failure |
//! | `Io` | No | No | Local filesystem failure |
//! | `Config` | No | Yes | Configuration invalid |
//! | `InvalidState` | No | No | Engine state machine violation |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! # Child Isolation
//!
//! Only fatal errors stop the daemon. Everything else that happens while
//! syncing a child tenant is logged against that child and the cycle moves
//! on to the next one.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Remote gateway transport or protocol error.
    ///
    /// Covers connection failures, timeouts, non-success HTTP statuses
    /// and failed session authentication.
    #[error("Gateway error ({tenant}, {operation}): {message}")]
    Gateway {
        tenant: String,
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The remote platform rejected a write with an error code.
    ///
    /// Recovered locally: the offending rule is skipped.
    #[error("Remote rejected write on {tenant}: {code}: {message}")]
    RemoteRejected {
        tenant: String,
        code: String,
        message: String,
    },

    /// Audit report reached the ERRORED terminal state.
    ///
    /// Fatal: change detection can no longer be trusted.
    #[error("Audit report failed for {tenant}: {message}")]
    AuditReport { tenant: String, message: String },

    /// Audit report did not reach a terminal state in time.
    #[error("Audit report for {tenant} not ready after {waited:?}")]
    ReportTimeout { tenant: String, waited: Duration },

    /// SQLite error in the snapshot store.
    #[error("Snapshot store error: {0}")]
    SnapshotStore(#[from] sqlx::Error),

    /// The store file exists but was not created by this engine.
    #[error("Snapshot store collision: {0}")]
    StoreCollision(String),

    /// Store bootstrap collided more times than allowed.
    #[error("Snapshot store bootstrap failed for {path} after {attempts} attempts")]
    BootstrapExhausted { path: String, attempts: u32 },

    /// JSON serialization failure (payloads, remote bodies).
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a gateway error from a reqwest error.
    pub fn gateway(
        tenant: impl Into<String>,
        operation: impl Into<String>,
        source: reqwest::Error,
    ) -> Self {
        Self::Gateway {
            tenant: tenant.into(),
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a gateway error without source.
    pub fn gateway_msg(
        tenant: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Gateway {
            tenant: tenant.into(),
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway { .. } => true,
            Self::SnapshotStore(e) => crate::store::is_sqlite_busy_error(e),
            Self::RemoteRejected { .. } => false, // Same payload, same answer
            Self::AuditReport { .. } => false,
            Self::ReportTimeout { .. } => false,
            Self::StoreCollision(_) => false,
            Self::BootstrapExhausted { .. } => false,
            Self::Serialization(_) => false,
            Self::Io(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error must stop the daemon.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuditReport { .. }
                | Self::ReportTimeout { .. }
                | Self::BootstrapExhausted { .. }
                | Self::Config(_)
        )
    }
}
