// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Policy Replication
//!
//! One-way replication of firewall filtering policy from a parent tenant to
//! any number of child tenants on a cloud security platform.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          policy-replication                               │
//! │                                                                           │
//! │  ┌────────────────┐   ┌────────────────┐   ┌───────────────────────────┐  │
//! │  │ ChangeDetector │──►│ SnapshotStore  │──►│ ChildSync (per child)     │  │
//! │  │ (audit log)    │   │ (SQLite)       │   │ transform, create, merge  │  │
//! │  └────────────────┘   └────────────────┘   └───────────────────────────┘  │
//! │          ▲                                              │                 │
//! │          │                                              ▼                 │
//! │  ┌────────────────┐                          ┌─────────────────────────┐  │
//! │  │ PARENT gateway │                          │ SUB* gateways           │  │
//! │  └────────────────┘                          └─────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cycle
//!
//! 1. **Detect**: count parent audit-log entries in the recent window
//! 2. **Snapshot**: on change (or first run) record the parent's rules and
//!    URL block list
//! 3. **Replicate**: remap each rule onto the child's own ids, create the
//!    missing ones, merge the block list, activate
//!
//! Replication is additive: nothing the child already has is modified or
//! removed.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use policy_replication::{ReplicationConfig, ReplicationEngine};
//!
//! #[tokio::main]
//! async fn main() -> policy_replication::Result<()> {
//!     let config = ReplicationConfig::load("config.toml")?;
//!     let mut engine = ReplicationEngine::new(config);
//!
//!     let shutdown = engine.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!
//!     // Runs until shutdown or a fatal error
//!     engine.run().await
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod detector;
pub mod diff;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod resilience;
pub mod session;
pub mod store;
pub mod transform;

// Re-exports for convenience
pub use config::{
    DetectorConfig, ReplicationConfig, ReplicationSettings, StoreConfig, TenantConfig,
    TransformConfig, UnresolvedReferencePolicy,
};
pub use coordinator::{
    ChildOutcome, ChildReport, CycleReport, EngineState, ReplicationEngine, ShutdownHandle,
};
pub use detector::ChangeDetector;
pub use error::{ReplicationError, Result};
pub use gateway::{
    HttpConnector, HttpPolicyGateway, InMemoryConnector, InMemoryGateway, PolicyGateway,
    TenantConnector,
};
pub use model::{PolicyRule, Snapshot, SnapshotKind, SnapshotPayload};
pub use store::SnapshotStore;
pub use transform::RuleTransformer;
