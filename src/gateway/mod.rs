// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote policy gateway.
//!
//! Typed read/write operations against one tenant's policy objects. The
//! engine only talks to tenants through the [`PolicyGateway`] trait and
//! obtains gateways through a [`TenantConnector`], so the HTTP client can be
//! replaced by [`InMemoryGateway`] for tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use policy_replication::gateway::{PolicyGateway, BoxFuture};
//! use policy_replication::model::*;
//!
//! struct ReadOnly;
//!
//! impl PolicyGateway for ReadOnly {
//!     fn tenant_id(&self) -> &str { "SUB1" }
//!     fn list_firewall_rules(&self) -> BoxFuture<'_, Vec<PolicyRule>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!     // ... remaining operations
//! #   fn create_firewall_rule<'a>(&'a self, _r: &'a PolicyRule) -> BoxFuture<'a, i64> { Box::pin(async move { Ok(0) }) }
//! #   fn activate_pending_changes(&self) -> BoxFuture<'_, ()> { Box::pin(async move { Ok(()) }) }
//! #   fn list_network_services(&self) -> BoxFuture<'_, Vec<ReferenceEntity>> { Box::pin(async move { Ok(vec![]) }) }
//! #   fn list_rule_labels(&self) -> BoxFuture<'_, Vec<ReferenceEntity>> { Box::pin(async move { Ok(vec![]) }) }
//! #   fn create_rule_label<'a>(&'a self, n: &'a str, _d: &'a str) -> BoxFuture<'a, ReferenceEntity> { Box::pin(async move { Ok(ReferenceEntity::new(1, n)) }) }
//! #   fn list_blocked_urls(&self) -> BoxFuture<'_, Vec<String>> { Box::pin(async move { Ok(vec![]) }) }
//! #   fn apply_blocked_urls<'a>(&'a self, _u: &'a [String]) -> BoxFuture<'a, ()> { Box::pin(async move { Ok(()) }) }
//! #   fn request_audit_report<'a>(&'a self, _s: i64, e: i64, _a: &'a [String]) -> BoxFuture<'a, ReportHandle> { Box::pin(async move { Ok(ReportHandle { tenant_id: "SUB1".into(), requested_at: e }) }) }
//! #   fn poll_audit_report<'a>(&'a self, _h: &'a ReportHandle) -> BoxFuture<'a, AuditReportStatus> { Box::pin(async move { Ok(AuditReportStatus::Complete) }) }
//! #   fn download_audit_report<'a>(&'a self, _h: &'a ReportHandle) -> BoxFuture<'a, String> { Box::pin(async move { Ok(String::new()) }) }
//! }
//! ```

mod http;
mod memory;

pub use http::{HttpConnector, HttpPolicyGateway};
pub use memory::{InMemoryConnector, InMemoryGateway};

use crate::config::TenantConfig;
use crate::error::Result;
use crate::model::{AuditReportStatus, PolicyRule, ReferenceEntity, ReportHandle};
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Operations the engine needs from one authenticated tenant session.
///
/// Writes are staged by the remote platform and only take effect after
/// [`activate_pending_changes`](Self::activate_pending_changes).
pub trait PolicyGateway: Send + Sync {
    /// Tenant this gateway is bound to (config section name).
    fn tenant_id(&self) -> &str;

    /// Firewall filtering rules in evaluation order.
    fn list_firewall_rules(&self) -> BoxFuture<'_, Vec<PolicyRule>>;

    /// Create a rule and return its new tenant-local id.
    ///
    /// A refusal by the platform is returned as
    /// [`ReplicationError::RemoteRejected`](crate::ReplicationError::RemoteRejected).
    fn create_firewall_rule<'a>(&'a self, rule: &'a PolicyRule) -> BoxFuture<'a, i64>;

    /// Commit staged changes.
    fn activate_pending_changes(&self) -> BoxFuture<'_, ()>;

    /// Network service catalog.
    fn list_network_services(&self) -> BoxFuture<'_, Vec<ReferenceEntity>>;

    /// Rule label catalog.
    fn list_rule_labels(&self) -> BoxFuture<'_, Vec<ReferenceEntity>>;

    /// Create a rule label.
    fn create_rule_label<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> BoxFuture<'a, ReferenceEntity>;

    /// URL block list entries.
    fn list_blocked_urls(&self) -> BoxFuture<'_, Vec<String>>;

    /// Replace the URL block list.
    fn apply_blocked_urls<'a>(&'a self, urls: &'a [String]) -> BoxFuture<'a, ()>;

    /// Ask the platform to generate an audit report for `[start_ms, end_ms]`.
    fn request_audit_report<'a>(
        &'a self,
        start_ms: i64,
        end_ms: i64,
        action_types: &'a [String],
    ) -> BoxFuture<'a, ReportHandle>;

    /// Generation status of a requested report.
    fn poll_audit_report<'a>(&'a self, handle: &'a ReportHandle) -> BoxFuture<'a, AuditReportStatus>;

    /// Raw CSV export of a completed report.
    fn download_audit_report<'a>(&'a self, handle: &'a ReportHandle) -> BoxFuture<'a, String>;
}

/// Opens a gateway for a tenant (authenticating as needed).
pub trait TenantConnector: Send + Sync + 'static {
    type Gateway: PolicyGateway;

    fn connect<'a>(&'a self, tenant: &'a TenantConfig) -> BoxFuture<'a, Self::Gateway>;
}
