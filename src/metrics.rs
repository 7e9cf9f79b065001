//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Sync cycle outcomes and duration
//! - Change detection (audit report polling)
//! - Per-child rule application (created, rejected, skipped)
//! - Reference remapping drops
//! - Snapshot store writes, retries and archival
//!
//! No exporter is installed here; the binary (or an embedding daemon) picks
//! one. Without a recorder every call is a no-op.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use policy_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_rule_applied("SUB1", "created");
//! metrics::record_child_sync("SUB1", true, Duration::from_secs(4));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Init" => 0.0,
        "Polling" => 1.0,
        "Syncing" => 2.0,
        "Waiting" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}

/// Number of configured child tenants.
pub fn set_children_configured(count: usize) {
    gauge!("replication_children_configured").set(count as f64);
}

/// Record a completed sync cycle.
///
/// `outcome` is one of `synced`, `unchanged`, `failed`.
pub fn record_cycle(outcome: &str, duration: Duration) {
    counter!("replication_cycles_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("replication_cycle_duration_seconds").record(duration.as_secs_f64());
}

/// Record the change detector verdict.
pub fn record_change_detected(changed: bool) {
    let result = if changed { "changed" } else { "unchanged" };
    counter!("replication_change_checks_total", "result" => result).increment(1);
}

/// Record how long an audit report took to generate.
pub fn record_audit_report(tenant_id: &str, polls: u32, duration: Duration, status: &str) {
    counter!(
        "replication_audit_reports_total",
        "tenant_id" => tenant_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("replication_audit_report_polls", "tenant_id" => tenant_id.to_string())
        .record(polls as f64);
    histogram!("replication_audit_report_duration_seconds", "tenant_id" => tenant_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a remote gateway request.
pub fn record_gateway_request(tenant_id: &str, operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_gateway_requests_total",
        "tenant_id" => tenant_id.to_string(),
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "replication_gateway_request_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a tenant session attempt.
pub fn record_session(tenant_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_sessions_total", "tenant_id" => tenant_id.to_string(), "status" => status)
        .increment(1);
}

/// Record a rule write outcome (`created`, `rejected`).
pub fn record_rule_applied(tenant_id: &str, outcome: &str) {
    counter!(
        "replication_rules_applied_total",
        "tenant_id" => tenant_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a parent rule that was not written to a child.
///
/// `reason` is one of `exists`, `platform_managed`, `unresolved_reference`.
pub fn record_rule_skipped(tenant_id: &str, reason: &str) {
    counter!(
        "replication_rules_skipped_total",
        "tenant_id" => tenant_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a reference removed during transformation.
pub fn record_reference_dropped(tenant_id: &str, kind: &str) {
    counter!(
        "replication_references_dropped_total",
        "tenant_id" => tenant_id.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record recognized labels created on a child.
pub fn record_labels_created(tenant_id: &str, count: usize) {
    counter!("replication_labels_created_total", "tenant_id" => tenant_id.to_string())
        .increment(count as u64);
}

/// Record URL block list entries added to a child.
pub fn record_blocklist_merge(tenant_id: &str, added: usize) {
    counter!("replication_blocklist_urls_added_total", "tenant_id" => tenant_id.to_string())
        .increment(added as u64);
}

/// Record an activation of staged changes.
pub fn record_activation(tenant_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_activations_total", "tenant_id" => tenant_id.to_string(), "status" => status)
        .increment(1);
}

/// Record a per-child sync outcome.
pub fn record_child_sync(tenant_id: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_child_syncs_total", "tenant_id" => tenant_id.to_string(), "status" => status)
        .increment(1);
    histogram!("replication_child_sync_duration_seconds", "tenant_id" => tenant_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a snapshot write.
pub fn record_snapshot_written(tenant_id: &str, kind: &str, entries: usize) {
    counter!(
        "replication_snapshots_written_total",
        "tenant_id" => tenant_id.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
    histogram!("replication_snapshot_entries", "kind" => kind.to_string()).record(entries as f64);
}

/// Record snapshot store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("replication_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a colliding store moved to the archive.
pub fn record_store_archived() {
    counter!("replication_store_archives_total").increment(1);
}
