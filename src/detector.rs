// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Audit-log change detection.
//!
//! Answers "did anyone create or update policy on this tenant recently?" by
//! asking the platform for an audit report over a trailing window and
//! counting its data rows.
//!
//! When the caller passes the start of its previous detection, the window
//! is widened back to that start minus the configured window, so edits made
//! during a long or failed cycle are still seen on the next one.
//!
//! # Report Lifecycle
//!
//! ```text
//! request(window) ──► poll ──► PENDING ──(sleep)──► poll ...
//!                          ├─► COMPLETE ──► download CSV ──► rows > 0 ?
//!                          └─► ERRORED  ──► AuditReport error (fatal)
//!
//! no terminal status within report_timeout ──► ReportTimeout (fatal)
//! ```
//!
//! # Export Layout
//!
//! ```text
//! line 1..=preamble_rows   report metadata (skipped)
//! next line                column header
//! remaining lines          one audit entry per line
//! ```

use crate::config::DetectorConfig;
use crate::error::{ReplicationError, Result};
use crate::gateway::PolicyGateway;
use crate::metrics;
use crate::model::AuditReportStatus;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Count the data rows of an audit export.
///
/// Skips `preamble_rows` physical lines, treats the next line as the column
/// header and counts every following record with at least one non-blank
/// field. A malformed record still counts: something was logged.
pub fn count_data_rows(raw: &str, preamble_rows: usize) -> usize {
    let body = skip_lines(raw, preamble_rows);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());

    reader
        .records()
        .filter(|record| match record {
            Ok(record) => record.iter().any(|field| !field.trim().is_empty()),
            Err(_) => true,
        })
        .count()
}

fn skip_lines(raw: &str, n: usize) -> &str {
    let mut rest = raw;
    for _ in 0..n {
        match rest.find('\n') {
            Some(idx) => rest = &rest[idx + 1..],
            None => return "",
        }
    }
    rest
}

/// Polls a tenant's audit log for recent policy changes.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    config: DetectorConfig,
}

impl ChangeDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Whether the tenant logged any matching audit entries in the window
    /// ending now.
    ///
    /// # Errors
    ///
    /// `AuditReport` when the report errors and `ReportTimeout` when it never
    /// finishes. Both are fatal for the daemon. Gateway failures propagate
    /// unchanged.
    pub async fn has_changed<G>(&self, gateway: &G) -> Result<bool>
    where
        G: PolicyGateway + ?Sized,
    {
        self.has_changed_since(gateway, None).await
    }

    /// Like [`has_changed`](Self::has_changed), but the window also reaches
    /// back to `since_ms - window` when that is earlier.
    ///
    /// `since_ms` is the start (epoch ms) of the last detection that
    /// completed.
    #[instrument(skip_all, fields(tenant_id = %gateway.tenant_id()))]
    pub async fn has_changed_since<G>(&self, gateway: &G, since_ms: Option<i64>) -> Result<bool>
    where
        G: PolicyGateway + ?Sized,
    {
        let window_ms = self.config.window().as_millis() as i64;
        let end_ms = Utc::now().timestamp_millis();
        let start_ms = match since_ms {
            Some(since) => (since - window_ms).min(end_ms - window_ms),
            None => end_ms - window_ms,
        };
        let tenant = gateway.tenant_id().to_string();

        let handle = gateway
            .request_audit_report(start_ms, end_ms, &self.config.action_types)
            .await?;
        debug!(start_ms, end_ms, "Audit report requested");

        let delay = self.config.report_poll_delay();
        let timeout = self.config.report_timeout();
        let started = Instant::now();
        let mut polls: u32 = 0;

        loop {
            let status = gateway.poll_audit_report(&handle).await?;
            polls += 1;

            match status {
                AuditReportStatus::Complete => break,
                AuditReportStatus::Errored => {
                    metrics::record_audit_report(&tenant, polls, started.elapsed(), "ERRORED");
                    return Err(ReplicationError::AuditReport {
                        tenant,
                        message: format!("report errored after {} polls", polls),
                    });
                }
                AuditReportStatus::Pending => {}
            }

            if started.elapsed() + delay > timeout {
                let waited = started.elapsed();
                warn!(polls, waited_ms = waited.as_millis() as u64, "Audit report not ready");
                metrics::record_audit_report(&tenant, polls, waited, "TIMEOUT");
                return Err(ReplicationError::ReportTimeout { tenant, waited });
            }
            tokio::time::sleep(delay).await;
        }

        metrics::record_audit_report(&tenant, polls, started.elapsed(), "COMPLETE");

        let raw = gateway.download_audit_report(&handle).await?;
        let rows = count_data_rows(&raw, self.config.preamble_rows);
        let changed = rows > 0;
        metrics::record_change_detected(changed);

        if changed {
            info!(rows, polls, "Policy changes found in audit log");
        } else {
            debug!(polls, "No policy changes in audit log");
        }
        Ok(changed)
    }
}
