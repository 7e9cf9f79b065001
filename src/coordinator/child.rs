// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-child sync pipeline.
//!
//! ```text
//! connect ──► bootstrap labels ──► list rules/services/labels ──► transform
//!         ──► create rules (throttled) ──► activate
//!         ──► merge URL block list ──► activate
//!         ──► snapshot child
//! ```
//!
//! Every write to the child (label, rule, block list, activation) waits for
//! the same throttle.
//!
//! A failing step ends this child's sync; the engine moves on to the next
//! child. A rule the child rejects is logged and skipped without ending the
//! sync.

use super::types::{ChildOutcome, ChildReport, RejectedRule};
use crate::config::{ReplicationSettings, TenantConfig};
use crate::error::{ReplicationError, Result};
use crate::gateway::{PolicyGateway, TenantConnector};
use crate::metrics;
use crate::model::{PolicyRule, SnapshotKind, SnapshotPayload};
use crate::resilience::WriteThrottle;
use crate::store::SnapshotStore;
use crate::transform::RuleTransformer;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Union of two block lists: every `child` entry in its order, then
/// `parent` entries the child lacks. Returns the merged list and how many
/// entries were added.
pub fn merge_blocklist(child: &[String], parent: &[String]) -> (Vec<String>, usize) {
    let mut seen: HashSet<&str> = child.iter().map(String::as_str).collect();
    let mut merged = child.to_vec();
    for url in parent {
        if seen.insert(url.as_str()) {
            merged.push(url.clone());
        }
    }
    let added = merged.len() - child.len();
    (merged, added)
}

/// Everything a child sync reads from the current cycle.
pub(super) struct ChildSync<'a, C: TenantConnector> {
    pub connector: &'a C,
    pub transformer: &'a RuleTransformer,
    pub store: &'a SnapshotStore,
    pub settings: &'a ReplicationSettings,
    pub parent_rules: &'a [PolicyRule],
    pub parent_urls: &'a [String],
}

impl<'a, C: TenantConnector> ChildSync<'a, C> {
    /// Sync one child. Never fails: errors end up in the report.
    pub async fn run(&self, tenant: &TenantConfig) -> ChildReport {
        let started = Instant::now();
        let mut report = ChildReport::new(&tenant.tenant_id);

        let result = self.sync(tenant, &mut report).await;
        report.duration = started.elapsed();

        match result {
            Ok(()) => {
                info!(
                    tenant_id = %tenant.tenant_id,
                    labels_created = report.labels_created.len(),
                    rules_created = report.rules_created.len(),
                    rules_rejected = report.rules_rejected.len(),
                    rules_skipped = report.skipped.len(),
                    references_dropped = report.references_dropped,
                    urls_added = report.urls_added,
                    duration_ms = report.duration.as_millis() as u64,
                    "Child synced"
                );
            }
            Err(e) => {
                error!(
                    tenant_id = %tenant.tenant_id,
                    error = %e,
                    "Child sync failed, continuing with next child"
                );
                report.outcome = ChildOutcome::Failed {
                    error: e.to_string(),
                };
            }
        }

        metrics::record_child_sync(&tenant.tenant_id, report.is_success(), report.duration);
        report
    }

    async fn sync(&self, tenant: &TenantConfig, report: &mut ChildReport) -> Result<()> {
        let gateway = self.connector.connect(tenant).await?;
        let throttle = WriteThrottle::new(self.settings.write_delay());

        self.bootstrap_labels(&gateway, &throttle, report).await?;

        let existing = gateway.list_firewall_rules().await?;
        let services = gateway.list_network_services().await?;
        let labels = gateway.list_rule_labels().await?;

        let ruleset = self.transformer.build_child_ruleset(
            gateway.tenant_id(),
            self.parent_rules,
            &existing,
            &services,
            &labels,
        );
        report.references_dropped = ruleset.dropped.len();
        report.skipped = ruleset.skipped;

        self.apply_rules(&gateway, &throttle, &ruleset.rules, report)
            .await;
        if !report.rules_created.is_empty() {
            activate(&gateway, &throttle, report).await?;
        }

        if self.settings.replicate_url_blocklist {
            self.sync_blocklist(&gateway, &throttle, report).await?;
        }

        self.snapshot(&gateway).await
    }

    /// Create every recognized label the child lacks.
    async fn bootstrap_labels<G: PolicyGateway>(
        &self,
        gateway: &G,
        throttle: &WriteThrottle,
        report: &mut ChildReport,
    ) -> Result<()> {
        let present: HashSet<String> = gateway
            .list_rule_labels()
            .await?
            .into_iter()
            .map(|l| l.name)
            .collect();

        for name in self.transformer.recognized_labels() {
            if present.contains(name) {
                continue;
            }
            throttle.acquire().await;
            match gateway.create_rule_label(name, name).await {
                Ok(label) => {
                    info!(tenant_id = %gateway.tenant_id(), label = %label.name, label_id = label.id, "Created rule label");
                    report.labels_created.push(label.name);
                }
                Err(e) => {
                    // Rules carrying this label will be reported as unresolved.
                    warn!(tenant_id = %gateway.tenant_id(), label = %name, error = %e, "Failed to create rule label");
                }
            }
        }

        if !report.labels_created.is_empty() {
            metrics::record_labels_created(gateway.tenant_id(), report.labels_created.len());
            activate(gateway, throttle, report).await?;
        }
        Ok(())
    }

    async fn apply_rules<G: PolicyGateway>(
        &self,
        gateway: &G,
        throttle: &WriteThrottle,
        rules: &[PolicyRule],
        report: &mut ChildReport,
    ) {
        let tenant_id = gateway.tenant_id();

        for rule in rules {
            throttle.acquire().await;
            match gateway.create_firewall_rule(rule).await {
                Ok(id) => {
                    debug!(tenant_id = %tenant_id, rule_name = %rule.name, rule_id = id, "Created rule");
                    metrics::record_rule_applied(tenant_id, "created");
                    report.rules_created.push(rule.name.clone());
                }
                Err(ReplicationError::RemoteRejected { code, message, .. }) => {
                    warn!(
                        tenant_id = %tenant_id,
                        rule_name = %rule.name,
                        code = %code,
                        message = %message,
                        "Child rejected rule, skipping"
                    );
                    metrics::record_rule_applied(tenant_id, "rejected");
                    report.rules_rejected.push(RejectedRule {
                        name: rule.name.clone(),
                        code: Some(code),
                        message,
                    });
                }
                Err(e) => {
                    warn!(
                        tenant_id = %tenant_id,
                        rule_name = %rule.name,
                        error = %e,
                        "Failed to create rule, skipping"
                    );
                    metrics::record_rule_applied(tenant_id, "failed");
                    report.rules_rejected.push(RejectedRule {
                        name: rule.name.clone(),
                        code: None,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    async fn sync_blocklist<G: PolicyGateway>(
        &self,
        gateway: &G,
        throttle: &WriteThrottle,
        report: &mut ChildReport,
    ) -> Result<()> {
        let current = gateway.list_blocked_urls().await?;
        let (merged, added) = merge_blocklist(&current, self.parent_urls);
        metrics::record_blocklist_merge(gateway.tenant_id(), added);

        if added == 0 {
            debug!(tenant_id = %gateway.tenant_id(), "URL block list already up to date");
            return Ok(());
        }

        throttle.acquire().await;
        gateway.apply_blocked_urls(&merged).await?;
        report.urls_added = added;
        info!(tenant_id = %gateway.tenant_id(), added, total = merged.len(), "Merged URL block list");
        activate(gateway, throttle, report).await
    }

    async fn snapshot<G: PolicyGateway>(&self, gateway: &G) -> Result<()> {
        let tenant_id = gateway.tenant_id();
        let rules = gateway.list_firewall_rules().await?;
        let urls = gateway.list_blocked_urls().await?;

        self.store
            .write(tenant_id, SnapshotKind::FwRules, &SnapshotPayload::FwRules(rules))
            .await?;
        self.store
            .write(tenant_id, SnapshotKind::UrlBlocklist, &SnapshotPayload::UrlBlocklist(urls))
            .await?;
        Ok(())
    }
}

async fn activate<G: PolicyGateway + ?Sized>(
    gateway: &G,
    throttle: &WriteThrottle,
    report: &mut ChildReport,
) -> Result<()> {
    throttle.acquire().await;
    let result = gateway.activate_pending_changes().await;
    metrics::record_activation(gateway.tenant_id(), result.is_ok());
    result?;
    report.activations += 1;
    debug!(tenant_id = %gateway.tenant_id(), "Activated pending changes");
    Ok(())
}
