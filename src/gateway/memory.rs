// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory tenant for tests.
//!
//! Behaves like a remote tenant closely enough for the engine: rule names are
//! unique, new objects get fresh ids, writes are counted, and the audit export
//! uses the same preamble layout as the platform's CSV download.
//!
//! Clones share state, so a test can hand one clone to the engine and
//! inspect the other afterwards.

use super::{BoxFuture, PolicyGateway, TenantConnector};
use crate::config::TenantConfig;
use crate::error::{ReplicationError, Result};
use crate::model::{AuditReportStatus, PolicyRule, ReferenceEntity, ReportHandle};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Preamble lines written ahead of the column header in a CSV export.
const EXPORT_PREAMBLE: [&str; 5] = [
    "Audit Logs Report",
    "Report Created:,in-memory",
    "Time Range:,last window",
    "Action Types:,CREATE;UPDATE",
    "",
];

const EXPORT_HEADER: &str = "No.,Time,User,Action,Category,Resource,Result";

#[derive(Debug, Default)]
struct TenantState {
    rules: Vec<PolicyRule>,
    next_id: i64,
    services: Vec<ReferenceEntity>,
    labels: Vec<ReferenceEntity>,
    blocked_urls: Vec<String>,
    activations: usize,
    audit_rows: usize,
    report_statuses: VecDeque<AuditReportStatus>,
    reports_requested: Vec<(i64, i64, Vec<String>)>,
    rejections: HashMap<String, (String, String)>,
    failing: HashSet<String>,
    calls: Vec<(String, Instant)>,
    submitted: Vec<PolicyRule>,
}

impl TenantState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A tenant held in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryGateway {
    tenant_id: String,
    state: Arc<Mutex<TenantState>>,
}

impl InMemoryGateway {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            state: Arc::new(Mutex::new(TenantState {
                next_id: 1000,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TenantState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed rules. Rules without an id get one.
    pub fn with_rules(self, rules: Vec<PolicyRule>) -> Self {
        {
            let mut state = self.lock();
            for mut rule in rules {
                match rule.id {
                    Some(id) => state.next_id = state.next_id.max(id),
                    None => rule.id = Some(state.allocate_id()),
                }
                state.rules.push(rule);
            }
        }
        self
    }

    pub fn with_services(self, services: Vec<ReferenceEntity>) -> Self {
        self.lock().services = services;
        self
    }

    pub fn with_labels(self, labels: Vec<ReferenceEntity>) -> Self {
        {
            let mut state = self.lock();
            let highest = labels.iter().map(|l| l.id).max().unwrap_or(0);
            state.next_id = state.next_id.max(highest);
            state.labels = labels;
        }
        self
    }

    pub fn with_blocked_urls(self, urls: Vec<String>) -> Self {
        self.lock().blocked_urls = urls;
        self
    }

    /// Number of data rows in the next audit export.
    pub fn with_audit_rows(self, rows: usize) -> Self {
        self.lock().audit_rows = rows;
        self
    }

    /// Statuses returned by successive polls. Once drained, polls report
    /// `Complete`.
    pub fn with_report_statuses(self, statuses: Vec<AuditReportStatus>) -> Self {
        self.lock().report_statuses = statuses.into();
        self
    }

    /// Reject creation of the named rule with `code` and `message`.
    pub fn reject_rule(
        self,
        name: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.lock()
            .rejections
            .insert(name.into(), (code.into(), message.into()));
        self
    }

    /// Fail every call to `operation` with a gateway error.
    pub fn fail_operation(self, operation: impl Into<String>) -> Self {
        self.lock().failing.insert(operation.into());
        self
    }

    /// Start or stop failing `operation` on an already shared tenant.
    pub fn set_operation_failing(&self, operation: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(operation.to_string());
        } else {
            state.failing.remove(operation);
        }
    }

    pub fn set_audit_rows(&self, rows: usize) {
        self.lock().audit_rows = rows;
    }

    /// Replace a stored rule by name, as an admin edit on the tenant would.
    pub fn update_rule(&self, rule: PolicyRule) -> bool {
        let mut state = self.lock();
        match state.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => {
                let id = existing.id;
                *existing = PolicyRule { id, ..rule };
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        self.lock().rules.clone()
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.lock().rules.iter().map(|r| r.name.clone()).collect()
    }

    pub fn labels(&self) -> Vec<ReferenceEntity> {
        self.lock().labels.clone()
    }

    pub fn blocked_urls(&self) -> Vec<String> {
        self.lock().blocked_urls.clone()
    }

    pub fn activations(&self) -> usize {
        self.lock().activations
    }

    /// Every rule body passed to `create_firewall_rule`, accepted or not.
    pub fn submitted_rules(&self) -> Vec<PolicyRule> {
        self.lock().submitted.clone()
    }

    /// Audit report windows requested so far.
    pub fn reports_requested(&self) -> Vec<(i64, i64, Vec<String>)> {
        self.lock().reports_requested.clone()
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.iter().map(|(op, _)| op.clone()).collect()
    }

    /// Operation names in call order, with the instant each call arrived.
    pub fn timed_calls(&self) -> Vec<(String, Instant)> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|(op, _)| op == operation).count()
    }

    /// Record a call and fail it if the operation is marked failing.
    fn enter(&self, operation: &str) -> Result<MutexGuard<'_, TenantState>> {
        let mut state = self.lock();
        state.calls.push((operation.to_string(), Instant::now()));
        if state.failing.contains(operation) {
            return Err(ReplicationError::gateway_msg(
                &self.tenant_id,
                operation,
                "injected failure",
            ));
        }
        Ok(state)
    }

    fn render_export(rows: usize) -> String {
        let mut out = String::new();
        for line in EXPORT_PREAMBLE {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(EXPORT_HEADER);
        out.push('\n');
        for i in 0..rows {
            out.push_str(&format!(
                "{},2026-01-01 00:0{}:00,admin@parent,UPDATE,Firewall Filtering,Rule {},SUCCESS\n",
                i + 1,
                i % 10,
                i + 1
            ));
        }
        out
    }
}

impl PolicyGateway for InMemoryGateway {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn list_firewall_rules(&self) -> BoxFuture<'_, Vec<PolicyRule>> {
        Box::pin(async move {
            let state = self.enter("list_firewall_rules")?;
            let mut rules = state.rules.clone();
            rules.sort_by_key(|r| r.order);
            Ok(rules)
        })
    }

    fn create_firewall_rule<'a>(&'a self, rule: &'a PolicyRule) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            let mut state = self.enter("create_firewall_rule")?;
            state.submitted.push(rule.clone());

            if let Some((code, message)) = state.rejections.get(&rule.name).cloned() {
                return Err(ReplicationError::RemoteRejected {
                    tenant: self.tenant_id.clone(),
                    code,
                    message,
                });
            }
            if state.rules.iter().any(|r| r.name == rule.name) {
                return Err(ReplicationError::RemoteRejected {
                    tenant: self.tenant_id.clone(),
                    code: "DUPLICATE_ITEM".to_string(),
                    message: format!("Rule name '{}' already in use", rule.name),
                });
            }

            let id = state.allocate_id();
            let mut created = rule.clone();
            created.id = Some(id);
            state.rules.push(created);
            Ok(id)
        })
    }

    fn activate_pending_changes(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.enter("activate_pending_changes")?;
            state.activations += 1;
            Ok(())
        })
    }

    fn list_network_services(&self) -> BoxFuture<'_, Vec<ReferenceEntity>> {
        Box::pin(async move { Ok(self.enter("list_network_services")?.services.clone()) })
    }

    fn list_rule_labels(&self) -> BoxFuture<'_, Vec<ReferenceEntity>> {
        Box::pin(async move { Ok(self.enter("list_rule_labels")?.labels.clone()) })
    }

    fn create_rule_label<'a>(
        &'a self,
        name: &'a str,
        _description: &'a str,
    ) -> BoxFuture<'a, ReferenceEntity> {
        Box::pin(async move {
            let mut state = self.enter("create_rule_label")?;
            if state.labels.iter().any(|l| l.name == name) {
                return Err(ReplicationError::RemoteRejected {
                    tenant: self.tenant_id.clone(),
                    code: "DUPLICATE_ITEM".to_string(),
                    message: format!("Label '{}' already exists", name),
                });
            }
            let label = ReferenceEntity::new(state.allocate_id(), name);
            state.labels.push(label.clone());
            Ok(label)
        })
    }

    fn list_blocked_urls(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.enter("list_blocked_urls")?.blocked_urls.clone()) })
    }

    fn apply_blocked_urls<'a>(&'a self, urls: &'a [String]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.enter("apply_blocked_urls")?.blocked_urls = urls.to_vec();
            Ok(())
        })
    }

    fn request_audit_report<'a>(
        &'a self,
        start_ms: i64,
        end_ms: i64,
        action_types: &'a [String],
    ) -> BoxFuture<'a, ReportHandle> {
        Box::pin(async move {
            let mut state = self.enter("request_audit_report")?;
            state
                .reports_requested
                .push((start_ms, end_ms, action_types.to_vec()));
            Ok(ReportHandle {
                tenant_id: self.tenant_id.clone(),
                requested_at: end_ms,
            })
        })
    }

    fn poll_audit_report<'a>(&'a self, _handle: &'a ReportHandle) -> BoxFuture<'a, AuditReportStatus> {
        Box::pin(async move {
            let mut state = self.enter("poll_audit_report")?;
            Ok(state
                .report_statuses
                .pop_front()
                .unwrap_or(AuditReportStatus::Complete))
        })
    }

    fn download_audit_report<'a>(&'a self, _handle: &'a ReportHandle) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let state = self.enter("download_audit_report")?;
            Ok(Self::render_export(state.audit_rows))
        })
    }
}

/// Connector over a fixed set of in-memory tenants.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConnector {
    tenants: HashMap<String, InMemoryGateway>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, gateway: InMemoryGateway) -> Self {
        self.tenants.insert(gateway.tenant_id.clone(), gateway);
        self
    }

    pub fn tenant(&self, tenant_id: &str) -> Option<&InMemoryGateway> {
        self.tenants.get(tenant_id)
    }
}

impl TenantConnector for InMemoryConnector {
    type Gateway = InMemoryGateway;

    fn connect<'a>(&'a self, tenant: &'a TenantConfig) -> BoxFuture<'a, InMemoryGateway> {
        Box::pin(async move {
            self.tenants.get(&tenant.tenant_id).cloned().ok_or_else(|| {
                ReplicationError::gateway_msg(&tenant.tenant_id, "authenticate", "unknown tenant")
            })
        })
    }
}
