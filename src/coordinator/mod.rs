// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The main orchestrator that ties together:
//! - Change detection on the parent via [`crate::detector::ChangeDetector`]
//! - Snapshot history via [`crate::store::SnapshotStore`]
//! - Rule remapping via [`crate::transform::RuleTransformer`]
//! - Per-child apply via the child pipeline
//!
//! # Cycle
//!
//! 1. Connect to the parent and ask the detector whether policy changed
//! 2. On change (or on the first cycle) snapshot the parent's rules and URL
//!    block list and log the difference against the previous snapshot
//! 3. Sync each child in turn; a failing child never affects the others
//! 4. Wait `poll_interval`, or stop if shutdown was requested
//!
//! A detected change stays pending until a sync phase completes, so a parent
//! failure after detection is retried on the next cycle even if the audit
//! log has gone quiet. Each detection window also reaches back to the start
//! of the previous one.
//!
//! Shutdown is only observed between cycles, so a sync is never cut off
//! halfway through a child.

mod child;
mod types;

pub use child::merge_blocklist;
pub use types::{ChildOutcome, ChildReport, CycleReport, EngineState, RejectedRule};

use crate::config::ReplicationConfig;
use crate::detector::ChangeDetector;
use crate::diff::change_set;
use crate::error::{ReplicationError, Result};
use crate::gateway::{HttpConnector, PolicyGateway, TenantConnector};
use crate::metrics;
use crate::model::{SnapshotKind, SnapshotPayload};
use crate::store::SnapshotStore;
use crate::transform::RuleTransformer;
use child::ChildSync;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Requests a graceful stop of a running engine.
///
/// Cloneable and usable from any task (e.g. a Ctrl-C handler).
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the engine to stop at the next cycle boundary.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The main replication engine.
///
/// Drives one-way replication from the parent tenant to every child
/// tenant. Tenants are reached through a [`TenantConnector`]; the default
/// is the HTTP API.
pub struct ReplicationEngine<C: TenantConnector = HttpConnector> {
    /// Configuration
    config: ReplicationConfig,

    /// Opens gateways to tenants
    connector: C,

    /// Snapshot history, opened on first use
    store: Option<SnapshotStore>,

    detector: ChangeDetector,
    transformer: RuleTransformer,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,

    /// Cycles whose sync phase ran
    cycles_synced: u64,

    /// A change (or the first cycle) still waiting for a completed sync
    sync_pending: bool,

    /// Start of the last detection that completed, epoch ms
    last_detection_ms: Option<i64>,
}

impl ReplicationEngine<HttpConnector> {
    /// Create an engine talking to tenants over HTTP.
    ///
    /// The engine starts in `Init` state. Call [`run()`](Self::run) for the
    /// daemon loop or [`run_once()`](Self::run_once) for a single cycle.
    pub fn new(config: ReplicationConfig) -> Self {
        let connector = HttpConnector::new(&config.settings.connect);
        Self::with_connector(config, connector)
    }
}

impl<C: TenantConnector> ReplicationEngine<C> {
    /// Create an engine with a custom tenant connector.
    pub fn with_connector(config: ReplicationConfig, connector: C) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Init);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        metrics::set_children_configured(config.children.len());

        Self {
            detector: ChangeDetector::new(config.settings.detector.clone()),
            transformer: RuleTransformer::new(&config.settings.transform),
            config,
            connector,
            store: None,
            state_tx,
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            cycles_synced: 0,
            sync_pending: true,
            last_detection_ms: None,
        }
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Snapshot store, once opened.
    pub fn store(&self) -> Option<&SnapshotStore> {
        self.store.as_ref()
    }

    /// Number of cycles whose sync phase ran.
    pub fn cycles_synced(&self) -> u64 {
        self.cycles_synced
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    fn ensure_init(&self) -> Result<()> {
        if self.state() != EngineState::Init {
            return Err(ReplicationError::InvalidState {
                expected: "Init".to_string(),
                actual: self.state().to_string(),
            });
        }
        Ok(())
    }

    async fn open_store(&mut self) -> Result<()> {
        if self.store.is_none() {
            let store = SnapshotStore::open(&self.config.store).await?;
            info!(path = %store.path(), "Snapshot store initialized");
            self.store = Some(store);
        }
        Ok(())
    }

    async fn close_store(&mut self) {
        if let Some(store) = self.store.take() {
            store.close().await;
        }
    }

    /// Run cycles until shutdown or a fatal error.
    ///
    /// Non-fatal cycle errors (e.g. the parent being unreachable) are logged
    /// and the cycle is retried after `poll_interval`.
    pub async fn run(&mut self) -> Result<()> {
        self.ensure_init()?;

        info!(
            parent = %self.config.parent.tenant_id,
            children = self.config.children.len(),
            poll_interval_secs = self.config.settings.poll_interval().as_secs(),
            "Starting replication engine"
        );

        if let Err(e) = self.open_store().await {
            error!(error = %e, "Cannot open snapshot store");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        // Mark initial shutdown value as seen so changed() only fires on actual changes
        let _ = self.shutdown_rx.borrow_and_update();
        let interval = self.config.settings.poll_interval();

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal error, stopping replication engine");
                    self.set_state(EngineState::Failed);
                    self.close_store().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Cycle failed, retrying after poll interval");
                    metrics::record_cycle("failed", std::time::Duration::ZERO);
                }
            }

            self.set_state(EngineState::Waiting);
            tokio::select! {
                biased;

                result = self.shutdown_rx.changed() => {
                    if result.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }

                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.close_store().await;
        self.set_state(EngineState::Stopped);
        info!(cycles_synced = self.cycles_synced, "Replication engine stopped");
        Ok(())
    }

    /// Run exactly one cycle, then stop.
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        self.ensure_init()?;

        let result = self.run_cycle().await;
        self.close_store().await;

        match &result {
            Ok(_) => self.set_state(EngineState::Stopped),
            Err(e) => {
                error!(error = %e, "Replication cycle failed");
                self.set_state(EngineState::Failed);
            }
        }
        result
    }

    /// One poll-and-maybe-sync cycle.
    ///
    /// # Errors
    ///
    /// Parent-side failures (connect, detection, snapshot) end the cycle.
    /// Child failures never do; they are recorded in the report.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let started = Instant::now();
        self.open_store().await?;
        self.set_state(EngineState::Polling);

        let parent = self.connector.connect(&self.config.parent).await?;
        let detection_started = Utc::now().timestamp_millis();
        let changed = self
            .detector
            .has_changed_since(&parent, self.last_detection_ms)
            .await?;
        self.last_detection_ms = Some(detection_started);

        let carried_over = self.sync_pending && !changed;
        self.sync_pending |= changed;

        let mut report = CycleReport {
            changed,
            ..Default::default()
        };

        if !self.sync_pending {
            debug!("No parent changes, nothing to replicate");
            report.duration = started.elapsed();
            metrics::record_cycle(report.outcome(), report.duration);
            return Ok(report);
        }

        self.set_state(EngineState::Syncing);
        info!(
            changed,
            carried_over,
            first_run = self.cycles_synced == 0,
            "Replicating parent policy"
        );

        let store = self
            .store
            .as_ref()
            .ok_or_else(|| ReplicationError::Internal("snapshot store not open".to_string()))?;
        let parent_id = parent.tenant_id().to_string();

        let parent_rules = parent.list_firewall_rules().await?;
        let parent_urls = parent.list_blocked_urls().await?;

        let previous = store.latest(&parent_id, SnapshotKind::FwRules).await?;
        store
            .write(
                &parent_id,
                SnapshotKind::FwRules,
                &SnapshotPayload::FwRules(parent_rules.clone()),
            )
            .await?;
        store
            .write(
                &parent_id,
                SnapshotKind::UrlBlocklist,
                &SnapshotPayload::UrlBlocklist(parent_urls.clone()),
            )
            .await?;

        if let Some(previous) = previous {
            let changes = change_set(previous.payload.as_rules().unwrap_or(&[]), &parent_rules);
            info!(
                previous_sequence = previous.sequence,
                added = ?changes.added,
                removed = ?changes.removed,
                modified = ?changes.modified,
                "Parent rule changes since last snapshot"
            );
            report.changes = Some(changes);
        }

        report.synced = true;
        report.parent_rules = parent_rules.len();
        report.parent_urls = parent_urls.len();

        let child_sync = ChildSync {
            connector: &self.connector,
            transformer: &self.transformer,
            store,
            settings: &self.config.settings,
            parent_rules: &parent_rules,
            parent_urls: &parent_urls,
        };

        for tenant in &self.config.children {
            let span = info_span!("child_sync", tenant_id = %tenant.tenant_id);
            let child_report = child_sync.run(tenant).instrument(span).await;
            report.children.push(child_report);
        }

        self.sync_pending = false;
        self.cycles_synced += 1;
        report.duration = started.elapsed();
        metrics::record_cycle(report.outcome(), report.duration);

        info!(
            children = report.children.len(),
            children_failed = report.children_failed(),
            rules_created = report.rules_created(),
            duration_ms = report.duration.as_millis() as u64,
            "Cycle complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantConfig;
    use crate::gateway::{InMemoryConnector, InMemoryGateway};
    use crate::model::{AuditReportStatus, PolicyRule};

    fn engine(
        parent: InMemoryGateway,
        children: Vec<InMemoryGateway>,
    ) -> ReplicationEngine<InMemoryConnector> {
        let child_configs = children
            .iter()
            .map(|c| TenantConfig::for_testing(c.tenant_id(), "http://localhost"))
            .collect();
        let config = ReplicationConfig::for_testing("http://localhost", child_configs);

        let mut connector = InMemoryConnector::new().with_tenant(parent);
        for child in children {
            connector = connector.with_tenant(child);
        }
        ReplicationEngine::with_connector(config, connector)
    }

    #[test]
    fn test_engine_initial_state() {
        let engine = engine(InMemoryGateway::new("PARENT"), vec![]);
        assert_eq!(engine.state(), EngineState::Init);
        assert_eq!(engine.cycles_synced(), 0);
        assert!(engine.store().is_none());
    }

    #[test]
    fn test_engine_state_receiver() {
        let engine = engine(InMemoryGateway::new("PARENT"), vec![]);
        let state_rx = engine.state_receiver();
        assert_eq!(*state_rx.borrow(), EngineState::Init);
    }

    #[tokio::test]
    async fn test_first_cycle_syncs_without_change() {
        let parent = InMemoryGateway::new("PARENT").with_rules(vec![PolicyRule::new("A", 1)]);
        let child = InMemoryGateway::new("SUB1");
        let mut engine = engine(parent, vec![child.clone()]);

        let report = engine.run_cycle().await.unwrap();
        assert!(!report.changed);
        assert!(report.synced);
        assert!(report.changes.is_none());
        assert_eq!(child.rule_names(), vec!["A"]);

        // Second cycle: detector says no change, nothing happens
        let report = engine.run_cycle().await.unwrap();
        assert!(!report.synced);
        assert_eq!(engine.cycles_synced(), 1);
    }

    #[tokio::test]
    async fn test_change_logged_against_previous_snapshot() {
        let parent = InMemoryGateway::new("PARENT").with_rules(vec![PolicyRule::new("A", 1).with_id(10)]);
        let mut engine = engine(parent.clone(), vec![]);

        engine.run_cycle().await.unwrap();
        parent.update_rule(PolicyRule::new("A", 1).with_action("BLOCK_DROP"));
        parent.set_audit_rows(1);

        let report = engine.run_cycle().await.unwrap();
        assert!(report.changed);
        let changes = report.changes.unwrap();
        assert_eq!(changes.modified.into_iter().collect::<Vec<_>>(), vec![10]);

        let store = engine.store().unwrap();
        assert_eq!(store.latest_sequence("PARENT", SnapshotKind::FwRules).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_change_survives_parent_failure_after_detection() {
        let parent = InMemoryGateway::new("PARENT").with_rules(vec![PolicyRule::new("A", 1)]);
        let child = InMemoryGateway::new("SUB1");
        let mut engine = engine(parent.clone(), vec![child.clone()]);
        engine.run_cycle().await.unwrap();

        // Admin adds a rule; the cycle sees it but cannot read the parent
        let parent = parent.with_rules(vec![PolicyRule::new("B", 2)]);
        parent.set_audit_rows(1);
        parent.set_operation_failing("list_firewall_rules", true);
        let err = engine.run_cycle().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(child.rule_names(), vec!["A"]);

        // Audit log has gone quiet by the retry
        parent.set_operation_failing("list_firewall_rules", false);
        parent.set_audit_rows(0);
        let report = engine.run_cycle().await.unwrap();
        assert!(!report.changed);
        assert!(report.synced);
        assert_eq!(child.rule_names(), vec!["A", "B"]);
        assert_eq!(engine.cycles_synced(), 2);

        // Once synced, a quiet log means nothing to do
        let report = engine.run_cycle().await.unwrap();
        assert!(!report.synced);
    }

    #[tokio::test]
    async fn test_detection_window_reaches_back_to_previous_cycle() {
        let parent = InMemoryGateway::new("PARENT");
        let mut engine = engine(parent.clone(), vec![]);

        engine.run_cycle().await.unwrap();
        engine.run_cycle().await.unwrap();

        let requests = parent.reports_requested();
        assert_eq!(requests.len(), 2);
        let (first_start, first_end, _) = requests[0];
        let (second_start, _, _) = requests[1];
        assert!(second_start <= first_start);
        let window_ms = first_end - first_start;
        assert!(second_start >= first_start - window_ms);
    }

    #[tokio::test]
    async fn test_errored_report_fails_run_once() {
        let parent = InMemoryGateway::new("PARENT")
            .with_report_statuses(vec![AuditReportStatus::Errored]);
        let mut engine = engine(parent, vec![]);

        let err = engine.run_once().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_run_once_requires_init() {
        let mut engine = engine(InMemoryGateway::new("PARENT"), vec![]);
        engine.run_once().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);

        let err = engine.run_once().await.unwrap_err();
        match err {
            ReplicationError::InvalidState { expected, actual } => {
                assert_eq!(expected, "Init");
                assert_eq!(actual, "Stopped");
            }
            other => panic!("Expected InvalidState error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_before_run_stops_immediately() {
        let parent = InMemoryGateway::new("PARENT");
        let mut engine = engine(parent.clone(), vec![]);
        engine.shutdown_handle().shutdown();

        engine.run().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(parent.call_count("request_audit_report"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_wait() {
        let parent = InMemoryGateway::new("PARENT");
        let mut engine = engine(parent.clone(), vec![]);
        let handle = engine.shutdown_handle();
        let mut states = engine.state_receiver();

        let task = tokio::spawn(async move {
            let result = engine.run().await;
            (result, engine)
        });

        states.wait_for(|s| *s == EngineState::Waiting).await.unwrap();
        handle.shutdown();
        assert!(handle.is_shutdown());

        let (result, engine) = task.await.unwrap();
        result.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(parent.call_count("request_audit_report") >= 1);
    }
}
