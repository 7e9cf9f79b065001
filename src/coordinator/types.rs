//! Engine state and cycle report types.
//!
//! # State Transitions
//!
//! ```text
//!              run()
//! Init ───────────────────→ Polling ──(no change)──→ Waiting
//!                             │   ↑                     │
//!          (change or first   │   └──── poll_interval ──┘
//!           run)              ↓                         │
//!                          Syncing ────────────────→ Waiting
//!                                                       │
//!                                            shutdown() │
//!                                                       ↓
//!                                                    Stopped
//!
//! Polling/Syncing ──(fatal detector or store error)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Init**: Created by `ReplicationEngine::new()`. Nothing opened yet.
//! - **Polling**: Asking the parent's audit log whether policy changed.
//! - **Syncing**: Snapshotting the parent and pushing rules to each child.
//! - **Waiting**: Sleeping until the next cycle. Shutdown is honored here.
//! - **Stopped**: Graceful shutdown complete.
//! - **Failed**: Fatal error. The process should exit non-zero.

use crate::model::ChangeSet;
use crate::transform::SkippedRule;
use std::time::Duration;

/// State of the replication engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    Init,

    /// Running change detection against the parent.
    Polling,

    /// Replicating parent policy to children.
    ///
    /// Never interrupted by shutdown; the cycle always runs to completion.
    Syncing,

    /// Between cycles.
    Waiting,

    /// Stopped after a shutdown request.
    Stopped,

    /// Unrecoverable error. Check logs for details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Init => write!(f, "Init"),
            EngineState::Polling => write!(f, "Polling"),
            EngineState::Syncing => write!(f, "Syncing"),
            EngineState::Waiting => write!(f, "Waiting"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// A rule the child refused (or that failed to send).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRule {
    pub name: String,
    /// Platform error code, when the platform gave one.
    pub code: Option<String>,
    pub message: String,
}

/// Final outcome of one child's sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutcome {
    /// Every step ran. Individual rules may still have been skipped or rejected.
    Synced,
    /// A step failed; later steps for this child were not attempted.
    Failed { error: String },
}

/// What happened on one child during a cycle.
#[derive(Debug, Clone)]
pub struct ChildReport {
    pub tenant_id: String,
    pub outcome: ChildOutcome,
    pub labels_created: Vec<String>,
    pub rules_created: Vec<String>,
    pub rules_rejected: Vec<RejectedRule>,
    pub skipped: Vec<SkippedRule>,
    pub references_dropped: usize,
    pub urls_added: usize,
    pub activations: usize,
    pub duration: Duration,
}

impl ChildReport {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            outcome: ChildOutcome::Synced,
            labels_created: Vec::new(),
            rules_created: Vec::new(),
            rules_rejected: Vec::new(),
            skipped: Vec::new(),
            references_dropped: 0,
            urls_added: 0,
            activations: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ChildOutcome::Synced
    }

    /// Whether this sync wrote anything to the child.
    pub fn wrote_changes(&self) -> bool {
        !self.labels_created.is_empty() || !self.rules_created.is_empty() || self.urls_added > 0
    }
}

/// Summary of one engine cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Detector verdict for the parent.
    pub changed: bool,
    /// Whether the sync phase ran (change detected or first run).
    pub synced: bool,
    pub parent_rules: usize,
    pub parent_urls: usize,
    /// Differences against the previous parent snapshot, when there was one.
    pub changes: Option<ChangeSet>,
    pub children: Vec<ChildReport>,
    pub duration: Duration,
}

impl CycleReport {
    pub fn children_failed(&self) -> usize {
        self.children.iter().filter(|c| !c.is_success()).count()
    }

    pub fn rules_created(&self) -> usize {
        self.children.iter().map(|c| c.rules_created.len()).sum()
    }

    /// Metric label for this cycle's outcome.
    pub fn outcome(&self) -> &'static str {
        match (self.synced, self.children_failed()) {
            (false, _) => "unchanged",
            (true, 0) => "synced",
            (true, _) => "partial",
        }
    }
}
