//! Configuration for the policy replicator.
//!
//! Configuration is read from a TOML file with one `[PARENT]` tenant
//! descriptor, any number of `[SUB*]` child tenant descriptors, and optional
//! `[settings]` and `[store]` tables. It is parsed once at startup into a
//! [`ReplicationConfig`] value that is passed by reference into the engine;
//! there is no ambient global configuration.
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── parent: TenantConfig             # [PARENT]
//! ├── children: Vec<TenantConfig>      # [SUB1], [SUB2], ... sorted by name
//! ├── settings: ReplicationSettings    # [settings]
//! │   ├── poll_interval / write_delay
//! │   ├── detector: DetectorConfig     # audit-log change oracle
//! │   ├── transform: TransformConfig   # rule transformation policy
//! │   └── connect: ConnectConfig       # gateway timeouts and retries
//! └── store: StoreConfig               # [store] snapshot persistence
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! [PARENT]
//! cloudId = "zscalerthree.net"
//! api_key = "abcdefghijkl"
//! username = "admin@parent.example"
//! password = "secret"
//!
//! [SUB1]
//! cloud_endpoint = "https://zsapi.zscalerthree.net"
//! api_key = "mnopqrstuvwx"
//! username = "admin@child.example"
//! password = "secret"
//!
//! [settings]
//! poll_interval = "5m"
//! write_delay = "1s"
//!
//! [settings.transform]
//! unresolved_references = "skip_rule"
//!
//! [store]
//! sqlite_path = "/var/lib/policy-replicator/snapshots.db"
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix identifying child tenant sections.
pub const CHILD_SECTION_PREFIX: &str = "SUB";

/// Section name of the authoritative tenant.
pub const PARENT_SECTION: &str = "PARENT";

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: parsed once at startup, passed to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// The authoritative tenant.
    pub parent: TenantConfig,

    /// Dependent tenants, in section-name order.
    pub children: Vec<TenantConfig>,

    /// Tunable replication parameters.
    pub settings: ReplicationSettings,

    /// Snapshot store location and bootstrap policy.
    pub store: StoreConfig,
}

/// On-disk shape of the config file before child sections are collected.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "PARENT")]
    parent: TenantConfig,

    #[serde(default)]
    settings: ReplicationSettings,

    #[serde(default)]
    store: StoreConfig,

    #[serde(flatten)]
    sections: BTreeMap<String, toml::Value>,
}

impl ReplicationConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(raw)
            .map_err(|e| ReplicationError::Config(format!("Invalid config TOML: {}", e)))?;

        let mut parent = raw.parent;
        parent.tenant_id = PARENT_SECTION.to_string();

        let mut children = Vec::new();
        for (section, value) in raw.sections {
            if !section.starts_with(CHILD_SECTION_PREFIX) {
                tracing::warn!(section = %section, "Ignoring unknown config section");
                continue;
            }
            let mut child: TenantConfig = value.try_into().map_err(|e| {
                ReplicationError::Config(format!("Invalid tenant section [{}]: {}", section, e))
            })?;
            child.tenant_id = section;
            children.push(child);
        }

        let config = Self {
            parent,
            children,
            settings: raw.settings,
            store: raw.store,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check the parsed configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for tenant in std::iter::once(&self.parent).chain(self.children.iter()) {
            tenant.validate()?;
        }
        if self.children.is_empty() {
            tracing::warn!("No [SUB*] child tenants configured; nothing will be replicated");
        }
        if self.store.max_bootstrap_attempts == 0 {
            return Err(ReplicationError::Config(
                "store.max_bootstrap_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a minimal config for testing.
    pub fn for_testing(parent_endpoint: &str, children: Vec<TenantConfig>) -> Self {
        Self {
            parent: TenantConfig::for_testing(PARENT_SECTION, parent_endpoint),
            children,
            settings: ReplicationSettings::for_testing(),
            store: StoreConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TenantConfig: one [PARENT] or [SUB*] section
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity and credentials of one tenant.
///
/// `tenant_id` is the config section name and is not read from the section
/// body.
#[derive(Clone, Deserialize)]
pub struct TenantConfig {
    #[serde(skip)]
    pub tenant_id: String,

    /// Either a full base URL (`https://zsapi.example.net`) or a bare cloud
    /// name (`example.net`).
    #[serde(alias = "cloudId", alias = "cloudEndpoint", alias = "base_url")]
    pub cloud_endpoint: String,

    pub api_key: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConfig")
            .field("tenant_id", &self.tenant_id)
            .field("cloud_endpoint", &self.cloud_endpoint)
            .field("api_key", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl TenantConfig {
    /// Base URL of the tenant's v1 API, always ending in `/`.
    pub fn api_base(&self) -> String {
        let endpoint = self.cloud_endpoint.trim_end_matches('/');
        if endpoint.contains("://") {
            format!("{}/api/v1/", endpoint)
        } else {
            format!("https://zsapi.{}/api/v1/", endpoint)
        }
    }

    fn validate(&self) -> Result<()> {
        let missing = [
            ("cloud_endpoint", self.cloud_endpoint.is_empty()),
            ("api_key", self.api_key.is_empty()),
            ("username", self.username.is_empty()),
            ("password", self.password.is_empty()),
        ];
        for (field, is_missing) in missing {
            if is_missing {
                return Err(ReplicationError::Config(format!(
                    "[{}] is missing {}",
                    self.tenant_id, field
                )));
            }
        }
        if self.api_key.chars().count() < crate::session::MIN_API_KEY_LEN {
            return Err(ReplicationError::Config(format!(
                "[{}] api_key must be at least {} characters",
                self.tenant_id,
                crate::session::MIN_API_KEY_LEN
            )));
        }
        Ok(())
    }

    /// Create a tenant descriptor for testing.
    pub fn for_testing(tenant_id: &str, cloud_endpoint: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            cloud_endpoint: cloud_endpoint.to_string(),
            api_key: "0123456789abcdef".to_string(),
            username: format!("admin@{}", tenant_id.to_lowercase()),
            password: "test-password".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings: cycle timing, detector, transformer
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the replication cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Fixed wait between cycles (humantime, e.g. "5m").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Minimum spacing between writes to the same tenant.
    #[serde(default = "default_write_delay")]
    pub write_delay: String,

    /// Replicate the parent's URL block list as well as firewall rules.
    #[serde(default = "default_true")]
    pub replicate_url_blocklist: bool,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub transform: TransformConfig,

    #[serde(default)]
    pub connect: ConnectConfig,
}

fn default_poll_interval() -> String {
    "5m".to_string()
}

fn default_write_delay() -> String {
    "1s".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            write_delay: default_write_delay(),
            replicate_url_blocklist: true,
            detector: DetectorConfig::default(),
            transform: TransformConfig::default(),
            connect: ConnectConfig::default(),
        }
    }
}

impl ReplicationSettings {
    /// Wait between cycles.
    pub fn poll_interval(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(300))
    }

    /// Minimum spacing between writes to one tenant.
    pub fn write_delay(&self) -> Duration {
        humantime::parse_duration(&self.write_delay).unwrap_or(Duration::from_secs(1))
    }

    /// Fast timings for tests.
    pub fn for_testing() -> Self {
        Self {
            poll_interval: "50ms".to_string(),
            write_delay: "1ms".to_string(),
            replicate_url_blocklist: true,
            detector: DetectorConfig {
                report_poll_delay: "5ms".to_string(),
                report_timeout: "2s".to_string(),
                ..Default::default()
            },
            transform: TransformConfig::default(),
            connect: ConnectConfig {
                request_timeout: "2s".to_string(),
                max_attempts: 1,
            },
        }
    }
}

/// Audit-log change detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Trailing window covered by each audit report. Never less than 6 minutes.
    #[serde(default = "default_window")]
    pub window: String,

    /// Delay between report status polls.
    #[serde(default = "default_report_poll_delay")]
    pub report_poll_delay: String,

    /// Ceiling on report generation; expiry is a detector failure.
    #[serde(default = "default_report_timeout")]
    pub report_timeout: String,

    /// Non-data rows preceding the column header in the export.
    #[serde(default = "default_preamble_rows")]
    pub preamble_rows: usize,

    /// Audit action types that count as a policy change.
    #[serde(default = "default_action_types")]
    pub action_types: Vec<String>,
}

/// Lower bound on the detector window (clock skew plus report latency).
pub const MIN_DETECTOR_WINDOW: Duration = Duration::from_secs(6 * 60);

fn default_window() -> String {
    "6m".to_string()
}

fn default_report_poll_delay() -> String {
    "5s".to_string()
}

fn default_report_timeout() -> String {
    "5m".to_string()
}

fn default_preamble_rows() -> usize {
    5
}

fn default_action_types() -> Vec<String> {
    vec!["UPDATE".to_string(), "CREATE".to_string()]
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            report_poll_delay: default_report_poll_delay(),
            report_timeout: default_report_timeout(),
            preamble_rows: default_preamble_rows(),
            action_types: default_action_types(),
        }
    }
}

impl DetectorConfig {
    /// Report window, clamped to [`MIN_DETECTOR_WINDOW`].
    pub fn window(&self) -> Duration {
        humantime::parse_duration(&self.window)
            .unwrap_or(MIN_DETECTOR_WINDOW)
            .max(MIN_DETECTOR_WINDOW)
    }

    pub fn report_poll_delay(&self) -> Duration {
        humantime::parse_duration(&self.report_poll_delay).unwrap_or(Duration::from_secs(5))
    }

    pub fn report_timeout(&self) -> Duration {
        humantime::parse_duration(&self.report_timeout).unwrap_or(Duration::from_secs(300))
    }
}

/// What to do with a reference the child tenant cannot resolve by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReferencePolicy {
    /// Skip the whole rule and report it.
    #[default]
    SkipRule,
    /// Drop only the unresolved reference and report it.
    DropReference,
}

/// Rule transformation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Labels that are replicated. Anything else is dropped.
    #[serde(default = "default_recognized_labels")]
    pub recognized_labels: Vec<String>,

    #[serde(default)]
    pub unresolved_references: UnresolvedReferencePolicy,

    /// Names of platform-managed rules that are never replicated. A parent
    /// rule is excluded when its name contains any of them.
    #[serde(default = "default_excluded_rule_names")]
    pub excluded_rule_names: Vec<String>,
}

fn default_recognized_labels() -> Vec<String> {
    vec!["pscm-high".to_string(), "pscm-low".to_string()]
}

fn default_excluded_rule_names() -> Vec<String> {
    vec![
        "Default Firewall Filtering Rule".to_string(),
        "Zscaler Proxy Traffic".to_string(),
        "Office 365 One Click Rule".to_string(),
        "Recommended Firewall Rule".to_string(),
    ]
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            recognized_labels: default_recognized_labels(),
            unresolved_references: UnresolvedReferencePolicy::default(),
            excluded_rule_names: default_excluded_rule_names(),
        }
    }
}

/// Gateway connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Authentication attempts per tenant per cycle.
    #[serde(default = "default_connect_attempts")]
    pub max_attempts: usize,
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_connect_attempts() -> usize {
    3
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            max_attempts: default_connect_attempts(),
        }
    }
}

impl ConnectConfig {
    pub fn request_timeout(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: snapshot persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Where colliding stores are moved. Defaults to the database's directory.
    #[serde(default)]
    pub archive_dir: Option<String>,

    /// Bootstrap attempts before giving up.
    #[serde(default = "default_max_bootstrap_attempts")]
    pub max_bootstrap_attempts: u32,
}

fn default_sqlite_path() -> String {
    "policy_snapshots.db".to_string()
}

fn default_max_bootstrap_attempts() -> u32 {
    3
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            archive_dir: None,
            max_bootstrap_attempts: default_max_bootstrap_attempts(),
        }
    }
}

impl StoreConfig {
    /// In-memory store for tests (not persisted, never archived).
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            archive_dir: None,
            max_bootstrap_attempts: default_max_bootstrap_attempts(),
        }
    }

    /// Store at a specific path.
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}
