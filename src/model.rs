// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Policy data model.
//!
//! Remote objects are modelled as explicit records with named optional
//! fields. Fields this engine does not interpret are kept in a flattened
//! `extra` map so a rule read from one tenant can be written to another
//! without losing attributes.
//!
//! # Identity
//!
//! Every `id` here is tenant-local. A rule's `name` is the only identity that
//! is stable across tenants.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// A reference from a rule to a named entity (network service, label).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EntityRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            extra: Map::new(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }
}

/// A catalog entry on one tenant: network service or rule label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntity {
    pub id: i64,
    pub name: String,
}

impl ReferenceEntity {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// One firewall filtering rule as read from, or written to, a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// Tenant-local identifier. Absent on rules about to be created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    pub name: String,

    /// Evaluation rank within the tenant's ruleset.
    #[serde(default)]
    pub order: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_full_logging: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predefined: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_rule: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nw_services: Vec<EntityRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<EntityRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_countries: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_ip_categories: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_categories: Option<Vec<Value>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PolicyRule {
    /// A bare rule with a name and order, for tests and fixtures.
    pub fn new(name: impl Into<String>, order: i64) -> Self {
        Self {
            name: name.into(),
            order,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_service(mut self, service: EntityRef) -> Self {
        self.nw_services.push(service);
        self
    }

    pub fn with_label(mut self, label: EntityRef) -> Self {
        self.labels.push(label);
        self
    }

    /// Whether the platform flags this rule as built-in.
    pub fn is_platform_managed(&self) -> bool {
        self.predefined.unwrap_or(false) || self.default_rule.unwrap_or(false)
    }

    /// The rule as a JSON value, for structural comparison.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Configuration kinds that are snapshotted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotKind {
    FwRules,
    UrlBlocklist,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::FwRules => "FW_RULES",
            SnapshotKind::UrlBlocklist => "URL_BLOCKLIST",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "FW_RULES" => Some(SnapshotKind::FwRules),
            "URL_BLOCKLIST" => Some(SnapshotKind::UrlBlocklist),
            _ => None,
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot contents.
///
/// Serialized without a tag; the kind is stored alongside the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SnapshotPayload {
    FwRules(Vec<PolicyRule>),
    UrlBlocklist(Vec<String>),
}

impl SnapshotPayload {
    pub fn kind(&self) -> SnapshotKind {
        match self {
            SnapshotPayload::FwRules(_) => SnapshotKind::FwRules,
            SnapshotPayload::UrlBlocklist(_) => SnapshotKind::UrlBlocklist,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SnapshotPayload::FwRules(rules) => rules.len(),
            SnapshotPayload::UrlBlocklist(urls) => urls.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_rules(&self) -> Option<&[PolicyRule]> {
        match self {
            SnapshotPayload::FwRules(rules) => Some(rules),
            SnapshotPayload::UrlBlocklist(_) => None,
        }
    }

    pub fn as_urls(&self) -> Option<&[String]> {
        match self {
            SnapshotPayload::UrlBlocklist(urls) => Some(urls),
            SnapshotPayload::FwRules(_) => None,
        }
    }
}

/// An immutable capture of one tenant's configuration of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tenant_id: String,
    pub sequence: i64,
    pub taken_at: chrono::DateTime<chrono::Utc>,
    pub kind: SnapshotKind,
    /// SHA-256 of the serialized payload, hex encoded.
    pub payload_hash: String,
    pub payload: SnapshotPayload,
}

impl Snapshot {
    /// The store key for this snapshot (`{sequence}-{kind}`).
    pub fn key(&self) -> String {
        snapshot_key(self.sequence, self.kind)
    }
}

/// Build the exact-match key `{sequence}-{kind}`.
pub fn snapshot_key(sequence: i64, kind: SnapshotKind) -> String {
    format!("{}-{}", sequence, kind.as_str())
}

/// Rule ids that differ between two snapshots of the same kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: BTreeSet<i64>,
    pub removed: BTreeSet<i64>,
    pub modified: BTreeSet<i64>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

/// Opaque handle to an audit report being generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportHandle {
    pub tenant_id: String,
    pub requested_at: i64,
}

/// Generation status of an audit report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditReportStatus {
    Pending,
    Complete,
    Errored,
}

impl AuditReportStatus {
    /// Map a remote status string. Anything unrecognized is still in progress.
    pub fn from_remote(raw: &str) -> Self {
        match raw {
            "COMPLETE" => AuditReportStatus::Complete,
            "ERRORED" => AuditReportStatus::Errored,
            _ => AuditReportStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuditReportStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_deserialize_remote_shape() {
        let rule: PolicyRule = serde_json::from_value(json!({
            "id": 1001,
            "name": "Allow Web",
            "order": 3,
            "rank": 7,
            "action": "ALLOW",
            "state": "ENABLED",
            "enableFullLogging": true,
            "nwServices": [{"id": 17, "name": "HTTP", "isNameL10nTag": true}],
            "labels": [{"id": 5, "name": "pscm-high"}],
            "destCountries": ["COUNTRY_CA"],
            "locations": [{"id": 9, "name": "HQ"}]
        }))
        .unwrap();

        assert_eq!(rule.id, Some(1001));
        assert_eq!(rule.order, 3);
        assert_eq!(rule.enable_full_logging, Some(true));
        assert_eq!(rule.nw_services[0].name, "HTTP");
        assert_eq!(rule.nw_services[0].extra.get("isNameL10nTag"), Some(&json!(true)));
        assert_eq!(rule.dest_countries.as_ref().map(Vec::len), Some(1));
        assert!(rule.extra.contains_key("locations"));
    }

    #[test]
    fn test_rule_serialize_omits_absent_fields() {
        let rule = PolicyRule::new("B", 2);
        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value, json!({"name": "B", "order": 2}));
    }

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let input = json!({"name": "X", "order": 1, "srcIps": ["10.0.0.1"]});
        let rule: PolicyRule = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(serde_json::to_value(&rule).unwrap(), input);
    }

    #[test]
    fn test_platform_managed() {
        let mut rule = PolicyRule::new("Default Firewall Filtering Rule", 1);
        assert!(!rule.is_platform_managed());
        rule.default_rule = Some(true);
        assert!(rule.is_platform_managed());
    }

    #[test]
    fn test_snapshot_kind_strings() {
        assert_eq!(SnapshotKind::FwRules.to_string(), "FW_RULES");
        assert_eq!(SnapshotKind::parse("URL_BLOCKLIST"), Some(SnapshotKind::UrlBlocklist));
        assert_eq!(SnapshotKind::parse("fw_rules"), None);
    }

    #[test]
    fn test_snapshot_key_format() {
        assert_eq!(snapshot_key(7, SnapshotKind::FwRules), "7-FW_RULES");
        assert_eq!(snapshot_key(1, SnapshotKind::UrlBlocklist), "1-URL_BLOCKLIST");
    }

    #[test]
    fn test_payload_kind_and_accessors() {
        let rules = SnapshotPayload::FwRules(vec![PolicyRule::new("A", 1)]);
        assert_eq!(rules.kind(), SnapshotKind::FwRules);
        assert_eq!(rules.len(), 1);
        assert!(rules.as_urls().is_none());

        let urls = SnapshotPayload::UrlBlocklist(vec![]);
        assert_eq!(urls.kind(), SnapshotKind::UrlBlocklist);
        assert!(urls.is_empty());
    }

    #[test]
    fn test_report_status_mapping() {
        assert_eq!(AuditReportStatus::from_remote("COMPLETE"), AuditReportStatus::Complete);
        assert_eq!(AuditReportStatus::from_remote("ERRORED"), AuditReportStatus::Errored);
        assert_eq!(AuditReportStatus::from_remote("EXECUTING"), AuditReportStatus::Pending);
        assert!(!AuditReportStatus::Pending.is_terminal());
        assert!(AuditReportStatus::Errored.is_terminal());
    }

    #[test]
    fn test_change_set_counts() {
        let mut set = ChangeSet::default();
        assert!(set.is_empty());
        set.modified.insert(3);
        set.added.insert(4);
        assert_eq!(set.len(), 2);
    }
}
