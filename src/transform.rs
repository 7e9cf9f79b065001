// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Parent-to-child rule transformation.
//!
//! Ids are tenant-local, so a parent rule cannot be written to a child
//! as-is. For each parent rule, in parent order:
//!
//! ```text
//! platform-managed? ──► skip
//! child has the name? ──► skip (idempotence)
//! strip id
//! drop destCountries / destIpCategories / resCategories
//! labels:     keep recognized names only, remap id by name
//! nwServices: remap id by exact name
//! unresolved reference ──► skip rule, or drop the reference (policy)
//! ```
//!
//! The output is sorted by `order`, stable for equal orders. Input rules are
//! never modified.

use crate::config::{TransformConfig, UnresolvedReferencePolicy};
use crate::metrics;
use crate::model::{EntityRef, PolicyRule, ReferenceEntity};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Kind of entity a rule references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    NetworkService,
    Label,
}

impl ReferenceKind {
    /// Wire field holding references of this kind.
    pub fn field(&self) -> &'static str {
        match self {
            ReferenceKind::NetworkService => "nwServices",
            ReferenceKind::Label => "labels",
        }
    }
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceKind::NetworkService => f.write_str("network service"),
            ReferenceKind::Label => f.write_str("label"),
        }
    }
}

/// Why a parent rule was not written to a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The child already has a rule with this name.
    AlreadyExists,
    /// Built-in rule the platform owns on every tenant.
    PlatformManaged,
    /// A referenced entity has no counterpart on the child.
    UnresolvedReference { kind: ReferenceKind, name: String },
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyExists => "exists",
            SkipReason::PlatformManaged => "platform_managed",
            SkipReason::UnresolvedReference { .. } => "unresolved_reference",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UnresolvedReference { kind, name } => {
                write!(f, "unresolved {} '{}'", kind, name)
            }
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRule {
    pub name: String,
    pub order: i64,
    pub reason: SkipReason,
}

/// Something removed from a rule that was still written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedReference {
    pub rule: String,
    /// Wire field the value was removed from.
    pub field: &'static str,
    /// Entity name, for label and service references.
    pub name: Option<String>,
}

/// Rules ready to create on one child, plus what was left out.
#[derive(Debug, Clone, Default)]
pub struct ChildRuleset {
    pub rules: Vec<PolicyRule>,
    pub skipped: Vec<SkippedRule>,
    pub dropped: Vec<DroppedReference>,
}

/// Turns parent rules into child-ready rules.
#[derive(Debug, Clone)]
pub struct RuleTransformer {
    recognized_labels: HashSet<String>,
    excluded_names: Vec<String>,
    policy: UnresolvedReferencePolicy,
}

impl RuleTransformer {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            recognized_labels: config.recognized_labels.iter().cloned().collect(),
            excluded_names: config.excluded_rule_names.clone(),
            policy: config.unresolved_references,
        }
    }

    pub fn is_recognized_label(&self, name: &str) -> bool {
        self.recognized_labels.contains(name)
    }

    /// Recognized label names, sorted.
    pub fn recognized_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.recognized_labels.iter().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }

    /// Whether a parent rule may be copied to children at all.
    ///
    /// Excluded names match anywhere in the rule name, so renamed copies of
    /// platform rules stay excluded too.
    pub fn is_replicable(&self, rule: &PolicyRule) -> bool {
        !rule.is_platform_managed()
            && !self
                .excluded_names
                .iter()
                .any(|name| rule.name.contains(name.as_str()))
    }

    /// Build the rules to create on `tenant_id`.
    pub fn build_child_ruleset(
        &self,
        tenant_id: &str,
        parent_rules: &[PolicyRule],
        child_existing: &[PolicyRule],
        child_services: &[ReferenceEntity],
        child_labels: &[ReferenceEntity],
    ) -> ChildRuleset {
        let existing: HashSet<&str> = child_existing.iter().map(|r| r.name.as_str()).collect();
        let services = index_by_name(child_services);
        let labels = index_by_name(child_labels);
        let mut out = ChildRuleset::default();

        for parent in parent_rules {
            let skip = |reason: SkipReason| SkippedRule {
                name: parent.name.clone(),
                order: parent.order,
                reason,
            };

            if !self.is_replicable(parent) {
                debug!(tenant_id = %tenant_id, rule_name = %parent.name, "Skipping platform-managed rule");
                out.skipped.push(skip(SkipReason::PlatformManaged));
                continue;
            }
            if existing.contains(parent.name.as_str()) {
                debug!(tenant_id = %tenant_id, rule_name = %parent.name, "Rule already present on child");
                out.skipped.push(skip(SkipReason::AlreadyExists));
                continue;
            }

            let mut rule = parent.clone();
            rule.id = None;
            let mut dropped = Vec::new();
            strip_unportable(&mut rule, &mut dropped);

            let remapped = self.remap_labels(&rule, &labels, &mut dropped).and_then(|l| {
                self.remap_services(&rule, &services, &mut dropped)
                    .map(|s| (l, s))
            });
            match remapped {
                Ok((new_labels, new_services)) => {
                    rule.labels = new_labels;
                    rule.nw_services = new_services;
                }
                Err(reason) => {
                    warn!(
                        tenant_id = %tenant_id,
                        rule_name = %parent.name,
                        reason = %reason,
                        "Skipping rule with unresolved reference"
                    );
                    out.skipped.push(skip(reason));
                    continue;
                }
            }

            for drop in &dropped {
                warn!(
                    tenant_id = %tenant_id,
                    rule_name = %drop.rule,
                    field = drop.field,
                    name = drop.name.as_deref().unwrap_or(""),
                    "Dropped value not replicable to child"
                );
                metrics::record_reference_dropped(tenant_id, drop.field);
            }
            out.dropped.extend(dropped);
            out.rules.push(rule);
        }

        for skipped in &out.skipped {
            metrics::record_rule_skipped(tenant_id, skipped.reason.as_str());
        }

        // Stable: equal orders keep parent sequence.
        out.rules.sort_by_key(|r| r.order);
        out
    }

    fn remap_labels(
        &self,
        rule: &PolicyRule,
        child_labels: &HashMap<&str, i64>,
        dropped: &mut Vec<DroppedReference>,
    ) -> std::result::Result<Vec<EntityRef>, SkipReason> {
        let mut out = Vec::new();
        for label in &rule.labels {
            if !self.is_recognized_label(&label.name) {
                dropped.push(DroppedReference {
                    rule: rule.name.clone(),
                    field: ReferenceKind::Label.field(),
                    name: Some(label.name.clone()),
                });
                continue;
            }
            match child_labels.get(label.name.as_str()) {
                Some(&id) => out.push(EntityRef::named(label.name.clone()).with_id(id)),
                None => self.unresolved(rule, ReferenceKind::Label, &label.name, dropped)?,
            }
        }
        Ok(out)
    }

    fn remap_services(
        &self,
        rule: &PolicyRule,
        child_services: &HashMap<&str, i64>,
        dropped: &mut Vec<DroppedReference>,
    ) -> std::result::Result<Vec<EntityRef>, SkipReason> {
        let mut out = Vec::new();
        for service in &rule.nw_services {
            match child_services.get(service.name.as_str()) {
                Some(&id) => {
                    let mut remapped = service.clone();
                    remapped.id = Some(id);
                    out.push(remapped);
                }
                None => {
                    self.unresolved(rule, ReferenceKind::NetworkService, &service.name, dropped)?
                }
            }
        }
        Ok(out)
    }

    /// Apply the unresolved-reference policy: `Err` skips the rule.
    fn unresolved(
        &self,
        rule: &PolicyRule,
        kind: ReferenceKind,
        name: &str,
        dropped: &mut Vec<DroppedReference>,
    ) -> std::result::Result<(), SkipReason> {
        match self.policy {
            UnresolvedReferencePolicy::SkipRule => Err(SkipReason::UnresolvedReference {
                kind,
                name: name.to_string(),
            }),
            UnresolvedReferencePolicy::DropReference => {
                dropped.push(DroppedReference {
                    rule: rule.name.clone(),
                    field: kind.field(),
                    name: Some(name.to_string()),
                });
                Ok(())
            }
        }
    }
}

fn index_by_name(entities: &[ReferenceEntity]) -> HashMap<&str, i64> {
    entities.iter().map(|e| (e.name.as_str(), e.id)).collect()
}

/// Remove fields whose values cannot be carried to another tenant.
fn strip_unportable(rule: &mut PolicyRule, dropped: &mut Vec<DroppedReference>) {
    let fields = [
        ("destCountries", rule.dest_countries.take()),
        ("destIpCategories", rule.dest_ip_categories.take()),
        ("resCategories", rule.res_categories.take()),
    ];
    for (field, value) in fields {
        if value.is_some_and(|v| !v.is_empty()) {
            dropped.push(DroppedReference {
                rule: rule.name.clone(),
                field,
                name: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transformer(policy: UnresolvedReferencePolicy) -> RuleTransformer {
        RuleTransformer::new(&TransformConfig {
            unresolved_references: policy,
            ..Default::default()
        })
    }

    fn labels() -> Vec<ReferenceEntity> {
        vec![ReferenceEntity::new(501, "pscm-high"), ReferenceEntity::new(502, "pscm-low")]
    }

    #[test]
    fn test_existing_rule_skipped_new_rule_stripped() {
        let parent = vec![
            PolicyRule::new("A", 1).with_id(11),
            PolicyRule::new("B", 2).with_id(12),
        ];
        let child = vec![PolicyRule::new("A", 1).with_id(900)];

        let out = transformer(UnresolvedReferencePolicy::SkipRule)
            .build_child_ruleset("SUB1", &parent, &child, &[], &labels());

        assert_eq!(out.rules.len(), 1);
        assert_eq!(out.rules[0].name, "B");
        assert_eq!(out.rules[0].id, None);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].reason, SkipReason::AlreadyExists);
    }

    #[test]
    fn test_service_remapped_by_name() {
        let parent = vec![PolicyRule::new("Web", 1)
            .with_id(10)
            .with_service(EntityRef::named("HTTP_8080").with_id(7))];
        let services = vec![ReferenceEntity::new(41, "HTTP"), ReferenceEntity::new(42, "HTTP_8080")];

        let out = transformer(UnresolvedReferencePolicy::SkipRule)
            .build_child_ruleset("SUB1", &parent, &[], &services, &[]);

        assert_eq!(out.rules[0].nw_services.len(), 1);
        assert_eq!(out.rules[0].nw_services[0].id, Some(42));
        assert_eq!(out.rules[0].nw_services[0].name, "HTTP_8080");
        // Input untouched
        assert_eq!(parent[0].nw_services[0].id, Some(7));
    }

    #[test]
    fn test_service_name_match_is_exact() {
        let parent = vec![PolicyRule::new("Web", 1).with_service(EntityRef::named("http"))];
        let services = vec![ReferenceEntity::new(41, "HTTP")];

        let out = transformer(UnresolvedReferencePolicy::SkipRule)
            .build_child_ruleset("SUB1", &parent, &[], &services, &[]);
        assert!(out.rules.is_empty());
        assert_eq!(
            out.skipped[0].reason,
            SkipReason::UnresolvedReference {
                kind: ReferenceKind::NetworkService,
                name: "http".to_string()
            }
        );
    }

    #[test]
    fn test_unresolved_reference_dropped_under_drop_policy() {
        let parent = vec![PolicyRule::new("Web", 1)
            .with_service(EntityRef::named("HTTP").with_id(7))
            .with_service(EntityRef::named("CUSTOM_9999").with_id(8))];
        let services = vec![ReferenceEntity::new(41, "HTTP")];

        let out = transformer(UnresolvedReferencePolicy::DropReference)
            .build_child_ruleset("SUB1", &parent, &[], &services, &[]);

        assert_eq!(out.rules.len(), 1);
        let remapped = &out.rules[0].nw_services;
        assert_eq!(remapped.len(), 1);
        assert_eq!(remapped[0].id, Some(41));
        assert_eq!(out.dropped[0].name.as_deref(), Some("CUSTOM_9999"));
        assert_eq!(out.dropped[0].field, "nwServices");
    }

    #[test]
    fn test_labels_filtered_and_remapped() {
        let parent = vec![PolicyRule::new("Tagged", 1)
            .with_label(EntityRef::named("pscm-high").with_id(3))
            .with_label(EntityRef::named("team-alpha").with_id(4))
            .with_label(EntityRef::named("pscm-high-extra").with_id(5))];

        let out = transformer(UnresolvedReferencePolicy::SkipRule)
            .build_child_ruleset("SUB1", &parent, &[], &[], &labels());

        let kept: Vec<_> = out.rules[0].labels.iter().map(|l| (l.name.as_str(), l.id)).collect();
        assert_eq!(kept, vec![("pscm-high", Some(501))]);
        assert_eq!(out.dropped.len(), 2);
    }

    #[test]
    fn test_recognized_label_missing_on_child_is_unresolved() {
        let parent = vec![PolicyRule::new("Tagged", 1).with_label(EntityRef::named("pscm-low"))];
        let out = transformer(UnresolvedReferencePolicy::SkipRule)
            .build_child_ruleset("SUB1", &parent, &[], &[], &[]);
        assert!(out.rules.is_empty());
        assert!(matches!(
            out.skipped[0].reason,
            SkipReason::UnresolvedReference { kind: ReferenceKind::Label, .. }
        ));
    }

    #[test]
    fn test_unportable_fields_stripped() {
        let mut rule = PolicyRule::new("Geo", 1).with_id(1);
        rule.dest_countries = Some(vec![json!("COUNTRY_CA")]);
        rule.dest_ip_categories = Some(vec![]);
        rule.res_categories = Some(vec![json!("OTHER_RESOURCES")]);

        let out = transformer(UnresolvedReferencePolicy::SkipRule)
            .build_child_ruleset("SUB1", &[rule], &[], &[], &[]);

        let written = &out.rules[0];
        assert!(written.dest_countries.is_none());
        assert!(written.dest_ip_categories.is_none());
        assert!(written.res_categories.is_none());
        let fields: Vec<_> = out.dropped.iter().map(|d| d.field).collect();
        assert_eq!(fields, vec!["destCountries", "resCategories"]);
    }

    #[test]
    fn test_platform_managed_rules_never_replicated() {
        let mut predefined = PolicyRule::new("Block Malicious", 1);
        predefined.predefined = Some(true);
        let parent = vec![
            predefined,
            PolicyRule::new("Default Firewall Filtering Rule", 99),
            PolicyRule::new("Office 365 One Click Rule", 2),
            PolicyRule::new("Custom", 3),
        ];

        let t = transformer(UnresolvedReferencePolicy::SkipRule);
        let out = t.build_child_ruleset("SUB1", &parent, &[], &[], &[]);

        assert_eq!(out.rules.len(), 1);
        assert_eq!(out.rules[0].name, "Custom");
        assert!(out.skipped.iter().all(|s| s.reason == SkipReason::PlatformManaged));
        assert!(!t.is_replicable(&parent[0]));
    }

    #[test]
    fn test_excluded_name_matches_anywhere_in_rule_name() {
        let t = transformer(UnresolvedReferencePolicy::SkipRule);
        let parent = vec![
            PolicyRule::new("Copy of Default Firewall Filtering Rule", 1),
            PolicyRule::new("Legacy - Zscaler Proxy Traffic", 2),
            PolicyRule::new("Default Firewall", 3),
        ];

        let out = t.build_child_ruleset("SUB1", &parent, &[], &[], &[]);

        assert_eq!(out.rules.len(), 1);
        assert_eq!(out.rules[0].name, "Default Firewall");
        assert_eq!(out.skipped.len(), 2);
        assert!(out.skipped.iter().all(|s| s.reason == SkipReason::PlatformManaged));
    }

    #[test]
    fn test_output_sorted_by_order_stable() {
        let parent = vec![
            PolicyRule::new("C", 3),
            PolicyRule::new("A1", 1),
            PolicyRule::new("B", 2),
            PolicyRule::new("A2", 1),
        ];
        let out = transformer(UnresolvedReferencePolicy::SkipRule)
            .build_child_ruleset("SUB1", &parent, &[], &[], &[]);
        let names: Vec<_> = out.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["A1", "A2", "B", "C"]);
    }

    #[test]
    fn test_idempotent_against_own_output() {
        let parent = vec![PolicyRule::new("A", 1).with_id(1), PolicyRule::new("B", 2).with_id(2)];
        let t = transformer(UnresolvedReferencePolicy::SkipRule);

        let first = t.build_child_ruleset("SUB1", &parent, &[], &[], &[]);
        let second = t.build_child_ruleset("SUB1", &parent, &first.rules, &[], &[]);
        assert!(second.rules.is_empty());
        assert_eq!(second.skipped.len(), 2);
    }

    #[test]
    fn test_recognized_labels_sorted() {
        let t = transformer(UnresolvedReferencePolicy::SkipRule);
        assert_eq!(t.recognized_labels(), vec!["pscm-high", "pscm-low"]);
        assert!(t.is_recognized_label("pscm-low"));
        assert!(!t.is_recognized_label("PSCM-LOW"));
    }
}
