// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structural comparison of rulesets.
//!
//! Two correlation modes:
//!
//! - **By id** ([`changed_rule_ids`], [`change_set`]): snapshots of the same
//!   tenant, where ids are stable.
//! - **By name** ([`changed_rule_names`]): rules from different tenants,
//!   where ids mean nothing. Rule and reference ids are stripped before
//!   comparing.

use crate::model::{ChangeSet, PolicyRule};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Recursive structural equality.
///
/// Variants must match. Objects compare key by key regardless of order;
/// arrays compare position by position.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| deep_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, l)| y.get(key).is_some_and(|r| deep_equal(l, r)))
        }
        _ => false,
    }
}

/// Ids of rules present in both sets whose content differs.
///
/// Rules without an id, additions and removals are not reported.
pub fn changed_rule_ids(old: &[PolicyRule], new: &[PolicyRule]) -> BTreeSet<i64> {
    let index: HashMap<i64, &PolicyRule> = new
        .iter()
        .filter_map(|rule| rule.id.map(|id| (id, rule)))
        .collect();

    old.iter()
        .filter_map(|rule| {
            let id = rule.id?;
            let counterpart = index.get(&id)?;
            (!deep_equal(&rule.to_value(), &counterpart.to_value())).then_some(id)
        })
        .collect()
}

/// Added, removed and modified rule ids between two snapshots.
pub fn change_set(old: &[PolicyRule], new: &[PolicyRule]) -> ChangeSet {
    let old_ids: BTreeSet<i64> = old.iter().filter_map(|r| r.id).collect();
    let new_ids: BTreeSet<i64> = new.iter().filter_map(|r| r.id).collect();

    ChangeSet {
        added: new_ids.difference(&old_ids).copied().collect(),
        removed: old_ids.difference(&new_ids).copied().collect(),
        modified: changed_rule_ids(old, new),
    }
}

/// Names of rules present in both sets whose portable content differs.
pub fn changed_rule_names(old: &[PolicyRule], new: &[PolicyRule]) -> BTreeSet<String> {
    let index: HashMap<&str, &PolicyRule> =
        new.iter().map(|rule| (rule.name.as_str(), rule)).collect();

    old.iter()
        .filter_map(|rule| {
            let counterpart = index.get(rule.name.as_str())?;
            (!deep_equal(&portable_value(rule), &portable_value(counterpart)))
                .then(|| rule.name.clone())
        })
        .collect()
}

/// A rule's JSON with every tenant-local id removed.
fn portable_value(rule: &PolicyRule) -> Value {
    let mut value = rule.to_value();
    if let Value::Object(map) = &mut value {
        map.remove("id");
        for field in ["nwServices", "labels"] {
            if let Some(Value::Array(refs)) = map.get_mut(field) {
                for entry in refs.iter_mut() {
                    if let Value::Object(entry) = entry {
                        entry.remove("id");
                    }
                }
            }
        }
    }
    value
}
