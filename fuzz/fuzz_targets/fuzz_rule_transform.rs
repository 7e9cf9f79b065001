//! Fuzz target for rule decoding and transformation.
//!
//! Decodes arbitrary bytes as a parent ruleset and runs it through the
//! transformer against an empty child. Must never panic, and must never
//! emit a rule that still carries an id.

#![no_main]

use libfuzzer_sys::fuzz_target;
use policy_replication::diff::changed_rule_names;
use policy_replication::{PolicyRule, RuleTransformer, TransformConfig};

fuzz_target!(|data: &[u8]| {
    let Ok(rules) = serde_json::from_slice::<Vec<PolicyRule>>(data) else {
        return;
    };

    let transformer = RuleTransformer::new(&TransformConfig::default());
    let ruleset = transformer.build_child_ruleset("SUB1", &rules, &[], &[], &[]);
    assert!(ruleset.rules.iter().all(|r| r.id.is_none()));

    let _ = changed_rule_names(&rules, &ruleset.rules);
});
