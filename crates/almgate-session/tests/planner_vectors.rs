//! Integration tests: call planner vectors.
//!
//! Each fixture in tests/fixtures/ has:
//! - case.json: `{"registry": "cold" | "warm", "intent": {...}}`
//! - expect.json: `{"plan": [rendered lines]}` or `{"error": {...}}`
//!
//! The warm registry holds project 1 "Platform", its trackers 42
//! "Requirements" and 43 "Bugs", and items 100..=103 named `REQ-<id>`.
//! Plans start at call-10.

use almgate_kernel::{
    CallId, Identifier, IdentifierKind, PolicyConfig, Provenance, RemoteId, ToolKind,
};
use almgate_session::{DiscoveryScope, IdentifierRegistry, Intent, plan_intent};
use serde_json::{Value, json};
use std::path::PathBuf;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn observed(kind: IdentifierKind, id: u64, name: &str, parent: Option<u64>, call: u64) -> Identifier {
    Identifier::observed(
        kind,
        RemoteId::new(id),
        Some(name.to_string()),
        parent.map(RemoteId::new),
        Provenance {
            call_id: CallId::new(call),
            tool: kind.discovered_by().unwrap_or(ToolKind::Query),
        },
    )
}

fn warm_registry() -> IdentifierRegistry {
    let mut registry = IdentifierRegistry::new();
    registry.record(observed(IdentifierKind::Project, 1, "Platform", None, 1));
    registry.note_discovery(DiscoveryScope::Projects);
    registry.record(observed(IdentifierKind::Tracker, 42, "Requirements", Some(1), 2));
    registry.record(observed(IdentifierKind::Tracker, 43, "Bugs", Some(1), 2));
    registry.note_discovery(DiscoveryScope::TrackersOf(RemoteId::new(1)));
    for id in 100..=103 {
        registry.record(observed(
            IdentifierKind::Item,
            id,
            &format!("REQ-{id}"),
            Some(42),
            3,
        ));
    }
    registry
}

fn run_fixture(name: &str) {
    let dir = fixtures_dir().join(name);

    let case_path = dir.join("case.json");
    let expect_path = dir.join("expect.json");

    let case_str = std::fs::read_to_string(&case_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", case_path.display()));
    let expect_str = std::fs::read_to_string(&expect_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", expect_path.display()));

    let case: Value = serde_json::from_str(&case_str)
        .unwrap_or_else(|e| panic!("failed to parse {}: {e}", case_path.display()));
    let expected: Value = serde_json::from_str(&expect_str)
        .unwrap_or_else(|e| panic!("failed to parse {}: {e}", expect_path.display()));

    let registry = match case["registry"].as_str() {
        Some("warm") => warm_registry(),
        Some("cold") => IdentifierRegistry::new(),
        other => panic!("fixture {name}: unknown registry {other:?}"),
    };
    let intent: Intent = serde_json::from_value(case["intent"].clone())
        .unwrap_or_else(|e| panic!("fixture {name}: bad intent: {e}"));

    let policy = PolicyConfig::default();
    let outcome = plan_intent(&intent, &policy, &registry, CallId::new(10));
    let result_json = match &outcome {
        Ok(plan) => json!({
            "plan": plan.render().lines().collect::<Vec<_>>(),
        }),
        Err(err) => json!({ "error": err }),
    };

    // Planning reads the registry only, so a second pass gives the same plan.
    let again = plan_intent(&intent, &policy, &registry, CallId::new(10));
    assert_eq!(
        again.map(|p| p.digest()),
        outcome.map(|p| p.digest()),
        "fixture {name} is not deterministic"
    );

    assert_eq!(
        result_json,
        expected,
        "\n\nFixture: {name}\n\nGot:\n{}\n\nExpected:\n{}\n",
        serde_json::to_string_pretty(&result_json).unwrap(),
        serde_json::to_string_pretty(&expected).unwrap(),
    );
}

#[test]
fn golden_linked_bulk_update() {
    run_fixture("golden_linked_bulk_update");
}

#[test]
fn golden_cold_discovery_then_injected_scope() {
    run_fixture("golden_cold_discovery_then_injected_scope");
}

#[test]
fn golden_two_trackers_share_one_discovery() {
    run_fixture("golden_two_trackers_share_one_discovery");
}

#[test]
fn golden_mixed_writes() {
    run_fixture("golden_mixed_writes");
}

#[test]
fn golden_predicate_case_and_semicolon_corrected() {
    run_fixture("golden_predicate_case_and_semicolon_corrected");
}

#[test]
fn adversarial_unresolvable_item() {
    run_fixture("adversarial_unresolvable_item");
}

#[test]
fn adversarial_scope_not_inferable() {
    run_fixture("adversarial_scope_not_inferable");
}

#[test]
fn adversarial_still_invalid_after_correction() {
    run_fixture("adversarial_still_invalid_after_correction");
}

#[test]
fn adversarial_unknown_read_label() {
    run_fixture("adversarial_unknown_read_label");
}
