//! Integration tests: grammar validator vectors.
//!
//! Each fixture in tests/fixtures/ has:
//! - case.json: `{"cbql": ...}`
//! - expect.json: the expected verdict under the default policy

use almgate_kernel::{PolicyConfig, QueryExpression, validate};
use serde_json::{Value, json};
use std::path::PathBuf;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
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

    let cbql = case["cbql"].as_str().expect("missing cbql field");
    let expression = QueryExpression::parse(cbql);
    let policy = PolicyConfig::default();

    let verdict = validate(&expression, &policy);
    let result_json = match &verdict {
        Ok(valid) => json!({
            "valid": true,
            "scope": valid.scope(),
            "predicates": valid.predicates(),
        }),
        Err(rejection) => json!({
            "valid": false,
            "rejection": rejection,
        }),
    };

    // Same input, same verdict.
    assert_eq!(validate(&expression, &policy), verdict, "fixture {name} is not idempotent");

    assert_eq!(
        result_json,
        expected,
        "\n\nFixture: {name}\n\nGot:\n{}\n\nExpected:\n{}\n",
        serde_json::to_string_pretty(&result_json).unwrap(),
        serde_json::to_string_pretty(&expected).unwrap(),
    );
}

#[test]
fn golden_tracker_scope_with_link() {
    run_fixture("golden_tracker_scope_with_link");
}

#[test]
fn golden_project_name_scope() {
    run_fixture("golden_project_name_scope");
}

#[test]
fn golden_keywords_inside_strings() {
    run_fixture("golden_keywords_inside_strings");
}

#[test]
fn adversarial_empty() {
    run_fixture("adversarial_empty");
}

#[test]
fn adversarial_scope_missing() {
    run_fixture("adversarial_scope_missing");
}

#[test]
fn adversarial_two_scopes() {
    run_fixture("adversarial_two_scopes");
}

#[test]
fn adversarial_unsupported_predicate() {
    run_fixture("adversarial_unsupported_predicate");
}

#[test]
fn adversarial_predicate_wrong_case() {
    run_fixture("adversarial_predicate_wrong_case");
}

#[test]
fn adversarial_sql_subselect() {
    run_fixture("adversarial_sql_subselect");
}

#[test]
fn adversarial_bare_star() {
    run_fixture("adversarial_bare_star");
}

#[test]
fn adversarial_batched_statements() {
    run_fixture("adversarial_batched_statements");
}
