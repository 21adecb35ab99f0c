use crate::support::{EXIT_ORCHESTRATION, load_policy_or_exit, print_json, yes_no};
use almgate_kernel::{QueryExpression, correct, validate};
use serde_json::json;

pub fn run(cbql: String, policy: Option<String>, json_output: bool) {
    let policy = load_policy_or_exit(policy.as_deref());
    let expression = QueryExpression::parse(&cbql);
    let verdict = validate(&expression, &policy);

    // Without read context only mechanical repairs apply; no scope is guessed.
    let suggestion = verdict.as_ref().err().and_then(|rejection| {
        let correction = correct(&expression, rejection, &policy, None)?;
        let valid = validate(&correction.expression, &policy).is_ok();
        Some((correction, valid))
    });

    if json_output {
        let mut payload = match &verdict {
            Ok(valid) => json!({
                "valid": true,
                "cbql": cbql,
                "scope": valid.scope(),
                "predicates": valid.predicates(),
            }),
            Err(rejection) => json!({
                "valid": false,
                "cbql": cbql,
                "rejection": rejection,
                "message": rejection.to_string(),
            }),
        };
        if let Some((correction, valid)) = &suggestion {
            payload["correction"] = json!({
                "expression": correction.expression,
                "applied": correction.applied,
                "valid": valid,
            });
        }
        print_json(&payload);
    } else {
        println!("almgate validate");
        println!("  Query: {cbql}");
        match &verdict {
            Ok(valid) => {
                println!("  Valid: yes");
                println!("  Scope: {}", valid.scope());
                if !valid.predicates().is_empty() {
                    println!("  Predicates: {}", valid.predicates().join(", "));
                }
            }
            Err(rejection) => {
                println!("  Valid: no ({})", rejection.reason());
                println!("  Reason: {rejection}");
            }
        }
        if let Some((correction, valid)) = &suggestion {
            println!(
                "  Suggested: {} (valid after repair: {})",
                correction.expression,
                yes_no(*valid)
            );
        }
    }

    if verdict.is_err() {
        std::process::exit(EXIT_ORCHESTRATION);
    }
}
