use crate::support::{
    EXIT_ORCHESTRATION, error_json, load_intent_or_exit, load_policy_or_exit, print_json,
};
use almgate_kernel::{CallId, Plan};
use almgate_session::{IdentifierRegistry, plan_intent};
use serde_json::{Value, json};

pub fn plan_json(plan: &Plan) -> Value {
    json!({
        "planDigest": plan.digest(),
        "stepCount": plan.len(),
        "steps": plan.steps(),
        "listing": plan.render().lines().collect::<Vec<_>>(),
    })
}

pub fn run(intent: String, policy: Option<String>, json_output: bool) {
    let policy = load_policy_or_exit(policy.as_deref());
    let parsed = load_intent_or_exit(&intent);

    // Nothing has been discovered yet, so every named project and tracker
    // gets a discovery step.
    let registry = IdentifierRegistry::new();
    let outcome = plan_intent(&parsed, &policy, &registry, CallId::new(1));

    match outcome {
        Ok(plan) => {
            if json_output {
                print_json(&plan_json(&plan));
            } else {
                println!("almgate plan {intent}");
                println!("  Steps: {}", plan.len());
                println!("  Digest: {}", plan.digest());
                for line in plan.render().lines() {
                    println!("  {line}");
                }
            }
        }
        Err(err) => {
            if json_output {
                print_json(&json!({ "error": error_json(&err) }));
            } else {
                eprintln!("error: {err}");
            }
            std::process::exit(EXIT_ORCHESTRATION);
        }
    }
}
