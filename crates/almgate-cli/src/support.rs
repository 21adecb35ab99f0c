use almgate_fixture::FixtureWorkspace;
use almgate_kernel::{OrchestratorError, PolicyConfig};
use almgate_session::Intent;
use serde::Serialize;
use serde_json::{Value, json};
use std::process;

/// Plan rejected or run stopped.
pub const EXIT_ORCHESTRATION: i32 = 1;
/// Unreadable or malformed input files.
pub const EXIT_INPUT: i32 = 2;

fn input_error(message: String) -> ! {
    eprintln!("error: {message}");
    process::exit(EXIT_INPUT);
}

pub fn load_policy_or_exit(path: Option<&str>) -> PolicyConfig {
    let Some(path) = path else {
        return PolicyConfig::default();
    };
    PolicyConfig::load(path).unwrap_or_else(|e| input_error(e.to_string()))
}

pub fn load_intent_or_exit(path: &str) -> Intent {
    Intent::load(path).unwrap_or_else(|e| input_error(e.to_string()))
}

pub fn load_fixture_or_exit(path: &str) -> FixtureWorkspace {
    FixtureWorkspace::load(path).unwrap_or_else(|e| input_error(e.to_string()))
}

pub fn print_json(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).expect("json serialization")
    );
}

/// `{"kind": ..., "message": ..., "detail": {...}}` for an orchestration error.
pub fn error_json(err: &OrchestratorError) -> Value {
    json!({
        "kind": err.kind(),
        "message": err.to_string(),
        "detail": err,
    })
}

pub fn yes_no(ok: bool) -> &'static str {
    if ok { "yes" } else { "no" }
}
