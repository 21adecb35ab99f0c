use super::plan::plan_json;
use crate::support::{
    EXIT_ORCHESTRATION, error_json, load_fixture_or_exit, load_intent_or_exit, load_policy_or_exit,
    print_json,
};
use almgate_fixture::FixtureAdapter;
use almgate_session::{RateLimitState, RunReport, Session, StepOutput, StepResult};
use serde_json::{Value, json};
use std::process;
use std::sync::Arc;

pub fn run(intents: Vec<String>, fixture: String, policy: Option<String>, json_output: bool) {
    let policy = Arc::new(load_policy_or_exit(policy.as_deref()));
    let parsed: Vec<_> = intents
        .iter()
        .map(|path| (path.clone(), load_intent_or_exit(path)))
        .collect();
    let adapter = FixtureAdapter::new(load_fixture_or_exit(&fixture));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("error: failed to create tokio runtime: {e}");
            process::exit(1);
        });

    let mut session = Session::new(policy);
    let mut runs = Vec::new();
    let mut failed = false;

    runtime.block_on(async {
        for (path, intent) in &parsed {
            let plan = match session.plan(intent) {
                Ok(plan) => plan,
                Err(err) => {
                    if !json_output {
                        eprintln!("error: {path}: {err}");
                    }
                    runs.push(json!({ "intent": path, "error": error_json(&err) }));
                    failed = true;
                    break;
                }
            };
            let planned = plan_json(&plan);
            let report = session.execute(plan, &adapter).run_to_end().await;
            if !json_output {
                print_report(path, &report);
            }
            let complete = report.is_complete();
            runs.push(run_json(path, planned, &report));
            if !complete {
                failed = true;
                break;
            }
        }
    });

    let status = session.status();
    if json_output {
        print_json(&json!({
            "session": session.id(),
            "runs": runs,
            "status": status,
        }));
    } else {
        match status.rate_limit {
            RateLimitState::Open => println!("  Rate limit: open"),
            RateLimitState::Halted {
                resume_after_seconds,
            } => println!("  Rate limit: halted ({resume_after_seconds}s remaining, reset required)"),
        }
        println!(
            "  Registry: {} projects, {} trackers, {} items",
            status.projects, status.trackers, status.items
        );
    }

    if failed {
        process::exit(EXIT_ORCHESTRATION);
    }
}

fn run_json(path: &str, plan: Value, report: &RunReport) -> Value {
    let mut payload = json!({
        "intent": path,
        "plan": plan,
        "report": report,
    });
    if let Some(err) = &report.error {
        payload["error"] = error_json(err);
    }
    payload
}

fn print_report(path: &str, report: &RunReport) {
    println!("almgate run {path}");
    println!("  Session: {}", report.session);
    println!("  Plan: {}", report.plan_digest);
    for step in &report.steps {
        println!("  [{}] {} {}", step.call_id, step.tool, outcome_line(step));
    }
    match &report.error {
        None => println!("  Completed: yes"),
        Some(err) => {
            println!("  Completed: no");
            println!("  Stopped: {err}");
            println!("  Cancelled steps: {}", report.cancelled_steps);
        }
    }
}

fn outcome_line(step: &StepResult) -> String {
    match &step.output {
        StepOutput::Projects { projects } => format!("{} projects", projects.len()),
        StepOutput::Trackers { project, trackers } => {
            format!("{} trackers in project {project}", trackers.len())
        }
        StepOutput::Items { items, pages, .. } => {
            format!("{} items over {pages} page(s)", items.len())
        }
        StepOutput::Relations { graph } => format!("{} relation edges", graph.edges.len()),
        StepOutput::Writes { outcomes } => {
            let ok = outcomes.iter().filter(|o| o.ok).count();
            format!("{ok}/{} items written", outcomes.len())
        }
    }
}
