//! almgate CLI: the `almgate` command.

mod cli;
mod commands;
mod support;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    // stdout carries results and the MCP protocol; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("ALMGATE_LOG")
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { cbql, policy, json } => commands::validate::run(cbql, policy, json),

        Commands::Plan {
            intent,
            policy,
            json,
        } => commands::plan::run(intent, policy, json),

        Commands::Run {
            intents,
            fixture,
            policy,
            json,
        } => commands::run::run(intents, fixture, policy, json),

        Commands::McpServe {
            fixture,
            policy,
            server_name,
            server_version,
        } => commands::mcp_serve::run(commands::mcp_serve::Args {
            fixture,
            policy,
            server_name,
            server_version,
        }),
    }
}
