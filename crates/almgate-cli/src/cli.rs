use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "almgate",
    about = "almgate: validate, plan, and dispatch ALM tool calls under a fixed policy",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check one CBQL expression against the grammar policy
    Validate {
        /// CBQL expression to check
        cbql: String,

        /// Path to a policy TOML file (defaults apply when omitted)
        #[arg(long)]
        policy: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan an intent against an empty registry without dispatching anything
    Plan {
        /// Path to the intent JSON
        #[arg(long)]
        intent: String,

        /// Path to a policy TOML file (defaults apply when omitted)
        #[arg(long)]
        policy: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan and run intents in one session against a fixture workspace
    Run {
        /// Path to an intent JSON; repeat to run several in order
        #[arg(long = "intent", required = true)]
        intents: Vec<String>,

        /// Path to the fixture workspace JSON
        #[arg(long)]
        fixture: String,

        /// Path to a policy TOML file (defaults apply when omitted)
        #[arg(long)]
        policy: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Serve the orchestrator over MCP on stdio, backed by a fixture workspace
    McpServe {
        /// Path to the fixture workspace JSON
        #[arg(long)]
        fixture: String,

        /// Path to a policy TOML file (defaults apply when omitted)
        #[arg(long)]
        policy: Option<String>,

        /// MCP server name reported during initialize
        #[arg(long, default_value = "almgate")]
        server_name: String,

        /// MCP server version reported during initialize
        #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
        server_version: String,
    },
}
