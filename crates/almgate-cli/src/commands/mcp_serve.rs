use super::plan::plan_json;
use crate::support::{error_json, load_fixture_or_exit, load_policy_or_exit};
use almgate_fixture::FixtureAdapter;
use almgate_kernel::{CallId, PolicyConfig, QueryExpression, correct, validate};
use almgate_session::{Intent, RateLimitState, Session, plan_intent};
use async_trait::async_trait;
use rust_mcp_sdk::{
    McpServer, StdioTransport, ToMcpServerHandler, TransportOptions,
    macros::{JsonSchema, mcp_tool},
    mcp_server::{McpServerOptions, ServerHandler, ServerRuntime, server_runtime},
    schema::{
        CallToolRequestParams, CallToolResult, Implementation, InitializeResult, ListToolsResult,
        PaginatedRequestParams, ProtocolVersion, RpcError, ServerCapabilities,
        ServerCapabilitiesTools, TextContent, schema_utils::CallToolError,
    },
    tool_box,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::process;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Args {
    pub fixture: String,
    pub policy: Option<String>,
    pub server_name: String,
    pub server_version: String,
}

const SERVER_INSTRUCTIONS: &str = "Every ALM call goes through this server; nothing reaches the tracker unless it is planned here. \
CBQL rules: each query needs exactly one scope clause (tracker.id, tracker.name, project.id or project.name with = or IN). \
Relations use only the allowed predicates, exact case: hasLinkTo, hasParent, hasChild. \
No SQL keywords (SELECT, FROM, JOIN, UPDATE, DELETE, INSERT), no bare *, and one statement per query (no ;). \
Mediation rules: identifiers must come from discovery or earlier query results, never from memory; \
the planner adds discovery steps when a project or tracker is not yet known. \
Field changes that share a payload across several items are sent as one bulk update. \
A RATE_LIMITED response halts the session: call session_reset before dispatching again. \
Use validate_query to check CBQL, plan_intent to preview a plan, run_intent to execute one, and session_status to inspect the registry and governor.";

struct AlmgateMcpHandler {
    policy: Arc<PolicyConfig>,
    session: Mutex<Session>,
    adapter: Arc<FixtureAdapter>,
}

impl AlmgateMcpHandler {
    fn new(policy: PolicyConfig, adapter: FixtureAdapter) -> Self {
        let policy = Arc::new(policy);
        Self {
            session: Mutex::new(Session::new(Arc::clone(&policy))),
            policy,
            adapter: Arc::new(adapter),
        }
    }
}

pub fn run(args: Args) {
    eprintln!("almgate mcp-serve");
    eprintln!("  transport: stdio");
    eprintln!("  server: {} {}", args.server_name, args.server_version);
    eprintln!("  fixture: {}", args.fixture);
    eprintln!(
        "  policy: {}",
        args.policy.as_deref().unwrap_or("(defaults)")
    );

    let policy = load_policy_or_exit(args.policy.as_deref());
    let adapter = FixtureAdapter::new(load_fixture_or_exit(&args.fixture));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("error: failed to create tokio runtime: {e}");
            process::exit(1);
        });

    runtime.block_on(async move {
        if let Err(e) = run_async(args, policy, adapter).await {
            eprintln!("error: mcp server failed: {e}");
            process::exit(1);
        }
    });
}

async fn run_async(args: Args, policy: PolicyConfig, adapter: FixtureAdapter) -> Result<(), String> {
    let server_details = InitializeResult {
        server_info: Implementation {
            name: args.server_name,
            version: args.server_version,
            title: Some("almgate MCP Server".into()),
            description: Some(
                "Policy-enforcing tool-call orchestration for ALM trackers".into(),
            ),
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            ..Default::default()
        },
        protocol_version: ProtocolVersion::V2025_11_25.into(),
        instructions: Some(SERVER_INSTRUCTIONS.into()),
        meta: None,
    };

    let transport = StdioTransport::new(TransportOptions::default()).map_err(|e| e.to_string())?;
    let handler = AlmgateMcpHandler::new(policy, adapter);

    let server: Arc<ServerRuntime> = server_runtime::create_server(McpServerOptions {
        server_details,
        transport,
        handler: handler.to_mcp_server_handler(),
        task_store: None,
        client_task_store: None,
    });

    server.start().await.map_err(|e| {
        e.rpc_error_message()
            .cloned()
            .unwrap_or_else(|| e.to_string())
    })
}

#[async_trait]
impl ServerHandler for AlmgateMcpHandler {
    async fn handle_list_tools_request(
        &self,
        _params: Option<PaginatedRequestParams>,
        _runtime: Arc<dyn McpServer>,
    ) -> std::result::Result<ListToolsResult, RpcError> {
        Ok(ListToolsResult {
            meta: None,
            next_cursor: None,
            tools: AlmgateTools::tools(),
        })
    }

    async fn handle_call_tool_request(
        &self,
        params: CallToolRequestParams,
        _runtime: Arc<dyn McpServer>,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let tool_params: AlmgateTools =
            AlmgateTools::try_from(params).map_err(CallToolError::new)?;

        match tool_params {
            AlmgateTools::ValidateQueryTool(tool) => call_validate_query(self, tool),
            AlmgateTools::PlanIntentTool(tool) => call_plan_intent(self, tool).await,
            AlmgateTools::RunIntentTool(tool) => call_run_intent(self, tool).await,
            AlmgateTools::SessionStatusTool(tool) => call_session_status(self, tool).await,
            AlmgateTools::SessionResetTool(tool) => call_session_reset(self, tool).await,
        }
    }
}

#[mcp_tool(
    name = "validate_query",
    description = "Check one CBQL expression against the grammar policy and suggest mechanical repairs",
    read_only_hint = true
)]
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
struct ValidateQueryTool {
    cbql: String,
}

#[mcp_tool(
    name = "plan_intent",
    description = "Plan an intent against the session registry without dispatching anything",
    read_only_hint = true
)]
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
struct PlanIntentTool {
    /// Intent JSON document: project, reads, writes.
    intent: String,
}

#[mcp_tool(
    name = "run_intent",
    description = "Plan an intent and dispatch it step by step; stops at the first failure",
    read_only_hint = false,
    idempotent_hint = false
)]
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct RunIntentTool {
    /// Intent JSON document: project, reads, writes.
    intent: String,
}

#[mcp_tool(
    name = "session_status",
    description = "Report rate-limit state, registry counts, and the next call id",
    read_only_hint = true
)]
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
struct SessionStatusTool {}

#[mcp_tool(
    name = "session_reset",
    description = "Reopen dispatch after a rate-limit halt; the identifier registry is kept",
    read_only_hint = false,
    idempotent_hint = true
)]
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
struct SessionResetTool {}

tool_box!(
    AlmgateTools,
    [
        ValidateQueryTool,
        PlanIntentTool,
        RunIntentTool,
        SessionStatusTool,
        SessionResetTool
    ]
);

fn call_validate_query(
    handler: &AlmgateMcpHandler,
    tool: ValidateQueryTool,
) -> std::result::Result<CallToolResult, CallToolError> {
    let expression = QueryExpression::parse(&tool.cbql);
    match validate(&expression, &handler.policy) {
        Ok(valid) => json_result(json!({
            "action": "query.validate",
            "valid": true,
            "cbql": tool.cbql,
            "scope": valid.scope(),
            "predicates": valid.predicates(),
        })),
        Err(rejection) => {
            let correction = correct(&expression, &rejection, &handler.policy, None).map(|c| {
                json!({
                    "expression": c.expression,
                    "applied": c.applied,
                    "valid": validate(&c.expression, &handler.policy).is_ok(),
                })
            });
            json_result(json!({
                "action": "query.validate",
                "valid": false,
                "cbql": tool.cbql,
                "rejection": rejection,
                "message": rejection.to_string(),
                "correction": correction,
            }))
        }
    }
}

fn parse_intent(raw: &str) -> std::result::Result<Intent, CallToolError> {
    Intent::from_json_str(raw).map_err(|e| call_tool_error(format!("invalid intent: {e}")))
}

async fn call_plan_intent(
    handler: &AlmgateMcpHandler,
    tool: PlanIntentTool,
) -> std::result::Result<CallToolResult, CallToolError> {
    let intent = parse_intent(&tool.intent)?;
    let session = handler.session.lock().await;
    // Preview only: the session's call-id counter is left untouched.
    let first = session.status().next_call_id;
    match plan_intent(&intent, &handler.policy, session.registry(), first) {
        Ok(plan) => json_result(json!({
            "action": "intent.plan",
            "session": session.id(),
            "plan": plan_json(&plan),
        })),
        Err(err) => json_result(json!({
            "action": "intent.plan",
            "session": session.id(),
            "error": error_json(&err),
        })),
    }
}

async fn call_run_intent(
    handler: &AlmgateMcpHandler,
    tool: RunIntentTool,
) -> std::result::Result<CallToolResult, CallToolError> {
    let intent = parse_intent(&tool.intent)?;
    let mut session = handler.session.lock().await;
    let plan = match session.plan(&intent) {
        Ok(plan) => plan,
        Err(err) => {
            return json_result(json!({
                "action": "intent.run",
                "session": session.id(),
                "completed": false,
                "error": error_json(&err),
            }));
        }
    };
    let planned = plan_json(&plan);
    let report = session
        .execute(plan, &*handler.adapter)
        .run_to_end()
        .await;

    let mut payload = json!({
        "action": "intent.run",
        "session": session.id(),
        "completed": report.is_complete(),
        "plan": planned,
        "report": report,
        "status": session.status(),
    });
    if let Some(err) = &report.error {
        payload["error"] = error_json(err);
    }
    json_result(payload)
}

async fn call_session_status(
    handler: &AlmgateMcpHandler,
    _tool: SessionStatusTool,
) -> std::result::Result<CallToolResult, CallToolError> {
    let session = handler.session.lock().await;
    json_result(json!({
        "action": "session.status",
        "status": session.status(),
        "adapterCalls": handler.adapter.calls().await.len(),
    }))
}

async fn call_session_reset(
    handler: &AlmgateMcpHandler,
    _tool: SessionResetTool,
) -> std::result::Result<CallToolResult, CallToolError> {
    let mut session = handler.session.lock().await;
    let previous = session.reset();
    json_result(json!({
        "action": "session.reset",
        "previous": previous,
        "wasHalted": matches!(previous, RateLimitState::Halted { .. }),
        "status": session.status(),
    }))
}

fn json_result(value: Value) -> std::result::Result<CallToolResult, CallToolError> {
    let text = serde_json::to_string_pretty(&value).map_err(CallToolError::new)?;
    Ok(CallToolResult::text_content(vec![TextContent::from(text)]))
}

fn call_tool_error(message: impl Into<String>) -> CallToolError {
    CallToolError::from_message(message.into())
}
