//! MCP Server for spec-driven development orchestration.
//!
//! Exposes the dispatch runtime state machine, the entry-point guide tools,
//! spec status reporting, and a handful of delegated research/approval
//! tools, all gated through the tool visibility registry and post-processed
//! through the tool shell's offload machinery.
//!
//! # Usage
//!
//! ```bash
//! spec-context-mcp --project-path .
//! ```

#![allow(dead_code)]

use anyhow::Result;
use clap::Parser;
use rmcp::{
    handler::server::wrapper::Parameters,
    model::{InitializeRequestParam, InitializeResult, ServerCapabilities, ServerInfo},
    service::{Peer, RequestContext, RoleServer},
    schemars, tool, tool_router, ServerHandler, ServiceExt,
};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{stdin, stdout};

use spec_context_runtime::chat::ChatContext;
use spec_context_runtime::config::Config;
use spec_context_runtime::dispatch::{self, Role};
use spec_context_runtime::ledger::progress;
use spec_context_runtime::registry::VisibilityRegistry;
use spec_context_runtime::shell::{self, ShellContext};
use spec_context_runtime::RunRegistry;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project root the server operates against; defaults to the current directory.
    #[arg(long)]
    project_path: Option<std::path::PathBuf>,

    /// Log level passed to the tracing env filter (e.g. "info", "debug").
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional dashboard URL surfaced in tool responses.
    #[arg(long)]
    dashboard_url: Option<String>,
}

fn parse_role(s: &str) -> Result<Role, String> {
    match s.to_ascii_lowercase().as_str() {
        "implementer" => Ok(Role::Implementer),
        "reviewer" => Ok(Role::Reviewer),
        other => Err(format!("unknown role: {other}")),
    }
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct DispatchRuntimeRequest {
    #[schemars(description = "One of: init_run, compile_prompt, ingest_output, get_snapshot, get_telemetry")]
    action: String,
    #[schemars(description = "Run identifier; required for every action except nothing (always required)")]
    run_id: String,
    #[schemars(description = "Spec directory name under .spec-context/specs; required for init_run")]
    spec_name: Option<String>,
    #[schemars(description = "Task id as it appears in tasks.md, e.g. \"1.2\"")]
    task_id: Option<String>,
    #[schemars(description = "Project root; required for init_run")]
    project_path: Option<String>,
    #[schemars(description = "\"implementer\" or \"reviewer\"; required for compile_prompt/ingest_output")]
    role: Option<String>,
    #[schemars(description = "Task-specific prompt text; required for compile_prompt")]
    task_prompt: Option<String>,
    #[schemars(description = "Model output token budget; required for compile_prompt")]
    max_output_tokens: Option<u32>,
    #[schemars(description = "Whether to auto-compact an over-budget prompt instead of failing terminally")]
    compaction_auto: Option<bool>,
    #[schemars(description = "Raw implementer/reviewer output; required for ingest_output")]
    output_content: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SpecStatusRequest {
    #[schemars(description = "Project root")]
    project_path: String,
    #[schemars(description = "Spec directory name under .spec-context/specs")]
    spec_name: String,
    #[schemars(description = "Task id as it appears in tasks.md")]
    task_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct DelegatedToolRequest {
    #[schemars(description = "Free-form query or payload; passed through unmodified to the delegate")]
    #[serde(default)]
    query: String,
}

const BRAINSTORM_GUIDE: &str = include_str!("../guides/brainstorm.md");
const IMPLEMENTER_GUIDE: &str = include_str!("../guides/implementer.md");
const REVIEWER_GUIDE: &str = include_str!("../guides/reviewer.md");
const WORKFLOW_GUIDE: &str = include_str!("../guides/workflow.md");
const STEERING_GUIDE: &str = include_str!("../guides/steering.md");

struct Server {
    registry: RunRegistry,
    visibility: VisibilityRegistry,
    chat: ChatContext,
    config: Config,
    shell: ShellContext,
    /// Set once the client completes MCP initialization; used to push
    /// `tools/list_changed` when a gate call locks mode or escalates tier.
    peer: std::sync::Mutex<Option<Peer<RoleServer>>>,
}

impl Server {
    fn new(config: Config, project_path: String, dashboard_url: Option<String>) -> Self {
        Self {
            registry: RunRegistry::new(),
            visibility: VisibilityRegistry::new(),
            chat: ChatContext::new(&config, 8),
            config,
            shell: ShellContext::new(project_path, dashboard_url),
            peer: std::sync::Mutex::new(None),
        }
    }

    /// Tells a connected client the visible tool catalog changed. Best
    /// effort: a client that hasn't connected yet, or one that dropped the
    /// connection, just doesn't get notified.
    fn notify_tool_list_changed(&self) {
        let peer = self.peer.lock().unwrap().clone();
        if let Some(peer) = peer {
            tokio::spawn(async move {
                if let Err(err) = peer.notify_tool_list_changed().await {
                    tracing::warn!("failed to send tools/list_changed notification: {err}");
                }
            });
        }
    }

    /// Must be called before any handler does real work: the visibility gate
    /// decides whether the call is allowed at all, so it runs first, not as
    /// a side effect of packaging the response. Mode locking happens inside
    /// the gate, so a before/after comparison here catches every handler's
    /// mode transition without each one having to check for it.
    fn gate(&self, tool: &str) -> Result<(), String> {
        let before = (self.visibility.mode(), self.visibility.tier());
        shell::gate(&self.visibility, tool).map_err(|e| e.to_string())?;
        if before != (self.visibility.mode(), self.visibility.tier()) {
            self.notify_tool_list_changed();
        }
        Ok(())
    }

    fn offload(&self, tool: &str, value: serde_json::Value) -> Result<String, String> {
        let serialized = serde_json::to_string(&value).map_err(|e| e.to_string())?;
        let result = shell::offload_if_large(
            &self.shell.project_path,
            tool,
            &serialized,
            "application/json",
            &self.config.offload,
        )
        .map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&result).map_err(|e| e.to_string())
    }
}

#[tool_router]
impl Server {
    #[tool(
        name = "dispatch-runtime",
        description = "Run the dispatch state machine: init_run, compile_prompt, ingest_output, get_snapshot, or get_telemetry."
    )]
    async fn dispatch_runtime(
        &self,
        Parameters(req): Parameters<DispatchRuntimeRequest>,
    ) -> Result<String, String> {
        self.gate("dispatch-runtime")?;
        // Driving the state machine directly demonstrates orchestrator
        // intent; widen visibility by one tier for subsequent calls.
        let tier_before = self.visibility.tier();
        self.visibility.escalate_tier();
        if self.visibility.tier() != tier_before {
            self.notify_tool_list_changed();
        }

        let value = match req.action.as_str() {
            "init_run" => {
                let spec_name = req.spec_name.ok_or("spec_name is required for init_run")?;
                let task_id = req.task_id.ok_or("task_id is required for init_run")?;
                let project_path = req.project_path.ok_or("project_path is required for init_run")?;
                let result = dispatch::init_run(
                    &self.registry,
                    &self.config,
                    &req.run_id,
                    &spec_name,
                    &task_id,
                    &project_path,
                )
                .await
                .map_err(|e| e.to_string())?;
                serde_json::to_value(result).map_err(|e| e.to_string())?
            }
            "compile_prompt" => {
                let role = parse_role(req.role.as_deref().unwrap_or_default())?;
                let task_id = req.task_id.ok_or("task_id is required for compile_prompt")?;
                let task_prompt = req.task_prompt.ok_or("task_prompt is required for compile_prompt")?;
                let max_output_tokens = req.max_output_tokens.unwrap_or(2048);
                let compaction_auto = req.compaction_auto.unwrap_or(true);
                let result = dispatch::compile_prompt(
                    &self.registry,
                    &self.config,
                    &req.run_id,
                    role,
                    &task_id,
                    &task_prompt,
                    max_output_tokens,
                    compaction_auto,
                    &[],
                )
                .await
                .map_err(|e| e.to_string())?;
                serde_json::to_value(result).map_err(|e| e.to_string())?
            }
            "ingest_output" => {
                let role = parse_role(req.role.as_deref().unwrap_or_default())?;
                let task_id = req.task_id.ok_or("task_id is required for ingest_output")?;
                let output_content = req
                    .output_content
                    .ok_or("output_content is required for ingest_output")?;
                let result = dispatch::ingest_output(&self.registry, &req.run_id, role, &task_id, &output_content)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(result).map_err(|e| e.to_string())?
            }
            "get_snapshot" => {
                let result = dispatch::get_snapshot(&self.registry, &req.run_id)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(result).map_err(|e| e.to_string())?
            }
            "get_telemetry" => {
                let snapshot = self.chat.telemetry.snapshot();
                serde_json::to_value(snapshot).map_err(|e| e.to_string())?
            }
            other => return Err(format!("unknown dispatch-runtime action: {other}")),
        };

        self.offload("dispatch-runtime", value)
    }

    #[tool(
        name = "spec-workflow-guide",
        description = "The top-level spec-driven workflow guide: how the orchestrator/implementer/reviewer roles cooperate."
    )]
    async fn spec_workflow_guide(&self) -> Result<String, String> {
        self.gate("spec-workflow-guide")?;
        self.offload("spec-workflow-guide", json!({ "guide": WORKFLOW_GUIDE }))
    }

    #[tool(
        name = "steering-guide",
        description = "Guide for authoring steering documents (tech.md, principles.md) that every compiled prompt includes."
    )]
    async fn steering_guide(&self) -> Result<String, String> {
        self.gate("steering-guide")?;
        self.offload("steering-guide", json!({ "guide": STEERING_GUIDE }))
    }

    #[tool(
        name = "get-brainstorm-guide",
        description = "Entry point for the orchestrator role: how to brainstorm and break work into tasks."
    )]
    async fn get_brainstorm_guide(&self) -> Result<String, String> {
        self.gate("get-brainstorm-guide")?;
        self.offload("get-brainstorm-guide", json!({ "guide": BRAINSTORM_GUIDE }))
    }

    #[tool(
        name = "get-implementer-guide",
        description = "Entry point for the implementer role: locks the session into implementer mode."
    )]
    async fn get_implementer_guide(&self) -> Result<String, String> {
        self.gate("get-implementer-guide")?;
        self.offload("get-implementer-guide", json!({ "guide": IMPLEMENTER_GUIDE }))
    }

    #[tool(
        name = "get-reviewer-guide",
        description = "Entry point for the reviewer role: locks the session into reviewer mode."
    )]
    async fn get_reviewer_guide(&self) -> Result<String, String> {
        self.gate("get-reviewer-guide")?;
        self.offload("get-reviewer-guide", json!({ "guide": REVIEWER_GUIDE }))
    }

    #[tool(
        name = "spec-status",
        description = "Report the current progress ledger totals and active task for a spec."
    )]
    async fn spec_status(&self, Parameters(req): Parameters<SpecStatusRequest>) -> Result<String, String> {
        self.gate("spec-status")?;
        let ledger = progress::extract(&req.project_path, &req.spec_name, &req.task_id).map_err(|e| e.to_string())?;
        let value = serde_json::to_value(ledger).map_err(|e| e.to_string())?;
        self.offload("spec-status", value)
    }

    #[tool(description = "Search the project for relevant code or documentation (delegated to an external indexer).")]
    async fn search(&self, Parameters(req): Parameters<DelegatedToolRequest>) -> Result<String, String> {
        self.gate("search")?;
        self.offload(
            "search",
            json!({ "delegated": true, "tool": "search", "note": "delegated to the project's configured search backend", "query": req.query }),
        )
    }

    #[tool(description = "Perform deeper code research across the project (delegated to an external research agent).")]
    async fn code_research(&self, Parameters(req): Parameters<DelegatedToolRequest>) -> Result<String, String> {
        self.gate("code_research")?;
        self.offload(
            "code_research",
            json!({ "delegated": true, "tool": "code_research", "note": "delegated to the project's configured research agent", "query": req.query }),
        )
    }

    #[tool(description = "List pending human approvals (delegated to the dashboard's approval queue).")]
    async fn approvals(&self) -> Result<String, String> {
        self.gate("approvals")?;
        self.offload(
            "approvals",
            json!({ "delegated": true, "tool": "approvals", "note": "delegated to the dashboard approval queue", "dashboardUrl": self.shell.dashboard_url }),
        )
    }

    #[tool(
        name = "wait-for-approval",
        description = "Block until a specific approval is resolved (delegated to the dashboard's approval queue)."
    )]
    async fn wait_for_approval(&self, Parameters(req): Parameters<DelegatedToolRequest>) -> Result<String, String> {
        self.gate("wait-for-approval")?;
        self.offload(
            "wait-for-approval",
            json!({ "delegated": true, "tool": "wait-for-approval", "note": "delegated to the dashboard approval queue", "query": req.query }),
        )
    }
}

impl ServerHandler for Server {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Spec-driven development orchestration server.\n\
                 Start with one of the guide tools (spec-workflow-guide, steering-guide, \
                 get-brainstorm-guide, get-implementer-guide, get-reviewer-guide) to lock the \
                 session into a role; further tool visibility is gated by that role and escalates \
                 with dispatch-runtime tier use."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            ..Default::default()
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, rmcp::ErrorData> {
        *self.peer.lock().unwrap() = Some(context.peer.clone());
        Ok(self.get_info())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let directive = format!("spec_context_mcp={}", args.log_level)
        .parse()
        .unwrap_or_else(|_| {
            eprintln!(
                "invalid --log-level {:?}, falling back to \"info\"",
                args.log_level
            );
            "spec_context_mcp=info".parse().unwrap()
        });

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .init();

    let project_path = args
        .project_path
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from(".")))
        .to_string_lossy()
        .to_string();

    tracing::info!(project_path = %project_path, "starting spec-context MCP server");

    let config = Config::from_env();
    let server = Server::new(config, project_path, args.dashboard_url);

    let transport = (stdin(), stdout());
    let service = server.serve(transport).await?;
    service.waiting().await?;

    Ok(())
}
