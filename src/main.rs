use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use uuid::Uuid;

use repoagent::agent::{clamp_max_tool_calls, Agent, AgentConfig, AgentExitReason};
use repoagent::events::{EventSink, JsonlFileSink, NullSink};
use repoagent::executor::ToolExecutor;
use repoagent::policy::{SecurityPolicy, ToolPolicy, UserRole};
use repoagent::providers::{HttpConfig, OpenAiChatClient};
use repoagent::ratelimit::RateLimiter;
use repoagent::tools::{builtin_registry, ToolsConfig};
use repoagent::types::CallContext;

#[derive(Debug, Parser)]
#[command(
    name = "repoagent",
    about = "Run one agent turn against a repository with the builtin tool catalog."
)]
struct Args {
    /// What to ask the agent.
    prompt: String,

    /// Repository the tools operate on.
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Caller role: viewer, member or admin.
    #[arg(long, default_value = "member")]
    role: String,

    /// OpenAI-compatible chat completions endpoint.
    #[arg(long, default_value = "http://localhost:11434/v1", env = "REPOAGENT_BASE_URL")]
    base_url: String,

    /// Bearer token for the chat endpoint.
    #[arg(long, env = "REPOAGENT_API_KEY")]
    api_key: Option<String>,

    #[arg(long, default_value = "gpt-4o-mini", env = "REPOAGENT_MODEL")]
    model: String,

    /// JSON file holding a project-level tool policy.
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Append run telemetry as JSON lines to this file.
    #[arg(long)]
    events: Option<PathBuf>,

    /// Tool call budget for this run.
    #[arg(long)]
    max_tool_calls: Option<i64>,

    /// Plan write tools without executing them.
    #[arg(long)]
    dry_run: bool,

    #[arg(long, default_value = "dev@localhost")]
    user: String,

    #[arg(long, default_value = "main")]
    branch: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let repo_root = args
        .repo
        .canonicalize()
        .with_context(|| format!("repository not found: {}", args.repo.display()))?;

    let role = UserRole::parse(&args.role);
    let mut project_policy = match &args.policy {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read policy file {}", path.display()))?;
            serde_json::from_str::<ToolPolicy>(&raw)
                .with_context(|| format!("invalid policy file {}", path.display()))?
        }
        None => ToolPolicy::default(),
    };
    if args.dry_run {
        project_policy.dry_run = true;
    }
    let policy = ToolPolicy::resolve(
        role,
        &SecurityPolicy::default(),
        &project_policy,
        &ToolPolicy::default(),
        &BTreeSet::new(),
    );

    let sink: Box<dyn EventSink> = match &args.events {
        Some(path) => Box::new(
            JsonlFileSink::create(path)
                .with_context(|| format!("failed to open event log {}", path.display()))?,
        ),
        None => Box::new(NullSink),
    };

    let run_id = Uuid::new_v4().to_string();
    let registry = Arc::new(builtin_registry(&ToolsConfig::new(&repo_root)));
    let executor = Arc::new(ToolExecutor::new(
        registry,
        Arc::new(RateLimiter::new()),
        sink,
        run_id.clone(),
    ));

    let client = OpenAiChatClient::new(
        args.base_url.clone(),
        args.api_key.clone(),
        args.model.clone(),
        HttpConfig::default(),
    )?;

    let config = AgentConfig {
        max_tool_calls: clamp_max_tool_calls(args.max_tool_calls),
        ..AgentConfig::default()
    };
    let agent = Agent::new(client, executor, config);

    let ctx = CallContext::new(
        repo_root.display().to_string(),
        args.branch.clone(),
        args.user.clone(),
        run_id,
        policy,
    );

    let outcome = agent
        .run(&ctx, &args.prompt)
        .await
        .map_err(anyhow::Error::from)?;

    println!("{}", outcome.answer);
    if let Some(pending) = &outcome.pending_question {
        eprintln!();
        eprintln!("[run paused: awaiting user input]");
        for option in &pending.options {
            eprintln!("  - {option}");
        }
    }
    if outcome.exit_reason != AgentExitReason::FinalAnswer {
        eprintln!(
            "[exit: {} after {} tool call(s)]",
            outcome.exit_reason.as_str(),
            outcome.tool_calls
        );
    }
    Ok(())
}
