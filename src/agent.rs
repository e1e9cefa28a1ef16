use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::classes::class_path_chain;
use crate::envelope::Envelope;
use crate::executor::ToolExecutor;
use crate::providers::{ChatClient, UpstreamError};
use crate::types::{CallContext, Message, PendingUserQuestion};

pub const DEFAULT_MAX_TOOL_CALLS: u32 = 12;
const MAX_TOOL_CALLS_CEILING: u32 = 80;

const BUDGET_EXHAUSTED_ANSWER: &str = "I made too many tool calls without reaching a final \
     answer. Please narrow the question or increase max_tool_calls.";
const REQUIRED_ACTION_ANSWER: &str = "I could not complete the requested action. The required \
     tool calls did not succeed, so I am stopping here rather than claiming they happened.";
const EVIDENCE_ANSWER: &str = "I was unable to gather tool evidence for this question, so I \
     cannot give a verified answer. Please rephrase the question or widen the tool policy.";
const CONTINUE_INSTRUCTION: &str = "Continue using the TOOL_RESULT above. If you have enough \
     information, answer the original question now in normal text (no JSON). Otherwise, call \
     the next tool as JSON.";

/// Intent markers in the user's text that obligate specific git tools.
/// A run mentioning one of these may not finish until the mapped tool has
/// succeeded at least once.
const REQUIRED_ACTION_MARKERS: &[(&str, &str)] = &[
    ("commit", "git_commit"),
    ("push", "git_push"),
    ("pull", "git_pull"),
    ("checkout", "git_checkout_branch"),
    ("switch branch", "git_checkout_branch"),
    ("create branch", "git_create_branch"),
];

const CATALOG_REQUEST_MARKERS: &[&str] = &[
    "what tools",
    "which tools",
    "list tools",
    "list the tools",
    "available tools",
    "tool catalog",
];

pub fn clamp_max_tool_calls(raw: Option<i64>) -> u32 {
    match raw {
        Some(v) if v >= 1 => (v as u64).min(MAX_TOOL_CALLS_CEILING as u64) as u32,
        Some(_) => 1,
        None => DEFAULT_MAX_TOOL_CALLS,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_tool_calls: u32,
    pub required_action_cycles: u32,
    pub evidence_cycles: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 800,
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            required_action_cycles: 3,
            evidence_cycles: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExitReason {
    FinalAnswer,
    ToolBudgetExhausted,
    RequiredActionUnmet,
    InsufficientEvidence,
    PendingUserInput,
}

impl AgentExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentExitReason::FinalAnswer => "final_answer",
            AgentExitReason::ToolBudgetExhausted => "tool_budget_exhausted",
            AgentExitReason::RequiredActionUnmet => "required_action_unmet",
            AgentExitReason::InsufficientEvidence => "insufficient_evidence",
            AgentExitReason::PendingUserInput => "pending_user_input",
        }
    }
}

#[derive(Debug)]
pub struct AgentOutcome {
    pub answer: String,
    pub exit_reason: AgentExitReason,
    pub tool_calls: u32,
    pub tool_events: Vec<Envelope>,
    pub pending_question: Option<PendingUserQuestion>,
}

/// Conversation state machine: ask the model, execute at most one tool per
/// turn, and refuse to accept a final answer until the guardrails are
/// satisfied. Tool failures stay inside envelopes; only a chat-backend
/// failure escapes as [`UpstreamError`].
pub struct Agent<C: ChatClient> {
    client: C,
    executor: Arc<ToolExecutor>,
    config: AgentConfig,
}

impl<C: ChatClient> Agent<C> {
    pub fn new(client: C, executor: Arc<ToolExecutor>, config: AgentConfig) -> Self {
        Self {
            client,
            executor,
            config,
        }
    }

    pub async fn run(
        &self,
        ctx: &CallContext,
        user_text: &str,
    ) -> Result<AgentOutcome, UpstreamError> {
        self.run_with_context(ctx, user_text, &[]).await
    }

    /// `extra_context` is opaque text prepended by a context provider
    /// (memory, documentation); the loop does not interpret it.
    pub async fn run_with_context(
        &self,
        ctx: &CallContext,
        user_text: &str,
        extra_context: &[Message],
    ) -> Result<AgentOutcome, UpstreamError> {
        let mut messages = Vec::with_capacity(extra_context.len() + 2);
        messages.push(Message::system(self.system_prompt(ctx)));
        messages.extend_from_slice(extra_context);
        messages.push(Message::user(user_text));

        let required_tools = required_tools_for(user_text);
        let catalog_request = is_catalog_request(user_text);
        let mut succeeded_tools: BTreeSet<String> = BTreeSet::new();
        let mut has_evidence = false;
        let mut tool_calls = 0u32;
        let mut required_nudges = 0u32;
        let mut evidence_nudges = 0u32;
        let mut tool_events: Vec<Envelope> = Vec::new();

        loop {
            let reply = self
                .client
                .chat(&messages, self.config.temperature, self.config.max_tokens)
                .await?
                .trim()
                .to_string();

            if let Some((tool, args)) = self.try_parse_tool_call(&reply) {
                tool_calls += 1;
                if tool_calls > self.config.max_tool_calls {
                    return Ok(self.finish(
                        BUDGET_EXHAUSTED_ANSWER.to_string(),
                        AgentExitReason::ToolBudgetExhausted,
                        tool_calls,
                        tool_events,
                        None,
                    ));
                }

                let envelope = self.executor.execute(&tool, args, ctx).await;

                if envelope.ok && tool == "request_user_input" {
                    let pending = envelope
                        .result
                        .clone()
                        .and_then(|v| serde_json::from_value::<PendingUserQuestion>(v).ok());
                    tool_events.push(envelope);
                    let answer = pending
                        .as_ref()
                        .map(|p| p.question.clone())
                        .unwrap_or_default();
                    return Ok(self.finish(
                        answer,
                        AgentExitReason::PendingUserInput,
                        tool_calls,
                        tool_events,
                        pending,
                    ));
                }

                if envelope.ok {
                    succeeded_tools.insert(tool.clone());
                    if !self.is_discovery_tool(&tool) {
                        has_evidence = true;
                    }
                }

                messages.push(Message::assistant(&reply));
                messages.push(Message::user(format!(
                    "TOOL_RESULT {tool}:\n{}\n",
                    serialize_envelope(&envelope)
                )));
                messages.push(Message::user(CONTINUE_INSTRUCTION));
                tool_events.push(envelope);
                continue;
            }

            // Free text: a candidate final answer, gated by the guardrails.
            let missing: Vec<&str> = required_tools
                .iter()
                .copied()
                .filter(|t| !succeeded_tools.contains(*t))
                .collect();
            if !missing.is_empty() {
                if required_nudges >= self.config.required_action_cycles {
                    return Ok(self.finish(
                        REQUIRED_ACTION_ANSWER.to_string(),
                        AgentExitReason::RequiredActionUnmet,
                        tool_calls,
                        tool_events,
                        None,
                    ));
                }
                required_nudges += 1;
                messages.push(Message::assistant(&reply));
                messages.push(Message::user(format!(
                    "You have not yet completed these required actions: {}. \
                     Call the matching tools now as a JSON tool call. Do not answer in \
                     plain text until each has succeeded.",
                    missing.join(", ")
                )));
                continue;
            }

            if !has_evidence && !catalog_request {
                if evidence_nudges >= self.config.evidence_cycles {
                    return Ok(self.finish(
                        EVIDENCE_ANSWER.to_string(),
                        AgentExitReason::InsufficientEvidence,
                        tool_calls,
                        tool_events,
                        None,
                    ));
                }
                evidence_nudges += 1;
                messages.push(Message::assistant(&reply));
                messages.push(Message::user(
                    "Do not answer from memory. Use the available tools to gather \
                     evidence first, then answer citing the tool results."
                        .to_string(),
                ));
                continue;
            }

            return Ok(self.finish(
                reply,
                AgentExitReason::FinalAnswer,
                tool_calls,
                tool_events,
                None,
            ));
        }
    }

    fn finish(
        &self,
        answer: String,
        exit_reason: AgentExitReason,
        tool_calls: u32,
        tool_events: Vec<Envelope>,
        pending_question: Option<PendingUserQuestion>,
    ) -> AgentOutcome {
        self.executor.emit(
            "agent.final",
            json!({
                "reason": exit_reason.as_str(),
                "tool_calls": tool_calls,
                "tool_events": tool_events.len(),
            }),
        );
        AgentOutcome {
            answer,
            exit_reason,
            tool_calls,
            tool_events,
            pending_question,
        }
    }

    /// A reply is a tool call only when it is exactly one JSON object of
    /// shape `{"tool": ..., "args": {...}}` naming a registered tool.
    /// Everything else, malformed JSON included, is a candidate answer.
    fn try_parse_tool_call(&self, text: &str) -> Option<(String, Value)> {
        let s = text.trim();
        if !(s.starts_with('{') && s.ends_with('}')) {
            return None;
        }
        let obj: Value = serde_json::from_str(s).ok()?;
        let map = obj.as_object()?;
        let tool = map.get("tool")?.as_str()?;
        if !self.executor.registry().has(tool) {
            return None;
        }
        let args = match map.get("args") {
            None | Some(Value::Null) => json!({}),
            Some(v) if v.is_object() => v.clone(),
            Some(_) => return None,
        };
        Some((tool.to_string(), args))
    }

    fn is_discovery_tool(&self, tool: &str) -> bool {
        self.executor
            .registry()
            .get(tool)
            .map(|spec| class_path_chain(&spec.class_key).contains(&"system.discovery".to_string()))
            .unwrap_or(false)
    }

    fn system_prompt(&self, ctx: &CallContext) -> String {
        let tool_schema = self.executor.registry().render_catalog_text();
        format!(
            "You are an onboarding and developer assistant for a codebase.\n\
             Context:\n\
             - project_id = {}\n\
             - branch = {}\n\
             - user = {}\n\n\
             You can call tools by replying with EXACTLY ONE JSON object (no markdown, no \
             text outside JSON) using the following format:\n\
             {{\n  \"tool\": \"<tool_name>\",\n  \"args\": {{ ... }}\n}}\n\n\
             IMPORTANT:\n\
             - Only include parameters explicitly listed for the tool.\n\
             - Do NOT invent parameters.\n\
             - Required parameters MUST be provided.\n\
             - If required parameters are missing, use request_user_input instead of guessing.\n\
             - Tool selection must be one of the tools listed below.\n\n\
             AVAILABLE TOOLS\n\
             {tool_schema}\n\
             GENERAL RULES\n\
             - Prefer tools over guessing.\n\
             - Use repo_grep to locate symbols, endpoints, config keys, and files.\n\
             - Use open_file to read exact code around grep results.\n\
             - Always include file paths and line numbers when citing code.\n\
             - After receiving a TOOL_RESULT, continue reasoning.\n\
             - When you have enough information, respond with a normal text answer (no JSON).\n\
             - If the answer cannot be proven with tool results, say what is missing.\n",
            ctx.project_id, ctx.branch, ctx.user_id
        )
    }
}

fn serialize_envelope(envelope: &Envelope) -> String {
    serde_json::to_string_pretty(envelope).unwrap_or_else(|_| "{}".to_string())
}

fn required_tools_for(user_text: &str) -> Vec<&'static str> {
    let lower = user_text.to_lowercase();
    let mut out: Vec<&'static str> = Vec::new();
    for (marker, tool) in REQUIRED_ACTION_MARKERS {
        if lower.contains(marker) && !out.contains(tool) {
            out.push(tool);
        }
    }
    out
}

fn is_catalog_request(user_text: &str) -> bool {
    let lower = user_text.to_lowercase();
    CATALOG_REQUEST_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::events::NullSink;
    use crate::policy::ToolPolicy;
    use crate::ratelimit::RateLimiter;
    use crate::registry::{handler_fn, ArgField, ArgSchema, ArgType, ToolRegistry, ToolSpec};

    struct ScriptedClient {
        replies: Mutex<VecDeque<String>>,
    }

    impl ScriptedClient {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn chat(
            &self,
            _messages: &[Message],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, UpstreamError> {
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "I give up.".to_string()))
        }
    }

    struct FailingClient;

    #[async_trait]
    impl ChatClient for FailingClient {
        async fn chat(
            &self,
            _messages: &[Message],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, UpstreamError> {
            Err(UpstreamError {
                kind: crate::providers::UpstreamErrorKind::Server,
                http_status: Some(503),
                retryable: true,
                attempt: 3,
                max_attempts: 3,
                message: "backend down".to_string(),
                retries: Vec::new(),
            })
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(
            ToolSpec::new(
                "repo_grep",
                "Search the repository.",
                ArgSchema::new(vec![ArgField::required(
                    "pattern",
                    ArgType::String,
                    "Pattern.",
                )]),
                handler_fn(|args, _ctx| async move {
                    Ok(json!({"matches": [args["pattern"]]}))
                }),
            )
            .with_class("repository.read"),
        );
        reg.register(
            ToolSpec::new(
                "list_tools",
                "List available tools.",
                ArgSchema::default(),
                handler_fn(|_args, _ctx| async move { Ok(json!({"tools": ["repo_grep"]})) }),
            )
            .with_class("system.discovery"),
        );
        reg.register(
            ToolSpec::new(
                "request_user_input",
                "Ask the user a question.",
                ArgSchema::new(vec![
                    ArgField::required("question", ArgType::String, "Question text."),
                    ArgField::optional("answer_mode", ArgType::String, "open_text or single_choice."),
                    ArgField::optional("options", ArgType::Array, "Choices."),
                ]),
                handler_fn(|args, _ctx| async move {
                    Ok(json!({
                        "id": "q-1",
                        "question": args["question"],
                        "answer_mode": args.get("answer_mode").cloned().unwrap_or(json!("open_text")),
                        "options": args.get("options").cloned().unwrap_or(json!([])),
                    }))
                }),
            )
            .with_class("system.discovery"),
        );
        reg.register(
            ToolSpec::new(
                "git_commit",
                "Commit staged changes.",
                ArgSchema::new(vec![ArgField::required(
                    "message",
                    ArgType::String,
                    "Commit message.",
                )]),
                handler_fn(|_args, _ctx| async move { Ok(json!({"committed": true})) }),
            )
            .with_class("git.commit")
            .writable(),
        );
        reg
    }

    fn agent<C: ChatClient>(client: C) -> Agent<C> {
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry()),
            Arc::new(RateLimiter::new()),
            Box::new(NullSink),
            "test-run",
        ));
        Agent::new(client, executor, AgentConfig::default())
    }

    fn ctx() -> CallContext {
        CallContext::new("proj-1", "main", "dev@example.com", "conv-1", ToolPolicy::default())
    }

    #[tokio::test]
    async fn tool_call_then_answer_produces_final_answer() {
        let client = ScriptedClient::new(&[
            r#"{"tool": "repo_grep", "args": {"pattern": "fn main"}}"#,
            "The entrypoint is src/main.rs line 1.",
        ]);
        let outcome = agent(client).run(&ctx(), "Where is the entrypoint?").await.unwrap();
        assert_eq!(outcome.exit_reason, AgentExitReason::FinalAnswer);
        assert_eq!(outcome.answer, "The entrypoint is src/main.rs line 1.");
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(outcome.tool_events.len(), 1);
        assert!(outcome.tool_events[0].ok);
    }

    #[tokio::test]
    async fn malformed_json_and_unregistered_tools_are_plain_text() {
        let client = ScriptedClient::new(&[
            r#"{"tool": "repo_grep", "args": {"pattern": "x"}}"#,
            r#"{"tool": "not_a_tool", "args": {}}"#,
        ]);
        let outcome = agent(client).run(&ctx(), "Look around.").await.unwrap();
        // The unregistered-tool JSON is treated as the final answer text.
        assert_eq!(outcome.exit_reason, AgentExitReason::FinalAnswer);
        assert_eq!(outcome.tool_calls, 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_fixed_answer() {
        let replies: Vec<String> = (0..20)
            .map(|_| r#"{"tool": "repo_grep", "args": {"pattern": "x"}}"#.to_string())
            .collect();
        let refs: Vec<&str> = replies.iter().map(String::as_str).collect();
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry()),
            Arc::new(RateLimiter::new()),
            Box::new(NullSink),
            "test-run",
        ));
        let config = AgentConfig {
            max_tool_calls: 3,
            ..AgentConfig::default()
        };
        let agent = Agent::new(ScriptedClient::new(&refs), executor, config);
        let outcome = agent.run(&ctx(), "Search forever.").await.unwrap();
        assert_eq!(outcome.exit_reason, AgentExitReason::ToolBudgetExhausted);
        assert_eq!(outcome.answer, BUDGET_EXHAUSTED_ANSWER);
        assert_eq!(outcome.tool_events.len(), 3);
    }

    #[tokio::test]
    async fn required_action_guard_stops_after_three_cycles() {
        // "commit" in the user text requires a successful git_commit; the
        // model keeps answering in prose and never calls it.
        let client = ScriptedClient::new(&[
            "Done! I committed your changes.",
            "Really, the commit happened.",
            "Trust me.",
            "Still just text.",
        ]);
        let outcome = agent(client).run(&ctx(), "commit my changes").await.unwrap();
        assert_eq!(outcome.exit_reason, AgentExitReason::RequiredActionUnmet);
        assert_eq!(outcome.answer, REQUIRED_ACTION_ANSWER);
        assert!(outcome
            .tool_events
            .iter()
            .all(|e| e.tool != "git_commit" || !e.ok));
    }

    #[tokio::test]
    async fn required_action_guard_passes_once_the_tool_succeeds() {
        let client = ScriptedClient::new(&[
            "I'll do it now.",
            r#"{"tool": "git_commit", "args": {"message": "fix tests"}}"#,
            "Committed as requested.",
        ]);
        let outcome = agent(client).run(&ctx(), "commit my changes").await.unwrap();
        assert_eq!(outcome.exit_reason, AgentExitReason::FinalAnswer);
        assert_eq!(outcome.answer, "Committed as requested.");
    }

    #[tokio::test]
    async fn evidence_guard_rejects_tool_free_answers() {
        let client = ScriptedClient::new(&[
            "From memory, the config lives in settings.py.",
            "I am sure it is settings.py.",
            "Final: settings.py.",
        ]);
        let outcome = agent(client).run(&ctx(), "Where is the config?").await.unwrap();
        assert_eq!(outcome.exit_reason, AgentExitReason::InsufficientEvidence);
        assert_eq!(outcome.answer, EVIDENCE_ANSWER);
    }

    #[tokio::test]
    async fn discovery_success_does_not_count_as_evidence() {
        let client = ScriptedClient::new(&[
            r#"{"tool": "list_tools", "args": {}}"#,
            "You have repo_grep available.",
            "Same answer.",
            "Same answer again.",
        ]);
        let outcome = agent(client).run(&ctx(), "Where is the config?").await.unwrap();
        assert_eq!(outcome.exit_reason, AgentExitReason::InsufficientEvidence);
    }

    #[tokio::test]
    async fn catalog_questions_skip_the_evidence_guard() {
        let client = ScriptedClient::new(&["You have repo_grep and git_commit."]);
        let outcome = agent(client).run(&ctx(), "What tools do you have?").await.unwrap();
        assert_eq!(outcome.exit_reason, AgentExitReason::FinalAnswer);
    }

    #[tokio::test]
    async fn request_user_input_pauses_the_run_immediately() {
        let client = ScriptedClient::new(&[
            r#"{"tool": "request_user_input", "args": {"question": "Which branch?"}}"#,
            "This reply must never be requested.",
        ]);
        let outcome = agent(client).run(&ctx(), "Pull the latest docs.").await.unwrap();
        assert_eq!(outcome.exit_reason, AgentExitReason::PendingUserInput);
        assert_eq!(outcome.tool_events.len(), 1);
        let pending = outcome.pending_question.unwrap();
        assert_eq!(pending.question, "Which branch?");
    }

    #[tokio::test]
    async fn upstream_failure_escapes_the_loop() {
        let err = agent(FailingClient).run(&ctx(), "Anything.").await.unwrap_err();
        assert_eq!(err.http_status, Some(503));
    }

    #[test]
    fn marker_mapping_and_budget_clamp() {
        assert_eq!(required_tools_for("Please commit and push this"), ["git_commit", "git_push"]);
        assert_eq!(required_tools_for("switch branch to dev"), ["git_checkout_branch"]);
        assert!(required_tools_for("what does this code do?").is_empty());

        assert_eq!(clamp_max_tool_calls(None), 12);
        assert_eq!(clamp_max_tool_calls(Some(0)), 1);
        assert_eq!(clamp_max_tool_calls(Some(500)), 80);
        assert_eq!(clamp_max_tool_calls(Some(20)), 20);
    }
}
