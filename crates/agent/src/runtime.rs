use nanocell_core::types::{ChatMessage, FinishReason, Role};
use nanocell_core::{Config, InboundMessage, OutboundMessage, Result};
use nanocell_providers::{ChatOptions, Provider};
use nanocell_storage::SessionManager;
use nanocell_tools::{MessageTool, SpawnTool, ToolContext, ToolRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::bus::MessageBus;
use crate::context::ContextBuilder;
use crate::subagent::SubagentManager;

/// Final answer when the loop ends without any text.
pub const NO_RESPONSE: &str = "No response";

/// Session key used by [`AgentRuntime::process_direct`] when none is given.
pub const DEFAULT_SESSION_KEY: &str = "cli:direct";

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub workspace: PathBuf,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_iterations: u32,
    pub subagent_max_iterations: u32,
    pub history_limit: usize,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        let defaults = &config.agents.defaults;
        Self {
            workspace: config.workspace_path(),
            model: defaults.model.clone(),
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            max_iterations: defaults.max_tool_iterations,
            subagent_max_iterations: defaults.subagent_max_iterations,
            history_limit: defaults.history_limit,
        }
    }

    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions::new(&self.model, self.max_tokens, self.temperature)
    }
}

/// How a run of the query/tool cycle ended.
#[derive(Debug)]
pub(crate) struct LoopOutcome {
    /// Text of the terminal response. `None` when the cap was hit first.
    pub content: Option<String>,
    pub finish_reason: FinishReason,
    pub iterations: u32,
}

impl LoopOutcome {
    /// The terminal text if it is non-empty.
    pub fn final_text(self) -> Option<String> {
        self.content.filter(|c| !c.is_empty())
    }
}

/// Alternates provider queries and tool execution until the provider answers
/// without tool calls or `max_iterations` queries have been made.
///
/// Every tool call in a response gets exactly one tool-result message, in
/// the order the provider returned them, before the next query. `Err` only
/// comes from the provider itself.
pub(crate) async fn run_tool_loop(
    provider: &dyn Provider,
    tools: &ToolRegistry,
    ctx: &ToolContext,
    messages: &mut Vec<ChatMessage>,
    options: &ChatOptions,
    max_iterations: u32,
) -> Result<LoopOutcome> {
    let definitions = tools.get_definitions();

    for iteration in 1..=max_iterations {
        debug!(iteration, messages = messages.len(), "Querying provider");
        let response = provider.chat(messages.as_slice(), &definitions, options).await?;

        info!(
            iteration,
            content_len = response.content.as_ref().map(|c| c.len()).unwrap_or(0),
            tool_calls = response.tool_calls.len(),
            finish_reason = %response.finish_reason,
            "Provider response received"
        );

        if !response.has_tool_calls() {
            if response.is_error() {
                warn!(iteration, "Provider returned an error response, ending turn");
            }
            return Ok(LoopOutcome {
                content: response.content,
                finish_reason: response.finish_reason,
                iterations: iteration,
            });
        }

        messages.push(ChatMessage::assistant_with_tool_calls(
            response.content.as_deref(),
            response.tool_calls.clone(),
        ));
        for call in &response.tool_calls {
            debug!(tool = %call.name, call_id = %call.id, "Executing tool call");
            let result = tools
                .execute_with_context(&call.name, ctx.clone(), call.arguments.clone())
                .await;
            messages.push(ChatMessage::tool_result(&call.id, &call.name, &result));
        }
    }

    warn!(max_iterations, "Iteration cap reached without a final answer");
    Ok(LoopOutcome {
        content: None,
        finish_reason: FinishReason::Length,
        iterations: max_iterations,
    })
}

/// The primary agent: one turn per inbound message, with session history,
/// the full tool set, and subagent spawning.
pub struct AgentRuntime {
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    context: ContextBuilder,
    sessions: SessionManager,
    bus: Arc<MessageBus>,
    subagents: Arc<SubagentManager>,
    settings: AgentSettings,
    span: Span,
}

impl AgentRuntime {
    /// `worker_tools` is the capability set shared with subagents. The
    /// primary registry adds `spawn` and `message` on top of it.
    pub fn new(
        settings: AgentSettings,
        provider: Arc<dyn Provider>,
        bus: Arc<MessageBus>,
        sessions: SessionManager,
        worker_tools: ToolRegistry,
    ) -> Self {
        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            bus.clone(),
            worker_tools.clone(),
            &settings,
        ));

        let mut tools = worker_tools;
        tools.register(Arc::new(SpawnTool));
        tools.register(Arc::new(MessageTool));

        let span = info_span!("agent_runtime", component = "runtime", model = %settings.model);
        span.in_scope(|| info!(tools = ?tools.tool_names(), "Agent runtime ready"));

        Self {
            provider,
            tools,
            context: ContextBuilder::new(settings.workspace.clone()),
            sessions,
            bus,
            subagents,
            settings,
            span,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn subagents(&self) -> &Arc<SubagentManager> {
        &self.subagents
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Runs one turn for `session_key` (default `cli:direct`) and returns the
    /// final answer.
    pub async fn process_direct(&self, content: &str, session_key: Option<&str>) -> String {
        let session_key = session_key.unwrap_or(DEFAULT_SESSION_KEY);
        let (channel, chat_id) = session_key.split_once(':').unwrap_or(("cli", session_key));
        self.run_turn(session_key, channel, chat_id, content, content, &[])
            .await
    }

    /// Runs one turn for a bus message. System messages are answered on the
    /// conversation encoded in their `chat_id`, using that conversation's
    /// session.
    pub async fn process_message(&self, msg: InboundMessage) -> OutboundMessage {
        if msg.is_system() {
            let (channel, chat_id) = msg.origin();
            let session_key = format!("{}:{}", channel, chat_id);
            let record = format!("[System: {}] {}", msg.sender_id, msg.content);
            self.span.in_scope(|| {
                info!(sender = %msg.sender_id, origin = %session_key, "Processing system message")
            });
            let answer = self
                .run_turn(&session_key, &channel, &chat_id, &msg.content, &record, &msg.media)
                .await;
            return OutboundMessage::new(&channel, &chat_id, &answer);
        }

        let session_key = msg.session_key();
        let answer = self
            .run_turn(&session_key, &msg.channel, &msg.chat_id, &msg.content, &msg.content, &msg.media)
            .await;
        OutboundMessage::new(&msg.channel, &msg.chat_id, &answer)
    }

    /// Answers inbound bus messages one at a time until the bus is stopped.
    pub async fn run_loop(&self) {
        self.span.in_scope(|| info!("Agent loop started"));
        while let Some(msg) = self.bus.consume_inbound().await {
            let outbound = self.process_message(msg).await;
            self.bus.publish_outbound(outbound);
        }
        self.span.in_scope(|| info!("Agent loop stopped"));
    }

    async fn run_turn(
        &self,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        content: &str,
        record: &str,
        media: &[String],
    ) -> String {
        let span = info_span!(parent: &self.span, "turn", session = %session_key);
        async {
            let mut session = self.sessions.get_or_create(session_key);
            let history = session.get_history(self.settings.history_limit);
            let mut messages = self.context.build_messages(&history, content, media);
            let ctx = self.tool_context(session_key, channel, chat_id);

            let answer = match run_tool_loop(
                self.provider.as_ref(),
                &self.tools,
                &ctx,
                &mut messages,
                &self.settings.chat_options(),
                self.settings.max_iterations,
            )
            .await
            {
                Ok(outcome) => {
                    debug!(iterations = outcome.iterations, "Turn finished");
                    outcome.final_text().unwrap_or_else(|| NO_RESPONSE.to_string())
                }
                Err(e) => {
                    error!(error = %e, "Turn failed");
                    format!("Error: {}", e)
                }
            };

            session.add_message(Role::User, record);
            session.add_message(Role::Assistant, &answer);
            if let Err(e) = self.sessions.save(&session) {
                warn!(error = %e, "Failed to save session");
            }

            answer
        }
        .instrument(span)
        .await
    }

    fn tool_context(&self, session_key: &str, channel: &str, chat_id: &str) -> ToolContext {
        let mut ctx = ToolContext::new(channel, chat_id).with_workspace(self.settings.workspace.clone());
        ctx.session_key = session_key.to_string();
        ctx.outbound_tx = Some(self.bus.outbound_sender());
        ctx.spawn_handle = Some(self.subagents.clone());
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{settings, ScriptedProvider};
    use async_trait::async_trait;
    use nanocell_core::types::{LLMResponse, ToolCallRequest, ToolDefinition};
    use nanocell_core::Paths;
    use nanocell_tools::Tool;
    use serde_json::{json, Value};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn schema(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".to_string(),
                description: "Echo the arguments back".to_string(),
                parameters: json!({"type": "object", "properties": {"x": {"type": "integer"}}}),
            }
        }

        async fn execute(&self, _ctx: ToolContext, params: Value) -> Result<String> {
            Ok(format!("echo: {}", params))
        }
    }

    fn echo_call(id: &str) -> LLMResponse {
        LLMResponse {
            tool_calls: vec![ToolCallRequest::new(id, "echo", json!({"x": 1}))],
            finish_reason: FinishReason::ToolCalls,
            ..Default::default()
        }
    }

    fn runtime(
        dir: &tempfile::TempDir,
        provider: Arc<ScriptedProvider>,
        max_iterations: u32,
    ) -> AgentRuntime {
        let mut worker_tools = ToolRegistry::new();
        worker_tools.register(Arc::new(EchoTool));
        let mut settings = settings(dir.path());
        settings.max_iterations = max_iterations;
        AgentRuntime::new(
            settings,
            provider,
            Arc::new(MessageBus::new()),
            SessionManager::new(Paths::with_base(dir.path().to_path_buf())),
            worker_tools,
        )
    }

    #[tokio::test]
    async fn test_tool_call_then_final_answer() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(echo_call("t1")),
            Ok(LLMResponse::text("done")),
        ]));
        let rt = runtime(&dir, provider.clone(), 20);

        let answer = rt.process_direct("please echo", None).await;
        assert_eq!(answer, "done");
        assert_eq!(provider.calls(), 2);

        // Second query sees the assistant call and exactly one matching result.
        let second = provider.request(1);
        let tool_messages: Vec<&ChatMessage> = second.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tool_messages.len(), 1);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(tool_messages[0].name.as_deref(), Some("echo"));
        assert_eq!(tool_messages[0].text(), "echo: {\"x\":1}");

        let assistant = &second[second.len() - 2];
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.tool_calls.as_ref().unwrap()[0].id, "t1");
    }

    #[tokio::test]
    async fn test_iteration_cap_returns_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::repeating(echo_call("loop")));
        let rt = runtime(&dir, provider.clone(), 1);

        assert_eq!(rt.process_direct("go", None).await, NO_RESPONSE);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_tool_results_follow_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LLMResponse {
                content: Some("working".to_string()),
                tool_calls: vec![
                    ToolCallRequest::new("a", "echo", json!({"x": 1})),
                    ToolCallRequest::new("b", "nope", json!({})),
                    ToolCallRequest::new("c", "echo", json!({"x": 3})),
                ],
                finish_reason: FinishReason::ToolCalls,
                ..Default::default()
            }),
            Ok(LLMResponse::text("ok")),
        ]));
        let rt = runtime(&dir, provider.clone(), 5);
        rt.process_direct("multi", None).await;

        let second = provider.request(1);
        let results: Vec<(String, String)> = second
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| (m.tool_call_id.clone().unwrap(), m.text()))
            .collect();
        assert_eq!(
            results,
            vec![
                ("a".to_string(), "echo: {\"x\":1}".to_string()),
                ("b".to_string(), "Error: Tool 'nope' not found".to_string()),
                ("c".to_string(), "echo: {\"x\":3}".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_history_saved_once_per_turn() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(echo_call("t1")),
            Ok(LLMResponse::text("first answer")),
            Ok(LLMResponse::text("second answer")),
        ]));
        let rt = runtime(&dir, provider.clone(), 20);

        rt.process_direct("one", Some("telegram:7")).await;
        let session = rt.sessions().get_or_create("telegram:7");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "one");
        assert_eq!(session.messages[1].content, "first answer");

        rt.process_direct("two", Some("telegram:7")).await;
        // The replayed history carries only the final texts, not tool traffic.
        let third = provider.request(2);
        assert_eq!(third.len(), 4);
        assert_eq!(third[1], ChatMessage::user("one"));
        assert_eq!(third[2], ChatMessage::assistant("first answer"));
        assert_eq!(third[3], ChatMessage::user("two"));
    }

    #[tokio::test]
    async fn test_provider_error_becomes_text() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Err(nanocell_core::Error::Provider(
            "backend exploded".to_string(),
        ))]));
        let rt = runtime(&dir, provider, 20);

        let answer = rt.process_direct("hi", None).await;
        assert_eq!(answer, "Error: Provider error: backend exploded");
    }

    #[tokio::test]
    async fn test_error_response_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(LLMResponse::error(
            "Error calling OpenAI: connection refused",
        ))]));
        let rt = runtime(&dir, provider.clone(), 20);

        let answer = rt.process_direct("hi", None).await;
        assert_eq!(answer, "Error calling OpenAI: connection refused");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_response_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(LLMResponse::default())]));
        let rt = runtime(&dir, provider, 20);
        assert_eq!(rt.process_direct("hi", None).await, NO_RESPONSE);
    }

    #[tokio::test]
    async fn test_primary_registry_has_spawn_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir, Arc::new(ScriptedProvider::new(vec![])), 20);
        assert_eq!(
            rt.tools().tool_names(),
            vec!["echo".to_string(), "message".to_string(), "spawn".to_string()]
        );
    }

    #[tokio::test]
    async fn test_system_message_routes_to_origin() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(LLMResponse::text("Your report is ready."))]));
        let rt = runtime(&dir, provider, 20);

        let msg = InboundMessage::system("subagent", "[Subagent 'report' completed successfully]", "slack", "C42");
        let out = rt.process_message(msg).await;
        assert_eq!(out.channel, "slack");
        assert_eq!(out.chat_id, "C42");
        assert_eq!(out.content, "Your report is ready.");

        let session = rt.sessions().get_or_create("slack:C42");
        assert_eq!(
            session.messages[0].content,
            "[System: subagent] [Subagent 'report' completed successfully]"
        );
    }

    #[tokio::test]
    async fn test_run_loop_publishes_answers() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(LLMResponse::text("pong"))]));
        let rt = Arc::new(runtime(&dir, provider, 20));
        let bus = rt.bus.clone();

        let worker = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.run_loop().await })
        };

        bus.publish_inbound(InboundMessage::new("cli", "user", "direct", "ping"));
        let out = bus.consume_outbound().await.unwrap();
        assert_eq!(out.channel, "cli");
        assert_eq!(out.chat_id, "direct");
        assert_eq!(out.content, "pong");

        bus.stop();
        worker.await.unwrap();
    }
}
