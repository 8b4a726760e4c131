use futures::FutureExt;
use nanocell_core::types::{ChatMessage, FinishReason};
use nanocell_core::{Error, InboundMessage, Result};
use nanocell_providers::{ChatOptions, Provider};
use nanocell_tools::{SpawnHandle, ToolContext, ToolRegistry};
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument, Span};

use crate::bus::MessageBus;
use crate::runtime::{run_tool_loop, AgentSettings};

/// Result text when a run ends without a final answer.
pub const NO_FINAL_RESPONSE: &str = "Task completed but no final response was generated.";

const LABEL_MAX_CHARS: usize = 30;

/// The conversation a subagent reports back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub channel: String,
    pub chat_id: String,
}

impl Origin {
    pub fn new(channel: &str, chat_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
        }
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new("cli", "direct")
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub label: Option<String>,
    pub origin: Option<Origin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Ok,
    Error,
}

impl SubagentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubagentStatus::Ok => "ok",
            SubagentStatus::Error => "error",
        }
    }
}

struct SubagentTask {
    label: String,
    handle: Option<JoinHandle<()>>,
}

type RunningTasks = Arc<Mutex<HashMap<String, SubagentTask>>>;

fn lock_tasks(tasks: &RunningTasks) -> MutexGuard<'_, HashMap<String, SubagentTask>> {
    tasks.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs background copies of the tool loop with a reduced tool set and
/// reports each outcome to the originating conversation through the bus.
pub struct SubagentManager {
    provider: Arc<dyn Provider>,
    bus: Arc<MessageBus>,
    tools: ToolRegistry,
    workspace: PathBuf,
    options: ChatOptions,
    max_iterations: u32,
    running: RunningTasks,
    span: Span,
}

impl SubagentManager {
    /// `tools` is cloned into every run. It must not contain `spawn` or
    /// `message`.
    pub fn new(
        provider: Arc<dyn Provider>,
        bus: Arc<MessageBus>,
        tools: ToolRegistry,
        settings: &AgentSettings,
    ) -> Self {
        Self {
            provider,
            bus,
            tools,
            workspace: settings.workspace.clone(),
            options: settings.chat_options(),
            max_iterations: settings.subagent_max_iterations,
            running: Arc::new(Mutex::new(HashMap::new())),
            span: info_span!("subagent_manager", component = "subagent"),
        }
    }

    /// Starts a run for `task` and returns the acknowledgement right away.
    /// The outcome arrives later as a system message on the inbound queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, task: &str, options: SpawnOptions) -> Result<String> {
        if task.trim().is_empty() {
            return Err(Error::Validation("Subagent task must not be empty".to_string()));
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("Cannot spawn subagent outside a tokio runtime: {}", e)))?;

        let task_id: String = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
        let label = options
            .label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| default_label(task));
        let origin = options.origin.unwrap_or_default();

        let run = SubagentRun {
            provider: self.provider.clone(),
            bus: self.bus.clone(),
            tools: self.tools.clone(),
            workspace: self.workspace.clone(),
            options: self.options.clone(),
            max_iterations: self.max_iterations,
            task_id: task_id.clone(),
            label: label.clone(),
            task: task.to_string(),
            origin: origin.clone(),
        };
        let guard = RunningGuard {
            running: self.running.clone(),
            task_id: task_id.clone(),
        };
        let span = info_span!(parent: &self.span, "subagent", task_id = %task_id, label = %label);

        // Registered before the task starts so a fast run cannot settle first.
        lock_tasks(&self.running).insert(
            task_id.clone(),
            SubagentTask {
                label: label.clone(),
                handle: None,
            },
        );
        let join = handle.spawn(
            async move {
                let _guard = guard;
                run.execute().await;
            }
            .instrument(span),
        );
        if let Some(entry) = lock_tasks(&self.running).get_mut(&task_id) {
            entry.handle = Some(join);
        }

        self.span.in_scope(|| {
            info!(task_id = %task_id, label = %label, origin = %format!("{}:{}", origin.channel, origin.chat_id), "Spawned subagent")
        });

        Ok(format!(
            "Subagent [{}] started (id: {}). I'll notify you when it completes.",
            label, task_id
        ))
    }

    /// Number of runs that have not yet announced their outcome.
    pub fn running_count(&self) -> usize {
        lock_tasks(&self.running).len()
    }

    /// `(id, label)` of every outstanding run, sorted by id.
    pub fn running_tasks(&self) -> Vec<(String, String)> {
        let mut tasks: Vec<(String, String)> = lock_tasks(&self.running)
            .iter()
            .map(|(id, t)| (id.clone(), t.label.clone()))
            .collect();
        tasks.sort();
        tasks
    }
}

impl SpawnHandle for SubagentManager {
    fn spawn(
        &self,
        task: &str,
        label: Option<&str>,
        origin_channel: &str,
        origin_chat_id: &str,
    ) -> Result<String> {
        SubagentManager::spawn(
            self,
            task,
            SpawnOptions {
                label: label.map(str::to_string),
                origin: Some(Origin::new(origin_channel, origin_chat_id)),
            },
        )
    }
}

/// Removes a run from the active set when its task finishes or is dropped.
struct RunningGuard {
    running: RunningTasks,
    task_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock_tasks(&self.running).remove(&self.task_id);
    }
}

fn default_label(task: &str) -> String {
    if task.chars().count() > LABEL_MAX_CHARS {
        let head: String = task.chars().take(LABEL_MAX_CHARS).collect();
        format!("{}...", head)
    } else {
        task.to_string()
    }
}

struct SubagentRun {
    provider: Arc<dyn Provider>,
    bus: Arc<MessageBus>,
    tools: ToolRegistry,
    workspace: PathBuf,
    options: ChatOptions,
    max_iterations: u32,
    task_id: String,
    label: String,
    task: String,
    origin: Origin,
}

impl SubagentRun {
    async fn execute(self) {
        info!("Subagent started");

        let (status, result) = match AssertUnwindSafe(self.run()).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(error = %e, "Subagent failed");
                (SubagentStatus::Error, format!("Error: {}", e))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Subagent panicked");
                (SubagentStatus::Error, format!("Error: {}", message))
            }
        };

        self.announce(status, &result);
    }

    async fn run(&self) -> Result<(SubagentStatus, String)> {
        let mut messages = vec![
            ChatMessage::system(&self.build_prompt()),
            ChatMessage::user(&self.task),
        ];
        let mut ctx = ToolContext::new(&self.origin.channel, &self.origin.chat_id)
            .with_workspace(self.workspace.clone());
        ctx.session_key = format!("subagent:{}", self.task_id);

        let outcome = run_tool_loop(
            self.provider.as_ref(),
            &self.tools,
            &ctx,
            &mut messages,
            &self.options,
            self.max_iterations,
        )
        .await?;

        if outcome.finish_reason == FinishReason::Error {
            let message = outcome.content.unwrap_or_default();
            error!(error = %message, "Subagent provider returned an error");
            return Ok((SubagentStatus::Error, message));
        }

        info!(iterations = outcome.iterations, "Subagent completed");
        Ok((
            SubagentStatus::Ok,
            outcome
                .final_text()
                .unwrap_or_else(|| NO_FINAL_RESPONSE.to_string()),
        ))
    }

    fn announce(&self, status: SubagentStatus, result: &str) {
        let status_text = match status {
            SubagentStatus::Ok => "completed successfully",
            SubagentStatus::Error => "failed",
        };
        let content = format!(
            "[Subagent '{}' {}]\n\n\
             Task: {}\n\n\
             Result:\n{}\n\n\
             Summarize this naturally for the user. Keep it brief (1-2 sentences). \
             Do not mention technical details like \"subagent\" or task IDs.",
            self.label, status_text, self.task, result
        );

        let mut msg = InboundMessage::system("subagent", &content, &self.origin.channel, &self.origin.chat_id);
        msg.metadata = json!({
            "task_id": self.task_id,
            "label": self.label,
            "status": status.as_str(),
        });
        self.bus.publish_inbound(msg);

        info!(
            status = status.as_str(),
            origin = %format!("{}:{}", self.origin.channel, self.origin.chat_id),
            "Announced subagent result"
        );
    }

    fn build_prompt(&self) -> String {
        let tools = self.tools.tool_names();
        let tool_list = if tools.is_empty() {
            "- (no tools available; answer from your own knowledge)".to_string()
        } else {
            tools
                .iter()
                .map(|name| format!("- {}", name))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "# Subagent\n\n\
             You were started by the main agent to carry out one specific task.\n\n\
             ## Your Task\n{}\n\n\
             ## Rules\n\
             1. Work only on the assigned task.\n\
             2. Your final response is reported back to the main agent, not shown to the user directly.\n\
             3. Do not start conversations or pick up side tasks.\n\
             4. Keep findings concise but complete.\n\n\
             ## Available Tools\n{}\n\n\
             ## Limits\n\
             - You cannot message users directly.\n\
             - You cannot start other subagents.\n\
             - You cannot see the main agent's conversation history.\n\n\
             ## Workspace\n{}\n\n\
             When the task is done, reply with a clear summary of what you found or did.",
            self.task,
            tool_list,
            self.workspace.display()
        )
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "subagent panicked".to_string()
    }
}
