use async_trait::async_trait;
use nanocell_core::types::{ChatMessage, LLMResponse, ToolDefinition};
use nanocell_core::{Error, Result};
use nanocell_providers::{ChatOptions, Provider};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::runtime::AgentSettings;

/// Replays a fixed list of replies and records every request it gets.
pub(crate) struct ScriptedProvider {
    script: Mutex<VecDeque<Result<LLMResponse>>>,
    repeat: Option<LLMResponse>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<LLMResponse>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Answers every call with `response`.
    pub fn repeating(response: LLMResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(Vec::new())
        }
    }

    /// Each call waits for one `notify_one` on `gate` before answering.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> Vec<ChatMessage> {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _options: &ChatOptions,
    ) -> Result<LLMResponse> {
        self.requests.lock().unwrap().push(messages.to_vec());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match (next, &self.repeat) {
            (Some(reply), _) => reply,
            (None, Some(response)) => Ok(response.clone()),
            (None, None) => Err(Error::Provider("script exhausted".to_string())),
        }
    }

    fn default_model(&self) -> &str {
        "scripted"
    }
}

pub(crate) fn settings(workspace: &Path) -> AgentSettings {
    AgentSettings {
        workspace: workspace.to_path_buf(),
        model: "scripted".to_string(),
        max_tokens: 1024,
        temperature: 0.0,
        max_iterations: 20,
        subagent_max_iterations: 15,
        history_limit: 50,
    }
}
