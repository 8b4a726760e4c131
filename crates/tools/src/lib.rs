pub mod message;
pub mod registry;
pub mod spawn;

use async_trait::async_trait;
use nanocell_core::types::ToolDefinition;
use nanocell_core::{OutboundMessage, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use message::MessageTool;
pub use registry::ToolRegistry;
pub use spawn::SpawnTool;

/// Sender handle for outbound messages (used by message tool).
pub type OutboundSender = mpsc::UnboundedSender<OutboundMessage>;

/// Trait for spawning subagents from tools, breaking the circular dependency
/// between the tools crate and the agent crate.
pub trait SpawnHandle: Send + Sync {
    /// Starts a background run and returns the acknowledgement text immediately.
    fn spawn(
        &self,
        task: &str,
        label: Option<&str>,
        origin_channel: &str,
        origin_chat_id: &str,
    ) -> Result<String>;
}

/// The conversation a tool call belongs to, plus the handles some tools need.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: PathBuf,
    pub session_key: String,
    pub channel: String,
    pub chat_id: String,
    pub outbound_tx: Option<OutboundSender>,
    pub spawn_handle: Option<Arc<dyn SpawnHandle>>,
}

impl ToolContext {
    pub fn new(channel: &str, chat_id: &str) -> Self {
        Self {
            workspace: PathBuf::from("."),
            session_key: format!("{}:{}", channel, chat_id),
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            outbound_tx: None,
            spawn_handle: None,
        }
    }

    pub fn with_workspace(mut self, workspace: PathBuf) -> Self {
        self.workspace = workspace;
        self
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new("cli", "direct")
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolDefinition;

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<String>;
}

/// Reads a required, non-empty string parameter.
pub(crate) fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| nanocell_core::Error::Validation(format!("Missing required parameter: {}", key)))
}
