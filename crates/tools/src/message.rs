use async_trait::async_trait;
use nanocell_core::types::ToolDefinition;
use nanocell_core::{Error, OutboundMessage, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::{required_str, Tool, ToolContext};

pub struct MessageTool;

#[async_trait]
impl Tool for MessageTool {
    fn schema(&self) -> ToolDefinition {
        ToolDefinition {
            name: "message".to_string(),
            description: "Send a message to the user. Defaults to the current conversation; \
                set channel and chat_id only to reach a different one."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": {
                        "type": "string",
                        "description": "The message content to send"
                    },
                    "channel": {
                        "type": "string",
                        "description": "Optional: target channel. Defaults to the current channel."
                    },
                    "chat_id": {
                        "type": "string",
                        "description": "Optional: target chat ID. Defaults to the current chat."
                    }
                },
                "required": ["content"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        required_str(params, "content").map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<String> {
        let content = required_str(&params, "content")?;
        let channel = params
            .get("channel")
            .and_then(|v| v.as_str())
            .unwrap_or(&ctx.channel);
        let chat_id = params
            .get("chat_id")
            .and_then(|v| v.as_str())
            .unwrap_or(&ctx.chat_id);

        let outbound_tx = ctx.outbound_tx.as_ref().ok_or_else(|| {
            Error::Tool("No outbound message channel available. Message delivery is not configured.".to_string())
        })?;

        outbound_tx
            .send(OutboundMessage::new(channel, chat_id, content))
            .map_err(|e| Error::Tool(format!("Failed to send message: {}", e)))?;

        debug!(channel = channel, chat_id = chat_id, content_len = content.len(), "Message queued for delivery");

        Ok(format!("Message sent to {}:{}", channel, chat_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_message_validate() {
        let tool = MessageTool;
        assert_eq!(tool.schema().name, "message");
        assert!(tool.validate(&json!({"content": "hello"})).is_ok());
        assert!(tool.validate(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_message_defaults_to_current_chat() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ctx = ToolContext::new("telegram", "42");
        ctx.outbound_tx = Some(tx);

        let out = MessageTool.execute(ctx.clone(), json!({"content": "hi"})).await.unwrap();
        assert_eq!(out, "Message sent to telegram:42");
        let msg = rx.recv().await.unwrap();
        assert_eq!((msg.channel.as_str(), msg.chat_id.as_str()), ("telegram", "42"));

        MessageTool
            .execute(ctx, json!({"content": "yo", "channel": "slack", "chat_id": "c1"}))
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!((msg.channel.as_str(), msg.content.as_str()), ("slack", "yo"));
    }

    #[tokio::test]
    async fn test_message_closed_channel_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut ctx = ToolContext::default();
        ctx.outbound_tx = Some(tx);
        assert!(MessageTool.execute(ctx, json!({"content": "hi"})).await.is_err());
    }
}
