use serde::{Deserialize, Serialize};

/// Channel name used for messages the runtime sends to itself, such as
/// subagent announcements.
pub const SYSTEM_CHANNEL: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp_ms: i64,
}

impl InboundMessage {
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: vec![],
            metadata: serde_json::Value::Null,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }

    pub fn cli(content: &str) -> Self {
        Self::new("cli", "user", "direct", content)
    }

    /// A message addressed back to `origin_channel:origin_chat_id`.
    pub fn system(sender_id: &str, content: &str, origin_channel: &str, origin_chat_id: &str) -> Self {
        Self::new(
            SYSTEM_CHANNEL,
            sender_id,
            &format!("{}:{}", origin_channel, origin_chat_id),
            content,
        )
    }

    pub fn is_system(&self) -> bool {
        self.channel == SYSTEM_CHANNEL
    }

    /// For system messages, the `(channel, chat_id)` the message is meant for.
    /// A chat id without a separator is treated as a cli chat.
    pub fn origin(&self) -> (String, String) {
        match self.chat_id.split_once(':') {
            Some((channel, chat_id)) => (channel.to_string(), chat_id.to_string()),
            None => ("cli".to_string(), self.chat_id.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            reply_to: None,
            media: vec![],
            metadata: serde_json::Value::Null,
        }
    }
}
