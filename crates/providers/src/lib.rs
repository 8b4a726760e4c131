pub mod anthropic;
pub mod factory;
pub mod openai;

use async_trait::async_trait;
use nanocell_core::types::{ChatMessage, LLMResponse, ToolDefinition};
use nanocell_core::Result;
use serde_json::{Map, Value};
use tracing::warn;

pub(crate) const DEFAULT_MAX_TOKENS: u32 = 4096;
pub(crate) const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Per-call overrides. Unset fields fall back to the provider's defaults.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatOptions {
    pub fn new(model: &str, max_tokens: u32, temperature: f32) -> Self {
        Self {
            model: Some(model.to_string()),
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
        }
    }
}

/// A chat-completion backend.
///
/// Implementations in this crate never return `Err` for transport or API
/// failures: those come back as an [`LLMResponse`] with
/// `finish_reason == FinishReason::Error` and the message as content.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<LLMResponse>;

    fn default_model(&self) -> &str;
}

/// Parses a tool-call argument payload into a JSON object.
/// Strings are decoded as JSON; anything that is not an object becomes `{}`.
pub(crate) fn parse_arguments(raw: &Value) -> Value {
    let parsed = match raw {
        Value::String(s) if s.trim().is_empty() => return Value::Object(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, raw = %s, "Failed to parse tool call arguments as JSON, using empty object");
                return Value::Object(Map::new());
            }
        },
        other => other.clone(),
    };
    match parsed {
        Value::Object(_) => parsed,
        Value::Null => Value::Object(Map::new()),
        other => {
            warn!(raw = %other, "Tool call arguments are not an object, using empty object");
            Value::Object(Map::new())
        }
    }
}

pub(crate) fn with_reasoning(content: Option<String>, reasoning: Option<&str>) -> Option<String> {
    match reasoning.filter(|r| !r.is_empty()) {
        None => content,
        Some(r) => {
            let thinking = format!("[Thinking: {}]", r);
            match content.filter(|c| !c.is_empty()) {
                Some(c) => Some(format!("{}\n\n{}", thinking, c)),
                None => Some(thinking),
            }
        }
    }
}

pub(crate) fn preview(s: &str, max_bytes: usize) -> &str {
    if max_bytes >= s.len() {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub use anthropic::AnthropicProvider;
pub use factory::{create_provider, ProviderKind};
pub use openai::OpenAIProvider;
