use async_trait::async_trait;
use nanocell_core::types::{
    ChatMessage, FinishReason, LLMResponse, MessageContent, Role, ToolCallRequest, ToolDefinition,
};
use nanocell_core::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::{parse_arguments, preview, with_reasoning, ChatOptions, Provider};
use crate::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Provider for the OpenAI chat-completions API and compatible relays.
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    api_base: String,
    default_model: String,
    span: Span,
}

impl OpenAIProvider {
    pub fn new(api_key: &str, api_base: Option<&str>) -> Self {
        let api_base = api_base
            .filter(|b| !b.is_empty())
            .unwrap_or(OPENAI_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            span: info_span!("provider", backend = "openai", api_base = %api_base),
            api_base,
            default_model: OPENAI_DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    async fn send_request(&self, request: &ChatRequest<'_>) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.api_base);

        info!(
            url = %url,
            model = %request.model,
            tools_count = request.tools.len(),
            messages_count = request.messages.len(),
            "Calling OpenAI API"
        );

        let mut builder = self.client.post(&url).json(request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Provider(format!("request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(status = %status, body = %raw_body, "OpenAI API error");
            return Err(Error::Provider(format!("API error {}: {}", status, raw_body)));
        }

        debug!(body_len = raw_body.len(), preview = %preview(&raw_body, 500), "OpenAI raw response");

        serde_json::from_str(&raw_body).map_err(|e| {
            Error::Provider(format!(
                "failed to parse response: {}. Body: {}",
                e,
                preview(&raw_body, 500)
            ))
        })
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<LLMResponse> {
        let model = options.model.as_deref().unwrap_or(&self.default_model);
        let wire_tools = encode_tools(tools);
        let request = ChatRequest {
            model,
            messages: encode_messages(messages),
            tool_choice: if wire_tools.is_empty() { None } else { Some("auto") },
            tools: wire_tools,
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        };

        let outcome = async {
            let response = self.send_request(&request).await?;
            decode_response(response)
        }
        .instrument(self.span.clone())
        .await;

        self.span.in_scope(|| match outcome {
            Ok(resp) => {
                info!(
                    content_len = resp.content.as_ref().map(|c| c.len()).unwrap_or(0),
                    tool_calls_count = resp.tool_calls.len(),
                    finish_reason = %resp.finish_reason,
                    "OpenAI response parsed"
                );
                Ok(resp)
            }
            Err(e) => {
                warn!(error = %e, "OpenAI call failed");
                Ok(LLMResponse::error(format!("Error calling OpenAI: {}", e)))
            }
        })
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    max_tokens: u32,
    temperature: f32,
}

/// A message in the flat chat-completions shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: WireFunction,
}

/// `arguments` is a JSON-encoded string on the wire. Some relays send an
/// object instead, so decoding accepts either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: &'a ToolDefinition,
}

fn encode_tools(tools: &[ToolDefinition]) -> Vec<WireTool<'_>> {
    tools
        .iter()
        .map(|function| WireTool {
            tool_type: "function",
            function,
        })
        .collect()
}

pub fn encode_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|msg| {
            let tool_calls = msg.tool_calls.as_ref().filter(|tc| !tc.is_empty()).map(|calls| {
                calls
                    .iter()
                    .map(|tc| WireToolCall {
                        id: tc.id.clone(),
                        call_type: function_type(),
                        function: WireFunction {
                            name: tc.name.clone(),
                            arguments: Value::String(tc.arguments.to_string()),
                        },
                    })
                    .collect::<Vec<_>>()
            });
            // Assistant turns that only carry tool calls send `content: null`.
            let content = if tool_calls.is_some() && msg.content.is_empty() {
                None
            } else {
                Some(msg.content.clone())
            };
            WireMessage {
                role: msg.role.as_str().to_string(),
                content,
                tool_calls,
                tool_call_id: msg.tool_call_id.clone(),
                name: msg.name.clone(),
            }
        })
        .collect()
}

pub fn decode_messages(messages: &[WireMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|wire| {
            let role = Role::parse(&wire.role).unwrap_or_else(|| {
                warn!(role = %wire.role, "Unknown message role, treating as user");
                Role::User
            });
            let tool_calls = wire.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|tc| ToolCallRequest {
                        id: tc.id.clone(),
                        name: tc.function.name.clone(),
                        arguments: parse_arguments(&tc.function.arguments),
                    })
                    .collect()
            });
            ChatMessage {
                role,
                content: wire.content.clone().unwrap_or_default(),
                tool_calls,
                tool_call_id: wire.tool_call_id.clone(),
                name: wire.name.clone(),
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning_details: Vec<ReasoningDetail>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct ReasoningDetail {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

fn decode_response(response: ChatResponse) -> Result<LLMResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::Provider("no choices in response".to_string()))?;

    let tool_calls: Vec<ToolCallRequest> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| ToolCallRequest {
            id: tc.id,
            name: tc.function.name,
            arguments: parse_arguments(&tc.function.arguments),
        })
        .collect();

    let reasoning = choice
        .message
        .reasoning_content
        .as_deref()
        .or_else(|| choice.message.reasoning_details.first().and_then(|d| d.text.as_deref()));
    let content = with_reasoning(choice.message.content.clone(), reasoning);

    let finish_reason = map_finish_reason(choice.finish_reason.as_deref(), !tool_calls.is_empty());

    let mut usage = HashMap::new();
    if let Some(u) = response.usage {
        for (key, value) in [
            ("prompt_tokens", u.prompt_tokens),
            ("completion_tokens", u.completion_tokens),
            ("total_tokens", u.total_tokens),
        ] {
            if let Some(v) = value {
                usage.insert(key.to_string(), v);
            }
        }
    }

    Ok(LLMResponse {
        content,
        tool_calls,
        finish_reason,
        usage,
    })
}

fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        None | Some("") if has_tool_calls => FinishReason::ToolCalls,
        None | Some("") => FinishReason::Stop,
        Some("function_call") => FinishReason::ToolCalls,
        Some(other) => FinishReason::from(other),
    }
}
