//! Anthropic Messages API adapter.
//!
//! Unlike the OpenAI-compatible adapters, Anthropic has its own wire shape:
//! the system prompt is a top-level field, replies arrive as typed content
//! blocks, and tool use is expressed as `tool_use` blocks answered with
//! `tool_result` blocks inside user messages. This adapter owns that
//! translation and reports native tool support.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agentgate::clients::common::{classify_status, classify_transport, get_shared_http_client};
use crate::agentgate::clients::{
    GenerateOptions, Message, Provider, ProviderClient, ProviderReply, Role, ToolCallRequest,
};
use crate::agentgate::config::ProviderEndpoint;
use crate::agentgate::error::GatewayError;
use async_trait::async_trait;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Client for Anthropic's Messages API.
pub struct AnthropicClient {
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    /// Create a client from an API key, using the public endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Create a client pointing at a custom Messages-compatible base URL.
    pub fn new_with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    /// Build from a configured endpoint.
    pub fn from_endpoint(endpoint: &ProviderEndpoint) -> Self {
        Self {
            api_key: endpoint.api_key.clone().unwrap_or_default(),
            base_url: endpoint
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len());
    for message in messages {
        match &message.role {
            // System messages inside the history fold into user turns; the
            // dedicated system field carries the real system prompt.
            Role::System | Role::User => wire.push(WireMessage {
                role: "user",
                content: json!(message.content.as_ref()),
            }),
            Role::Assistant => wire.push(WireMessage {
                role: "assistant",
                content: json!(message.content.as_ref()),
            }),
            Role::Tool { call_id } => wire.push(WireMessage {
                role: "user",
                content: json!([{
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": message.content.as_ref(),
                }]),
            }),
        }
    }
    wire
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<ProviderReply, GatewayError> {
        let tools = options.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters_schema,
                    })
                })
                .collect::<Vec<_>>()
        });

        let request = WireRequest {
            model,
            max_tokens: options.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: system_prompt,
            messages: to_wire_messages(messages),
            temperature: options.temperature,
            tools,
        };

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let response = get_shared_http_client()
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let parsed: WireResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::internal(format!("malformed provider payload: {}", e)))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text: chunk } => text.push_str(&chunk),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCallRequest {
                    id,
                    name,
                    arguments: input,
                }),
                ContentBlock::Other => {}
            }
        }

        let usage = parsed.usage.unwrap_or(WireUsage {
            input_tokens: None,
            output_tokens: None,
        });
        Ok(ProviderReply {
            text,
            tool_calls,
            input_tokens: usage.input_tokens.unwrap_or(0),
            output_tokens: usage.output_tokens.unwrap_or(0),
        })
    }
}
