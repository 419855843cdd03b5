//! Shared utilities used across provider adapter implementations.
//!
//! Three concerns live here: the single pooled [`reqwest`] client every
//! adapter shares, the classification of transport and HTTP failures into
//! the gateway error taxonomy, and the OpenAI-compatible chat-completions
//! codec reused by the DeepSeek, MiniMax, and Ollama adapters.

use lazy_static::lazy_static;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::agentgate::clients::{
    GenerateOptions, Message, ProviderReply, Role, ToolCallRequest, ToolDefinition,
};
use crate::agentgate::error::GatewayError;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client instance keeps TLS sessions and DNS lookups warm,
    /// which significantly reduces latency when many concurrent requests
    /// are issued to upstream providers.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Classify a transport-level failure (no HTTP status available).
pub fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::timeout(format!("provider call timed out: {}", err))
    } else if err.is_connect() || err.is_request() {
        GatewayError::network(format!("provider unreachable: {}", err))
    } else {
        GatewayError::internal(format!("provider transport failure: {}", err))
    }
}

/// Classify an HTTP error status into the gateway taxonomy.
///
/// The body is only used for a trimmed detail line; raw provider payloads
/// never travel past this boundary.
pub fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let detail = trimmed_detail(body);
    match status.as_u16() {
        401 | 403 => GatewayError::authentication(format!(
            "provider rejected credentials (HTTP {})",
            status.as_u16()
        )),
        404 => GatewayError::model_error(format!("model not found: {}", detail)),
        429 => GatewayError::rate_limit("provider returned too many requests"),
        400 | 422 => {
            // Vendors report unknown models and bad options as 400s.
            if body.contains("model") {
                GatewayError::model_error(format!("provider rejected model/options: {}", detail))
            } else {
                GatewayError::validation(format!("provider rejected request: {}", detail))
            }
        }
        code if code >= 500 => {
            GatewayError::internal(format!("provider returned HTTP {}", code))
        }
        code => GatewayError::internal(format!("unexpected provider status HTTP {}", code)),
    }
}

fn trimmed_detail(body: &str) -> String {
    let line = body.lines().next().unwrap_or("");
    let mut detail: String = line.chars().take(160).collect();
    if detail.is_empty() {
        detail.push_str("(no detail)");
    }
    detail
}

// ── OpenAI-compatible wire types ─────────────────────────────────────────────

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireToolCallFunction,
}

#[derive(Deserialize)]
struct WireToolCallFunction {
    name: String,
    /// Arguments arrive as a JSON-encoded string on this surface.
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

fn to_wire_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system_prompt {
        wire.push(WireMessage {
            role: "system",
            content: system.to_string(),
            tool_call_id: None,
        });
    }
    for message in messages {
        let (role, tool_call_id) = match &message.role {
            Role::System => ("system", None),
            Role::User => ("user", None),
            Role::Assistant => ("assistant", None),
            Role::Tool { call_id } => ("tool", Some(call_id.clone())),
        };
        wire.push(WireMessage {
            role,
            content: message.content.as_ref().to_string(),
            tool_call_id,
        });
    }
    wire
}

fn to_wire_tools(tools: &[ToolDefinition]) -> Vec<WireTool<'_>> {
    tools
        .iter()
        .map(|tool| WireTool {
            kind: "function",
            function: WireFunction {
                name: &tool.name,
                description: &tool.description,
                parameters: &tool.parameters_schema,
            },
        })
        .collect()
}

/// Send one chat-completions request against an OpenAI-compatible endpoint
/// and surface the assistant reply with token accounting.
pub async fn send_chat_completions(
    base_url: &str,
    api_key: Option<&str>,
    model: &str,
    system_prompt: Option<&str>,
    messages: &[Message],
    options: &GenerateOptions,
) -> Result<ProviderReply, GatewayError> {
    let request = WireRequest {
        model,
        messages: to_wire_messages(system_prompt, messages),
        max_tokens: options.max_output_tokens,
        temperature: options.temperature,
        tools: options
            .tools
            .as_ref()
            .filter(|tools| !tools.is_empty())
            .map(|tools| to_wire_tools(tools)),
    };

    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let mut builder = get_shared_http_client().post(&url).json(&request);
    if let Some(key) = api_key {
        builder = builder.header("Authorization", format!("Bearer {}", key));
    }

    let response = builder.send().await.map_err(classify_transport)?;
    let status = response.status();
    let body = response.text().await.map_err(classify_transport)?;
    if !status.is_success() {
        let err = classify_status(status, &body);
        if log::log_enabled!(log::Level::Warn) {
            log::warn!(
                "chat completions against {} failed: {} ({})",
                url,
                status,
                err.kind
            );
        }
        return Err(err);
    }

    let parsed: WireResponse = serde_json::from_str(&body)
        .map_err(|e| GatewayError::internal(format!("malformed provider payload: {}", e)))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::internal("provider returned no choices"))?;

    let mut tool_calls = Vec::with_capacity(choice.message.tool_calls.len());
    for call in choice.message.tool_calls {
        let arguments = serde_json::from_str(&call.function.arguments)
            .unwrap_or(serde_json::Value::Null);
        tool_calls.push(ToolCallRequest {
            id: call.id,
            name: call.function.name,
            arguments,
        });
    }

    let usage = parsed.usage.unwrap_or(WireUsage {
        prompt_tokens: None,
        completion_tokens: None,
    });
    Ok(ProviderReply {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        input_tokens: usage.prompt_tokens.unwrap_or(0),
        output_tokens: usage.completion_tokens.unwrap_or(0),
    })
}
