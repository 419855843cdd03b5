//! Provider adapters and the shared primitives they implement.
//!
//! Every upstream LLM vendor enters the gateway through the
//! [`ProviderClient`] trait: a single `generate` operation that takes a
//! model id, an optional system prompt, a message history, and per-call
//! options, and returns text plus token accounting. Adapters own the wire
//! format and are responsible for mapping vendor-specific failures into the
//! closed [`ErrorKind`](crate::agentgate::error::ErrorKind) taxonomy.
//!
//! The provider set is closed: new vendors are added as a [`Provider`]
//! variant plus an adapter registered at startup, never by runtime string
//! dispatch.

pub mod anthropic;
pub mod common;
pub mod deepseek;
pub mod minimax;
pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::agentgate::config::ProviderSettings;
use crate::agentgate::error::GatewayError;

/// The closed set of supported upstream providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Anthropic Messages API.
    Anthropic,
    /// DeepSeek chat completions (OpenAI-compatible surface).
    DeepSeek,
    /// MiniMax chat completions (OpenAI-compatible surface).
    MiniMax,
    /// A local Ollama daemon exposing the OpenAI-compatible surface.
    Ollama,
}

impl Provider {
    /// Stable lowercase identifier, matching configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::DeepSeek => "deepseek",
            Provider::MiniMax => "minimax",
            Provider::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(Provider::Anthropic),
            "deepseek" => Ok(Provider::DeepSeek),
            "minimax" => Ok(Provider::MiniMax),
            "ollama" => Ok(Provider::Ollama),
            other => Err(GatewayError::validation(format!(
                "unknown provider '{}'",
                other
            ))),
        }
    }
}

/// Role attached to a conversation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains the assistant.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message.
    Assistant,
    /// A tool-result message correlating with a prior [`ToolCallRequest`].
    Tool {
        /// The provider-assigned id of the call this result answers.
        call_id: String,
    },
}

/// A single conversation message in the minimal shape providers consume.
///
/// Content is stored as `Arc<str>` so histories can be cheaply cloned when
/// they fan out across retries, fallback entries, and parallel tasks.
#[derive(Debug, Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: Arc<str>,
}

impl Message {
    /// Build a system message.
    pub fn system(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::System,
            content: Arc::from(content.as_ref()),
        }
    }

    /// Build a user message.
    pub fn user(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::User,
            content: Arc::from(content.as_ref()),
        }
    }

    /// Build an assistant message.
    pub fn assistant(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Assistant,
            content: Arc::from(content.as_ref()),
        }
    }

    /// Build a tool-result message answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Tool {
                call_id: call_id.into(),
            },
            content: Arc::from(content.as_ref()),
        }
    }
}

/// Provider-agnostic tool schema forwarded with a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it appears in the provider's tools array.
    pub name: String,
    /// Human-readable description surfaced to the model.
    pub description: String,
    /// JSON Schema object describing the accepted arguments.
    pub parameters_schema: serde_json::Value,
}

/// A tool invocation requested by the model in a provider response.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Provider-assigned call id, echoed back in the tool-result message.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// Parsed JSON arguments supplied by the model.
    pub arguments: serde_json::Value,
}

/// Per-call generation options.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Upper bound on generated tokens, when the provider supports one.
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Native tool definitions, for providers that support tool use.
    pub tools: Option<Vec<ToolDefinition>>,
}

/// A completed provider round-trip.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    /// Assistant text. May be empty when the reply is only tool calls.
    pub text: String,
    /// Tool invocations requested by the model, in response order.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Prompt tokens billed by the provider.
    pub input_tokens: u64,
    /// Generated tokens billed by the provider.
    pub output_tokens: u64,
}

/// Contract implemented by every provider adapter.
///
/// Implementations must be `Send + Sync` so they can be shared across
/// concurrent dispatch units. Errors must already be classified into the
/// gateway taxonomy when they leave the adapter.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Which provider this adapter speaks for.
    fn provider(&self) -> Provider;

    /// Execute one generation call against `model`.
    async fn generate(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<ProviderReply, GatewayError>;

    /// Whether the adapter forwards tool definitions natively.
    ///
    /// Calls that need tools against a non-supporting provider are rerouted
    /// by the dispatcher to the configured tool-execution fallback.
    fn supports_tools(&self) -> bool {
        false
    }
}

/// Immutable map from [`Provider`] to its adapter, built once at startup.
#[derive(Clone)]
pub struct ProviderRegistry {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    /// Create an empty registry. Useful for tests that register mocks.
    pub fn empty() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Build adapters for every provider with an endpoint in `settings`.
    ///
    /// Providers without configuration are simply absent; dispatching to an
    /// agent bound to an absent provider fails with a validation error at
    /// startup (see [`crate::agentgate::gateway::Gateway::new`]).
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let mut registry = Self::empty();
        if let Some(endpoint) = &settings.anthropic {
            registry.register(Arc::new(anthropic::AnthropicClient::from_endpoint(endpoint)));
        }
        if let Some(endpoint) = &settings.deepseek {
            registry.register(Arc::new(deepseek::DeepSeekClient::from_endpoint(endpoint)));
        }
        if let Some(endpoint) = &settings.minimax {
            registry.register(Arc::new(minimax::MiniMaxClient::from_endpoint(endpoint)));
        }
        if let Some(endpoint) = &settings.ollama {
            registry.register(Arc::new(ollama::OllamaClient::from_endpoint(endpoint)));
        }
        registry
    }

    /// Register (or replace) the adapter for a provider.
    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.provider(), client);
    }

    /// Look up the adapter for `provider`.
    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(&provider).cloned()
    }

    /// Whether an adapter is registered for `provider`.
    pub fn contains(&self, provider: Provider) -> bool {
        self.clients.contains_key(&provider)
    }
}
