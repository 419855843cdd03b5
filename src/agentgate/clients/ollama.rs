//! Ollama adapter for a local daemon's OpenAI-compatible surface.
//!
//! Runs unauthenticated against `http://127.0.0.1:11434/v1` by default.
//! Local models report no billing usage on some builds; missing usage
//! fields surface as zero tokens, which keeps cost accounting truthful for
//! free local inference.

use crate::agentgate::clients::common::send_chat_completions;
use crate::agentgate::clients::{
    GenerateOptions, Message, Provider, ProviderClient, ProviderReply,
};
use crate::agentgate::config::ProviderEndpoint;
use crate::agentgate::error::GatewayError;
use async_trait::async_trait;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434/v1";

/// Client for a local Ollama daemon.
pub struct OllamaClient {
    base_url: String,
}

impl OllamaClient {
    /// Create a client against the default local daemon address.
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Create a client pointing at a custom daemon address.
    pub fn new_with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Build from a configured endpoint.
    pub fn from_endpoint(endpoint: &ProviderEndpoint) -> Self {
        Self {
            base_url: endpoint
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for OllamaClient {
    fn provider(&self) -> Provider {
        Provider::Ollama
    }

    async fn generate(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<ProviderReply, GatewayError> {
        let options = GenerateOptions {
            max_output_tokens: options.max_output_tokens,
            temperature: options.temperature,
            tools: None,
        };
        send_chat_completions(&self.base_url, None, model, system_prompt, messages, &options).await
    }
}
