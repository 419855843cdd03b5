//! MiniMax adapter, routed through the shared OpenAI-compatible codec.
//!
//! Tool definitions are not forwarded natively; tool-using calls against a
//! MiniMax-backed agent are rerouted by the dispatcher to the configured
//! tool-execution fallback.

use crate::agentgate::clients::common::send_chat_completions;
use crate::agentgate::clients::{
    GenerateOptions, Message, Provider, ProviderClient, ProviderReply,
};
use crate::agentgate::config::ProviderEndpoint;
use crate::agentgate::error::GatewayError;
use async_trait::async_trait;

const DEFAULT_BASE_URL: &str = "https://api.minimaxi.com/v1";

/// Client for MiniMax's chat-completions surface.
pub struct MiniMaxClient {
    api_key: String,
    base_url: String,
}

impl MiniMaxClient {
    /// Create a client from an API key, using the public endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Create a client pointing at a custom compatible base URL.
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

#[async_trait]
impl ProviderClient for MiniMaxClient {
    fn provider(&self) -> Provider {
        Provider::MiniMax
    }

    async fn generate(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<ProviderReply, GatewayError> {
        // Strip tools: this surface does not receive them natively.
        let options = GenerateOptions {
            max_output_tokens: options.max_output_tokens,
            temperature: options.temperature,
            tools: None,
        };
        send_chat_completions(
            &self.base_url,
            Some(&self.api_key),
            model,
            system_prompt,
            messages,
            &options,
        )
        .await
    }
}
