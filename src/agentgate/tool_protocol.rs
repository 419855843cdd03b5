//! Tool registry for tool-capable agent calls.
//!
//! Tools are opaque to the gateway: a name, a JSON-schema definition
//! forwarded to the provider, and a handler invoked with the model's
//! arguments. The dispatcher drives the tool loop; this module only owns
//! registration and invocation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agentgate::clients::ToolDefinition;
use crate::agentgate::error::GatewayError;

/// Result of a tool invocation handed back to the model.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// JSON payload returned to the model as the tool result.
    pub output: serde_json::Value,
    /// Whether the invocation failed at the application level.
    pub is_error: bool,
}

impl ToolResult {
    /// A successful invocation.
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            output,
            is_error: false,
        }
    }

    /// A failed invocation, surfaced to the model rather than the caller.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            output: serde_json::json!({ "error": message.into() }),
            is_error: true,
        }
    }
}

/// Handler signature for a registered tool.
pub type ToolHandler =
    Arc<dyn Fn(serde_json::Value) -> Result<ToolResult, GatewayError> + Send + Sync>;

/// Mapping from tool name to schema plus handler, assembled at startup.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, (ToolDefinition, ToolHandler)>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register (or replace) a tool.
    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) {
        self.tools.insert(definition.name.clone(), (definition, handler));
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// The definitions for the given tool names, in manifest order.
    /// Unknown names are skipped with a warning; an agent manifest naming a
    /// missing tool degrades to the tools that do exist.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        let mut definitions = Vec::with_capacity(names.len());
        for name in names {
            match self.tools.get(name) {
                Some((definition, _)) => definitions.push(definition.clone()),
                None => log::warn!("agent manifest names unregistered tool '{}'", name),
            }
        }
        definitions
    }

    /// Invoke a tool with the model-supplied arguments.
    ///
    /// An unknown tool name is an application-level failure handed back to
    /// the model, not a gateway error; only handler-level classified errors
    /// propagate.
    pub fn invoke(&self, name: &str, args: serde_json::Value) -> Result<ToolResult, GatewayError> {
        match self.tools.get(name) {
            Some((_, handler)) => handler(args),
            None => Ok(ToolResult::failure(format!("unknown tool '{}'", name))),
        }
    }
}
