//! Agent descriptors and the startup registry.
//!
//! An [`Agent`] binds a provider and model to a cost profile, a set of
//! routing signals (skill tags and intent affinities), an optional persona,
//! and an optional tool manifest. Agents are created once from
//! configuration and never mutated afterwards; everything that changes at
//! runtime (health, spend, cache state) lives in the other subsystems,
//! keyed by agent id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::agentgate::clients::Provider;
use crate::agentgate::config::AgentConfig;
use crate::agentgate::error::GatewayError;

/// Coarse classification of a query, derived by the router per call and
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Security,
    Development,
    Database,
    Planning,
    General,
}

impl Intent {
    /// Stable lowercase tag, matching configuration affinity keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Security => "security",
            Intent::Development => "development",
            Intent::Database => "database",
            Intent::Planning => "planning",
            Intent::General => "general",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named capability handler: provider + model + cost profile + routing
/// signals + optional persona and tools.
#[derive(Debug, Clone)]
pub struct Agent {
    /// Stable identifier referenced everywhere else in the gateway.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Upstream provider this agent calls.
    pub provider: Provider,
    /// Model identifier, opaque to the gateway.
    pub model: String,
    /// USD per million input tokens.
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens.
    pub output_cost_per_mtok: f64,
    /// Skill tags matched against query keywords.
    pub skills: Vec<String>,
    /// Intent → affinity weight in `[0, 1]`.
    pub intent_affinities: HashMap<Intent, f64>,
    /// Ordered fallback agent ids.
    pub fallbacks: Vec<String>,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// Optional persona hint folded into the system prompt.
    pub personality: Option<String>,
    /// Names of registered tools this agent may call.
    pub tools: Vec<String>,
    /// Generation cap forwarded to the provider.
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature forwarded to the provider.
    pub temperature: Option<f32>,
}

impl Agent {
    /// Create an agent with the mandatory identity information. Routing
    /// signals and persona attach through the `with_*` builders.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: Provider,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider,
            model: model.into(),
            input_cost_per_mtok: 0.0,
            output_cost_per_mtok: 0.0,
            skills: Vec::new(),
            intent_affinities: HashMap::new(),
            fallbacks: Vec::new(),
            system_prompt: None,
            personality: None,
            tools: Vec::new(),
            max_output_tokens: None,
            temperature: None,
        }
    }

    /// Set the USD rates per million input and output tokens.
    pub fn with_rates(mut self, input_per_mtok: f64, output_per_mtok: f64) -> Self {
        self.input_cost_per_mtok = input_per_mtok;
        self.output_cost_per_mtok = output_per_mtok;
        self
    }

    /// Attach skill tags.
    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    /// Attach an intent affinity.
    pub fn with_affinity(mut self, intent: Intent, weight: f64) -> Self {
        self.intent_affinities.insert(intent, weight);
        self
    }

    /// Attach the ordered fallback chain.
    pub fn with_fallbacks<I, S>(mut self, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallbacks = fallbacks.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Attach a persona hint.
    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = Some(personality.into());
        self
    }

    /// Grant access to registered tools by name.
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Blended USD-per-token figure used for cost scoring and tie-breaking.
    pub fn cost_per_token(&self) -> f64 {
        (self.input_cost_per_mtok + self.output_cost_per_mtok) / 2.0 / 1_000_000.0
    }

    /// Compose the effective system prompt from `system_prompt` and
    /// `personality`. Returns `None` when neither is set.
    pub fn effective_system_prompt(&self) -> Option<String> {
        match (&self.system_prompt, &self.personality) {
            (Some(prompt), Some(persona)) => Some(format!("{}\n\nPersona: {}", prompt, persona)),
            (Some(prompt), None) => Some(prompt.clone()),
            (None, Some(persona)) => Some(format!("Persona: {}", persona)),
            (None, None) => None,
        }
    }

    fn from_config(config: &AgentConfig) -> Result<Self, GatewayError> {
        let provider: Provider = config.provider.parse()?;
        let mut affinities = HashMap::new();
        for (tag, weight) in &config.intent_affinities {
            let intent = match tag.as_str() {
                "security" => Intent::Security,
                "development" => Intent::Development,
                "database" => Intent::Database,
                "planning" => Intent::Planning,
                "general" => Intent::General,
                other => {
                    return Err(GatewayError::validation(format!(
                        "agent '{}' has affinity for unknown intent '{}'",
                        config.id, other
                    )))
                }
            };
            affinities.insert(intent, *weight);
        }
        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            provider,
            model: config.model.clone(),
            input_cost_per_mtok: config.input_cost_per_mtok,
            output_cost_per_mtok: config.output_cost_per_mtok,
            skills: config.skills.clone(),
            intent_affinities: affinities,
            fallbacks: config.fallbacks.clone(),
            system_prompt: config.system_prompt.clone(),
            personality: config.personality.clone(),
            tools: config.tools.clone(),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
        })
    }
}

/// Immutable set of agents built at startup, preserving declaration order.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<Agent>>,
    order: Vec<String>,
    default_agent: String,
    version: u64,
}

impl AgentRegistry {
    /// Build the registry from validated configuration.
    pub fn from_configs(
        configs: &[AgentConfig],
        default_agent: &str,
    ) -> Result<Self, GatewayError> {
        let mut agents = HashMap::new();
        let mut order = Vec::new();
        for config in configs {
            let agent = Agent::from_config(config)?;
            order.push(agent.id.clone());
            agents.insert(agent.id.clone(), Arc::new(agent));
        }
        if !agents.contains_key(default_agent) {
            return Err(GatewayError::validation(format!(
                "default agent '{}' is not configured",
                default_agent
            )));
        }
        Ok(Self {
            agents,
            order,
            default_agent: default_agent.to_string(),
            version: 1,
        })
    }

    /// Build a registry directly from agent values. Intended for tests and
    /// embedded callers that skip the config layer.
    pub fn from_agents(agents: Vec<Agent>, default_agent: &str) -> Result<Self, GatewayError> {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for agent in agents {
            order.push(agent.id.clone());
            map.insert(agent.id.clone(), Arc::new(agent));
        }
        if !map.contains_key(default_agent) {
            return Err(GatewayError::validation(format!(
                "default agent '{}' is not configured",
                default_agent
            )));
        }
        Ok(Self {
            agents: map,
            order,
            default_agent: default_agent.to_string(),
            version: 1,
        })
    }

    /// Look up an agent by id.
    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.get(id).cloned()
    }

    /// Whether `id` names a configured agent.
    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// All agents in declaration order.
    pub fn all(&self) -> Vec<Arc<Agent>> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id).cloned())
            .collect()
    }

    /// The configured default agent.
    pub fn default_agent(&self) -> Arc<Agent> {
        self.agents
            .get(&self.default_agent)
            .cloned()
            .expect("default agent validated at construction")
    }

    /// Agent-set version, folded into router cache keys.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The lowest and highest blended per-token cost across the registry,
    /// used by the router to normalize cost scores.
    pub fn cost_bounds(&self) -> (f64, f64) {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for id in &self.order {
            if let Some(agent) = self.agents.get(id) {
                let cost = agent.cost_per_token();
                if cost < min {
                    min = cost;
                }
                if cost > max {
                    max = cost;
                }
            }
        }
        if min.is_infinite() {
            (0.0, 0.0)
        } else {
            (min, max)
        }
    }
}
