//! Typed gateway configuration.
//!
//! The whole process is configured once at startup from a single
//! [`GatewayConfig`] value. How that value is produced (file, environment,
//! hand-built in code) is the caller's business — no parsing dependencies
//! are introduced here. Unknown keys in a serialized config are ignored for
//! forward compatibility; recognized keys are validated by
//! [`GatewayConfig::validate`], and an invalid configuration refuses to
//! start.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::agentgate::error::GatewayError;

/// Declaration of a single agent, as it appears in configuration.
///
/// Agents are immutable for the process lifetime; the registry turns these
/// declarations into [`Agent`](crate::agentgate::agent::Agent) values once,
/// at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identifier referenced by routing, health, and cost records.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Provider identifier; must parse into the closed provider set.
    pub provider: String,
    /// Model identifier, opaque to the gateway and understood by the provider.
    pub model: String,
    /// USD cost per million input tokens.
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    /// USD cost per million output tokens.
    #[serde(default)]
    pub output_cost_per_mtok: f64,
    /// Skill tags matched against query keywords by the router.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Intent tag → affinity weight in `[0, 1]`.
    #[serde(default)]
    pub intent_affinities: HashMap<String, f64>,
    /// Ordered fallback agent ids tried after this agent is exhausted.
    #[serde(default)]
    pub fallbacks: Vec<String>,
    /// Optional system prompt prepended to every call.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Optional persona hint appended to the system prompt.
    #[serde(default)]
    pub personality: Option<String>,
    /// Names of registered tools this agent may call. Empty = no tool loop.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Generation cap forwarded to the provider.
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature forwarded to the provider.
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Connection details for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Bearer/API key. Optional for unauthenticated local providers.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL override. Each adapter supplies its vendor default.
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Per-provider endpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub anthropic: Option<ProviderEndpoint>,
    #[serde(default)]
    pub deepseek: Option<ProviderEndpoint>,
    #[serde(default)]
    pub minimax: Option<ProviderEndpoint>,
    #[serde(default)]
    pub ollama: Option<ProviderEndpoint>,
}

/// Router knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Seconds a cached routing decision stays valid.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Scores at or below this threshold fall back to the default agent.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            min_score: default_min_score(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_min_score() -> f64 {
    0.1
}

/// Dispatcher knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per-attempt upper bound in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Retries per model after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries_per_model: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Apply ±10 % jitter to backoff delays.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_retries_per_model: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_jitter() -> bool {
    true
}

/// One budget tier: a hard limit and a warning threshold, both USD.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierConfig {
    /// Hard limit. Requests that would push spend past it are rejected.
    pub limit: f64,
    /// Warning threshold; must be strictly less than `limit`.
    pub warn: f64,
}

impl TierConfig {
    /// Build a tier from `(limit, warn)`.
    pub fn new(limit: f64, warn: f64) -> Self {
        Self { limit, warn }
    }
}

/// The three budget tiers plus optional per-project overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Per-request tier. Default $10, warn at $5.
    #[serde(default = "default_per_request_tier")]
    pub per_request: TierConfig,
    /// Rolling UTC-day tier. Default $50, warn at $40.
    #[serde(default = "default_daily_tier")]
    pub daily: TierConfig,
    /// Rolling UTC-month tier. Default $1000, warn at $800.
    #[serde(default = "default_monthly_tier")]
    pub monthly: TierConfig,
    /// Project id → tier overrides.
    #[serde(default)]
    pub projects: HashMap<String, ProjectBudget>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_request: default_per_request_tier(),
            daily: default_daily_tier(),
            monthly: default_monthly_tier(),
            projects: HashMap::new(),
        }
    }
}

/// Partial tier overrides for one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectBudget {
    #[serde(default)]
    pub per_request: Option<TierConfig>,
    #[serde(default)]
    pub daily: Option<TierConfig>,
    #[serde(default)]
    pub monthly: Option<TierConfig>,
}

fn default_per_request_tier() -> TierConfig {
    TierConfig::new(10.0, 5.0)
}

fn default_daily_tier() -> TierConfig {
    TierConfig::new(50.0, 40.0)
}

fn default_monthly_tier() -> TierConfig {
    TierConfig::new(1000.0, 800.0)
}

/// One worker pool: bounded concurrency plus per-task defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum tasks executing simultaneously in this pool.
    pub concurrency: usize,
    /// Default per-task timeout in seconds.
    pub timeout_seconds: u64,
    /// Default per-task retries after the first run.
    pub max_retries: u32,
}

/// The three orchestrator pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_codegen_pool")]
    pub codegen: PoolConfig,
    #[serde(default = "default_security_pool")]
    pub security: PoolConfig,
    #[serde(default = "default_database_pool")]
    pub database: PoolConfig,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            codegen: default_codegen_pool(),
            security: default_security_pool(),
            database: default_database_pool(),
        }
    }
}

fn default_codegen_pool() -> PoolConfig {
    PoolConfig {
        concurrency: 3,
        timeout_seconds: 300,
        max_retries: 2,
    }
}

fn default_security_pool() -> PoolConfig {
    PoolConfig {
        concurrency: 2,
        timeout_seconds: 300,
        max_retries: 2,
    }
}

fn default_database_pool() -> PoolConfig {
    PoolConfig {
        concurrency: 2,
        timeout_seconds: 180,
        max_retries: 2,
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Agent declarations. At least one is required.
    pub agents: Vec<AgentConfig>,
    /// Agent selected when no score clears the router threshold.
    pub default_agent: String,
    /// Provider endpoints.
    #[serde(default)]
    pub providers: ProviderSettings,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub pools: PoolSettings,
    /// Append-only cost ledger path. `None` keeps the ledger in memory only.
    #[serde(default)]
    pub cost_log: Option<PathBuf>,
    /// Directory for per-session JSON snapshots. `None` disables persistence.
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    /// Agent whose provider/model executes tool calls for providers without
    /// native tool support.
    #[serde(default)]
    pub tool_execution_fallback: Option<String>,
    /// Agent that synthesizes orchestrated results. Defaults to
    /// `default_agent` when unset.
    #[serde(default)]
    pub coordinator_agent: Option<String>,
    /// Bearer token required on privileged operations when set.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl GatewayConfig {
    /// Minimal configuration around a list of agents and a default.
    pub fn new(agents: Vec<AgentConfig>, default_agent: impl Into<String>) -> Self {
        Self {
            agents,
            default_agent: default_agent.into(),
            providers: ProviderSettings::default(),
            router: RouterConfig::default(),
            dispatch: DispatchConfig::default(),
            budget: BudgetConfig::default(),
            pools: PoolSettings::default(),
            cost_log: None,
            session_dir: None,
            tool_execution_fallback: None,
            coordinator_agent: None,
            api_token: None,
        }
    }

    /// Validate recognized keys. Invalid configurations refuse to start.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.agents.is_empty() {
            return Err(GatewayError::validation("at least one agent is required"));
        }
        let mut ids = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(GatewayError::validation("agent id must not be empty"));
            }
            if !ids.insert(agent.id.as_str()) {
                return Err(GatewayError::validation(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
            agent
                .provider
                .parse::<crate::agentgate::clients::Provider>()?;
            if agent.input_cost_per_mtok < 0.0 || agent.output_cost_per_mtok < 0.0 {
                return Err(GatewayError::validation(format!(
                    "agent '{}' has a negative token rate",
                    agent.id
                )));
            }
            for (intent, weight) in &agent.intent_affinities {
                if !(0.0..=1.0).contains(weight) {
                    return Err(GatewayError::validation(format!(
                        "agent '{}' affinity for '{}' must be in [0, 1]",
                        agent.id, intent
                    )));
                }
            }
        }
        for agent in &self.agents {
            for fallback in &agent.fallbacks {
                if !ids.contains(fallback.as_str()) {
                    return Err(GatewayError::validation(format!(
                        "agent '{}' lists unknown fallback '{}'",
                        agent.id, fallback
                    )));
                }
            }
        }
        if !ids.contains(self.default_agent.as_str()) {
            return Err(GatewayError::validation(format!(
                "default agent '{}' is not configured",
                self.default_agent
            )));
        }
        if let Some(fallback) = &self.tool_execution_fallback {
            if !ids.contains(fallback.as_str()) {
                return Err(GatewayError::validation(format!(
                    "tool execution fallback '{}' is not configured",
                    fallback
                )));
            }
        }
        if let Some(coordinator) = &self.coordinator_agent {
            if !ids.contains(coordinator.as_str()) {
                return Err(GatewayError::validation(format!(
                    "coordinator agent '{}' is not configured",
                    coordinator
                )));
            }
        }
        let tiers = vec![
            ("per_request", self.budget.per_request),
            ("daily", self.budget.daily),
            ("monthly", self.budget.monthly),
        ];
        for (name, tier) in tiers {
            if tier.warn >= tier.limit {
                return Err(GatewayError::validation(format!(
                    "budget tier '{}' warning threshold must be below its limit",
                    name
                )));
            }
            if tier.limit <= 0.0 {
                return Err(GatewayError::validation(format!(
                    "budget tier '{}' limit must be positive",
                    name
                )));
            }
        }
        let pools = vec![
            ("codegen", self.pools.codegen),
            ("security", self.pools.security),
            ("database", self.pools.database),
        ];
        for (name, pool) in pools {
            if pool.concurrency == 0 {
                return Err(GatewayError::validation(format!(
                    "pool '{}' concurrency must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }
}
