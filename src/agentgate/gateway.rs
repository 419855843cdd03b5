//! The request handler surface.
//!
//! A [`Gateway`] owns one configured instance of every subsystem — agent
//! registry, router, dispatcher, cost tracker, health tracker, session
//! store, orchestrator — and runs the request pipeline:
//!
//! ```text
//! validate → session context → quota preflight → route → dispatch
//!          → session append → response
//! ```
//!
//! Transport framing is an external collaborator; this type is what an
//! HTTP or WebSocket layer calls into. All state is initialized once at
//! startup from a [`GatewayConfig`] and shared behind `Arc`s; nothing here
//! is a process-global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agentgate::agent::{AgentRegistry, Intent};
use crate::agentgate::clients::ProviderRegistry;
use crate::agentgate::config::GatewayConfig;
use crate::agentgate::cost::{
    BudgetDecision, CostFilter, CostOperation, CostSummary, CostTracker, WarningNotifier,
    estimate_tokens,
};
use crate::agentgate::dispatcher::{DispatchOptions, Dispatcher};
use crate::agentgate::error::GatewayError;
use crate::agentgate::health::{AgentHealth, HealthTracker};
use crate::agentgate::orchestrator::{
    ExecutionPlan, Orchestrator, OrchestratorContext, OrchestratorReport,
};
use crate::agentgate::router::{Router, RouterStats, RoutingDecision};
use crate::agentgate::session::SessionStore;
use crate::agentgate::tool_protocol::ToolRegistry;

/// Maximum accepted request content, in bytes.
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

/// An incoming request, as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// The natural-language message. Required, non-empty, ≤ 64 KiB.
    pub content: String,
    /// Optional explicit agent. Unknown ids are rejected.
    pub agent_id: Option<String>,
    /// Optional conversation key.
    pub session_key: Option<String>,
    /// Project for cost attribution. Defaults to `"default"`.
    pub project_id: Option<String>,
    /// Opaque bearer token; checked on privileged operations.
    pub auth_token: Option<String>,
    /// Attach per-attempt summaries to successful responses too.
    pub include_attempts: bool,
}

impl GatewayRequest {
    /// Build a request around its content.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            agent_id: None,
            session_key: None,
            project_id: None,
            auth_token: None,
            include_attempts: false,
        }
    }

    /// Pin the request to an explicit agent.
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Attach a session key.
    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    /// Attribute spend to a project.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Request per-attempt summaries on success.
    pub fn with_attempts(mut self) -> Self {
        self.include_attempts = true;
        self
    }
}

/// Routing information echoed back with a response.
#[derive(Debug, Clone)]
pub struct RoutingSummary {
    pub agent_id: String,
    pub intent: Intent,
    pub confidence: f64,
    pub cached: bool,
    pub rationale: String,
}

impl From<&RoutingDecision> for RoutingSummary {
    fn from(decision: &RoutingDecision) -> Self {
        Self {
            agent_id: decision.agent_id.clone(),
            intent: decision.intent,
            confidence: decision.confidence,
            cached: decision.cached,
            rationale: decision.rationale.clone(),
        }
    }
}

/// A successful gateway response.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// Assistant text.
    pub response: String,
    /// Agent whose output is returned.
    pub agent: String,
    /// Total output tokens.
    pub tokens: u64,
    /// USD cost, rounded to 6 decimal places.
    pub cost_usd: f64,
    /// How the request was routed.
    pub routing: RoutingSummary,
    /// Per-attempt one-liners, present when the caller opted in.
    pub attempts: Option<Vec<String>>,
}

/// Privileged operational snapshot.
#[derive(Debug, Clone)]
pub struct GatewayStats {
    pub router: RouterStats,
    pub health: Vec<AgentHealth>,
    pub costs: CostSummary,
}

/// The assembled gateway.
pub struct Gateway {
    config: GatewayConfig,
    agents: Arc<AgentRegistry>,
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    costs: Arc<CostTracker>,
    health: Arc<HealthTracker>,
    sessions: Option<SessionStore>,
    orchestrator: Orchestrator,
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Gateway {
    /// Assemble a gateway from configuration, building provider adapters
    /// from the configured endpoints and an empty tool registry.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let providers = ProviderRegistry::from_settings(&config.providers);
        Self::with_components(config, providers, ToolRegistry::empty(), None)
    }

    /// Assemble a gateway with an explicit provider registry. Intended for
    /// tests and embedders that bring their own adapters.
    pub fn with_provider_registry(
        config: GatewayConfig,
        providers: ProviderRegistry,
    ) -> Result<Self, GatewayError> {
        Self::with_components(config, providers, ToolRegistry::empty(), None)
    }

    /// Full-control constructor: explicit providers, tools, and an optional
    /// budget-warning side channel.
    pub fn with_components(
        config: GatewayConfig,
        providers: ProviderRegistry,
        tools: ToolRegistry,
        notifier: Option<WarningNotifier>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let agents = Arc::new(AgentRegistry::from_configs(
            &config.agents,
            &config.default_agent,
        )?);
        for agent in agents.all() {
            if !providers.contains(agent.provider) {
                return Err(GatewayError::validation(format!(
                    "agent '{}' uses provider '{}' which has no configured endpoint",
                    agent.id, agent.provider
                )));
            }
        }

        let mut costs = match &config.cost_log {
            Some(path) => CostTracker::open(path, config.budget.clone())?,
            None => CostTracker::in_memory(config.budget.clone()),
        };
        if let Some(notifier) = notifier {
            costs = costs.with_notifier(notifier);
        }
        let costs = Arc::new(costs);

        let health = Arc::new(HealthTracker::new());
        let router = Arc::new(
            Router::new(agents.clone(), config.router.clone()).with_health(health.clone()),
        );
        let providers = Arc::new(providers);
        let dispatcher = Arc::new(Dispatcher::new(
            agents.clone(),
            providers,
            health.clone(),
            costs.clone(),
            Arc::new(tools),
            config.dispatch.clone(),
            config.tool_execution_fallback.clone(),
        ));

        let sessions = match &config.session_dir {
            Some(dir) => Some(SessionStore::open(dir.clone())?),
            None => None,
        };

        let coordinator = config
            .coordinator_agent
            .clone()
            .unwrap_or_else(|| config.default_agent.clone());
        let orchestrator = Orchestrator::new(
            router.clone(),
            dispatcher.clone(),
            costs.clone(),
            config.pools.clone(),
            coordinator,
        );

        Ok(Self {
            config,
            agents,
            router,
            dispatcher,
            costs,
            health,
            sessions,
            orchestrator,
            session_locks: Mutex::new(HashMap::new()),
        })
    }

    fn validate(&self, request: &GatewayRequest) -> Result<(), GatewayError> {
        if request.content.trim().is_empty() {
            return Err(GatewayError::validation("content must not be empty"));
        }
        if request.content.len() > MAX_CONTENT_BYTES {
            return Err(GatewayError::validation(format!(
                "content exceeds the {} KiB limit",
                MAX_CONTENT_BYTES / 1024
            )));
        }
        if let Some(agent_id) = &request.agent_id {
            if !self.agents.contains(agent_id) {
                return Err(GatewayError::validation(format!(
                    "unknown agent '{}'",
                    agent_id
                )));
            }
        }
        Ok(())
    }

    async fn session_guard(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.session_locks.lock().expect("session lock map poisoned");
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Handle one chat request end to end.
    pub async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.handle_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// [`Gateway::handle`] with caller-supplied cancellation.
    pub async fn handle_with_cancel(
        &self,
        request: GatewayRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, GatewayError> {
        self.validate(&request)?;
        let project = request.project_id.clone().unwrap_or_else(|| "default".to_string());

        // Requests within one session run sequentially; the guard spans the
        // whole pipeline so history reads and writes cannot interleave.
        let _session_guard = match &request.session_key {
            Some(key) => Some(self.session_guard(key).await),
            None => None,
        };

        let context = match (&self.sessions, &request.session_key) {
            (Some(store), Some(key)) => store.context(key),
            _ => Vec::new(),
        };

        let decision = self.router.select(
            &request.content,
            if context.is_empty() { None } else { Some(&context) },
            request.agent_id.as_deref(),
        );
        let agent = self
            .agents
            .get(&decision.agent_id)
            .ok_or_else(|| GatewayError::internal("routed agent disappeared"))?;

        let (est_input, est_output) = estimate_tokens(&request.content);
        // The reservation stays alive until this request settles, so
        // concurrent requests against the project cannot double-admit.
        let (budget_decision, _budget_hold) =
            self.costs.check_budget(&project, &agent, est_input, est_output);
        if let BudgetDecision::Rejected { reason, .. } = budget_decision {
            return Err(GatewayError::budget_exceeded(reason));
        }

        let opts = DispatchOptions::default()
            .for_project(&project)
            .with_operation(CostOperation::Chat);
        let outcome = match self
            .dispatcher
            .dispatch(&decision.agent_id, &request.content, &context, &opts, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(failure) => {
                for attempt in &failure.attempts {
                    log::info!("attempt log: {}", attempt.summary());
                }
                return Err(failure.error);
            }
        };

        if let (Some(store), Some(key)) = (&self.sessions, &request.session_key) {
            if let Err(e) = store.append_exchange(key, &request.content, &outcome.text) {
                // A session write failure degrades history, not the response.
                log::warn!("session append for '{}' failed: {}", key, e);
            }
        }

        let attempts = if request.include_attempts {
            Some(outcome.attempts.iter().map(|a| a.summary()).collect())
        } else {
            None
        };
        Ok(GatewayResponse {
            response: outcome.text,
            agent: outcome.agent_id,
            tokens: outcome.tokens_used,
            cost_usd: round_usd(outcome.cost_usd),
            routing: RoutingSummary::from(&decision),
            attempts,
        })
    }

    /// Execute an orchestrated plan on behalf of `request`.
    pub async fn execute_plan(
        &self,
        plan: ExecutionPlan,
        project: impl Into<String>,
        request: impl Into<String>,
    ) -> Result<OrchestratorReport, GatewayError> {
        self.execute_plan_with_cancel(plan, project, request, &CancellationToken::new())
            .await
    }

    /// [`Gateway::execute_plan`] with caller-supplied cancellation.
    pub async fn execute_plan_with_cancel(
        &self,
        plan: ExecutionPlan,
        project: impl Into<String>,
        request: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<OrchestratorReport, GatewayError> {
        let ctx = OrchestratorContext {
            request: request.into(),
            project: project.into(),
            session_key: None,
        };
        self.orchestrator.execute(plan, &ctx, cancel).await
    }

    /// Privileged operational snapshot. Requires the configured API token
    /// when one is set.
    pub fn stats(&self, auth_token: Option<&str>) -> Result<GatewayStats, GatewayError> {
        if let Some(expected) = &self.config.api_token {
            if auth_token != Some(expected.as_str()) {
                return Err(GatewayError::authentication("invalid or missing API token"));
            }
        }
        Ok(GatewayStats {
            router: self.router.stats(),
            health: self.health.summary(),
            costs: self.costs.summary(&CostFilter::default()),
        })
    }

    /// The router, for semantic activation and cache control.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The health tracker.
    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// The cost tracker.
    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    /// The agent registry.
    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }
}

fn round_usd(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
