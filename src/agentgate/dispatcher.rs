//! Model dispatch: turning an agent selection into a provider call.
//!
//! The dispatcher owns everything between "route chose agent X" and "here
//! is text": per-attempt timeouts, exponential-backoff retries, ordered
//! fallback chains across agents, the native tool loop, health reporting,
//! and synchronous cost recording. Cancellation arrives through a
//! [`CancellationToken`] and is honoured at every suspension point.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::agentgate::agent::{Agent, AgentRegistry};
use crate::agentgate::clients::{
    GenerateOptions, Message, Provider, ProviderClient, ProviderRegistry, ToolDefinition,
};
use crate::agentgate::config::DispatchConfig;
use crate::agentgate::cost::{CostOperation, CostTracker};
use crate::agentgate::error::{ErrorKind, GatewayError};
use crate::agentgate::health::{HealthStatus, HealthTracker};
use crate::agentgate::tool_protocol::ToolRegistry;

/// Upper bound on provider round-trips inside one tool loop.
pub const TOOL_LOOP_LIMIT: usize = 8;

/// Outcome of a single provider invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The attempt produced text.
    Success,
    /// The attempt failed with the given kind.
    Failed(ErrorKind),
    /// The chain entry was skipped before calling, on health grounds.
    Skipped,
}

/// Record of one provider invocation (or health-based skip).
#[derive(Debug, Clone)]
pub struct CallAttempt {
    /// Logical agent the attempt was made for.
    pub agent_id: String,
    /// Provider that actually served (or would have served) the call.
    pub provider: Provider,
    /// Model that actually served (or would have served) the call.
    pub model: String,
    /// Billed input tokens; zero if the attempt failed before billing.
    pub input_tokens: u64,
    /// Billed output tokens; zero if the attempt failed.
    pub output_tokens: u64,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the attempt.
    pub duration_ms: u64,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Error detail when the outcome is not success.
    pub detail: Option<String>,
}

impl CallAttempt {
    /// One-line summary for attempt logs and failure responses.
    pub fn summary(&self) -> String {
        match &self.outcome {
            AttemptOutcome::Success => format!(
                "{} via {}/{}: ok ({} in / {} out, {} ms)",
                self.agent_id,
                self.provider,
                self.model,
                self.input_tokens,
                self.output_tokens,
                self.duration_ms
            ),
            AttemptOutcome::Failed(kind) => format!(
                "{} via {}/{}: {} ({})",
                self.agent_id,
                self.provider,
                self.model,
                kind,
                self.detail.as_deref().unwrap_or("no detail")
            ),
            AttemptOutcome::Skipped => format!(
                "{} via {}/{}: skipped ({})",
                self.agent_id,
                self.provider,
                self.model,
                self.detail.as_deref().unwrap_or("health")
            ),
        }
    }
}

/// Options recognized by [`Dispatcher::dispatch`]. Unset fields fall back
/// to the dispatcher's configured defaults.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Per-attempt upper bound. Default: the configured `timeout_seconds`.
    pub timeout: Option<Duration>,
    /// Retries per model after the initial attempt.
    pub max_retries_per_model: Option<u32>,
    /// Override of the agent's configured fallback chain.
    pub fallback_chain: Option<Vec<String>>,
    /// Bypass fallback and health skipping; call the primary only.
    pub force_provider: bool,
    /// Error kinds that must not be retried even though retryable.
    pub abort_on: Vec<ErrorKind>,
    /// Project the spend is attributed to.
    pub project: String,
    /// Operation tag recorded with the cost event.
    pub operation: CostOperation,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_retries_per_model: None,
            fallback_chain: None,
            force_provider: false,
            abort_on: Vec::new(),
            project: "default".to_string(),
            operation: CostOperation::Chat,
        }
    }
}

impl DispatchOptions {
    /// Attribute spend to `project` (builder pattern).
    pub fn for_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    /// Tag cost events with `operation` (builder pattern).
    pub fn with_operation(mut self, operation: CostOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Override the per-attempt timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the per-model retry count (builder pattern).
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries_per_model = Some(retries);
        self
    }
}

/// Successful dispatch result.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Final assistant text.
    pub text: String,
    /// Agent that produced the text (a fallback entry when the primary
    /// was exhausted).
    pub agent_id: String,
    /// Billed input tokens across the whole call (tool loop included).
    pub input_tokens: u64,
    /// Billed output tokens across the whole call.
    pub tokens_used: u64,
    /// USD recorded to the ledger for this call.
    pub cost_usd: f64,
    /// Every attempt made, in order, including skips.
    pub attempts: Vec<CallAttempt>,
}

/// Failed dispatch: the final classified error plus the full attempt log.
#[derive(Debug)]
pub struct DispatchFailure {
    /// The error surfaced to the caller.
    pub error: GatewayError,
    /// Every attempt made, in order, including skips.
    pub attempts: Vec<CallAttempt>,
}

impl From<DispatchFailure> for GatewayError {
    fn from(failure: DispatchFailure) -> Self {
        failure.error
    }
}

/// The model dispatcher.
pub struct Dispatcher {
    agents: Arc<AgentRegistry>,
    providers: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    costs: Arc<CostTracker>,
    tools: Arc<ToolRegistry>,
    config: DispatchConfig,
    tool_fallback: Option<String>,
}

impl Dispatcher {
    /// Assemble a dispatcher over the shared subsystems.
    pub fn new(
        agents: Arc<AgentRegistry>,
        providers: Arc<ProviderRegistry>,
        health: Arc<HealthTracker>,
        costs: Arc<CostTracker>,
        tools: Arc<ToolRegistry>,
        config: DispatchConfig,
        tool_fallback: Option<String>,
    ) -> Self {
        Self {
            agents,
            providers,
            health,
            costs,
            tools,
            config,
            tool_fallback,
        }
    }

    fn backoff_delay(&self, retry_index: u32) -> Duration {
        let base = self.config.backoff_base_ms.max(1);
        let exponent = retry_index.saturating_sub(1).min(16);
        let raw = base.saturating_mul(1u64 << exponent);
        let capped = raw.min(self.config.backoff_max_ms.max(base));
        if !self.config.jitter {
            return Duration::from_millis(capped);
        }
        // ±10 % jitter keeps synchronized clients from retrying in lockstep.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let spread = capped / 5;
        let jittered = capped - capped / 10 + if spread > 0 { nanos % spread } else { 0 };
        Duration::from_millis(jittered)
    }

    fn resolve_chain(
        &self,
        primary: &Arc<Agent>,
        opts: &DispatchOptions,
    ) -> Vec<Arc<Agent>> {
        let mut chain = vec![primary.clone()];
        if opts.force_provider {
            return chain;
        }
        let fallback_ids = opts
            .fallback_chain
            .clone()
            .unwrap_or_else(|| primary.fallbacks.clone());
        for id in fallback_ids {
            match self.agents.get(&id) {
                Some(agent) => chain.push(agent),
                None => log::warn!("fallback chain names unknown agent '{}'", id),
            }
        }
        chain
    }

    /// Execute `prompt` against `agent_id`, with retry, fallback, tools,
    /// health reporting, and cost recording.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        prompt: &str,
        history: &[Message],
        opts: &DispatchOptions,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchFailure> {
        let primary = match self.agents.get(agent_id) {
            Some(agent) => agent,
            None => {
                return Err(DispatchFailure {
                    error: GatewayError::validation(format!("unknown agent '{}'", agent_id)),
                    attempts: Vec::new(),
                })
            }
        };

        let chain = self.resolve_chain(&primary, opts);
        let timeout = opts
            .timeout
            .unwrap_or_else(|| Duration::from_secs(self.config.timeout_seconds));
        let max_retries = opts
            .max_retries_per_model
            .unwrap_or(self.config.max_retries_per_model);

        let mut attempts: Vec<CallAttempt> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        for entry in &chain {
            if !opts.force_provider
                && self.health.status_of(&entry.id).status() == HealthStatus::Unreachable
            {
                log::info!("skipping unreachable agent '{}'", entry.id);
                attempts.push(CallAttempt {
                    agent_id: entry.id.clone(),
                    provider: entry.provider,
                    model: entry.model.clone(),
                    input_tokens: 0,
                    output_tokens: 0,
                    started_at: Utc::now(),
                    duration_ms: 0,
                    outcome: AttemptOutcome::Skipped,
                    detail: Some("agent is unreachable".to_string()),
                });
                continue;
            }

            for retry_index in 0..=max_retries {
                if retry_index > 0 {
                    let delay = self.backoff_delay(retry_index);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(DispatchFailure {
                                error: GatewayError::cancelled("dispatch cancelled during backoff"),
                                attempts,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                let started_at = Utc::now();
                let started = Instant::now();
                let (result, input_tokens, output_tokens) = self
                    .call_once(entry, prompt, history, timeout, cancel)
                    .await;
                let duration_ms = started.elapsed().as_millis() as u64;

                match result {
                    Ok(text) => {
                        attempts.push(CallAttempt {
                            agent_id: entry.id.clone(),
                            provider: entry.provider,
                            model: entry.model.clone(),
                            input_tokens,
                            output_tokens,
                            started_at,
                            duration_ms,
                            outcome: AttemptOutcome::Success,
                            detail: None,
                        });
                        self.health.track_success(&entry.id);
                        let cost_usd = self
                            .costs
                            .record(
                                &opts.project,
                                entry,
                                input_tokens,
                                output_tokens,
                                opts.operation,
                            )
                            .map_err(|error| DispatchFailure {
                                error,
                                attempts: attempts.clone(),
                            })?;
                        return Ok(DispatchOutcome {
                            text,
                            agent_id: entry.id.clone(),
                            input_tokens,
                            tokens_used: output_tokens,
                            cost_usd,
                            attempts,
                        });
                    }
                    Err(error) => {
                        if log::log_enabled!(log::Level::Warn) {
                            log::warn!(
                                "attempt {} on '{}' failed: {}",
                                retry_index + 1,
                                entry.id,
                                error
                            );
                        }
                        attempts.push(CallAttempt {
                            agent_id: entry.id.clone(),
                            provider: entry.provider,
                            model: entry.model.clone(),
                            input_tokens,
                            output_tokens,
                            started_at,
                            duration_ms,
                            outcome: AttemptOutcome::Failed(error.kind),
                            detail: Some(error.message.clone()),
                        });
                        self.health.track_failure(&entry.id, error.kind);

                        // Partial failures that already charged tokens still
                        // land in the ledger.
                        if input_tokens > 0 || output_tokens > 0 {
                            let _ = self.costs.record(
                                &opts.project,
                                entry,
                                input_tokens,
                                output_tokens,
                                opts.operation,
                            );
                        }

                        // Non-retryable kinds surface immediately; they
                        // neither retry nor advance the fallback chain.
                        let fatal = !error.is_retryable() || opts.abort_on.contains(&error.kind);
                        if fatal {
                            return Err(DispatchFailure { error, attempts });
                        }
                        last_error = Some(error);
                    }
                }
            }
        }

        let detail: Vec<String> = attempts.iter().map(|a| a.summary()).collect();
        let error = match last_error {
            Some(last) => GatewayError::new(
                last.kind,
                format!("all agents exhausted: [{}]", detail.join("; ")),
            ),
            None => GatewayError::internal(format!(
                "no dispatchable agent in chain: [{}]",
                detail.join("; ")
            )),
        };
        Err(DispatchFailure { error, attempts })
    }

    /// Pick the client and model for one call, rerouting to the tool
    /// execution fallback when the entry's provider lacks native tool use.
    fn execution_target(
        &self,
        entry: &Arc<Agent>,
        wants_tools: bool,
    ) -> Result<(Arc<dyn ProviderClient>, String), GatewayError> {
        let client = self.providers.get(entry.provider).ok_or_else(|| {
            GatewayError::internal(format!(
                "provider '{}' has no registered adapter",
                entry.provider
            ))
        })?;
        if !wants_tools || client.supports_tools() {
            return Ok((client, entry.model.clone()));
        }
        if let Some(fallback_id) = &self.tool_fallback {
            if let Some(fallback) = self.agents.get(fallback_id) {
                if let Some(fallback_client) = self.providers.get(fallback.provider) {
                    if fallback_client.supports_tools() {
                        log::info!(
                            "rerouting tool call for '{}' through '{}' ({}/{})",
                            entry.id,
                            fallback.id,
                            fallback.provider,
                            fallback.model
                        );
                        return Ok((fallback_client, fallback.model.clone()));
                    }
                }
            }
        }
        log::warn!(
            "agent '{}' wants tools but neither '{}' nor the tool fallback supports them; \
             calling without tools",
            entry.id,
            entry.provider
        );
        Ok((client, entry.model.clone()))
    }

    /// One attempt: a full tool loop under the per-call timeout. Returns the
    /// result plus the tokens charged so far (also on failure, so partial
    /// spend can be recorded).
    async fn call_once(
        &self,
        entry: &Arc<Agent>,
        prompt: &str,
        history: &[Message],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> (Result<String, GatewayError>, u64, u64) {
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        let definitions: Vec<ToolDefinition> = if entry.tools.is_empty() {
            Vec::new()
        } else {
            self.tools.definitions_for(&entry.tools)
        };
        let wants_tools = !definitions.is_empty();

        let (client, model) = match self.execution_target(entry, wants_tools) {
            Ok(target) => target,
            Err(error) => return (Err(error), 0, 0),
        };
        let supports_tools = wants_tools && client.supports_tools();

        let system_prompt = entry.effective_system_prompt();
        let mut messages: Vec<Message> = history.to_vec();
        messages.push(Message::user(prompt));

        let options = GenerateOptions {
            max_output_tokens: entry.max_output_tokens,
            temperature: entry.temperature,
            tools: if supports_tools {
                Some(definitions.clone())
            } else {
                None
            },
        };

        let mut last_text = String::new();
        for iteration in 0..TOOL_LOOP_LIMIT {
            let call = client.generate(&model, system_prompt.as_deref(), &messages, &options);
            let reply = tokio::select! {
                _ = cancel.cancelled() => {
                    return (
                        Err(GatewayError::cancelled("provider call cancelled")),
                        input_tokens,
                        output_tokens,
                    );
                }
                outcome = tokio::time::timeout(timeout, call) => match outcome {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(error)) => return (Err(error), input_tokens, output_tokens),
                    Err(_) => {
                        return (
                            Err(GatewayError::timeout(format!(
                                "provider call exceeded {} s",
                                timeout.as_secs()
                            ))),
                            input_tokens,
                            output_tokens,
                        );
                    }
                }
            };

            input_tokens += reply.input_tokens;
            output_tokens += reply.output_tokens;
            if !reply.text.is_empty() {
                last_text = reply.text.clone();
            }

            if reply.tool_calls.is_empty() || !supports_tools {
                return (Ok(reply.text), input_tokens, output_tokens);
            }

            if iteration == TOOL_LOOP_LIMIT - 1 {
                // Loop bound reached: the most recent assistant text wins.
                log::warn!(
                    "tool loop for '{}' hit the {}-iteration bound",
                    entry.id,
                    TOOL_LOOP_LIMIT
                );
                break;
            }

            if !reply.text.is_empty() {
                messages.push(Message::assistant(&reply.text));
            }
            for call in &reply.tool_calls {
                let result = match self.tools.invoke(&call.name, call.arguments.clone()) {
                    Ok(result) => result,
                    Err(error) => return (Err(error), input_tokens, output_tokens),
                };
                let payload = serde_json::to_string(&result.output)
                    .unwrap_or_else(|_| "null".to_string());
                messages.push(Message::tool_result(call.id.clone(), payload));
            }
        }

        (Ok(last_text), input_tokens, output_tokens)
    }
}
