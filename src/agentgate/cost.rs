//! Cost ledger and quota enforcement.
//!
//! Spend flows through two tightly coupled surfaces: a synchronous
//! [`CostTracker::check_budget`] preflight that decides whether a call may
//! be dispatched, and an append-only [`CostTracker::record`] that lands the
//! actual spend after the provider reports token counts. The preflight
//! compares and reserves under one lock: an approved estimate is held
//! against the project as a [`BudgetReservation`] until the guard drops,
//! so two concurrent preflights can never both admit against the same
//! remaining budget. Callers keep the guard alive across the dispatch that
//! records the true cost.
//!
//! The ledger is newline-delimited JSON, one [`CostEvent`] per line, written
//! in a single write call per event. Rolling daily (`YYYY-MM-DD`) and
//! monthly (`YYYY-MM`) counters are keyed in UTC; old period keys are
//! retained for audit. On open, an existing ledger file is replayed into
//! fresh counters, so the on-disk log is always the source of truth.

use chrono::{DateTime, Datelike, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::agentgate::agent::Agent;
pub use crate::agentgate::config::BudgetConfig;
use crate::agentgate::config::TierConfig;
use crate::agentgate::error::GatewayError;

/// Operation tag attached to a cost event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostOperation {
    /// A direct chat request.
    Chat,
    /// A call made on behalf of another agent.
    Delegation,
    /// One task inside an orchestrated plan.
    WorkflowStep,
    /// The final synthesis call of an orchestrated plan.
    Synthesis,
}

/// One append-only ledger record. Events are never mutated.
///
/// Serialized keys are stable; readers must tolerate unknown keys, which
/// serde's default behavior provides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEvent {
    /// Project the spend is attributed to.
    pub project: String,
    /// Agent that made the call.
    pub agent: String,
    /// Model that served the call.
    pub model: String,
    /// Billed input tokens.
    pub tokens_input: u64,
    /// Billed output tokens.
    pub tokens_output: u64,
    /// USD cost of the call.
    pub cost: f64,
    /// UTC timestamp, strictly monotonic within a process.
    pub timestamp: DateTime<Utc>,
    /// Optional operation tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<CostOperation>,
    /// Optional free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The three quota tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaTier {
    PerRequest,
    Daily,
    Monthly,
}

impl fmt::Display for QuotaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuotaTier::PerRequest => "per-request",
            QuotaTier::Daily => "daily",
            QuotaTier::Monthly => "monthly",
        };
        f.write_str(name)
    }
}

/// Outcome of a budget preflight.
#[derive(Debug, Clone)]
pub enum BudgetDecision {
    /// The estimated spend fits with room to spare.
    Approved,
    /// The estimated spend fits but crosses a warning threshold. The
    /// configured notifier fires out-of-band; the call proceeds.
    Warning {
        /// Which tier crossed its threshold.
        tier: QuotaTier,
        /// USD remaining before the tier's hard limit.
        remaining: f64,
    },
    /// The estimated spend would overflow a tier; the call must not run.
    Rejected {
        /// Which tier rejected.
        tier: QuotaTier,
        /// Human-readable rejection reason naming the tier.
        reason: String,
        /// USD remaining before the tier's hard limit.
        remaining: f64,
    },
}

impl BudgetDecision {
    /// Whether the call may proceed.
    pub fn is_approved(&self) -> bool {
        !matches!(self, BudgetDecision::Rejected { .. })
    }
}

/// Caller-injected side channel for warning notifications.
pub type WarningNotifier = Arc<dyn Fn(&str, QuotaTier, f64) + Send + Sync>;

/// Filter for [`CostTracker::summary`]. Empty filter = everything.
#[derive(Debug, Clone, Default)]
pub struct CostFilter {
    pub project: Option<String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    /// Only events at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

/// Rolling totals produced by [`CostTracker::summary`].
#[derive(Debug, Clone, Default)]
pub struct CostSummary {
    pub total_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub events: usize,
    pub by_project: HashMap<String, f64>,
    pub by_agent: HashMap<String, f64>,
    pub by_model: HashMap<String, f64>,
    /// USD per UTC day (`YYYY-MM-DD`).
    pub by_day: HashMap<String, f64>,
}

/// Per-project rolling counters. Old period keys are retained for audit.
#[derive(Debug, Default, Clone)]
struct ProjectCounters {
    daily: HashMap<String, f64>,
    monthly: HashMap<String, f64>,
}

struct CostState {
    projects: HashMap<String, ProjectCounters>,
    /// USD held by live [`BudgetReservation`]s, per project.
    reserved: HashMap<String, f64>,
    events: Vec<CostEvent>,
    writer: Option<File>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// An approved preflight's estimate, held against the project's budget
/// until dropped.
///
/// [`CostTracker::check_budget`] hands one back with every approval; the
/// caller keeps it alive across the dispatch that records the true cost.
/// While it lives, further preflights for the project see the held amount
/// as committed spend, which closes the check-then-record window against
/// double admission.
pub struct BudgetReservation {
    state: Arc<Mutex<CostState>>,
    project: String,
    amount: f64,
}

impl Drop for BudgetReservation {
    fn drop(&mut self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        let drained = match state.reserved.get_mut(&self.project) {
            Some(reserved) => {
                *reserved -= self.amount;
                *reserved <= 1e-9
            }
            None => false,
        };
        if drained {
            state.reserved.remove(&self.project);
        }
    }
}

/// The cost and quota enforcer.
pub struct CostTracker {
    state: Arc<Mutex<CostState>>,
    budget: BudgetConfig,
    notifier: Option<WarningNotifier>,
}

/// Compute the USD cost of a call. Rates are per million tokens.
pub fn compute_cost(
    tokens_input: u64,
    tokens_output: u64,
    input_rate_per_mtok: f64,
    output_rate_per_mtok: f64,
) -> f64 {
    (tokens_input as f64 * input_rate_per_mtok + tokens_output as f64 * output_rate_per_mtok)
        / 1_000_000.0
}

/// Pre-call token estimate when true counts are unknown: the prompt's word
/// count, split evenly between input and output. Deliberately conservative
/// for short prompts.
pub fn estimate_tokens(prompt: &str) -> (u64, u64) {
    let words = prompt.split_whitespace().count() as u64;
    (words, words)
}

fn day_key(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}-{:02}", at.year(), at.month(), at.day())
}

fn month_key(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

impl CostTracker {
    /// Create a tracker with no on-disk ledger. Events are still retained
    /// in memory for summaries; intended for tests and embedded use.
    pub fn in_memory(budget: BudgetConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(CostState {
                projects: HashMap::new(),
                reserved: HashMap::new(),
                events: Vec::new(),
                writer: None,
                last_timestamp: None,
            })),
            budget,
            notifier: None,
        }
    }

    /// Open (or create) the ledger at `path`, replaying any existing events
    /// into fresh counters. Partial trailing lines are tolerated.
    pub fn open(path: &Path, budget: BudgetConfig) -> Result<Self, GatewayError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GatewayError::internal(format!("cannot create ledger directory: {}", e))
                })?;
            }
        }

        let mut events = Vec::new();
        if path.exists() {
            let file = File::open(path)
                .map_err(|e| GatewayError::internal(format!("cannot open ledger: {}", e)))?;
            let reader = BufReader::new(file);
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CostEvent>(&line) {
                    Ok(event) => events.push(event),
                    // A torn tail line from an interrupted writer is not an
                    // error; anything before it already replayed.
                    Err(e) => {
                        log::warn!("skipping unparseable ledger line: {}", e);
                    }
                }
            }
        }

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| GatewayError::internal(format!("cannot append to ledger: {}", e)))?;

        let mut projects: HashMap<String, ProjectCounters> = HashMap::new();
        let mut last_timestamp = None;
        for event in &events {
            let counters = projects.entry(event.project.clone()).or_default();
            *counters.daily.entry(day_key(event.timestamp)).or_insert(0.0) += event.cost;
            *counters
                .monthly
                .entry(month_key(event.timestamp))
                .or_insert(0.0) += event.cost;
            last_timestamp = Some(event.timestamp);
        }

        Ok(Self {
            state: Arc::new(Mutex::new(CostState {
                projects,
                reserved: HashMap::new(),
                events,
                writer: Some(writer),
                last_timestamp,
            })),
            budget,
            notifier: None,
        })
    }

    /// Attach a warning side channel (builder pattern).
    pub fn with_notifier(mut self, notifier: WarningNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Where the ledger for `path` would be; convenience for callers.
    pub fn default_ledger_path(dir: &Path) -> PathBuf {
        dir.join("cost_log.jsonl")
    }

    fn tier_for(&self, project: &str, tier: QuotaTier) -> TierConfig {
        let overrides = self.budget.projects.get(project);
        match tier {
            QuotaTier::PerRequest => overrides
                .and_then(|p| p.per_request)
                .unwrap_or(self.budget.per_request),
            QuotaTier::Daily => overrides.and_then(|p| p.daily).unwrap_or(self.budget.daily),
            QuotaTier::Monthly => overrides
                .and_then(|p| p.monthly)
                .unwrap_or(self.budget.monthly),
        }
    }

    /// Decide whether an estimated call fits all three tiers and, on
    /// approval, reserve the estimate against the project.
    ///
    /// Rejection rule per tier: `current + estimate > limit`, where
    /// `current` includes live reservations. An estimate exactly equal to
    /// the remaining budget is approved. The comparison and the reservation
    /// happen under one lock, so concurrent preflights serialize per the
    /// tracker; the returned guard must stay alive until the paired
    /// [`CostTracker::record`] has run (or the call was abandoned).
    pub fn check_budget(
        &self,
        project: &str,
        agent: &Agent,
        est_input_tokens: u64,
        est_output_tokens: u64,
    ) -> (BudgetDecision, Option<BudgetReservation>) {
        let estimate = compute_cost(
            est_input_tokens,
            est_output_tokens,
            agent.input_cost_per_mtok,
            agent.output_cost_per_mtok,
        );

        let mut state = self.state.lock().expect("cost state poisoned");
        let now = Utc::now();
        let (daily_spent, monthly_spent) = match state.projects.get(project) {
            Some(counters) => (
                counters.daily.get(&day_key(now)).copied().unwrap_or(0.0),
                counters.monthly.get(&month_key(now)).copied().unwrap_or(0.0),
            ),
            None => (0.0, 0.0),
        };
        let reserved = state.reserved.get(project).copied().unwrap_or(0.0);

        let checks = vec![
            (QuotaTier::PerRequest, 0.0),
            (QuotaTier::Daily, daily_spent + reserved),
            (QuotaTier::Monthly, monthly_spent + reserved),
        ];

        // Hard limits first across all tiers, then warning thresholds, so a
        // rejection is never masked by an earlier tier's warning.
        for (tier, current) in &checks {
            let config = self.tier_for(project, *tier);
            if current + estimate > config.limit {
                let remaining = (config.limit - current).max(0.0);
                return (
                    BudgetDecision::Rejected {
                        tier: *tier,
                        reason: format!(
                            "{} budget for project '{}' would be exceeded: ${:.4} estimated, ${:.4} remaining",
                            tier, project, estimate, remaining
                        ),
                        remaining,
                    },
                    None,
                );
            }
        }

        *state.reserved.entry(project.to_string()).or_insert(0.0) += estimate;
        let reservation = BudgetReservation {
            state: self.state.clone(),
            project: project.to_string(),
            amount: estimate,
        };

        let mut warning = None;
        for (tier, current) in &checks {
            let config = self.tier_for(project, *tier);
            if current + estimate > config.warn {
                warning = Some((*tier, config.limit - current));
                break;
            }
        }
        drop(state);

        // The notifier runs outside the lock; it is caller-supplied code.
        match warning {
            Some((tier, remaining)) => {
                if let Some(notifier) = &self.notifier {
                    notifier(project, tier, remaining);
                }
                (
                    BudgetDecision::Warning { tier, remaining },
                    Some(reservation),
                )
            }
            None => (BudgetDecision::Approved, Some(reservation)),
        }
    }

    /// Append a cost event with the true token counts and update counters.
    /// Returns the USD cost of the call.
    pub fn record(
        &self,
        project: &str,
        agent: &Agent,
        tokens_input: u64,
        tokens_output: u64,
        operation: CostOperation,
    ) -> Result<f64, GatewayError> {
        let cost = compute_cost(
            tokens_input,
            tokens_output,
            agent.input_cost_per_mtok,
            agent.output_cost_per_mtok,
        );

        let mut state = self.state.lock().expect("cost state poisoned");

        // Timestamps are strictly monotonic within a process: when the wall
        // clock does not advance between events, bump by one microsecond.
        let mut timestamp = Utc::now();
        if let Some(last) = state.last_timestamp {
            if timestamp <= last {
                timestamp = last + Duration::microseconds(1);
            }
        }
        state.last_timestamp = Some(timestamp);

        let event = CostEvent {
            project: project.to_string(),
            agent: agent.id.clone(),
            model: agent.model.clone(),
            tokens_input,
            tokens_output,
            cost,
            timestamp,
            operation: Some(operation),
            metadata: None,
        };

        if let Some(writer) = state.writer.as_mut() {
            let mut line = serde_json::to_string(&event)
                .map_err(|e| GatewayError::internal(format!("cannot serialize cost event: {}", e)))?;
            line.push('\n');
            // One write call per record keeps concurrent readers from ever
            // seeing an interleaved line.
            writer
                .write_all(line.as_bytes())
                .map_err(|e| GatewayError::internal(format!("cannot append cost event: {}", e)))?;
        }

        let counters = state.projects.entry(project.to_string()).or_default();
        *counters.daily.entry(day_key(timestamp)).or_insert(0.0) += cost;
        *counters.monthly.entry(month_key(timestamp)).or_insert(0.0) += cost;
        state.events.push(event);

        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "recorded ${:.6} for project '{}' agent '{}' ({} in / {} out)",
                cost,
                project,
                agent.id,
                tokens_input,
                tokens_output
            );
        }
        Ok(cost)
    }

    /// Current spend for `project` in the live daily and monthly periods.
    pub fn current_spend(&self, project: &str) -> (f64, f64) {
        let state = self.state.lock().expect("cost state poisoned");
        let now = Utc::now();
        match state.projects.get(project) {
            Some(counters) => (
                counters.daily.get(&day_key(now)).copied().unwrap_or(0.0),
                counters.monthly.get(&month_key(now)).copied().unwrap_or(0.0),
            ),
            None => (0.0, 0.0),
        }
    }

    /// Rolling totals over the retained events, restricted by `filter`.
    pub fn summary(&self, filter: &CostFilter) -> CostSummary {
        let state = self.state.lock().expect("cost state poisoned");
        let mut summary = CostSummary::default();
        for event in &state.events {
            if let Some(project) = &filter.project {
                if &event.project != project {
                    continue;
                }
            }
            if let Some(agent) = &filter.agent {
                if &event.agent != agent {
                    continue;
                }
            }
            if let Some(model) = &filter.model {
                if &event.model != model {
                    continue;
                }
            }
            if let Some(since) = filter.since {
                if event.timestamp < since {
                    continue;
                }
            }
            summary.total_usd += event.cost;
            summary.total_input_tokens += event.tokens_input;
            summary.total_output_tokens += event.tokens_output;
            summary.events += 1;
            *summary.by_project.entry(event.project.clone()).or_insert(0.0) += event.cost;
            *summary.by_agent.entry(event.agent.clone()).or_insert(0.0) += event.cost;
            *summary.by_model.entry(event.model.clone()).or_insert(0.0) += event.cost;
            *summary.by_day.entry(day_key(event.timestamp)).or_insert(0.0) += event.cost;
        }
        summary
    }

    /// The most recent event's timestamp, RFC 3339, for diagnostics.
    pub fn last_event_at(&self) -> Option<String> {
        let state = self.state.lock().expect("cost state poisoned");
        state
            .last_timestamp
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentgate::clients::Provider;

    fn agent() -> Agent {
        Agent::new("scribe", "Scribe", Provider::Ollama, "llama3.1:8b").with_rates(3.0, 15.0)
    }

    #[test]
    fn cost_math_divides_by_a_million() {
        let cost = compute_cost(120, 240, 3.0, 15.0);
        let expected = (120.0 * 3.0 + 240.0 * 15.0) / 1_000_000.0;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn estimates_split_word_count_evenly() {
        let (input, output) = estimate_tokens("fetch all orders from the database");
        assert_eq!(input, 6);
        assert_eq!(output, 6);
    }

    #[test]
    fn estimate_within_remaining_is_approved_and_overflow_is_rejected() {
        let mut budget = BudgetConfig::default();
        budget.daily = TierConfig::new(50.0, 40.0);
        let tracker = CostTracker::in_memory(budget);
        let agent = agent();

        // Burn $49.50 of today's budget: at $15/Mtok output that is 3.3M tokens.
        tracker
            .record("shop", &agent, 0, 3_300_000, CostOperation::Chat)
            .unwrap();
        let (daily, _) = tracker.current_spend("shop");
        assert!((daily - 49.5).abs() < 1e-9);

        // 150k input tokens at $3/Mtok estimate $0.45: still fits.
        let (decision, hold) = tracker.check_budget("shop", &agent, 150_000, 0);
        assert!(decision.is_approved(), "$0.45 estimate should fit");
        drop(hold);

        // $0.60 estimate: rejected by the daily tier with $0.50 remaining.
        let (decision, hold) = tracker.check_budget("shop", &agent, 200_000, 0);
        assert!(hold.is_none(), "rejections reserve nothing");
        match decision {
            BudgetDecision::Rejected {
                tier, remaining, ..
            } => {
                assert_eq!(tier, QuotaTier::Daily);
                assert!((remaining - 0.5).abs() < 1e-9);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn an_estimate_exactly_equal_to_the_remaining_budget_is_approved() {
        let mut budget = BudgetConfig::default();
        budget.daily = TierConfig::new(50.0, 49.9);
        let tracker = CostTracker::in_memory(budget);
        // Rates chosen so every figure is exact in binary floating point.
        let agent =
            Agent::new("exact", "Exact", Provider::Ollama, "llama3.1:8b").with_rates(5.0, 15.0);

        // 3.3M output tokens at $15/Mtok puts today's spend at $49.50.
        tracker
            .record("p", &agent, 0, 3_300_000, CostOperation::Chat)
            .unwrap();

        // 100k input tokens at $5/Mtok estimate exactly the remaining $0.50.
        let (decision, hold) = tracker.check_budget("p", &agent, 100_000, 0);
        assert!(decision.is_approved());
        drop(hold);

        // One more token tips past the limit.
        let (decision, _) = tracker.check_budget("p", &agent, 100_001, 0);
        assert!(!decision.is_approved());
    }

    #[test]
    fn a_live_reservation_blocks_concurrent_admission() {
        let mut budget = BudgetConfig::default();
        budget.per_request = TierConfig::new(100.0, 90.0);
        budget.daily = TierConfig::new(50.0, 49.0);
        let tracker = CostTracker::in_memory(budget);
        let agent =
            Agent::new("bulk", "Bulk", Provider::Ollama, "llama3.1:8b").with_rates(6.0, 6.0);

        // Each request estimates $30; two of them overflow the $50 day.
        let (first, first_hold) = tracker.check_budget("p", &agent, 2_500_000, 2_500_000);
        assert!(first.is_approved());

        // While the first request is in flight, its estimate is committed:
        // an identical concurrent preflight must be rejected, not admitted
        // against the same remaining budget.
        let (second, second_hold) = tracker.check_budget("p", &agent, 2_500_000, 2_500_000);
        assert!(!second.is_approved());
        assert!(second_hold.is_none());

        // Once the first call settles (reservation released), the budget is
        // decided by recorded spend again.
        drop(first_hold);
        let (third, _hold) = tracker.check_budget("p", &agent, 2_500_000, 2_500_000);
        assert!(third.is_approved());
    }

    #[test]
    fn per_request_tier_rejects_oversized_single_calls() {
        let tracker = CostTracker::in_memory(BudgetConfig::default());
        let agent = agent();
        // 1B output tokens at $15/Mtok = $15_000, far past the $10 tier.
        let (decision, _) = tracker.check_budget("default", &agent, 0, 1_000_000_000);
        match decision {
            BudgetDecision::Rejected { tier, .. } => assert_eq!(tier, QuotaTier::PerRequest),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn warnings_fire_the_notifier_without_blocking() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let mut budget = BudgetConfig::default();
        budget.per_request = TierConfig::new(10.0, 0.001);
        let tracker = CostTracker::in_memory(budget).with_notifier(Arc::new(
            move |_project, _tier, _remaining| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        ));
        let (decision, _hold) = tracker.check_budget("default", &agent(), 10_000, 0);
        assert!(decision.is_approved());
        assert!(matches!(decision, BudgetDecision::Warning { .. }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn counters_increase_by_exactly_the_recorded_cost() {
        let tracker = CostTracker::in_memory(BudgetConfig::default());
        let agent = agent();
        let (daily_before, monthly_before) = tracker.current_spend("proj");
        let cost = tracker
            .record("proj", &agent, 120, 240, CostOperation::Chat)
            .unwrap();
        let (daily_after, monthly_after) = tracker.current_spend("proj");
        assert!((daily_after - daily_before - cost).abs() < 1e-12);
        assert!((monthly_after - monthly_before - cost).abs() < 1e-12);
    }

    #[test]
    fn timestamps_are_strictly_monotonic() {
        let tracker = CostTracker::in_memory(BudgetConfig::default());
        let agent = agent();
        for _ in 0..50 {
            tracker.record("p", &agent, 1, 1, CostOperation::Chat).unwrap();
        }
        let state = tracker.state.lock().unwrap();
        for pair in state.events.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn events_round_trip_through_json_exactly() {
        let event = CostEvent {
            project: "shop".to_string(),
            agent: "scribe".to_string(),
            model: "llama3.1:8b".to_string(),
            tokens_input: 120,
            tokens_output: 240,
            cost: 0.003_96,
            timestamp: Utc::now(),
            operation: Some(CostOperation::WorkflowStep),
            metadata: Some(serde_json::json!({"task": "t1"})),
        };
        let line = serde_json::to_string(&event).unwrap();
        let back: CostEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back.project, event.project);
        assert_eq!(back.tokens_input, event.tokens_input);
        assert_eq!(back.tokens_output, event.tokens_output);
        assert_eq!(back.cost.to_bits(), event.cost.to_bits());
        assert_eq!(back.timestamp, event.timestamp);
        assert_eq!(back.operation, event.operation);
    }

    #[test]
    fn readers_tolerate_unknown_keys() {
        let line = r#"{"project":"p","agent":"a","model":"m","tokens_input":1,
            "tokens_output":2,"cost":0.0001,"timestamp":"2026-08-01T00:00:00Z",
            "operation":"chat","future_key":{"nested":true}}"#;
        let event: CostEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.tokens_output, 2);
    }
}
