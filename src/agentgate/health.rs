//! Per-agent runtime health metrics.
//!
//! Every dispatcher attempt reports its outcome here. The tracker keeps
//! aggregate counters and a consecutive-failure streak per agent and
//! derives a status on each read; nothing derived is ever persisted.
//! Updates are atomic per agent; cross-agent consistency is not required.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, RwLock};

use crate::agentgate::error::ErrorKind;

/// Derived health status, recomputed on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No active failure streak and a success rate of at least 0.9.
    Healthy,
    /// A short failure streak, or a success rate between 0.5 and 0.9.
    Degraded,
    /// Three or more consecutive failures, or a success rate below 0.5.
    Unhealthy,
    /// Five or more consecutive failures. Skipped by dispatch scheduling.
    Unreachable,
}

impl HealthStatus {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one agent's health metrics.
#[derive(Debug, Clone)]
pub struct AgentHealth {
    /// Agent this snapshot describes.
    pub agent_id: String,
    /// Total attempts reported.
    pub total_requests: u64,
    /// Total failed attempts.
    pub total_failures: u64,
    /// Length of the current failure streak. Reset to 0 by any success.
    pub consecutive_failures: u32,
    /// Timestamp of the most recent success.
    pub last_success: Option<DateTime<Utc>>,
    /// Timestamp of the most recent failure.
    pub last_failure: Option<DateTime<Utc>>,
    /// Failure counts per error kind. Bounded by the closed taxonomy.
    pub failures_by_kind: HashMap<ErrorKind, u64>,
}

impl AgentHealth {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            total_requests: 0,
            total_failures: 0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            failures_by_kind: HashMap::new(),
        }
    }

    /// Fraction of attempts that succeeded. Agents with no attempts yet
    /// report 1.0 so they are eligible for scheduling.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            1.0 - self.total_failures as f64 / self.total_requests as f64
        }
    }

    /// Derive the current status from the thresholds above.
    pub fn status(&self) -> HealthStatus {
        let rate = self.success_rate();
        if self.consecutive_failures >= 5 {
            HealthStatus::Unreachable
        } else if self.consecutive_failures >= 3 || rate < 0.5 {
            HealthStatus::Unhealthy
        } else if self.consecutive_failures >= 1 || rate < 0.9 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Registry of per-agent health metrics.
///
/// Each agent's entry sits behind its own lock, so concurrent updates to
/// different agents never contend. The outer map lock is only held long
/// enough to find (or lazily create) the entry.
pub struct HealthTracker {
    agents: RwLock<HashMap<String, Mutex<AgentHealth>>>,
}

impl HealthTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    fn with_entry<F, R>(&self, agent_id: &str, f: F) -> R
    where
        F: FnOnce(&mut AgentHealth) -> R,
    {
        {
            let agents = self.agents.read().expect("health registry poisoned");
            if let Some(entry) = agents.get(agent_id) {
                let mut health = entry.lock().expect("health entry poisoned");
                return f(&mut health);
            }
        }
        let mut agents = self.agents.write().expect("health registry poisoned");
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Mutex::new(AgentHealth::new(agent_id)));
        let mut health = entry.lock().expect("health entry poisoned");
        f(&mut health)
    }

    /// Record a successful attempt. Resets the failure streak.
    pub fn track_success(&self, agent_id: &str) {
        self.with_entry(agent_id, |health| {
            health.total_requests += 1;
            health.consecutive_failures = 0;
            health.last_success = Some(Utc::now());
        });
    }

    /// Record a failed attempt with its classified kind.
    pub fn track_failure(&self, agent_id: &str, kind: ErrorKind) {
        self.with_entry(agent_id, |health| {
            health.total_requests += 1;
            health.total_failures += 1;
            health.consecutive_failures += 1;
            health.last_failure = Some(Utc::now());
            *health.failures_by_kind.entry(kind).or_insert(0) += 1;
        });
    }

    /// Snapshot one agent's metrics. Unknown agents report a fresh record.
    pub fn status_of(&self, agent_id: &str) -> AgentHealth {
        self.with_entry(agent_id, |health| health.clone())
    }

    /// Keep only candidates whose status is `healthy` or `degraded`.
    pub fn filter_healthy(&self, candidates: Vec<String>) -> Vec<String> {
        candidates
            .into_iter()
            .filter(|id| {
                matches!(
                    self.status_of(id).status(),
                    HealthStatus::Healthy | HealthStatus::Degraded
                )
            })
            .collect()
    }

    /// Snapshot every tracked agent.
    pub fn summary(&self) -> Vec<AgentHealth> {
        let agents = self.agents.read().expect("health registry poisoned");
        let mut out: Vec<AgentHealth> = agents
            .values()
            .map(|entry| entry.lock().expect("health entry poisoned").clone())
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_agents_are_healthy() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.status_of("new").status(), HealthStatus::Healthy);
        assert!((tracker.status_of("new").success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn streaks_walk_the_status_ladder() {
        let tracker = HealthTracker::new();
        // Build up a success history so the rate stays above 0.9.
        for _ in 0..100 {
            tracker.track_success("a");
        }
        assert_eq!(tracker.status_of("a").status(), HealthStatus::Healthy);

        tracker.track_failure("a", ErrorKind::Timeout);
        assert_eq!(tracker.status_of("a").status(), HealthStatus::Degraded);

        tracker.track_failure("a", ErrorKind::Timeout);
        tracker.track_failure("a", ErrorKind::Timeout);
        assert_eq!(tracker.status_of("a").status(), HealthStatus::Unhealthy);

        tracker.track_failure("a", ErrorKind::Network);
        tracker.track_failure("a", ErrorKind::Network);
        assert_eq!(tracker.status_of("a").status(), HealthStatus::Unreachable);
    }

    #[test]
    fn success_resets_the_streak_and_nothing_else_does() {
        let tracker = HealthTracker::new();
        tracker.track_failure("a", ErrorKind::Internal);
        tracker.track_failure("a", ErrorKind::Internal);
        assert_eq!(tracker.status_of("a").consecutive_failures, 2);

        tracker.track_success("a");
        let health = tracker.status_of("a");
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_failures, 2);
        assert_eq!(health.total_requests, 3);
    }

    #[test]
    fn low_success_rate_alone_is_unhealthy() {
        let tracker = HealthTracker::new();
        // Alternate so the streak never passes 1 but the rate sinks to 0.5.
        for _ in 0..10 {
            tracker.track_failure("a", ErrorKind::Internal);
            tracker.track_success("a");
        }
        tracker.track_failure("a", ErrorKind::Internal);
        let health = tracker.status_of("a");
        assert!(health.success_rate() < 0.5);
        assert_eq!(health.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn filter_keeps_healthy_and_degraded_only() {
        let tracker = HealthTracker::new();
        tracker.track_success("good");
        tracker.track_failure("shaky", ErrorKind::Timeout);
        for _ in 0..5 {
            tracker.track_failure("down", ErrorKind::Network);
        }
        let kept = tracker.filter_healthy(vec![
            "good".to_string(),
            "shaky".to_string(),
            "down".to_string(),
        ]);
        assert_eq!(kept, vec!["good".to_string(), "shaky".to_string()]);
    }

    #[test]
    fn per_kind_counters_accumulate() {
        let tracker = HealthTracker::new();
        tracker.track_failure("a", ErrorKind::RateLimit);
        tracker.track_failure("a", ErrorKind::RateLimit);
        tracker.track_failure("a", ErrorKind::Timeout);
        let health = tracker.status_of("a");
        assert_eq!(health.failures_by_kind[&ErrorKind::RateLimit], 2);
        assert_eq!(health.failures_by_kind[&ErrorKind::Timeout], 1);
    }
}
