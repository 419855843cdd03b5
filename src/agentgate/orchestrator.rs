//! Parallel task orchestration across bounded worker pools.
//!
//! An [`ExecutionPlan`] is a DAG of [`Task`]s, each bound to one of three
//! pools (`codegen`, `security`, `database`). The orchestrator schedules
//! ready tasks onto semaphore-bounded workers, honours `blocked_by` edges,
//! retries retryable failures per task, cascades terminal failures to
//! dependents, aggregates results with rule-based conflict resolution, and
//! synthesizes one final answer through the router and dispatcher.
//!
//! Partial results are acceptable: failed branches are summarized in the
//! synthesized response instead of failing the caller, and a cancelled
//! plan still returns its report with unfinished tasks marked. The
//! orchestrator errors only when plan construction fails or when the
//! synthesis call itself is exhausted.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agentgate::config::{PoolConfig, PoolSettings};
use crate::agentgate::cost::{estimate_tokens, CostOperation, CostTracker};
use crate::agentgate::dispatcher::{DispatchOptions, Dispatcher};
use crate::agentgate::error::{ErrorKind, GatewayError};
use crate::agentgate::router::Router;

/// The closed set of worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Codegen,
    Security,
    Database,
}

impl PoolKind {
    /// Stable lowercase name used in unified-context keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Codegen => "codegen",
            PoolKind::Security => "security",
            PoolKind::Database => "database",
        }
    }

    fn settings<'a>(&self, pools: &'a PoolSettings) -> &'a PoolConfig {
        match self {
            PoolKind::Codegen => &pools.codegen,
            PoolKind::Security => &pools.security,
            PoolKind::Database => &pools.database,
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle states.
///
/// Transitions: `pending → running → (completed | failed | timeout)`;
/// `failed` re-enters `pending` while retries remain. `completed` and
/// `timeout` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    fn reason_str(&self) -> &'static str {
        match self {
            TaskStatus::Timeout => "timeout",
            TaskStatus::Failed => "failed",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
        }
    }
}

/// A unit of parallel work inside an [`ExecutionPlan`].
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique id within the plan.
    pub id: String,
    /// Which pool executes the task.
    pub pool: PoolKind,
    /// Prompt dispatched for this task.
    pub prompt: String,
    /// Lower runs sooner among simultaneously-ready tasks.
    pub priority: i32,
    /// Per-task timeout override; pool default when unset.
    pub timeout: Option<Duration>,
    /// Per-task retry override; pool default when unset.
    pub max_retries: Option<u32>,
    /// Ids of tasks that must complete before this one becomes runnable.
    pub blocked_by: Vec<String>,
    /// Optional explicit agent for this task; otherwise the router decides.
    pub agent: Option<String>,
}

impl Task {
    /// Create a task with a generated id.
    pub fn new(pool: PoolKind, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pool,
            prompt: prompt.into(),
            priority: 0,
            timeout: None,
            max_retries: None,
            blocked_by: Vec::new(),
            agent: None,
        }
    }

    /// Override the generated id (builder pattern).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the scheduling priority; lower is sooner.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Declare dependencies on other task ids.
    pub fn blocked_by<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Override the pool's default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the pool's default retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Pin the task to an explicit agent.
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

/// A validated DAG of tasks.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    tasks: Vec<Task>,
}

impl ExecutionPlan {
    /// Validate and build a plan: unique ids, known dependencies, no cycles.
    pub fn new(tasks: Vec<Task>) -> Result<Self, GatewayError> {
        let mut ids = HashSet::new();
        for task in &tasks {
            if !ids.insert(task.id.clone()) {
                return Err(GatewayError::validation(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
        }
        for task in &tasks {
            for dep in &task.blocked_by {
                if !ids.contains(dep) {
                    return Err(GatewayError::validation(format!(
                        "task '{}' is blocked by unknown task '{}'",
                        task.id, dep
                    )));
                }
                if dep == &task.id {
                    return Err(GatewayError::validation(format!(
                        "task '{}' cannot depend on itself",
                        task.id
                    )));
                }
            }
        }

        // Kahn's algorithm: anything left un-visited sits on a cycle.
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &tasks {
            indegree.entry(task.id.as_str()).or_insert(0);
            for dep in &task.blocked_by {
                *indegree.entry(task.id.as_str()).or_insert(0) += 1;
                edges.entry(dep.as_str()).or_default().push(task.id.as_str());
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(dependents) = edges.get(id) {
                for dependent in dependents {
                    let degree = indegree.get_mut(dependent).expect("seeded above");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        if visited != tasks.len() {
            return Err(GatewayError::validation(
                "task graph contains a dependency cycle",
            ));
        }

        Ok(Self { tasks })
    }

    /// The plan's tasks in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }
}

/// Final state of one task after the plan reached a fixed point.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub pool: PoolKind,
    pub status: TaskStatus,
    /// Pool-shaped result payload for completed tasks.
    pub result: Option<Value>,
    /// Error detail for failed or timed-out tasks.
    pub error: Option<GatewayError>,
    /// Times the task was run (1 + retries used).
    pub runs: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Closed set of detectable result conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// A security finding's remediation is not reflected in codegen output.
    SecurityVsCodegen,
    /// Codegen output references columns absent from the schema result.
    SchemaVsCode,
}

/// A recorded conflict resolution. Policy is fixed: security findings win
/// over codegen recommendations; the schema result is authoritative for
/// column references.
#[derive(Debug, Clone)]
pub struct ConflictResolution {
    pub kind: ConflictKind,
    /// Task whose result was overridden or annotated.
    pub overridden_task: String,
    /// Task whose result won.
    pub winning_task: String,
    pub description: String,
}

/// Coordinator context carried through an orchestrated request.
#[derive(Debug, Clone)]
pub struct OrchestratorContext {
    /// The originating natural-language request.
    pub request: String,
    /// Project the spend is attributed to.
    pub project: String,
    /// Session key, when the request belongs to a conversation.
    pub session_key: Option<String>,
}

/// The orchestrator's output. Cancelled plans still produce one, with
/// their unfinished tasks marked `failed`/`cancelled` and no synthesis
/// call made.
#[derive(Debug)]
pub struct OrchestratorReport {
    /// Synthesized final answer, with failed branches summarized. For a
    /// cancelled plan this is an orchestrator-built summary instead.
    pub response: String,
    /// Agent that produced the synthesis; for a cancelled plan, the
    /// designated coordinator (which was not called).
    pub synthesized_by: String,
    /// Final state of every task.
    pub tasks: Vec<TaskRecord>,
    /// Conflict resolutions applied during aggregation.
    pub overrides: Vec<ConflictResolution>,
    /// Output tokens of the synthesis call.
    pub tokens_used: u64,
    /// Total USD recorded across tasks and synthesis.
    pub cost_usd: f64,
}

struct TaskState {
    task: Task,
    status: TaskStatus,
    scheduled: bool,
    runs: u32,
    result: Option<Value>,
    error: Option<GatewayError>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

struct TaskSuccess {
    payload: Value,
    cost_usd: f64,
}

struct WorkerEvent {
    id: String,
    started_at: Option<DateTime<Utc>>,
    outcome: Result<TaskSuccess, GatewayError>,
}

/// The parallel task orchestrator.
pub struct Orchestrator {
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    costs: Arc<CostTracker>,
    pools: PoolSettings,
    coordinator: String,
}

impl Orchestrator {
    /// Assemble an orchestrator over the shared subsystems.
    pub fn new(
        router: Arc<Router>,
        dispatcher: Arc<Dispatcher>,
        costs: Arc<CostTracker>,
        pools: PoolSettings,
        coordinator: impl Into<String>,
    ) -> Self {
        Self {
            router,
            dispatcher,
            costs,
            pools,
            coordinator: coordinator.into(),
        }
    }

    /// Execute a plan to its fixed point, aggregate, and synthesize.
    pub async fn execute(
        &self,
        plan: ExecutionPlan,
        ctx: &OrchestratorContext,
        cancel: &CancellationToken,
    ) -> Result<OrchestratorReport, GatewayError> {
        let mut states: HashMap<String, TaskState> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let now = Utc::now();
        for task in plan.tasks() {
            order.push(task.id.clone());
            states.insert(
                task.id.clone(),
                TaskState {
                    task: task.clone(),
                    status: TaskStatus::Pending,
                    scheduled: false,
                    runs: 0,
                    result: None,
                    error: None,
                    created_at: now,
                    started_at: None,
                    completed_at: None,
                },
            );
        }

        let semaphores: HashMap<PoolKind, Arc<Semaphore>> = vec![
            PoolKind::Codegen,
            PoolKind::Security,
            PoolKind::Database,
        ]
        .into_iter()
        .map(|pool| {
            let concurrency = pool.settings(&self.pools).concurrency;
            (pool, Arc::new(Semaphore::new(concurrency)))
        })
        .collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let child_cancel = cancel.child_token();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut task_cost = 0.0f64;
        let mut cancelled = false;

        loop {
            if !cancelled {
                self.mark_upstream_failures(&mut states, &order);
                self.spawn_ready(&mut states, &order, &semaphores, &tx, ctx, &child_cancel, &mut handles);
            }

            if states.values().all(|state| state.status.is_terminal()) {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    child_cancel.cancel();
                    for id in &order {
                        let state = states.get_mut(id).expect("state exists");
                        if !state.status.is_terminal() && !state.scheduled {
                            state.status = TaskStatus::Failed;
                            state.error = Some(GatewayError::cancelled("plan cancelled"));
                            state.completed_at = Some(Utc::now());
                        }
                    }
                }
                event = rx.recv() => {
                    let event = match event {
                        Some(event) => event,
                        None => break,
                    };
                    if let Ok(success) = &event.outcome {
                        task_cost += success.cost_usd;
                    }
                    self.apply_event(&mut states, event, cancelled);
                }
            }
        }

        join_all(handles).await;

        // Aggregation runs even after cancellation: completed work is still
        // validated, reconciled, and reported.
        self.validate_shapes(&mut states, &order);
        let overrides = detect_and_resolve_conflicts(&mut states, &order);

        let (response, synthesized_by, tokens_used, synthesis_cost) = if cancelled {
            // Cancellation yields a partial report rather than an error; the
            // synthesis call is skipped because its token is already gone.
            let mut response =
                String::from("Execution was cancelled before the plan completed.");
            let incomplete = incomplete_branches(&states, &order);
            if !incomplete.is_empty() {
                response.push_str("\n\nIncomplete branches:\n");
                response.push_str(&incomplete.join("\n"));
            }
            (response, self.coordinator.clone(), 0, 0.0)
        } else {
            let context_map = unified_context(&states, &order);
            self.synthesize(ctx, &states, &order, &context_map, cancel)
                .await?
        };

        let mut tasks: Vec<TaskRecord> = Vec::with_capacity(order.len());
        for id in &order {
            let state = &states[id];
            tasks.push(TaskRecord {
                id: id.clone(),
                pool: state.task.pool,
                status: state.status,
                result: state.result.clone(),
                error: state.error.clone(),
                runs: state.runs,
                created_at: state.created_at,
                started_at: state.started_at,
                completed_at: state.completed_at,
            });
        }

        Ok(OrchestratorReport {
            response,
            synthesized_by,
            tasks,
            overrides,
            tokens_used,
            cost_usd: task_cost + synthesis_cost,
        })
    }

    /// Mark pending tasks whose dependencies terminally failed.
    fn mark_upstream_failures(&self, states: &mut HashMap<String, TaskState>, order: &[String]) {
        loop {
            let mut doomed: Option<String> = None;
            for id in order {
                let state = &states[id];
                if state.status != TaskStatus::Pending || state.scheduled {
                    continue;
                }
                let blocked = state.task.blocked_by.iter().any(|dep| {
                    let dep_state = &states[dep];
                    dep_state.status.is_terminal() && dep_state.status != TaskStatus::Completed
                });
                if blocked {
                    doomed = Some(id.clone());
                    break;
                }
            }
            match doomed {
                Some(id) => {
                    let state = states.get_mut(&id).expect("state exists");
                    state.status = TaskStatus::Failed;
                    state.error = Some(GatewayError::upstream_failed(format!(
                        "a dependency of task '{}' terminally failed",
                        id
                    )));
                    state.completed_at = Some(Utc::now());
                    log::info!("task '{}' failed upstream; it will not run", id);
                }
                None => break,
            }
        }
    }

    /// Spawn every ready pending task onto its pool.
    #[allow(clippy::too_many_arguments)]
    fn spawn_ready(
        &self,
        states: &mut HashMap<String, TaskState>,
        order: &[String],
        semaphores: &HashMap<PoolKind, Arc<Semaphore>>,
        tx: &mpsc::UnboundedSender<WorkerEvent>,
        ctx: &OrchestratorContext,
        cancel: &CancellationToken,
        handles: &mut Vec<JoinHandle<()>>,
    ) {
        let mut ready: Vec<String> = order
            .iter()
            .filter(|id| {
                let state = &states[*id];
                state.status == TaskStatus::Pending
                    && !state.scheduled
                    && state
                        .task
                        .blocked_by
                        .iter()
                        .all(|dep| states[dep].status == TaskStatus::Completed)
            })
            .cloned()
            .collect();
        // Priority first (lower is sooner), declaration order as tiebreak.
        ready.sort_by_key(|id| states[id].task.priority);

        for id in ready {
            let state = states.get_mut(&id).expect("state exists");
            state.scheduled = true;
            state.status = TaskStatus::Running;
            state.runs += 1;

            let task = state.task.clone();
            let pool_config = *task.pool.settings(&self.pools);
            let semaphore = semaphores[&task.pool].clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let router = self.router.clone();
            let dispatcher = self.dispatcher.clone();
            let costs = self.costs.clone();
            let project = ctx.project.clone();

            handles.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(WorkerEvent {
                            id: task.id.clone(),
                            started_at: None,
                            outcome: Err(GatewayError::cancelled("plan cancelled")),
                        });
                        return;
                    }
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    }
                };

                let started_at = Utc::now();
                let outcome =
                    run_task(&task, &pool_config, &router, &dispatcher, &costs, &project, &cancel)
                        .await;
                drop(permit);
                let _ = tx.send(WorkerEvent {
                    id: task.id,
                    started_at: Some(started_at),
                    outcome,
                });
            }));
        }
    }

    fn apply_event(
        &self,
        states: &mut HashMap<String, TaskState>,
        event: WorkerEvent,
        cancelled: bool,
    ) {
        let state = match states.get_mut(&event.id) {
            Some(state) => state,
            None => return,
        };
        state.scheduled = false;
        if state.started_at.is_none() {
            state.started_at = event.started_at;
        }
        match event.outcome {
            Ok(success) => {
                state.status = TaskStatus::Completed;
                state.result = Some(success.payload);
                state.completed_at = Some(Utc::now());
            }
            Err(error) => {
                let max_retries = state
                    .task
                    .max_retries
                    .unwrap_or_else(|| state.task.pool.settings(&self.pools).max_retries);
                let retryable = error.is_retryable() && !cancelled;
                if retryable && state.runs <= max_retries {
                    log::info!(
                        "task '{}' failed with {} (run {}); re-queueing",
                        state.task.id,
                        error.kind,
                        state.runs
                    );
                    state.status = TaskStatus::Pending;
                    state.error = Some(error);
                } else {
                    state.status = if error.kind == ErrorKind::Timeout {
                        TaskStatus::Timeout
                    } else {
                        TaskStatus::Failed
                    };
                    state.error = Some(error);
                    state.completed_at = Some(Utc::now());
                }
            }
        }
    }

    /// Shape-invalid completed results become failures before aggregation.
    fn validate_shapes(&self, states: &mut HashMap<String, TaskState>, order: &[String]) {
        for id in order {
            let state = states.get_mut(id).expect("state exists");
            if state.status != TaskStatus::Completed {
                continue;
            }
            let valid = state
                .result
                .as_ref()
                .map(|result| shape_is_valid(state.task.pool, result))
                .unwrap_or(false);
            if !valid {
                log::warn!(
                    "task '{}' completed with a shape-invalid {} result",
                    id,
                    state.task.pool
                );
                state.status = TaskStatus::Failed;
                state.error = Some(GatewayError::validation(format!(
                    "result is missing the '{}' field required of {} tasks",
                    required_field(state.task.pool),
                    state.task.pool
                )));
                state.result = None;
            }
        }
    }

    async fn synthesize(
        &self,
        ctx: &OrchestratorContext,
        states: &HashMap<String, TaskState>,
        order: &[String],
        context_map: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<(String, String, u64, f64), GatewayError> {
        let mut prompt = String::new();
        prompt.push_str("Synthesize a single final answer for this request:\n\n");
        prompt.push_str(&ctx.request);
        prompt.push_str("\n\nResults from the task branches:\n");
        let mut keys: Vec<&String> = context_map.keys().collect();
        keys.sort();
        for key in keys {
            let value = serde_json::to_string(&context_map[key]).unwrap_or_default();
            let clipped: String = value.chars().take(2000).collect();
            prompt.push_str(&format!("- {}: {}\n", key, clipped));
        }

        // The synthesis call is budget-gated like any other dispatch.
        let decision = self
            .router
            .select(&prompt, None, Some(self.coordinator.as_str()));
        let coordinator = self
            .router
            .agents()
            .get(&decision.agent_id)
            .ok_or_else(|| GatewayError::internal("coordinator agent disappeared"))?;
        let (est_in, est_out) = estimate_tokens(&prompt);
        // Held for the duration of the synthesis dispatch.
        let (budget, _budget_hold) = self
            .costs
            .check_budget(&ctx.project, &coordinator, est_in, est_out);
        if !budget.is_approved() {
            return Err(GatewayError::budget_exceeded(format!(
                "synthesis call rejected by budget preflight for project '{}'",
                ctx.project
            )));
        }

        let opts = DispatchOptions::default()
            .for_project(&ctx.project)
            .with_operation(CostOperation::Synthesis);
        let outcome = self
            .dispatcher
            .dispatch(&decision.agent_id, &prompt, &[], &opts, cancel)
            .await
            .map_err(|failure| failure.error)?;

        let mut response = outcome.text;
        let incomplete = incomplete_branches(states, order);
        if !incomplete.is_empty() {
            response.push_str("\n\nIncomplete branches:\n");
            response.push_str(&incomplete.join("\n"));
        }

        Ok((
            response,
            outcome.agent_id,
            outcome.tokens_used,
            outcome.cost_usd,
        ))
    }
}

async fn run_task(
    task: &Task,
    pool_config: &PoolConfig,
    router: &Arc<Router>,
    dispatcher: &Arc<Dispatcher>,
    costs: &Arc<CostTracker>,
    project: &str,
    cancel: &CancellationToken,
) -> Result<TaskSuccess, GatewayError> {
    let decision = router.select(&task.prompt, None, task.agent.as_deref());
    let agent = router
        .agents()
        .get(&decision.agent_id)
        .ok_or_else(|| GatewayError::internal("routed agent disappeared"))?;

    let (est_in, est_out) = estimate_tokens(&task.prompt);
    // Held for the duration of the dispatch below.
    let (budget, _budget_hold) = costs.check_budget(project, &agent, est_in, est_out);
    if !budget.is_approved() {
        return Err(GatewayError::budget_exceeded(format!(
            "task '{}' rejected by budget preflight",
            task.id
        )));
    }

    let task_timeout = task
        .timeout
        .unwrap_or_else(|| Duration::from_secs(pool_config.timeout_seconds));
    let opts = DispatchOptions::default()
        .for_project(project)
        .with_operation(CostOperation::WorkflowStep);

    let dispatched = tokio::time::timeout(
        task_timeout,
        dispatcher.dispatch(&decision.agent_id, &task.prompt, &[], &opts, cancel),
    )
    .await;
    match dispatched {
        Ok(Ok(outcome)) => Ok(TaskSuccess {
            payload: shape_payload(task.pool, &outcome.text),
            cost_usd: outcome.cost_usd,
        }),
        Ok(Err(failure)) => Err(failure.error),
        Err(_) => Err(GatewayError::timeout(format!(
            "task '{}' exceeded its {} s budget",
            task.id,
            task_timeout.as_secs()
        ))),
    }
}

fn required_field(pool: PoolKind) -> &'static str {
    match pool {
        PoolKind::Codegen => "code",
        PoolKind::Security => "findings",
        PoolKind::Database => "schema",
    }
}

fn shape_is_valid(pool: PoolKind, result: &Value) -> bool {
    match pool {
        PoolKind::Codegen => result.get("code").map(|v| !v.is_null()).unwrap_or(false),
        PoolKind::Security => result
            .get("findings")
            .map(|v| v.is_array())
            .unwrap_or(false),
        PoolKind::Database => result.get("schema").map(|v| !v.is_null()).unwrap_or(false),
    }
}

/// Wrap raw dispatcher text into the pool's expected shape. Structured JSON
/// objects pass through untouched and face shape validation as-is.
fn shape_payload(pool: PoolKind, text: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() {
            return value;
        }
    }
    match pool {
        PoolKind::Codegen => json!({ "code": text }),
        PoolKind::Security => json!({ "findings": [text] }),
        PoolKind::Database => json!({ "schema": text }),
    }
}

fn significant_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 3)
        .map(|t| t.to_string())
        .collect()
}

fn finding_remediations(findings: &Value) -> Vec<String> {
    let mut remediations = Vec::new();
    if let Some(items) = findings.as_array() {
        for item in items {
            match item {
                Value::String(text) => remediations.push(text.clone()),
                Value::Object(map) => {
                    if let Some(Value::String(remediation)) = map.get("remediation") {
                        remediations.push(remediation.clone());
                    } else if let Some(Value::String(finding)) = map.get("finding") {
                        remediations.push(finding.clone());
                    }
                }
                _ => {}
            }
        }
    }
    remediations
}

/// Columns referenced in code as `identifier.identifier`.
fn referenced_columns(code: &str) -> HashSet<String> {
    let mut columns = HashSet::new();
    for token in code.split(|c: char| c.is_whitespace() || "(),;\"'`".contains(c)) {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() == 2
            && !parts[0].is_empty()
            && !parts[1].is_empty()
            && parts
                .iter()
                .all(|p| p.chars().all(|c| c.is_alphanumeric() || c == '_'))
        {
            columns.insert(parts[1].to_lowercase());
        }
    }
    columns
}

/// Detect the closed conflict set and apply the fixed resolution policy:
/// security remediations override codegen output; the database schema is
/// authoritative for column references. Overrides annotate the losing
/// result in place and are recorded.
fn detect_and_resolve_conflicts(
    states: &mut HashMap<String, TaskState>,
    order: &[String],
) -> Vec<ConflictResolution> {
    let mut overrides = Vec::new();

    let completed_in_pool = |states: &HashMap<String, TaskState>, pool: PoolKind| -> Vec<String> {
        order
            .iter()
            .filter(|id| {
                let state = &states[*id];
                state.status == TaskStatus::Completed && state.task.pool == pool
            })
            .cloned()
            .collect()
    };
    let security_ids = completed_in_pool(states, PoolKind::Security);
    let codegen_ids = completed_in_pool(states, PoolKind::Codegen);
    let schema_ids = completed_in_pool(states, PoolKind::Database);

    // security-vs-codegen: each remediation must be reflected in every
    // codegen result; a remediation mostly absent from the code wins over it.
    for security_id in security_ids {
        let remediations = states[&security_id]
            .result
            .as_ref()
            .and_then(|r| r.get("findings").cloned())
            .map(|findings| finding_remediations(&findings))
            .unwrap_or_default();
        for codegen_id in codegen_ids.clone() {
            let code_text = states[&codegen_id]
                .result
                .as_ref()
                .and_then(|r| r.get("code"))
                .and_then(|c| c.as_str())
                .map(|c| c.to_string())
                .unwrap_or_default();
            let code_tokens = significant_tokens(&code_text);
            for remediation in &remediations {
                let wanted = significant_tokens(remediation);
                if wanted.is_empty() {
                    continue;
                }
                let present = wanted.iter().filter(|t| code_tokens.contains(*t)).count();
                if present * 2 < wanted.len() {
                    if let Some(state) = states.get_mut(&codegen_id) {
                        if let Some(Value::Object(map)) = state.result.as_mut() {
                            let entry = map
                                .entry("security_overrides".to_string())
                                .or_insert_with(|| Value::Array(Vec::new()));
                            if let Value::Array(list) = entry {
                                list.push(Value::String(remediation.clone()));
                            }
                        }
                    }
                    overrides.push(ConflictResolution {
                        kind: ConflictKind::SecurityVsCodegen,
                        overridden_task: codegen_id.clone(),
                        winning_task: security_id.clone(),
                        description: format!(
                            "security remediation not reflected in '{}': {}",
                            codegen_id, remediation
                        ),
                    });
                }
            }
        }
    }

    // schema-vs-code: columns referenced in code must exist in the schema.
    if !schema_ids.is_empty() {
        let mut schema_tokens = HashSet::new();
        for schema_id in &schema_ids {
            if let Some(schema) = states[schema_id]
                .result
                .as_ref()
                .and_then(|r| r.get("schema"))
            {
                let text = match schema {
                    Value::String(text) => text.clone(),
                    other => serde_json::to_string(other).unwrap_or_default(),
                };
                schema_tokens.extend(
                    text.to_lowercase()
                        .split(|c: char| !c.is_alphanumeric() && c != '_')
                        .filter(|t| !t.is_empty())
                        .map(|t| t.to_string()),
                );
            }
        }
        for codegen_id in codegen_ids {
            let code_text = states[&codegen_id]
                .result
                .as_ref()
                .and_then(|r| r.get("code"))
                .and_then(|c| c.as_str())
                .map(|c| c.to_string())
                .unwrap_or_default();
            let missing: Vec<String> = referenced_columns(&code_text)
                .into_iter()
                .filter(|column| !schema_tokens.contains(column))
                .collect();
            if !missing.is_empty() {
                let mut missing = missing;
                missing.sort();
                if let Some(state) = states.get_mut(&codegen_id) {
                    if let Some(Value::Object(map)) = state.result.as_mut() {
                        map.insert(
                            "schema_mismatches".to_string(),
                            json!(missing.clone()),
                        );
                    }
                }
                overrides.push(ConflictResolution {
                    kind: ConflictKind::SchemaVsCode,
                    overridden_task: codegen_id.clone(),
                    winning_task: schema_ids[0].clone(),
                    description: format!(
                        "code in '{}' references columns absent from the schema: {}",
                        codegen_id,
                        missing.join(", ")
                    ),
                });
            }
        }
    }

    overrides
}

/// One "could not complete" line per non-completed task, in plan order.
fn incomplete_branches(states: &HashMap<String, TaskState>, order: &[String]) -> Vec<String> {
    order
        .iter()
        .filter_map(|id| {
            let state = &states[id];
            match state.status {
                TaskStatus::Completed => None,
                status => {
                    let reason = state
                        .error
                        .as_ref()
                        .map(|e| e.kind.as_str())
                        .unwrap_or(status.reason_str());
                    Some(format!(
                        "- {}_{}: could not complete ({})",
                        state.task.pool, id, reason
                    ))
                }
            }
        })
        .collect()
}

/// Build the `{pool_taskid: result}` map handed to synthesis. Failed
/// branches carry their status so the synthesizer can name them.
fn unified_context(
    states: &HashMap<String, TaskState>,
    order: &[String],
) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    for id in order {
        let state = &states[id];
        let key = format!("{}_{}", state.task.pool, id);
        let value = match state.status {
            TaskStatus::Completed => state.result.clone().unwrap_or(Value::Null),
            status => json!({
                "status": status,
                "error": state.error.as_ref().map(|e| e.kind.as_str()),
            }),
        };
        map.insert(key, value);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_with_cycles_are_rejected() {
        let t1 = Task::new(PoolKind::Codegen, "a").with_id("t1").blocked_by(vec!["t2"]);
        let t2 = Task::new(PoolKind::Codegen, "b").with_id("t2").blocked_by(vec!["t1"]);
        let err = ExecutionPlan::new(vec![t1, t2]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn plans_with_unknown_dependencies_are_rejected() {
        let t1 = Task::new(PoolKind::Codegen, "a").with_id("t1").blocked_by(vec!["ghost"]);
        assert!(ExecutionPlan::new(vec![t1]).is_err());
    }

    #[test]
    fn duplicate_task_ids_are_rejected() {
        let t1 = Task::new(PoolKind::Codegen, "a").with_id("t");
        let t2 = Task::new(PoolKind::Security, "b").with_id("t");
        assert!(ExecutionPlan::new(vec![t1, t2]).is_err());
    }

    #[test]
    fn valid_dags_construct() {
        let t1 = Task::new(PoolKind::Codegen, "a").with_id("t1");
        let t2 = Task::new(PoolKind::Security, "b").with_id("t2").blocked_by(vec!["t1"]);
        let t3 = Task::new(PoolKind::Database, "c")
            .with_id("t3")
            .blocked_by(vec!["t1", "t2"]);
        assert!(ExecutionPlan::new(vec![t1, t2, t3]).is_ok());
    }

    #[test]
    fn raw_text_is_wrapped_into_pool_shapes() {
        let code = shape_payload(PoolKind::Codegen, "fn main() {}");
        assert_eq!(code["code"], "fn main() {}");
        let findings = shape_payload(PoolKind::Security, "no issues");
        assert!(findings["findings"].is_array());
        let schema = shape_payload(PoolKind::Database, "CREATE TABLE orders (id INT)");
        assert!(schema["schema"].is_string());
    }

    #[test]
    fn structured_objects_pass_through_and_face_validation() {
        let passthrough = shape_payload(PoolKind::Codegen, r#"{"notes": "no code here"}"#);
        assert!(!shape_is_valid(PoolKind::Codegen, &passthrough));
        let good = shape_payload(PoolKind::Codegen, r#"{"code": "fn main() {}"}"#);
        assert!(shape_is_valid(PoolKind::Codegen, &good));
    }

    #[test]
    fn referenced_columns_are_extracted_from_dotted_identifiers() {
        let columns = referenced_columns("SELECT orders.total, users.name FROM orders");
        assert!(columns.contains("total"));
        assert!(columns.contains("name"));
        assert!(!columns.contains("orders"));
    }
}
