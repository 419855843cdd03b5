use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use agentgate::agentgate::clients::{
    GenerateOptions, Message, Provider, ProviderClient, ProviderRegistry, ProviderReply,
};
use agentgate::agentgate::config::{AgentConfig, GatewayConfig};
use agentgate::agentgate::gateway::Gateway;
use agentgate::agentgate::orchestrator::{ConflictKind, ExecutionPlan, PoolKind, Task, TaskStatus};
use agentgate::ErrorKind;

/// Behavior for prompts matching a substring rule.
#[derive(Clone)]
enum Behavior {
    Ok { text: String, delay: Duration },
    Fail { kind: ErrorKind, delay: Duration },
}

/// Mock provider that answers based on the first substring rule matching
/// the latest user message, while tracking concurrency.
struct MockClient {
    rules: Mutex<Vec<(String, Behavior)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            rules: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    fn rule(&self, needle: &str, behavior: Behavior) {
        self.rules.lock().unwrap().push((needle.to_string(), behavior));
    }

    fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for MockClient {
    fn provider(&self) -> Provider {
        Provider::Ollama
    }

    async fn generate(
        &self,
        _model: &str,
        _system_prompt: Option<&str>,
        messages: &[Message],
        _options: &GenerateOptions,
    ) -> Result<ProviderReply, agentgate::GatewayError> {
        let prompt = messages
            .last()
            .map(|m| m.content.as_ref().to_string())
            .unwrap_or_default();
        let behavior = {
            let rules = self.rules.lock().unwrap();
            rules
                .iter()
                .find(|(needle, _)| prompt.contains(needle.as_str()))
                .map(|(_, behavior)| behavior.clone())
        };
        let behavior = behavior.unwrap_or(Behavior::Ok {
            text: "ok".to_string(),
            delay: Duration::from_millis(0),
        });

        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(current, Ordering::SeqCst);
        let result = match behavior {
            Behavior::Ok { text, delay } => {
                tokio::time::sleep(delay).await;
                Ok(ProviderReply {
                    text,
                    tool_calls: vec![],
                    input_tokens: 40,
                    output_tokens: 60,
                })
            }
            Behavior::Fail { kind, delay } => {
                tokio::time::sleep(delay).await;
                Err(agentgate::GatewayError::new(kind, "scripted failure"))
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn worker_config() -> GatewayConfig {
    let mut config = GatewayConfig::new(
        vec![AgentConfig {
            id: "worker".to_string(),
            name: "Worker".to_string(),
            provider: "ollama".to_string(),
            model: "llama3.1:8b".to_string(),
            input_cost_per_mtok: 0.1,
            output_cost_per_mtok: 0.2,
            skills: Vec::new(),
            intent_affinities: Default::default(),
            fallbacks: Vec::new(),
            system_prompt: None,
            personality: None,
            tools: Vec::new(),
            max_output_tokens: None,
            temperature: None,
        }],
        "worker",
    );
    // Single dispatcher attempt per task run keeps retry accounting at the
    // task level where these tests measure it, and a generous per-attempt
    // timeout keeps the scripted delays below from being cut short.
    config.dispatch.max_retries_per_model = 0;
    config.dispatch.timeout_seconds = 600;
    config
}

fn gateway(mock: Arc<MockClient>) -> Gateway {
    let mut providers = ProviderRegistry::empty();
    providers.register(mock);
    Gateway::with_provider_registry(worker_config(), providers).unwrap()
}

#[tokio::test(start_paused = true)]
async fn partial_failure_cascades_and_is_summarized() {
    let mock = MockClient::new();
    mock.rule(
        "Synthesize a single final",
        Behavior::Ok {
            text: "Here is the combined result.".to_string(),
            delay: Duration::from_millis(10),
        },
    );
    mock.rule(
        "build frontend",
        Behavior::Ok {
            text: "frontend markup ready".to_string(),
            delay: Duration::from_secs(60),
        },
    );
    mock.rule(
        "build backend",
        Behavior::Fail {
            kind: ErrorKind::Internal,
            delay: Duration::from_secs(100),
        },
    );
    mock.rule(
        "design schema",
        Behavior::Ok {
            text: "schema ready".to_string(),
            delay: Duration::from_secs(45),
        },
    );

    let plan = ExecutionPlan::new(vec![
        Task::new(PoolKind::Codegen, "build frontend").with_id("frontend"),
        Task::new(PoolKind::Codegen, "build backend").with_id("backend"),
        Task::new(PoolKind::Database, "design schema").with_id("schema"),
        Task::new(PoolKind::Security, "audit the result")
            .with_id("audit")
            .blocked_by(vec!["backend"]),
    ])
    .unwrap();

    let gateway = gateway(mock);
    let report = gateway
        .execute_plan(plan, "shop", "build the shop service")
        .await
        .unwrap();

    let by_id = |id: &str| report.tasks.iter().find(|t| t.id == id).unwrap();
    assert_eq!(by_id("frontend").status, TaskStatus::Completed);
    assert_eq!(by_id("schema").status, TaskStatus::Completed);

    // The backend ran 1 + 2 retries and failed terminally.
    let backend = by_id("backend");
    assert_eq!(backend.status, TaskStatus::Failed);
    assert_eq!(backend.runs, 3);

    // The audit never ran: upstream terminally failed.
    let audit = by_id("audit");
    assert_eq!(audit.status, TaskStatus::Failed);
    assert_eq!(audit.error.as_ref().unwrap().kind, ErrorKind::UpstreamFailed);
    assert!(audit.started_at.is_none());

    // The synthesized response names the incomplete branches.
    assert!(report.response.contains("Here is the combined result."));
    assert!(report.response.contains("Incomplete branches"));
    assert!(report.response.contains("codegen_backend: could not complete"));
    assert!(report.response.contains("security_audit: could not complete (upstream_failed)"));
}

#[tokio::test(start_paused = true)]
async fn dependencies_gate_start_times() {
    let mock = MockClient::new();
    mock.rule(
        "Synthesize a single final",
        Behavior::Ok {
            text: "done".to_string(),
            delay: Duration::from_millis(1),
        },
    );
    mock.rule(
        "first step",
        Behavior::Ok {
            text: "one".to_string(),
            delay: Duration::from_secs(30),
        },
    );
    mock.rule(
        "second step",
        Behavior::Ok {
            text: "two".to_string(),
            delay: Duration::from_secs(5),
        },
    );

    let plan = ExecutionPlan::new(vec![
        Task::new(PoolKind::Codegen, "first step").with_id("one"),
        Task::new(PoolKind::Codegen, "second step")
            .with_id("two")
            .blocked_by(vec!["one"]),
    ])
    .unwrap();

    let gateway = gateway(mock);
    let report = gateway.execute_plan(plan, "shop", "steps").await.unwrap();

    let one = report.tasks.iter().find(|t| t.id == "one").unwrap();
    let two = report.tasks.iter().find(|t| t.id == "two").unwrap();
    assert_eq!(one.status, TaskStatus::Completed);
    assert_eq!(two.status, TaskStatus::Completed);
    assert!(two.started_at.unwrap() >= one.completed_at.unwrap());
}

#[tokio::test(start_paused = true)]
async fn pool_concurrency_is_bounded() {
    let mock = MockClient::new();
    mock.rule(
        "Synthesize a single final",
        Behavior::Ok {
            text: "done".to_string(),
            delay: Duration::from_millis(1),
        },
    );
    mock.rule(
        "generate module",
        Behavior::Ok {
            text: "module".to_string(),
            delay: Duration::from_secs(10),
        },
    );

    let tasks: Vec<Task> = (0..6)
        .map(|i| Task::new(PoolKind::Codegen, "generate module").with_id(format!("m{}", i)))
        .collect();
    let plan = ExecutionPlan::new(tasks).unwrap();

    let mock_ref = mock.clone();
    let gateway = gateway(mock);
    let report = gateway.execute_plan(plan, "shop", "modules").await.unwrap();

    assert!(report.tasks.iter().all(|t| t.status == TaskStatus::Completed));
    // The codegen pool runs at most 3 tasks at once; the synthesis call may
    // overlap nothing because it runs after the fixed point.
    assert!(
        mock_ref.max_concurrency() <= 3,
        "observed {} concurrent calls",
        mock_ref.max_concurrency()
    );
}

#[tokio::test(start_paused = true)]
async fn task_timeouts_count_as_retryable_and_terminalize_as_timeout() {
    let mock = MockClient::new();
    mock.rule(
        "Synthesize a single final",
        Behavior::Ok {
            text: "done".to_string(),
            delay: Duration::from_millis(1),
        },
    );
    mock.rule(
        "slow work",
        Behavior::Ok {
            text: "too late".to_string(),
            delay: Duration::from_secs(3600),
        },
    );

    let plan = ExecutionPlan::new(vec![Task::new(PoolKind::Database, "slow work")
        .with_id("slow")
        .with_timeout(Duration::from_secs(5))
        .with_max_retries(1)])
    .unwrap();

    let gateway = gateway(mock);
    let report = gateway.execute_plan(plan, "shop", "slow").await.unwrap();

    let slow = report.tasks.iter().find(|t| t.id == "slow").unwrap();
    assert_eq!(slow.status, TaskStatus::Timeout);
    assert_eq!(slow.runs, 2, "initial run plus one retry");
    assert_eq!(slow.error.as_ref().unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn conflicts_resolve_security_first_and_against_the_schema() {
    let mock = MockClient::new();
    mock.rule(
        "Synthesize a single final",
        Behavior::Ok {
            text: "final".to_string(),
            delay: Duration::from_millis(1),
        },
    );
    mock.rule(
        "write the query layer",
        Behavior::Ok {
            text: r#"{"code": "SELECT orders.total FROM orders"}"#.to_string(),
            delay: Duration::from_secs(1),
        },
    );
    let findings = serde_json::json!({
        "findings": [{
            "finding": "string-built SQL",
            "remediation": "switch to parameterized statements with bound placeholders",
        }]
    });
    mock.rule(
        "audit the query layer",
        Behavior::Ok {
            text: findings.to_string(),
            delay: Duration::from_secs(1),
        },
    );
    mock.rule(
        "design the orders schema",
        Behavior::Ok {
            text: r#"{"schema": "CREATE TABLE orders (id INT, amount INT)"}"#.to_string(),
            delay: Duration::from_secs(1),
        },
    );

    let plan = ExecutionPlan::new(vec![
        Task::new(PoolKind::Codegen, "write the query layer").with_id("query"),
        Task::new(PoolKind::Security, "audit the query layer").with_id("sec"),
        Task::new(PoolKind::Database, "design the orders schema").with_id("db"),
    ])
    .unwrap();

    let gateway = gateway(mock);
    let report = gateway.execute_plan(plan, "shop", "query layer").await.unwrap();

    assert!(report
        .overrides
        .iter()
        .any(|o| o.kind == ConflictKind::SecurityVsCodegen && o.overridden_task == "query"));
    // `orders.total` is not a column of the schema result.
    assert!(report
        .overrides
        .iter()
        .any(|o| o.kind == ConflictKind::SchemaVsCode
            && o.description.contains("total")));

    let query = report.tasks.iter().find(|t| t.id == "query").unwrap();
    let result = query.result.as_ref().unwrap();
    assert!(result.get("security_overrides").is_some());
}

#[tokio::test(start_paused = true)]
async fn cancellation_yields_a_partial_report() {
    let mock = MockClient::new();
    mock.rule(
        "long haul",
        Behavior::Ok {
            text: "never seen".to_string(),
            delay: Duration::from_secs(5_000),
        },
    );

    let plan = ExecutionPlan::new(vec![
        Task::new(PoolKind::Codegen, "long haul").with_id("long"),
        Task::new(PoolKind::Security, "after the haul")
            .with_id("later")
            .blocked_by(vec!["long"]),
    ])
    .unwrap();

    let gateway = Arc::new(gateway(mock));
    let cancel = CancellationToken::new();
    let child = cancel.clone();
    let gw = gateway.clone();
    let handle = tokio::spawn(async move {
        gw.execute_plan_with_cancel(plan, "shop", "long haul", &child)
            .await
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    cancel.cancel();

    // Cancellation is not an error: the caller still gets the report, with
    // every unfinished task marked and no synthesis call made.
    let report = handle.await.unwrap().unwrap();

    let long = report.tasks.iter().find(|t| t.id == "long").unwrap();
    assert_eq!(long.status, TaskStatus::Failed);
    assert_eq!(long.error.as_ref().unwrap().kind, ErrorKind::Cancelled);

    let later = report.tasks.iter().find(|t| t.id == "later").unwrap();
    assert_eq!(later.status, TaskStatus::Failed);
    assert_eq!(later.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert!(later.started_at.is_none());

    assert!(report.response.contains("cancelled before the plan completed"));
    assert!(report.response.contains("codegen_long: could not complete (cancelled)"));
    assert_eq!(report.tokens_used, 0, "no synthesis call was made");
    assert!((report.cost_usd - 0.0).abs() < f64::EPSILON, "nothing was billed");
}
