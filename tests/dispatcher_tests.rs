use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use agentgate::agentgate::clients::{
    GenerateOptions, Message, Provider, ProviderClient, ProviderRegistry, ProviderReply,
    ToolCallRequest, ToolDefinition,
};
use agentgate::agentgate::config::DispatchConfig;
use agentgate::agentgate::cost::{BudgetConfig, CostFilter, CostTracker};
use agentgate::agentgate::dispatcher::{
    AttemptOutcome, DispatchOptions, Dispatcher, TOOL_LOOP_LIMIT,
};
use agentgate::agentgate::health::{HealthStatus, HealthTracker};
use agentgate::agentgate::tool_protocol::{ToolRegistry, ToolResult};
use agentgate::{Agent, AgentRegistry, ErrorKind, Intent};

/// One scripted provider response.
enum Scripted {
    Ok {
        text: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    Fail(ErrorKind),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
}

/// Mock provider client driven by a response script. Once the script is
/// exhausted it answers with a fixed success.
struct MockClient {
    provider: Provider,
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
    tool_capable: bool,
}

impl MockClient {
    fn new(provider: Provider) -> Self {
        Self {
            provider,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            tool_capable: false,
        }
    }

    fn tool_capable(mut self) -> Self {
        self.tool_capable = true;
        self
    }

    fn push(&self, entry: Scripted) {
        self.script.lock().unwrap().push_back(entry);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for MockClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn supports_tools(&self) -> bool {
        self.tool_capable
    }

    async fn generate(
        &self,
        _model: &str,
        _system_prompt: Option<&str>,
        _messages: &[Message],
        _options: &GenerateOptions,
    ) -> Result<ProviderReply, agentgate::GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Ok {
                text,
                input_tokens,
                output_tokens,
            }) => Ok(ProviderReply {
                text,
                tool_calls: vec![],
                input_tokens,
                output_tokens,
            }),
            Some(Scripted::Fail(kind)) => Err(agentgate::GatewayError::new(
                kind,
                "scripted failure".to_string(),
            )),
            Some(Scripted::ToolCall { name, arguments }) => Ok(ProviderReply {
                text: format!("calling {}", name),
                tool_calls: vec![ToolCallRequest {
                    id: format!("call_{}", self.calls()),
                    name,
                    arguments,
                }],
                input_tokens: 10,
                output_tokens: 5,
            }),
            None => Ok(ProviderReply {
                text: "default reply".to_string(),
                tool_calls: vec![],
                input_tokens: 120,
                output_tokens: 240,
            }),
        }
    }
}

struct Harness {
    dispatcher: Dispatcher,
    costs: Arc<CostTracker>,
    health: Arc<HealthTracker>,
    primary_client: Arc<MockClient>,
    fallback_client: Arc<MockClient>,
}

fn harness(config: DispatchConfig, tool_fallback: Option<String>, tools: ToolRegistry) -> Harness {
    let primary = Agent::new("scribe", "Scribe", Provider::MiniMax, "MiniMax-M2.5")
        .with_rates(1.0, 2.0)
        .with_affinity(Intent::General, 0.5)
        .with_fallbacks(vec!["backup"]);
    let primary = if tools.is_empty() {
        primary
    } else {
        primary.with_tools(vec!["echo"])
    };
    let backup = Agent::new("backup", "Backup", Provider::Anthropic, "claude-sonnet-4-0")
        .with_rates(3.0, 15.0);
    let agents = Arc::new(AgentRegistry::from_agents(vec![primary, backup], "scribe").unwrap());

    let primary_client = Arc::new(MockClient::new(Provider::MiniMax));
    let fallback_client = Arc::new(MockClient::new(Provider::Anthropic).tool_capable());
    let mut providers = ProviderRegistry::empty();
    providers.register(primary_client.clone());
    providers.register(fallback_client.clone());

    let costs = Arc::new(CostTracker::in_memory(BudgetConfig::default()));
    let health = Arc::new(HealthTracker::new());
    let dispatcher = Dispatcher::new(
        agents,
        Arc::new(providers),
        health.clone(),
        costs.clone(),
        Arc::new(tools),
        config,
        tool_fallback,
    );
    Harness {
        dispatcher,
        costs,
        health,
        primary_client,
        fallback_client,
    }
}

fn no_jitter_config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.jitter = false;
    config
}

#[tokio::test]
async fn successful_dispatch_records_exactly_one_cost_event() {
    let h = harness(no_jitter_config(), None, ToolRegistry::empty());
    let outcome = h
        .dispatcher
        .dispatch(
            "scribe",
            "hello",
            &[],
            &DispatchOptions::default().for_project("shop"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.text, "default reply");
    assert_eq!(outcome.tokens_used, 240);
    assert_eq!(outcome.attempts.len(), 1);

    let summary = h.costs.summary(&CostFilter::default());
    assert_eq!(summary.events, 1);
    assert_eq!(summary.total_output_tokens, outcome.tokens_used);
    assert!((summary.by_project["shop"] - outcome.cost_usd).abs() < 1e-12);
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_exponentially_then_fall_back() {
    let h = harness(no_jitter_config(), None, ToolRegistry::empty());
    h.primary_client.push(Scripted::Fail(ErrorKind::RateLimit));
    h.primary_client.push(Scripted::Fail(ErrorKind::RateLimit));
    h.primary_client.push(Scripted::Fail(ErrorKind::Internal));
    h.fallback_client.push(Scripted::Ok {
        text: "rescued".to_string(),
        input_tokens: 50,
        output_tokens: 80,
    });

    let started = tokio::time::Instant::now();
    let opts = DispatchOptions::default().with_max_retries(2);
    let outcome = h
        .dispatcher
        .dispatch("scribe", "hello", &[], &opts, &CancellationToken::new())
        .await
        .unwrap();

    // Sleeps of 1 s and 2 s separate the three primary attempts.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "elapsed {:?}", elapsed);

    assert_eq!(outcome.text, "rescued");
    assert_eq!(outcome.agent_id, "backup");
    assert_eq!(outcome.attempts.len(), 4, "3 primary + 1 fallback");
    assert!(matches!(outcome.attempts[0].outcome, AttemptOutcome::Failed(ErrorKind::RateLimit)));
    assert!(matches!(outcome.attempts[2].outcome, AttemptOutcome::Failed(ErrorKind::Internal)));
    assert!(matches!(outcome.attempts[3].outcome, AttemptOutcome::Success));

    // Exactly one cost event: the successful fallback call.
    let summary = h.costs.summary(&CostFilter::default());
    assert_eq!(summary.events, 1);
    assert_eq!(summary.total_output_tokens, 80);

    // Health: three primary failures, one fallback success.
    let primary = h.health.status_of("scribe");
    assert_eq!(primary.total_requests, 3);
    assert_eq!(primary.total_failures, 3);
    assert_eq!(primary.consecutive_failures, 3);
    let backup = h.health.status_of("backup");
    assert_eq!(backup.total_requests, 1);
    assert_eq!(backup.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn backoff_delay_is_capped() {
    let h = harness(no_jitter_config(), None, ToolRegistry::empty());
    for _ in 0..6 {
        h.primary_client.push(Scripted::Fail(ErrorKind::Internal));
    }
    h.primary_client.push(Scripted::Ok {
        text: "finally".to_string(),
        input_tokens: 1,
        output_tokens: 1,
    });

    let started = tokio::time::Instant::now();
    let opts = DispatchOptions::default().with_max_retries(6);
    let outcome = h
        .dispatcher
        .dispatch("scribe", "hello", &[], &opts, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.text, "finally");

    // 1 + 2 + 4 + 8 + 8 + 8 seconds of backoff, capped at 8.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(31), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(33), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn non_retryable_errors_surface_immediately() {
    let h = harness(no_jitter_config(), None, ToolRegistry::empty());
    h.primary_client
        .push(Scripted::Fail(ErrorKind::Authentication));

    let failure = h
        .dispatcher
        .dispatch(
            "scribe",
            "hello",
            &[],
            &DispatchOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(failure.error.kind, ErrorKind::Authentication);
    assert_eq!(failure.attempts.len(), 1);
    // The fallback was never consulted.
    assert_eq!(h.fallback_client.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn abort_on_stops_retries_of_otherwise_retryable_kinds() {
    let h = harness(no_jitter_config(), None, ToolRegistry::empty());
    h.primary_client.push(Scripted::Fail(ErrorKind::RateLimit));

    let mut opts = DispatchOptions::default();
    opts.abort_on = vec![ErrorKind::RateLimit];
    let failure = h
        .dispatcher
        .dispatch("scribe", "hello", &[], &opts, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.error.kind, ErrorKind::RateLimit);
    assert_eq!(failure.attempts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausting_an_empty_fallback_chain_returns_the_primary_error() {
    let h = harness(no_jitter_config(), None, ToolRegistry::empty());
    for _ in 0..3 {
        h.primary_client.push(Scripted::Fail(ErrorKind::Network));
    }

    // An explicit empty chain models an agent with no fallback configured.
    let mut opts = DispatchOptions::default().with_max_retries(2);
    opts.fallback_chain = Some(vec![]);
    let failure = h
        .dispatcher
        .dispatch("scribe", "hello", &[], &opts, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.error.kind, ErrorKind::Network);
    assert_eq!(failure.attempts.len(), 3);
    assert!(failure.error.message.contains("scripted failure"));
}

#[tokio::test]
async fn unreachable_agents_are_skipped_and_the_skip_is_recorded() {
    let h = harness(no_jitter_config(), None, ToolRegistry::empty());
    for _ in 0..5 {
        h.health.track_failure("scribe", ErrorKind::Network);
    }
    assert_eq!(
        h.health.status_of("scribe").status(),
        HealthStatus::Unreachable
    );
    h.fallback_client.push(Scripted::Ok {
        text: "served by backup".to_string(),
        input_tokens: 10,
        output_tokens: 20,
    });

    let outcome = h
        .dispatcher
        .dispatch(
            "scribe",
            "hello",
            &[],
            &DispatchOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.agent_id, "backup");
    assert_eq!(outcome.attempts.len(), 2);
    assert!(matches!(outcome.attempts[0].outcome, AttemptOutcome::Skipped));
    assert_eq!(outcome.attempts[0].agent_id, "scribe");
    assert_eq!(h.primary_client.calls(), 0);
}

#[tokio::test]
async fn force_provider_ignores_health_and_fallbacks() {
    let h = harness(no_jitter_config(), None, ToolRegistry::empty());
    for _ in 0..5 {
        h.health.track_failure("scribe", ErrorKind::Network);
    }

    let mut opts = DispatchOptions::default();
    opts.force_provider = true;
    let outcome = h
        .dispatcher
        .dispatch("scribe", "hello", &[], &opts, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.agent_id, "scribe");
    assert_eq!(h.fallback_client.calls(), 0);
}

#[tokio::test]
async fn cancellation_surfaces_as_cancelled() {
    let h = harness(no_jitter_config(), None, ToolRegistry::empty());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let failure = h
        .dispatcher
        .dispatch("scribe", "hello", &[], &DispatchOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(failure.error.kind, ErrorKind::Cancelled);
}

fn echo_tools() -> (ToolRegistry, Arc<AtomicUsize>) {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let mut tools = ToolRegistry::empty();
    tools.register(
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echoes its arguments.".to_string(),
            parameters_schema: serde_json::json!({"type": "object"}),
        },
        Arc::new(move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::success(serde_json::json!({ "echoed": args })))
        }),
    );
    (tools, invocations)
}

#[tokio::test]
async fn tool_calls_reroute_to_the_tool_execution_fallback() {
    let (tools, invocations) = echo_tools();
    // Primary is MiniMax (no native tools); "backup" is the designated
    // tool-execution fallback on a tool-capable provider.
    let h = harness(no_jitter_config(), Some("backup".to_string()), tools);
    h.fallback_client.push(Scripted::ToolCall {
        name: "echo".to_string(),
        arguments: serde_json::json!({"text": "ping"}),
    });
    h.fallback_client.push(Scripted::Ok {
        text: "tool loop done".to_string(),
        input_tokens: 30,
        output_tokens: 40,
    });

    let outcome = h
        .dispatcher
        .dispatch(
            "scribe",
            "use the echo tool",
            &[],
            &DispatchOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.text, "tool loop done");
    // The reroute keeps the logical agent: attempts and cost name 'scribe'.
    assert_eq!(outcome.agent_id, "scribe");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(h.primary_client.calls(), 0, "rerouted away from minimax");
    assert_eq!(h.fallback_client.calls(), 2);
    // Token accounting spans both loop iterations.
    assert_eq!(outcome.tokens_used, 5 + 40);

    let summary = h.costs.summary(&CostFilter::default());
    assert_eq!(summary.events, 1);
    assert!((summary.by_agent["scribe"] - outcome.cost_usd).abs() < 1e-12);
}

#[tokio::test]
async fn tool_loops_stop_at_the_bound_with_the_latest_text() {
    let (tools, invocations) = echo_tools();
    let h = harness(no_jitter_config(), Some("backup".to_string()), tools);
    for _ in 0..TOOL_LOOP_LIMIT + 4 {
        h.fallback_client.push(Scripted::ToolCall {
            name: "echo".to_string(),
            arguments: serde_json::json!({}),
        });
    }

    let outcome = h
        .dispatcher
        .dispatch(
            "scribe",
            "loop forever",
            &[],
            &DispatchOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(h.fallback_client.calls(), TOOL_LOOP_LIMIT);
    // The final loop's tool request is not executed; seven rounds of
    // results were fed back before the bound hit.
    assert_eq!(invocations.load(Ordering::SeqCst), TOOL_LOOP_LIMIT - 1);
    assert_eq!(outcome.text, format!("calling {}", "echo"));
}
