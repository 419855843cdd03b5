//! Query routing: scoring, intent inference, and the decision cache.
//!
//! Given a query, the router scores every registered agent on three
//! signals — keyword overlap, optional semantic similarity, and cost — and
//! returns a [`RoutingDecision`] naming exactly one agent. Selection never
//! fails: when nothing clears the minimum score the configured default
//! agent is returned with a rationale explaining the fallback.
//!
//! Decisions are cached under a SHA-256 key of the normalized query and the
//! agent-set version, with a TTL. Cache hits return a copy of the original
//! decision flagged `cached = true`; they are never recomputed.
//!
//! The semantic scorer is opt-in and one-way: until
//! [`Router::enable_semantic`] succeeds, the semantic score is 0 and its
//! weight is redistributed onto keywords.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::agentgate::agent::{Agent, AgentRegistry, Intent};
use crate::agentgate::clients::Message;
use crate::agentgate::config::RouterConfig;
use crate::agentgate::cost::estimate_tokens;
use crate::agentgate::error::GatewayError;
use crate::agentgate::health::{HealthStatus, HealthTracker};

/// Keyword weight when the semantic scorer is active.
pub const KEYWORD_WEIGHT: f64 = 0.60;
/// Semantic weight when the semantic scorer is active.
pub const SEMANTIC_WEIGHT: f64 = 0.25;
/// Cost weight when the semantic scorer is active.
pub const COST_WEIGHT: f64 = 0.15;

/// Keyword weight when the semantic scorer is disabled.
pub const KEYWORD_WEIGHT_NO_SEMANTIC: f64 = 0.85;
/// Cost weight when the semantic scorer is disabled.
pub const COST_WEIGHT_NO_SEMANTIC: f64 = 0.15;

/// Keyword weight for simple queries (≤ [`SIMPLE_QUERY_KEYWORDS`] matches).
pub const SIMPLE_KEYWORD_WEIGHT: f64 = 0.45;
/// Cost weight for simple queries with the semantic scorer active.
pub const SIMPLE_COST_WEIGHT: f64 = 0.30;
/// Keyword weight for simple queries without the semantic scorer.
pub const SIMPLE_KEYWORD_WEIGHT_NO_SEMANTIC: f64 = 0.70;
/// Cost weight for simple queries without the semantic scorer.
pub const SIMPLE_COST_WEIGHT_NO_SEMANTIC: f64 = 0.30;

/// A query matching at most this many keywords weights cost aggressively.
pub const SIMPLE_QUERY_KEYWORDS: usize = 2;

const SECURITY_KEYWORDS: &[&str] = &[
    "security", "vulnerability", "vulnerabilities", "exploit", "injection", "xss", "csrf",
    "audit", "pentest", "encryption", "authentication", "authorization", "cve", "owasp",
    "firewall", "malware", "breach", "sanitize", "secrets",
];

const DEVELOPMENT_KEYWORDS: &[&str] = &[
    "code", "implement", "function", "refactor", "bug", "debug", "compile", "build",
    "api", "endpoint", "frontend", "backend", "library", "module", "test", "tests",
    "deploy", "feature", "class", "typescript", "python", "rust",
];

const DATABASE_KEYWORDS: &[&str] = &[
    "database", "sql", "query", "queries", "table", "tables", "schema", "index",
    "migration", "orders", "records", "rows", "postgres", "mysql", "sqlite", "join",
    "select", "insert", "transaction",
];

const PLANNING_KEYWORDS: &[&str] = &[
    "plan", "planning", "roadmap", "milestone", "sprint", "estimate", "architecture",
    "design", "strategy", "requirements", "scope", "breakdown", "schedule", "prioritize",
];

/// The router's output: exactly one agent plus the factors that decided.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    /// Selected agent.
    pub agent_id: String,
    /// Selection confidence in `[0, 1]`.
    pub confidence: f64,
    /// Inferred intent.
    pub intent: Intent,
    /// Query keywords that matched skills or intent vocabulary.
    pub matched_keywords: Vec<String>,
    /// Cost score in `[0, 1]`; higher is cheaper.
    pub cost_score: f64,
    /// Semantic score in `[0, 1]`; 0 while semantic analysis is inactive.
    pub semantic_score: f64,
    /// Whether this decision was served from the cache.
    pub cached: bool,
    /// Human-readable explanation referencing the deciding factors.
    pub rationale: String,
}

/// Counters exposed by [`Router::stats`].
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    /// Live entries in the decision cache.
    pub cache_size: usize,
    /// Cache hits since startup.
    pub cache_hits: u64,
    /// Cache misses since startup.
    pub cache_misses: u64,
    /// Requests routed per agent id.
    pub routed: HashMap<String, u64>,
    /// Word-count-based USD estimate of everything routed so far.
    pub estimated_cost_usd: f64,
}

/// Black-box embedding function producing fixed-dimension unit vectors.
pub trait Embedder: Send + Sync {
    /// Embed `text` into a unit-normalized vector. All vectors returned by
    /// one embedder must share the same dimension.
    fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError>;
}

/// Deterministic feature-hashing embedder used when no external model is
/// supplied. Tokens are bucketed by SHA-256 into a fixed-width vector that
/// is then L2-normalized; similar token sets land near each other, which is
/// all the scoring needs from a default.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Create an embedder with the given vector width.
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
                as usize
                % self.dimensions;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in vector.iter_mut() {
                *value /= norm;
            }
        }
        Ok(vector)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    // Inputs are unit vectors; clamp into [0, 1] so antipodal noise
    // cannot produce a negative score.
    (dot as f64).max(0.0).min(1.0)
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

struct CachedDecision {
    decision: RoutingDecision,
    computed_at: Instant,
}

struct SemanticIndex {
    embedder: Arc<dyn Embedder>,
    /// Agent id → pre-computed intent-phrase embeddings.
    phrases: HashMap<String, Vec<Vec<f32>>>,
}

#[derive(Default)]
struct StatsInner {
    cache_hits: u64,
    cache_misses: u64,
    routed: HashMap<String, u64>,
    estimated_cost_usd: f64,
}

/// The agent router.
pub struct Router {
    agents: Arc<AgentRegistry>,
    config: RouterConfig,
    health: Option<Arc<HealthTracker>>,
    cache: Mutex<HashMap<String, CachedDecision>>,
    stats: Mutex<StatsInner>,
    semantic: RwLock<Option<SemanticIndex>>,
}

impl Router {
    /// Create a router over the given agent set.
    pub fn new(agents: Arc<AgentRegistry>, config: RouterConfig) -> Self {
        Self {
            agents,
            config,
            health: None,
            cache: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatsInner::default()),
            semantic: RwLock::new(None),
        }
    }

    /// Attach a health tracker (builder pattern). With one attached,
    /// selection skips agents whose derived status is unreachable.
    pub fn with_health(mut self, health: Arc<HealthTracker>) -> Self {
        self.health = Some(health);
        self
    }

    /// Activate the semantic scorer with the default hashing embedder.
    /// One-way; returns whether activation succeeded.
    pub fn enable_semantic(&self) -> bool {
        self.enable_semantic_with(Arc::new(HashEmbedder::default()))
    }

    /// Activate the semantic scorer with a caller-supplied embedder.
    /// Returns `false` (leaving semantic inactive) if any agent phrase
    /// fails to embed.
    pub fn enable_semantic_with(&self, embedder: Arc<dyn Embedder>) -> bool {
        {
            let semantic = self.semantic.read().expect("semantic lock poisoned");
            if semantic.is_some() {
                return true;
            }
        }

        let mut phrases: HashMap<String, Vec<Vec<f32>>> = HashMap::new();
        for agent in self.agents.all() {
            let mut agent_phrases = Vec::new();
            for skill in &agent.skills {
                agent_phrases.push(skill.clone());
            }
            for (intent, weight) in &agent.intent_affinities {
                if *weight > 0.0 {
                    agent_phrases.push(format!("{} {}", intent, agent.skills.join(" ")));
                }
            }
            if agent_phrases.is_empty() {
                agent_phrases.push(agent.name.clone());
            }
            let mut embedded = Vec::with_capacity(agent_phrases.len());
            for phrase in &agent_phrases {
                match embedder.embed(phrase) {
                    Ok(vector) => embedded.push(vector),
                    Err(e) => {
                        log::warn!("semantic activation failed on '{}': {}", agent.id, e);
                        return false;
                    }
                }
            }
            phrases.insert(agent.id.clone(), embedded);
        }

        let mut semantic = self.semantic.write().expect("semantic lock poisoned");
        if semantic.is_none() {
            *semantic = Some(SemanticIndex { embedder, phrases });
        }
        true
    }

    /// The agent set this router scores over.
    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    /// Drop every cached decision.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("router cache poisoned").clear();
    }

    /// Snapshot the router counters.
    pub fn stats(&self) -> RouterStats {
        let cache_size = self.cache.lock().expect("router cache poisoned").len();
        let stats = self.stats.lock().expect("router stats poisoned");
        RouterStats {
            cache_size,
            cache_hits: stats.cache_hits,
            cache_misses: stats.cache_misses,
            routed: stats.routed.clone(),
            estimated_cost_usd: stats.estimated_cost_usd,
        }
    }

    fn cache_key(&self, query: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize_query(query).as_bytes());
        hasher.update(b"|");
        hasher.update(self.agents.version().to_be_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn note_routed(&self, agent: &Agent, query: &str) {
        let mut stats = self.stats.lock().expect("router stats poisoned");
        *stats.routed.entry(agent.id.clone()).or_insert(0) += 1;
        let (est_in, est_out) = estimate_tokens(query);
        stats.estimated_cost_usd += (est_in as f64 * agent.input_cost_per_mtok
            + est_out as f64 * agent.output_cost_per_mtok)
            / 1_000_000.0;
    }

    /// Select exactly one agent for `query`.
    ///
    /// A known `hint` routes directly with confidence 1.0. Otherwise the
    /// decision comes from the cache when fresh, or is computed, cached,
    /// and returned with `cached = false`.
    pub fn select(
        &self,
        query: &str,
        context: Option<&[Message]>,
        hint: Option<&str>,
    ) -> RoutingDecision {
        if let Some(hint_id) = hint {
            if let Some(agent) = self.agents.get(hint_id) {
                let (intent, matched) = self.infer_intent(query, context);
                let decision = RoutingDecision {
                    agent_id: agent.id.clone(),
                    confidence: 1.0,
                    intent,
                    matched_keywords: matched,
                    cost_score: 0.0,
                    semantic_score: 0.0,
                    cached: false,
                    rationale: format!("explicit agent hint '{}'", hint_id),
                };
                self.note_routed(&agent, query);
                return decision;
            }
        }

        let key = self.cache_key(query);
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        {
            let mut cache = self.cache.lock().expect("router cache poisoned");
            match cache.get(&key) {
                Some(entry) if entry.computed_at.elapsed() < ttl => {
                    let mut decision = entry.decision.clone();
                    decision.cached = true;
                    let mut stats = self.stats.lock().expect("router stats poisoned");
                    stats.cache_hits += 1;
                    drop(stats);
                    if let Some(agent) = self.agents.get(&decision.agent_id) {
                        self.note_routed(&agent, query);
                    }
                    return decision;
                }
                Some(_) => {
                    cache.remove(&key);
                }
                None => {}
            }
        }

        let decision = self.compute(query, context);
        {
            let mut stats = self.stats.lock().expect("router stats poisoned");
            stats.cache_misses += 1;
        }
        if let Some(agent) = self.agents.get(&decision.agent_id) {
            self.note_routed(&agent, query);
        }
        let mut cache = self.cache.lock().expect("router cache poisoned");
        cache.insert(
            key,
            CachedDecision {
                decision: decision.clone(),
                computed_at: Instant::now(),
            },
        );
        decision
    }

    fn infer_intent(&self, query: &str, context: Option<&[Message]>) -> (Intent, Vec<String>) {
        let tokens = tokenize(query);
        let (intent, matched) = classify_tokens(&tokens);
        if intent != Intent::General || context.is_none() {
            return (intent, matched);
        }
        // The query alone said nothing; let recent context break the tie.
        let mut context_tokens = Vec::new();
        if let Some(messages) = context {
            for message in messages {
                context_tokens.extend(tokenize(message.content.as_ref()));
            }
        }
        let (context_intent, context_matched) = classify_tokens(&context_tokens);
        if context_intent != Intent::General {
            (context_intent, context_matched)
        } else {
            (Intent::General, matched)
        }
    }

    fn semantic_score_for(&self, agent_id: &str, query: &str) -> f64 {
        let semantic = self.semantic.read().expect("semantic lock poisoned");
        let index = match semantic.as_ref() {
            Some(index) => index,
            None => return 0.0,
        };
        let query_vector = match index.embedder.embed(query) {
            Ok(vector) => vector,
            Err(e) => {
                // Embedding failures degrade to keyword-only for this call.
                log::warn!("query embedding failed, semantic disabled for call: {}", e);
                return 0.0;
            }
        };
        index
            .phrases
            .get(agent_id)
            .map(|phrases| {
                phrases
                    .iter()
                    .map(|phrase| cosine(&query_vector, phrase))
                    .fold(0.0, f64::max)
            })
            .unwrap_or(0.0)
    }

    fn compute(&self, query: &str, context: Option<&[Message]>) -> RoutingDecision {
        let tokens = tokenize(query);
        let (intent, matched_keywords) = self.infer_intent(query, context);
        let semantic_active = self
            .semantic
            .read()
            .expect("semantic lock poisoned")
            .is_some();
        let simple_query = matched_keywords.len() <= SIMPLE_QUERY_KEYWORDS;
        let (keyword_weight, semantic_weight, cost_weight) = match (semantic_active, simple_query) {
            (true, false) => (KEYWORD_WEIGHT, SEMANTIC_WEIGHT, COST_WEIGHT),
            (true, true) => (SIMPLE_KEYWORD_WEIGHT, SEMANTIC_WEIGHT, SIMPLE_COST_WEIGHT),
            (false, false) => (KEYWORD_WEIGHT_NO_SEMANTIC, 0.0, COST_WEIGHT_NO_SEMANTIC),
            (false, true) => (
                SIMPLE_KEYWORD_WEIGHT_NO_SEMANTIC,
                0.0,
                SIMPLE_COST_WEIGHT_NO_SEMANTIC,
            ),
        };

        let (min_cost, max_cost) = self.agents.cost_bounds();
        let cost_span = max_cost - min_cost;

        let mut skipped_unreachable: Vec<String> = Vec::new();
        let mut best: Option<(Arc<Agent>, f64, f64, f64)> = None;
        for agent in self.agents.all() {
            if let Some(health) = &self.health {
                if health.status_of(&agent.id).status() == HealthStatus::Unreachable {
                    skipped_unreachable.push(agent.id.clone());
                    continue;
                }
            }

            let keyword_score = keyword_score(&agent, intent, &tokens, &matched_keywords);
            let semantic_score = if semantic_active {
                self.semantic_score_for(&agent.id, query)
            } else {
                0.0
            };
            let cost_score = if cost_span > 0.0 {
                (max_cost - agent.cost_per_token()) / cost_span
            } else {
                1.0
            };
            let score = keyword_weight * keyword_score
                + semantic_weight * semantic_score
                + cost_weight * cost_score;

            let replace = match &best {
                None => true,
                Some((current, current_score, _, _)) => {
                    if (score - current_score).abs() < 1e-9 {
                        // Tie: cheaper first, then lexicographic id.
                        match agent
                            .cost_per_token()
                            .partial_cmp(&current.cost_per_token())
                        {
                            Some(std::cmp::Ordering::Less) => true,
                            Some(std::cmp::Ordering::Equal) => agent.id < current.id,
                            _ => false,
                        }
                    } else {
                        score > *current_score
                    }
                }
            };
            if replace {
                best = Some((agent, score, semantic_score, cost_score));
            }
        }

        let skip_note = if skipped_unreachable.is_empty() {
            String::new()
        } else {
            format!("; skipped unreachable: {}", skipped_unreachable.join(", "))
        };

        match best {
            Some((agent, score, semantic_score, cost_score)) if score > self.config.min_score => {
                RoutingDecision {
                    agent_id: agent.id.clone(),
                    confidence: score.min(1.0),
                    intent,
                    matched_keywords: matched_keywords.clone(),
                    cost_score,
                    semantic_score,
                    cached: false,
                    rationale: format!(
                        "intent={} (keywords: {}); selected '{}' score={:.3} (semantic={:.3}, cost={:.3}){}",
                        intent,
                        if matched_keywords.is_empty() {
                            "none".to_string()
                        } else {
                            matched_keywords.join(", ")
                        },
                        agent.id,
                        score,
                        semantic_score,
                        cost_score,
                        skip_note
                    ),
                }
            }
            best => {
                let fallback = self.agents.default_agent();
                let (best_note, confidence) = match best {
                    Some((agent, score, _, _)) => {
                        (format!("best candidate '{}' scored {:.3}", agent.id, score), score)
                    }
                    None => ("no candidate was schedulable".to_string(), 0.0),
                };
                RoutingDecision {
                    agent_id: fallback.id.clone(),
                    confidence: confidence.max(0.0).min(1.0),
                    intent,
                    matched_keywords,
                    cost_score: 0.0,
                    semantic_score: 0.0,
                    cached: false,
                    rationale: format!(
                        "no score cleared the {:.2} threshold ({}); falling back to default '{}'{}",
                        self.config.min_score, best_note, fallback.id, skip_note
                    ),
                }
            }
        }
    }
}

fn vocabulary(intent: Intent) -> &'static [&'static str] {
    match intent {
        Intent::Security => SECURITY_KEYWORDS,
        Intent::Development => DEVELOPMENT_KEYWORDS,
        Intent::Database => DATABASE_KEYWORDS,
        Intent::Planning => PLANNING_KEYWORDS,
        Intent::General => &[],
    }
}

/// Classify tokens against the four closed vocabularies. The vocabulary
/// with the most matches wins; ties break in the order security,
/// development, database, planning. No matches at all is `general`.
fn classify_tokens(tokens: &[String]) -> (Intent, Vec<String>) {
    let candidates = vec![
        Intent::Security,
        Intent::Development,
        Intent::Database,
        Intent::Planning,
    ];
    let mut best = (Intent::General, Vec::new());
    let mut best_count = 0usize;
    for intent in candidates {
        let vocab = vocabulary(intent);
        let matched: Vec<String> = tokens
            .iter()
            .filter(|token| vocab.contains(&token.as_str()))
            .cloned()
            .collect();
        if matched.len() > best_count {
            best_count = matched.len();
            best = (intent, matched);
        }
    }
    best
}

/// Fraction of query tokens matching the agent's skills or the inferred
/// intent's vocabulary (the latter scaled by the agent's affinity for that
/// intent), bounded to `[0, 1]`.
fn keyword_score(
    agent: &Agent,
    intent: Intent,
    tokens: &[String],
    intent_matches: &[String],
) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let skill_matches = tokens
        .iter()
        .filter(|token| {
            agent
                .skills
                .iter()
                .any(|skill| skill.eq_ignore_ascii_case(token))
        })
        .count();
    let affinity = agent.intent_affinities.get(&intent).copied().unwrap_or(0.0);
    let weighted = skill_matches as f64 + affinity * intent_matches.len() as f64;
    (weighted / tokens.len() as f64).min(1.0)
}
