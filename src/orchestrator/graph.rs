//! Stateful workflow graph (§4.6): `cache_lookup -> retrieve -> router ->
//! (clarify <-> router | plan -> generate -> validate -> (execute -> visualize
//! -> synthesize | correct -> validate))`, checkpointed after every node.

use super::checkpoint::CheckpointStore;
use crate::error::{Error, Result};
use crate::execution::{ExecutionEngine, ExecutionOutcome};
use crate::llm::{ChatMessage, LlmClient};
use crate::registry::recommend::{RecommendationInputs, RecommendationService};
use crate::registry::{QueryPairRole, RegistryStore};
use crate::schema::SchemaIntrospector;
use crate::sql::validator::{AstValidator, ValidatorConfig};
use crate::state::{AgentState, AmbiguityType, Message, MessageRole, MAX_CLARIFY_ROUNDS, MAX_CORRECTION_ROUNDS};
use crate::telemetry::{SpanType, TelemetryBackend, TelemetryContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeName {
    CacheLookup,
    Router,
    Clarify,
    Retrieve,
    Plan,
    Generate,
    Validate,
    Execute,
    Correct,
    Visualize,
    Synthesize,
}

impl NodeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheLookup => "cache_lookup",
            Self::Router => "router",
            Self::Clarify => "clarify",
            Self::Retrieve => "retrieve",
            Self::Plan => "plan",
            Self::Generate => "generate",
            Self::Validate => "validate",
            Self::Execute => "execute",
            Self::Correct => "correct",
            Self::Visualize => "visualize",
            Self::Synthesize => "synthesize",
        }
    }
}

/// A partial state update a node contributes; merged shallowly over the
/// prior state by [`merge_state`].
pub type StateFragment = serde_json::Map<String, Value>;

/// Merges `fragment` over `base` one field at a time (top-level keys only;
/// nested collections like `decision_events` are replaced wholesale by
/// whichever node touches them, which is always the node that owns them).
pub fn merge_state(base: &AgentState, fragment: StateFragment) -> Result<AgentState> {
    let mut value = serde_json::to_value(base).map_err(Error::from)?;
    if let Value::Object(map) = &mut value {
        for (key, val) in fragment {
            map.insert(key, val);
        }
    }
    serde_json::from_value(value).map_err(Error::from)
}

/// Strips control characters and caps length. The raw text is kept in
/// `raw_user_input` for audit; the graph only ever sees the sanitized form.
pub fn sanitize_question(raw: &str, max_len: usize) -> String {
    let cleaned: String = raw.chars().filter(|c| !c.is_control() || *c == ' ').collect();
    let trimmed = cleaned.trim();
    if trimmed.chars().count() > max_len {
        trimmed.chars().take(max_len).collect()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> NodeName;

    async fn run(&self, state: &AgentState) -> Result<StateFragment>;
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub max_correction_rounds: u32,
    pub max_clarify_rounds: u32,
    pub persistence_fail_open: bool,
    pub sanitizer_max_len: usize,
    pub cache_similarity_threshold: f64,
    pub interaction_retry_attempts: u32,
    pub interaction_retry_base_delay_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_correction_rounds: MAX_CORRECTION_ROUNDS,
            max_clarify_rounds: MAX_CLARIFY_ROUNDS,
            persistence_fail_open: false,
            sanitizer_max_len: 4000,
            cache_similarity_threshold: 0.97,
            interaction_retry_attempts: 3,
            interaction_retry_base_delay_ms: 50,
        }
    }
}

impl WorkflowConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            persistence_fail_open: std::env::var("PERSISTENCE_FAIL_OPEN")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
                .unwrap_or(default.persistence_fail_open),
            ..default
        }
    }
}

/// Interaction persistence (§4.6 "interaction persistence"): the
/// `create_interaction`/`update_interaction` tools, abstracted so the core
/// does not depend on a concrete storage backend.
#[async_trait]
pub trait InteractionPersistence: Send + Sync {
    async fn create_interaction(&self, trace_id: &str, question: &str, tenant_id: Option<i64>) -> Result<String>;

    async fn update_interaction(&self, interaction_id: &str, outcome: &Value) -> Result<()>;
}

/// No-op persistence for tests and standalone eval runs.
pub struct NullInteractionPersistence;

#[async_trait]
impl InteractionPersistence for NullInteractionPersistence {
    async fn create_interaction(&self, trace_id: &str, _question: &str, _tenant_id: Option<i64>) -> Result<String> {
        Ok(trace_id.to_string())
    }

    async fn update_interaction(&self, _interaction_id: &str, _outcome: &Value) -> Result<()> {
        Ok(())
    }
}

async fn retry_with_backoff<F, Fut, T>(attempts: u32, base_delay_ms: u64, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(base_delay_ms * 2u64.pow(attempt))).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Internal("retry loop exited without an error".to_string())))
}

/// A 32-hex-digit OTEL trace id; anything else falls back to `thread_id`
/// when persisting (§4.6 "cross-process context").
fn is_well_formed_trace_id(id: &str) -> bool {
    id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit())
}

struct CacheLookupNode {
    registry: Arc<dyn RegistryStore>,
    threshold: f64,
}

#[async_trait]
impl Node for CacheLookupNode {
    fn name(&self) -> NodeName {
        NodeName::CacheLookup
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let mut fragment = StateFragment::new();
        let question = state.raw_user_input.clone().unwrap_or_default();
        // A real embedding would come from the same model used to seed the
        // registry; this crate only owns the lookup contract, not embedding
        // generation, so an empty vector here always misses, which is safe.
        let embedding: Vec<f32> = Vec::new();
        let hits = self
            .registry
            .lookup_semantic_candidates(&embedding, Some(QueryPairRole::Interaction), state.tenant_id, 1)
            .await?;

        if let Some((pair, score)) = hits.into_iter().next() {
            if score >= self.threshold {
                fragment.insert("from_cache".to_string(), json!(true));
                fragment.insert("current_sql".to_string(), json!(pair.sql_query));
                return Ok(fragment);
            }
        }
        let _ = question;
        fragment.insert("from_cache".to_string(), json!(false));
        Ok(fragment)
    }
}

struct RetrieveNode {
    schema: Arc<dyn SchemaIntrospector>,
}

#[async_trait]
impl Node for RetrieveNode {
    fn name(&self) -> NodeName {
        NodeName::Retrieve
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let question = state.raw_user_input.clone().unwrap_or_default();
        let matches = self.schema.search_nodes(&question, Some("table"), 8).await?;

        let mut raw_schema_context = Vec::new();
        for m in &matches {
            if let Some(table) = self.schema.get_table_def(&m.node).await? {
                raw_schema_context.push(serde_json::to_value(&table).map_err(Error::from)?);
            }
        }

        let mut fragment = StateFragment::new();
        fragment.insert("raw_schema_context".to_string(), json!(raw_schema_context));
        Ok(fragment)
    }
}

struct RouterNode;

#[async_trait]
impl Node for RouterNode {
    fn name(&self) -> NodeName {
        NodeName::Router
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let mut fragment = StateFragment::new();
        let question = state.raw_user_input.clone().unwrap_or_default();

        let ambiguity = if state.tenant_id.is_none() {
            Some(AmbiguityType::MissingTenantScope)
        } else if question.trim().is_empty() {
            Some(AmbiguityType::MultipleInterpretations)
        } else if state.raw_schema_context.is_empty() {
            Some(AmbiguityType::UnresolvedEntity)
        } else {
            None
        };

        match ambiguity {
            Some(kind) => {
                fragment.insert("ambiguity_type".to_string(), serde_json::to_value(kind).map_err(Error::from)?);
            }
            None => {
                fragment.insert("ambiguity_type".to_string(), Value::Null);
            }
        }
        Ok(fragment)
    }
}

struct ClarifyNode {
    max_clarify_rounds: u32,
}

#[async_trait]
impl Node for ClarifyNode {
    fn name(&self) -> NodeName {
        NodeName::Clarify
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let mut fragment = StateFragment::new();
        let next_count = state.clarify_count + 1;
        fragment.insert("clarify_count".to_string(), json!(next_count));

        if next_count >= self.max_clarify_rounds {
            // Surface the clarification instead of looping again: clear the
            // ambiguity flag so the router sends this through to planning
            // with whatever context is available.
            fragment.insert("ambiguity_type".to_string(), Value::Null);
        }
        Ok(fragment)
    }
}

struct PlanNode {
    registry: Arc<dyn RegistryStore>,
}

#[async_trait]
impl Node for PlanNode {
    fn name(&self) -> NodeName {
        NodeName::Plan
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let service = RecommendationService::new(self.registry.clone(), Vec::new(), Default::default());
        let inputs = RecommendationInputs {
            question: state.raw_user_input.clone().unwrap_or_default(),
            question_embedding: Vec::new(),
            tenant_id: state.tenant_id,
            limit: 3,
            enable_fallback: true,
        };
        let (examples, explanation) = service.recommend(&inputs).await?;

        let mut decision_events = state.decision_events.clone();
        decision_events.push(json!({
            "node": "plan",
            "examples": examples,
            "explanation": explanation,
        }));

        let mut fragment = StateFragment::new();
        fragment.insert("decision_events".to_string(), serde_json::to_value(&decision_events).map_err(Error::from)?);
        Ok(fragment)
    }
}

/// Pulls the few-shot examples the most recent `plan` node surfaced, if any.
fn plan_examples_from(state: &AgentState) -> Vec<Value> {
    state
        .decision_events
        .entries()
        .iter()
        .rev()
        .find(|e| e.get("node").and_then(Value::as_str) == Some("plan"))
        .and_then(|e| e.get("examples"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

struct GenerateNode {
    llm: Arc<dyn LlmClient>,
    max_tokens: u64,
}

#[async_trait]
impl Node for GenerateNode {
    fn name(&self) -> NodeName {
        NodeName::Generate
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let question = state.raw_user_input.clone().unwrap_or_default();
        let schema_summary = serde_json::to_string(&state.raw_schema_context).unwrap_or_default();
        let examples = plan_examples_from(state);
        let examples_summary = if examples.is_empty() {
            String::new()
        } else {
            format!("\nSimilar past questions and their SQL:\n{}", serde_json::to_string(&examples).unwrap_or_default())
        };
        let system = format!("Generate a single read-only SQL query for this schema:\n{schema_summary}{examples_summary}");
        let mut messages = vec![ChatMessage::user(question)];
        let breakpoints = crate::llm::cache::find_cache_breakpoints(Some(&system), &messages, 1024);
        crate::llm::cache::apply_cache_markers(&mut messages, &breakpoints);

        let completion = self.llm.complete(Some(&system), &messages, self.max_tokens).await?;

        let mut fragment = StateFragment::new();
        fragment.insert("current_sql".to_string(), json!(completion.text));
        Ok(fragment)
    }
}

struct ValidateNode {
    validator: AstValidator,
    dialect: String,
}

#[async_trait]
impl Node for ValidateNode {
    fn name(&self) -> NodeName {
        NodeName::Validate
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let mut fragment = StateFragment::new();
        let sql = state.current_sql.clone().unwrap_or_default();
        let result = self.validator.validate(&sql, &self.dialect, None, None);

        if !result.is_valid {
            let mut failures = state.validation_failures.clone();
            for violation in &result.violations {
                failures.push(serde_json::to_value(violation).map_err(Error::from)?);
            }
            fragment.insert("validation_failures".to_string(), serde_json::to_value(&failures).map_err(Error::from)?);
            fragment.insert(
                "error".to_string(),
                json!(result.violations.first().map(|v| v.message.clone()).unwrap_or_default()),
            );
            fragment.insert("error_category".to_string(), json!("VALIDATION_ERROR"));
        } else {
            fragment.insert("error".to_string(), Value::Null);
            fragment.insert("error_category".to_string(), Value::Null);
        }
        Ok(fragment)
    }
}

struct ExecuteNodeImpl {
    engine: Arc<ExecutionEngine>,
}

#[async_trait]
impl Node for ExecuteNodeImpl {
    fn name(&self) -> NodeName {
        NodeName::Execute
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let outcome: ExecutionOutcome = self.engine.execute(state).await;
        let mut fragment = StateFragment::new();
        fragment.insert("query_result".to_string(), serde_json::to_value(&outcome.query_result).map_err(Error::from)?);
        fragment.insert("error".to_string(), json!(outcome.error));
        fragment.insert("error_category".to_string(), json!(outcome.error_category));
        fragment.insert("error_metadata".to_string(), serde_json::to_value(&outcome.error_metadata).map_err(Error::from)?);
        fragment.insert("result_is_truncated".to_string(), json!(outcome.result_is_truncated));
        fragment.insert("result_row_limit".to_string(), json!(outcome.result_row_limit));
        fragment.insert("result_rows_returned".to_string(), json!(outcome.result_rows_returned));
        fragment.insert("result_columns".to_string(), json!(outcome.result_columns));
        fragment.insert(
            "result_completeness".to_string(),
            serde_json::to_value(&outcome.result_completeness).map_err(Error::from)?,
        );
        fragment.insert("schema_drift_suspected".to_string(), json!(outcome.schema_drift_suspected));
        fragment.insert("missing_identifiers".to_string(), json!(outcome.missing_identifiers));
        fragment.insert("schema_drift_auto_refresh".to_string(), json!(outcome.schema_drift_auto_refresh));
        Ok(fragment)
    }
}

struct CorrectNode;

#[async_trait]
impl Node for CorrectNode {
    fn name(&self) -> NodeName {
        NodeName::Correct
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let mut fragment = StateFragment::new();
        let next_count = state.retry_count + 1;
        fragment.insert("retry_count".to_string(), json!(next_count));
        Ok(fragment)
    }
}

struct VisualizeNode;

#[async_trait]
impl Node for VisualizeNode {
    fn name(&self) -> NodeName {
        NodeName::Visualize
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let suggestion = match state.result_columns.len() {
            0 => "table",
            1 => "metric",
            2 => "bar_chart",
            _ => "table",
        };

        let mut decision_events = state.decision_events.clone();
        decision_events.push(json!({ "node": "visualize", "suggestion": suggestion }));

        let mut fragment = StateFragment::new();
        fragment.insert("decision_events".to_string(), serde_json::to_value(&decision_events).map_err(Error::from)?);
        Ok(fragment)
    }
}

struct SynthesizeNode;

#[async_trait]
impl Node for SynthesizeNode {
    fn name(&self) -> NodeName {
        NodeName::Synthesize
    }

    async fn run(&self, state: &AgentState) -> Result<StateFragment> {
        let mut fragment = StateFragment::new();
        let rows = state.query_result.as_ref().map(|r| r.len()).unwrap_or(0);
        let summary = format!("returned {rows} row(s)");

        let mut messages = state.messages.clone();
        messages.push(Message {
            role: MessageRole::Assistant,
            content: summary,
        });
        fragment.insert("messages".to_string(), serde_json::to_value(&messages).map_err(Error::from)?);
        Ok(fragment)
    }
}

/// Terminal disposition of a graph run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    AwaitingClarification,
}

#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub outcome: RunOutcome,
    pub state: AgentState,
}

pub struct AgentGraph {
    config: WorkflowConfig,
    checkpointer: Arc<dyn CheckpointStore>,
    telemetry: Arc<dyn TelemetryBackend>,
    persistence: Arc<dyn InteractionPersistence>,
    cache_lookup: CacheLookupNode,
    retrieve: RetrieveNode,
    router: RouterNode,
    clarify: ClarifyNode,
    plan: PlanNode,
    generate: GenerateNode,
    validate: ValidateNode,
    execute: ExecuteNodeImpl,
    correct: CorrectNode,
    visualize: VisualizeNode,
    synthesize: SynthesizeNode,
}

#[allow(clippy::too_many_arguments)]
impl AgentGraph {
    pub fn new(
        config: WorkflowConfig,
        checkpointer: Arc<dyn CheckpointStore>,
        telemetry: Arc<dyn TelemetryBackend>,
        persistence: Arc<dyn InteractionPersistence>,
        registry: Arc<dyn RegistryStore>,
        schema: Arc<dyn SchemaIntrospector>,
        llm: Arc<dyn LlmClient>,
        validator_config: ValidatorConfig,
        dialect: String,
        engine: Arc<ExecutionEngine>,
        llm_max_tokens: u64,
    ) -> Self {
        Self {
            cache_lookup: CacheLookupNode {
                registry: registry.clone(),
                threshold: config.cache_similarity_threshold,
            },
            retrieve: RetrieveNode { schema },
            router: RouterNode,
            clarify: ClarifyNode {
                max_clarify_rounds: config.max_clarify_rounds,
            },
            plan: PlanNode { registry },
            generate: GenerateNode { llm, max_tokens: llm_max_tokens },
            validate: ValidateNode {
                validator: AstValidator::new(validator_config),
                dialect,
            },
            execute: ExecuteNodeImpl { engine },
            correct: CorrectNode,
            visualize: VisualizeNode,
            synthesize: SynthesizeNode,
            config,
            checkpointer,
            telemetry,
            persistence,
        }
    }

    async fn run_node(&self, node: &dyn Node, thread_id: &str, state: AgentState) -> Result<AgentState> {
        let wire_context = state.telemetry_context.clone();
        let restored = wire_context.as_ref().and_then(TelemetryContext::deserialize);
        let _context_guard = restored.map(|ctx| self.telemetry.use_context(ctx));

        let (_span, _guard) = self.telemetry.start_span(node.name().as_str(), SpanType::Node, None, None);
        let captured = self.telemetry.capture_context();

        let fragment = node.run(&state).await?;
        let mut merged = merge_state(&state, fragment)?;
        merged.telemetry_context = Some(captured.serialize());

        self.checkpointer.save(thread_id, &merged).await?;
        Ok(merged)
    }

    /// Runs the graph to completion (or to a clarification interrupt) from
    /// `initial_state`. `thread_id` identifies the checkpoint row; callers
    /// resuming after a clarification interrupt should pass the same id
    /// with the user's follow-up folded into `raw_user_input`.
    pub async fn run(&self, thread_id: &str, mut initial_state: AgentState) -> Result<WorkflowResult> {
        initial_state.raw_user_input = initial_state
            .raw_user_input
            .as_deref()
            .map(|raw| sanitize_question(raw, self.config.sanitizer_max_len));

        let trace_id = self.telemetry.get_current_trace_id().unwrap_or_else(|| thread_id.to_string());
        let persisted_trace_id = if is_well_formed_trace_id(&trace_id) { trace_id.clone() } else { thread_id.to_string() };

        let question = initial_state.raw_user_input.clone().unwrap_or_default();
        let interaction_id = match retry_with_backoff(self.config.interaction_retry_attempts, self.config.interaction_retry_base_delay_ms, || {
            self.persistence.create_interaction(&persisted_trace_id, &question, initial_state.tenant_id)
        })
        .await
        {
            Ok(id) => id,
            Err(e) => {
                if self.config.persistence_fail_open {
                    tracing::warn!(error = %e, "interaction persistence failed open");
                    initial_state.persistence_failed = true;
                    initial_state.persistence_error = Some(e.to_string());
                    Uuid::new_v4().to_string()
                } else {
                    return Err(e);
                }
            }
        };
        initial_state.interaction_id = Some(interaction_id.clone());

        let mut state = initial_state;
        let mut current = NodeName::CacheLookup;
        let outcome;

        loop {
            state = match current {
                NodeName::CacheLookup => {
                    let next = self.run_node(&self.cache_lookup, thread_id, state).await?;
                    current = if next.from_cache { NodeName::Validate } else { NodeName::Retrieve };
                    next
                }
                NodeName::Retrieve => {
                    let next = self.run_node(&self.retrieve, thread_id, state).await?;
                    current = NodeName::Router;
                    next
                }
                NodeName::Router => {
                    let next = self.run_node(&self.router, thread_id, state).await?;
                    current = if next.ambiguity_type.is_some() { NodeName::Clarify } else { NodeName::Plan };
                    next
                }
                NodeName::Clarify => {
                    let next = self.run_node(&self.clarify, thread_id, state).await?;
                    if next.clarify_count >= self.config.max_clarify_rounds {
                        outcome = RunOutcome::AwaitingClarification;
                        break;
                    }
                    current = NodeName::Router;
                    next
                }
                NodeName::Plan => {
                    let next = self.run_node(&self.plan, thread_id, state).await?;
                    current = NodeName::Generate;
                    next
                }
                NodeName::Generate => {
                    let next = self.run_node(&self.generate, thread_id, state).await?;
                    current = NodeName::Validate;
                    next
                }
                NodeName::Validate => {
                    let next = self.run_node(&self.validate, thread_id, state).await?;
                    current = if next.error.is_none() { NodeName::Execute } else { NodeName::Correct };
                    next
                }
                NodeName::Execute => {
                    let next = self.run_node(&self.execute, thread_id, state).await?;
                    current = if next.error.is_none() {
                        NodeName::Visualize
                    } else if next.retry_count < self.config.max_correction_rounds {
                        NodeName::Correct
                    } else {
                        outcome = RunOutcome::Failed;
                        self.finish(thread_id, &next, &interaction_id, RunOutcome::Failed).await;
                        return Ok(WorkflowResult { outcome, state: next });
                    };
                    next
                }
                NodeName::Correct => {
                    if state.retry_count >= self.config.max_correction_rounds {
                        outcome = RunOutcome::Failed;
                        self.finish(thread_id, &state, &interaction_id, RunOutcome::Failed).await;
                        return Ok(WorkflowResult { outcome, state });
                    }
                    let next = self.run_node(&self.correct, thread_id, state).await?;
                    current = NodeName::Validate;
                    next
                }
                NodeName::Visualize => {
                    let next = self.run_node(&self.visualize, thread_id, state).await?;
                    current = NodeName::Synthesize;
                    next
                }
                NodeName::Synthesize => {
                    let next = self.run_node(&self.synthesize, thread_id, state).await?;
                    outcome = RunOutcome::Succeeded;
                    self.finish(thread_id, &next, &interaction_id, RunOutcome::Succeeded).await;
                    return Ok(WorkflowResult { outcome, state: next });
                }
            };
        }

        self.checkpointer.save(thread_id, &state).await?;
        Ok(WorkflowResult { outcome, state })
    }

    async fn finish(&self, thread_id: &str, state: &AgentState, interaction_id: &str, outcome: RunOutcome) {
        let _ = self.checkpointer.save(thread_id, state).await;

        let summary = json!({
            "outcome": format!("{outcome:?}"),
            "retry_count": state.retry_count,
            "error": state.error,
        });
        if let Err(e) = self.persistence.update_interaction(interaction_id, &summary).await {
            tracing::warn!(error = %e, interaction_id, "interaction update failed, surfacing via persistence_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::dal::StaticQueryTargetDatabase;
    use crate::execution::{ExecutionEngine, ExecutionEngineConfig, NullToolInvoker};
    use crate::llm::StaticLlmClient;
    use crate::registry::store::SqliteRegistryStore;
    use crate::schema::{ColumnDef, StaticSchemaIntrospector, TableDef};
    use crate::sql::tenant_rewriter::TenantRewriteSettings;
    use crate::telemetry::InMemoryTelemetryBackend;

    fn sample_table() -> TableDef {
        TableDef {
            name: "orders".to_string(),
            columns: vec![ColumnDef {
                name: "id".to_string(),
                data_type: "integer".to_string(),
                nullable: false,
            }],
            foreign_keys: vec![],
            description: None,
        }
    }

    fn test_graph() -> AgentGraph {
        let registry = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let schema = Arc::new(StaticSchemaIntrospector::new(vec![sample_table()]));
        let llm = Arc::new(StaticLlmClient::new("test-model", "SELECT id FROM orders"));
        let telemetry: Arc<dyn TelemetryBackend> = Arc::new(InMemoryTelemetryBackend::new());
        let db = StaticQueryTargetDatabase::new("sqlite").with_fixture(
            "SELECT id FROM orders",
            json!({
                "schema_version": "1.0",
                "rows": [{"id": 1}],
                "metadata": { "rows_returned": 1, "is_truncated": false },
            }),
        );
        let engine = Arc::new(ExecutionEngine::new(
            ExecutionEngineConfig::default(),
            ValidatorConfig::default(),
            TenantRewriteSettings::default(),
            Arc::new(db),
            Arc::new(NullToolInvoker),
            telemetry.clone(),
        ));

        AgentGraph::new(
            WorkflowConfig::default(),
            Arc::new(super::super::checkpoint::InMemoryCheckpointer::new()),
            telemetry,
            Arc::new(NullInteractionPersistence),
            registry,
            schema,
            llm,
            ValidatorConfig::default(),
            "sqlite".to_string(),
            engine,
            512,
        )
    }

    #[tokio::test]
    async fn happy_path_reaches_synthesize() {
        let graph = test_graph();
        let state = AgentState::new("orders", Some(7));
        let result = graph.run("thread-1", state).await.unwrap();
        assert_eq!(result.outcome, RunOutcome::Succeeded);
        assert!(result.state.current_sql.is_some());
        assert!(!result.state.messages.is_empty());
    }

    #[tokio::test]
    async fn missing_tenant_scope_routes_to_clarify_until_exhausted() {
        let graph = test_graph();
        let state = AgentState::new("how many orders", None);
        let result = graph.run("thread-2", state).await.unwrap();
        assert_eq!(result.outcome, RunOutcome::AwaitingClarification);
        assert_eq!(result.state.clarify_count, WorkflowConfig::default().max_clarify_rounds);
    }

    #[test]
    fn sanitize_question_strips_control_characters_and_caps_length() {
        let sanitized = sanitize_question("hi\u{0007}there", 100);
        assert_eq!(sanitized, "hithere");
        let capped = sanitize_question(&"a".repeat(50), 10);
        assert_eq!(capped.len(), 10);
    }

    #[test]
    fn merge_state_overlays_only_fragment_keys() {
        let base = AgentState::new("q", Some(1));
        let mut fragment = StateFragment::new();
        fragment.insert("retry_count".to_string(), json!(2));
        let merged = merge_state(&base, fragment).unwrap();
        assert_eq!(merged.retry_count, 2);
        assert_eq!(merged.tenant_id, Some(1));
    }
}
