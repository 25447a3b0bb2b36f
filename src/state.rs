//! Checkpointed workflow state shared by every orchestrator node.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A single conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Bounded FIFO list used for `decision_events` / `validation_failures`.
/// Truncates from the front once `max_len` or `max_bytes` is exceeded and
/// keeps a running count of how many entries were dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoundedAudit<T> {
    entries: Vec<T>,
    max_len: usize,
    max_bytes: usize,
    dropped: u64,
}

impl<T: Serialize> BoundedAudit<T> {
    pub fn new(max_len: usize, max_bytes: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_len,
            max_bytes,
            dropped: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        self.entries.push(item);
        self.enforce_caps();
    }

    fn enforce_caps(&mut self) {
        while self.entries.len() > self.max_len {
            self.entries.remove(0);
            self.dropped += 1;
        }
        while self.approx_bytes() > self.max_bytes && !self.entries.is_empty() {
            self.entries.remove(0);
            self.dropped += 1;
        }
    }

    fn approx_bytes(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|e| serde_json::to_vec(e).ok())
            .map(|v| v.len())
            .sum()
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Completeness summary of an execution result, surfaced to synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCompleteness {
    pub is_truncated: bool,
    pub rows_returned: usize,
    pub row_limit: Option<usize>,
    pub auto_pagination_stopped_reason: Option<String>,
    pub pages_fetched: usize,
}

impl ResultCompleteness {
    pub fn from_parts(
        is_truncated: bool,
        rows_returned: usize,
        row_limit: Option<usize>,
        auto_pagination_stopped_reason: Option<String>,
        pages_fetched: usize,
    ) -> Self {
        Self {
            is_truncated,
            rows_returned,
            row_limit,
            auto_pagination_stopped_reason,
            pages_fetched,
        }
    }

    pub fn complete(rows_returned: usize) -> Self {
        Self {
            is_truncated: false,
            rows_returned,
            row_limit: None,
            auto_pagination_stopped_reason: None,
            pages_fetched: 1,
        }
    }
}

/// Ambiguity classification set by the router node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmbiguityType {
    MissingTenantScope,
    UnresolvedEntity,
    MultipleInterpretations,
}

/// The checkpointed state carried through the workflow graph. Each node
/// returns a partial fragment that the orchestrator merges shallowly over
/// the previous value (see `orchestrator::merge_state`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub messages: Vec<Message>,
    pub raw_user_input: Option<String>,

    pub current_sql: Option<String>,
    pub query_result: Option<Vec<HashMap<String, Value>>>,

    pub error: Option<String>,
    pub error_category: Option<String>,
    pub error_metadata: HashMap<String, Value>,

    pub retry_count: u32,
    pub clarify_count: u32,
    pub schema_refresh_count: u32,

    pub tenant_id: Option<i64>,
    pub schema_snapshot_id: Option<String>,
    pub schema_fingerprint: Option<String>,
    pub raw_schema_context: Vec<Value>,

    pub deadline_ts: Option<f64>,
    pub timeout_seconds: Option<f64>,

    pub page_token: Option<String>,
    pub page_size: Option<usize>,
    pub seed: Option<u64>,
    pub interactive_session: bool,
    pub replay_bundle: Option<Value>,

    pub telemetry_context: Option<Value>,

    pub token_budget: Option<u64>,
    pub llm_prompt_bytes_used: u64,

    pub decision_events: BoundedAudit<Value>,
    pub validation_failures: BoundedAudit<Value>,

    pub ambiguity_type: Option<AmbiguityType>,
    pub from_cache: bool,

    pub interaction_id: Option<String>,

    pub result_is_truncated: bool,
    pub result_row_limit: Option<usize>,
    pub result_rows_returned: Option<usize>,
    pub result_columns: Vec<String>,
    pub result_completeness: Option<ResultCompleteness>,

    pub schema_drift_suspected: bool,
    pub missing_identifiers: Vec<String>,
    pub schema_drift_auto_refresh: bool,

    pub persistence_failed: bool,
    pub persistence_error: Option<String>,
}

pub const MAX_CORRECTION_ROUNDS: u32 = 3;
pub const MAX_CLARIFY_ROUNDS: u32 = 2;
pub const MAX_AUDIT_EVENTS: usize = 200;
pub const MAX_AUDIT_BYTES: usize = 64 * 1024;

impl AgentState {
    pub fn new(question: impl Into<String>, tenant_id: Option<i64>) -> Self {
        let question = question.into();
        Self {
            messages: vec![Message {
                role: MessageRole::User,
                content: question.clone(),
            }],
            raw_user_input: Some(question),
            tenant_id,
            decision_events: BoundedAudit::new(MAX_AUDIT_EVENTS, MAX_AUDIT_BYTES),
            validation_failures: BoundedAudit::new(MAX_AUDIT_EVENTS, MAX_AUDIT_BYTES),
            ..Default::default()
        }
    }

    pub fn invariants_hold(&self) -> bool {
        self.retry_count <= MAX_CORRECTION_ROUNDS
            && self.clarify_count <= MAX_CLARIFY_ROUNDS
            && (!self.from_cache || self.current_sql.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_audit_truncates_by_count() {
        let mut audit: BoundedAudit<Value> = BoundedAudit::new(2, 64 * 1024);
        audit.push(serde_json::json!({"i": 1}));
        audit.push(serde_json::json!({"i": 2}));
        audit.push(serde_json::json!({"i": 3}));
        assert_eq!(audit.entries().len(), 2);
        assert_eq!(audit.dropped(), 1);
    }

    #[test]
    fn new_state_satisfies_invariants() {
        let state = AgentState::new("how many orders", Some(7));
        assert!(state.invariants_hold());
        assert_eq!(state.tenant_id, Some(7));
    }

    #[test]
    fn from_cache_without_sql_violates_invariant() {
        let mut state = AgentState::new("q", None);
        state.from_cache = true;
        assert!(!state.invariants_hold());
    }
}
