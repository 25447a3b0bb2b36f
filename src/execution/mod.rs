//! Execution engine (C5): validate -> rewrite -> dispatch, with
//! auto-pagination, opportunistic prefetch, typed error classification,
//! and schema-drift detection.

pub mod dal;
pub mod drift;
pub mod envelope;
pub mod prefetch;

use crate::error::{Error, ErrorCode, Result};
use crate::sql::tenant_rewriter::{TenantRewriteSettings, TenantRewriter};
use crate::sql::validator::{AstValidator, ValidatorConfig};
use crate::state::{AgentState, ResultCompleteness};
use crate::telemetry::{SpanType, TelemetryBackend};
use async_trait::async_trait;
use dal::{BackendTopology, ExecuteSqlQueryRequest, QueryTargetDatabase};
use envelope::ToolResponseEnvelope;
use prefetch::{prefetch_cache_key, PrefetchHeuristic, PrefetchManager};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The engine's side-channel tool call for write-through caching
/// (§4.5 step 12). Kept as its own small interface so the execution
/// engine does not depend on the registry/cache store's full API.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn update_cache(
        &self,
        query: &str,
        sql: &str,
        tenant_id: Option<i64>,
        schema_snapshot_id: Option<&str>,
    ) -> Result<()>;
}

/// No-op invoker: cache write-through is best-effort and swallowed on
/// failure anyway, so tests that don't care about it can use this.
pub struct NullToolInvoker;

#[async_trait]
impl ToolInvoker for NullToolInvoker {
    async fn update_cache(
        &self,
        _query: &str,
        _sql: &str,
        _tenant_id: Option<i64>,
        _schema_snapshot_id: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionEngineConfig {
    pub auto_pagination_enabled: bool,
    pub auto_pagination_max_pages: u32,
    pub auto_pagination_max_rows: u64,
    pub legacy_tool_shim_enabled: bool,
    pub schema_drift_hints_enabled: bool,
    pub schema_drift_auto_refresh: bool,
    pub prefetch_max_concurrency: usize,
    pub prefetch_heuristic: PrefetchHeuristic,
    pub prefetch_deadline_ceiling_seconds: f64,
    pub grace_seconds: f64,
    pub dialect: String,
}

impl Default for ExecutionEngineConfig {
    fn default() -> Self {
        Self {
            auto_pagination_enabled: true,
            auto_pagination_max_pages: 3,
            auto_pagination_max_rows: 5000,
            legacy_tool_shim_enabled: false,
            schema_drift_hints_enabled: true,
            schema_drift_auto_refresh: false,
            prefetch_max_concurrency: 4,
            prefetch_heuristic: PrefetchHeuristic::default(),
            prefetch_deadline_ceiling_seconds: 2.0,
            grace_seconds: 0.5,
            dialect: "sqlite".to_string(),
        }
    }
}

impl ExecutionEngineConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let env_bool = |key: &str, d: bool| {
            std::env::var(key)
                .ok()
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
                .unwrap_or(d)
        };
        let env_num = |key: &str, d: u32| {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(d)
        };
        let env_num64 = |key: &str, d: u64| {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(d)
        };

        Self {
            auto_pagination_enabled: std::env::var("AGENT_AUTO_PAGINATION")
                .map(|v| v == "on")
                .unwrap_or(default.auto_pagination_enabled),
            auto_pagination_max_pages: env_num("AGENT_AUTO_PAGINATION_MAX_PAGES", default.auto_pagination_max_pages),
            auto_pagination_max_rows: env_num64("AGENT_AUTO_PAGINATION_MAX_ROWS", default.auto_pagination_max_rows),
            legacy_tool_shim_enabled: env_bool("AGENT_ENABLE_LEGACY_TOOL_SHIM", default.legacy_tool_shim_enabled),
            schema_drift_hints_enabled: env_bool("AGENT_SCHEMA_DRIFT_HINTS", default.schema_drift_hints_enabled),
            schema_drift_auto_refresh: env_bool("AGENT_SCHEMA_DRIFT_AUTO_REFRESH", default.schema_drift_auto_refresh),
            ..default
        }
    }
}

/// Reasons auto-pagination can stop (§4.5 step 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoPaginationStopReason {
    NoNextPage,
    MaxPages,
    MaxRows,
    BudgetExhausted,
    FetchError,
    FetchException,
    TokenRepeat,
    EmptyPageWithToken,
    PathologicalEmptyPages,
    UnsupportedCapability,
    Disabled,
}

impl AutoPaginationStopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoNextPage => "NO_NEXT_PAGE",
            Self::MaxPages => "MAX_PAGES",
            Self::MaxRows => "MAX_ROWS",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::FetchError => "FETCH_ERROR",
            Self::FetchException => "FETCH_EXCEPTION",
            Self::TokenRepeat => "TOKEN_REPEAT",
            Self::EmptyPageWithToken => "EMPTY_PAGE_WITH_TOKEN",
            Self::PathologicalEmptyPages => "PATHOLOGICAL_EMPTY_PAGES",
            Self::UnsupportedCapability => "UNSUPPORTED_CAPABILITY",
            Self::Disabled => "DISABLED",
        }
    }
}

/// State fragment the engine produces; merged shallowly by the
/// orchestrator over the prior `AgentState` (§4.6 "state merging").
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub query_result: Option<Vec<HashMap<String, Value>>>,
    pub error: Option<String>,
    pub error_category: Option<String>,
    pub error_metadata: HashMap<String, Value>,
    pub result_is_truncated: bool,
    pub result_row_limit: Option<usize>,
    pub result_rows_returned: Option<usize>,
    pub result_columns: Vec<String>,
    pub result_completeness: Option<ResultCompleteness>,
    pub schema_drift_suspected: bool,
    pub missing_identifiers: Vec<String>,
    pub schema_drift_auto_refresh: bool,
    pub from_cache: bool,
}

impl ExecutionOutcome {
    fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            error_category: Some(code.as_str().to_string()),
            ..Default::default()
        }
    }
}

pub struct ExecutionEngine {
    config: ExecutionEngineConfig,
    validator: AstValidator,
    rewriter: TenantRewriter,
    db: Arc<dyn QueryTargetDatabase>,
    cache: Arc<dyn ToolInvoker>,
    telemetry: Arc<dyn TelemetryBackend>,
    prefetch: PrefetchManager,
}

impl ExecutionEngine {
    pub fn new(
        config: ExecutionEngineConfig,
        validator_config: ValidatorConfig,
        rewrite_settings: TenantRewriteSettings,
        db: Arc<dyn QueryTargetDatabase>,
        cache: Arc<dyn ToolInvoker>,
        telemetry: Arc<dyn TelemetryBackend>,
    ) -> Self {
        let prefetch = PrefetchManager::new(config.prefetch_max_concurrency);
        Self {
            validator: AstValidator::new(validator_config),
            rewriter: TenantRewriter::new(rewrite_settings),
            config,
            db,
            cache,
            telemetry,
            prefetch,
        }
    }

    /// Decodes a keyset cursor against `sql`'s own ORDER BY and turns it into
    /// a "strictly after" predicate, returning the patched SQL plus the
    /// param values to append. `Ok(None)` is never returned today (kept for
    /// symmetry with the other best-effort apply-or-skip call sites); a bad
    /// cursor is a hard error since silently ignoring it would return rows
    /// from the wrong side of the page boundary.
    fn apply_keyset_cursor(
        &self,
        sql: &str,
        cursor: &str,
        schema_snapshot_id: Option<&str>,
    ) -> Result<Option<(String, Vec<Value>)>> {
        let order_keys = crate::sql::keyset::extract_keyset_order_keys(sql, &self.config.dialect)?;
        let order_signature = crate::sql::keyset::build_keyset_order_signature(&order_keys);
        let fingerprint = crate::sql::keyset::compute_fingerprint(schema_snapshot_id.unwrap_or(""), &order_signature, None);
        let payload = crate::sql::keyset::decode_keyset_cursor(cursor, &fingerprint, Some(&order_signature), None)?;

        let is_postgres = matches!(self.config.dialect.to_lowercase().as_str(), "postgres" | "postgresql");
        let predicate = crate::sql::keyset::build_strictly_after_predicate(&order_keys, &payload.values, is_postgres)?;
        let patched_sql = crate::sql::keyset::append_keyset_predicate(sql, &predicate.sql)?;
        Ok(Some((patched_sql, predicate.params)))
    }

    fn now_unix() -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    fn remaining_budget(deadline_ts: Option<f64>) -> f64 {
        match deadline_ts {
            Some(deadline) => (deadline - Self::now_unix()).max(0.0),
            None => f64::MAX,
        }
    }

    pub async fn execute(&self, state: &AgentState) -> ExecutionOutcome {
        let (_span, _guard) = self.telemetry.start_span("execution_engine.execute", SpanType::Tool, None, None);

        let Some(sql) = state.current_sql.as_deref() else {
            return ExecutionOutcome::error(ErrorCode::Unknown, "no current_sql to execute");
        };

        // 1. Budget gate.
        let remaining = Self::remaining_budget(state.deadline_ts);
        if remaining < self.config.grace_seconds {
            return ExecutionOutcome::error(ErrorCode::DbTimeout, "deadline exceeded before dispatch");
        }

        // 2. Structural validation (C1).
        let validation = self.validator.validate(sql, &self.config.dialect, None, None);
        if !validation.is_valid {
            let reason = validation
                .violations
                .first()
                .map(|v| v.message.clone())
                .unwrap_or_else(|| "security policy violation".to_string());
            tracing::warn!(sql, reason, "security policy violation, no tool dispatch");
            return ExecutionOutcome::error(ErrorCode::SecurityPolicyViolation, reason);
        }

        // 3. Tenant rewrite (C2).
        let tenant_id_str = state.tenant_id.map(|t| t.to_string()).unwrap_or_default();
        let request = crate::sql::tenant_rewriter::RewriteRequest {
            sql,
            provider: &self.config.dialect,
            tenant_id: state.tenant_id.map(Value::from).unwrap_or(Value::Null),
            tenant_column: "tenant_id",
            global_allowlist: std::collections::HashSet::new(),
            table_has_tenant_column: None,
        };
        let mut rewrite = match self.rewriter.rewrite_sql(&request) {
            Ok(success) => {
                tracing::info!(original = sql, rewritten = %success.sql, "tenant rewrite completed");
                success
            }
            Err(failure) => {
                tracing::error!(kind = ?failure.kind, detail = ?failure.details_safe, "tenant rewrite failed");
                return ExecutionOutcome::error(ErrorCode::TenantEnforcementUnsupported, failure.message);
            }
        };

        // 3b. Keyset pagination cursor (C3): on a backend that advertises
        // keyset support, a page token is a cursor, not an opaque backend
        // token - decode it into a "strictly after" predicate and inject it
        // before dispatch rather than passing it through as `page_token`.
        let mut keyset_cursor_applied = false;
        if self.db.capabilities().supports_keyset_pagination {
            if let Some(cursor) = state.page_token.as_deref() {
                match self.apply_keyset_cursor(&rewrite.sql, cursor, state.schema_snapshot_id.as_deref()) {
                    Ok(Some((next_sql, mut extra_params))) => {
                        rewrite.sql = next_sql;
                        rewrite.params.append(&mut extra_params);
                        keyset_cursor_applied = true;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "keyset cursor could not be applied to the rewritten query");
                        return ExecutionOutcome::error(e.code(), e.to_string());
                    }
                }
            }
        }

        // 4. Pre-execution schema validation (advisory).
        let mut outcome = ExecutionOutcome::default();
        if !state.raw_schema_context.is_empty() {
            let known: std::collections::HashSet<String> = state
                .raw_schema_context
                .iter()
                .filter_map(|v| v.get("name").and_then(|n| n.as_str()).map(|s| s.to_lowercase()))
                .collect();
            let referenced = crate::sql::keyset::extract_keyset_table_names(&rewrite.sql).unwrap_or_default();
            let missing = drift::pre_execution_missing_tables(&referenced, &known);
            if !missing.is_empty() {
                outcome.error_metadata.insert(
                    "validation.pre_exec_missing_tables".to_string(),
                    serde_json::to_value(&missing).unwrap_or(Value::Null),
                );
            }
        }

        // 5. Replay-bundle shortcut.
        if let Some(bundle) = &state.replay_bundle {
            if let Some(recorded) = bundle.get(&rewrite.sql) {
                return self.finish_from_envelope(state, recorded.clone(), &mut outcome, 1, AutoPaginationStopReason::Disabled);
            }
        }

        // 6. Prefetch admission.
        let page_token_for_dispatch = if keyset_cursor_applied {
            None
        } else {
            state.page_token.as_deref()
        };
        let prefetch_key = prefetch_cache_key(
            &rewrite.sql,
            Some(&tenant_id_str),
            page_token_for_dispatch,
            state.page_size.map(|p| p as u64),
            state.schema_snapshot_id.as_deref(),
            state.seed,
            None,
            None,
        );
        let mut first_page_latency_ms = 0u64;
        let first_page = if let Some(cached) = self.prefetch.cached(&prefetch_key).await {
            cached
        } else {
            let remaining = Self::remaining_budget(state.deadline_ts);
            let timeout = remaining.min(f64::MAX);
            let fetch_started = Self::now_unix();
            let result = self
                .db
                .execute_sql_query(ExecuteSqlQueryRequest {
                    sql: rewrite.sql.clone(),
                    tenant_id: Some(tenant_id_str.clone()),
                    params: rewrite.params.clone(),
                    include_columns: true,
                    timeout_seconds: timeout,
                    page_token: page_token_for_dispatch.map(|s| s.to_string()),
                    page_size: state.page_size.map(|p| p as u64),
                })
                .await;
            first_page_latency_ms = ((Self::now_unix() - fetch_started) * 1000.0).max(0.0) as u64;
            match result {
                Ok(raw) => raw,
                Err(e) => {
                    return ExecutionOutcome::error(e.code(), e.to_string());
                }
            }
        };

        // 7. Parse response envelope.
        let envelope = match ToolResponseEnvelope::parse(&first_page) {
            Ok(e) => e,
            Err(_) if self.config.legacy_tool_shim_enabled => {
                match first_page.as_array() {
                    Some(rows) => {
                        let rows: Vec<HashMap<String, Value>> = rows
                            .iter()
                            .filter_map(|r| r.as_object().map(|o| o.clone().into_iter().collect()))
                            .collect();
                        ToolResponseEnvelope::from_legacy_rows(rows)
                    }
                    None => {
                        return ExecutionOutcome::error(
                            ErrorCode::ToolResponseMalformed,
                            "tool response malformed and legacy shim could not apply",
                        );
                    }
                }
            }
            Err(_) => {
                let trace_id = self.telemetry.get_current_trace_id();
                outcome.error_metadata.insert("trace_id".to_string(), Value::String(trace_id.unwrap_or_default()));
                return ExecutionOutcome {
                    error: Some("tool response malformed".to_string()),
                    error_category: Some(ErrorCode::ToolResponseMalformed.as_str().to_string()),
                    ..outcome
                };
            }
        };

        if let Some(tool_error) = &envelope.error {
            return self.classify_tool_error(state, tool_error, &mut outcome);
        }

        // 8-9. Auto-pagination + prefetch scheduling.
        let (rows, completeness) = self
            .run_auto_pagination(state, &rewrite.sql, &tenant_id_str, &rewrite.params, envelope, first_page_latency_ms)
            .await;

        outcome.query_result = Some(rows.clone());
        outcome.result_rows_returned = Some(rows.len());
        outcome.result_is_truncated = completeness.is_truncated;
        outcome.result_row_limit = completeness.row_limit;
        outcome.result_completeness = Some(completeness);

        // 12. Cache write-through (best-effort).
        if !state.from_cache && state.retry_count == 0 && state.tenant_id.is_some() {
            if let Some(last_user_message) = state.messages.iter().rev().find(|m| matches!(m.role, crate::state::MessageRole::User)) {
                if !last_user_message.content.trim().is_empty() {
                    if let Err(e) = self
                        .cache
                        .update_cache(&last_user_message.content, &rewrite.sql, state.tenant_id, state.schema_snapshot_id.as_deref())
                        .await
                    {
                        tracing::warn!(error = %e, "cache write-through failed, swallowing");
                    }
                }
            }
        }

        outcome
    }

    fn finish_from_envelope(
        &self,
        _state: &AgentState,
        raw: Value,
        outcome: &mut ExecutionOutcome,
        pages_fetched: usize,
        stop_reason: AutoPaginationStopReason,
    ) -> ExecutionOutcome {
        let envelope = match ToolResponseEnvelope::parse(&raw) {
            Ok(e) => e,
            Err(_) => {
                return ExecutionOutcome::error(ErrorCode::ToolResponseMalformed, "replay bundle entry malformed");
            }
        };
        outcome.query_result = Some(envelope.rows.clone());
        outcome.result_rows_returned = Some(envelope.rows.len());
        outcome.result_is_truncated = envelope.metadata.is_truncated;
        outcome.result_row_limit = envelope.metadata.row_limit.map(|v| v as usize);
        outcome.result_completeness = Some(ResultCompleteness::from_parts(
            envelope.metadata.is_truncated,
            envelope.rows.len(),
            envelope.metadata.row_limit.map(|v| v as usize),
            Some(stop_reason.as_str().to_string()),
            pages_fetched,
        ));
        outcome.clone()
    }

    async fn run_auto_pagination(
        &self,
        state: &AgentState,
        sql: &str,
        tenant_id: &str,
        params: &[Value],
        first_page: ToolResponseEnvelope,
        first_page_latency_ms: u64,
    ) -> (Vec<HashMap<String, Value>>, ResultCompleteness) {
        let mut rows = first_page.rows.clone();
        let mut pages_fetched = 1usize;
        let mut is_truncated = first_page.metadata.is_truncated;
        let mut row_limit = first_page.metadata.row_limit.map(|v| v as usize);
        let mut next_token = first_page.metadata.next_page_token.clone();
        let mut seen_tokens: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut consecutive_empty_with_token = if first_page.rows.is_empty() && next_token.is_some() { 1 } else { 0 };
        let mut last_latency_ms = first_page_latency_ms;
        let mut last_rows_returned = first_page.rows.len() as u64;

        if !self.config.auto_pagination_enabled || next_token.is_none() {
            let reason = if next_token.is_none() {
                AutoPaginationStopReason::NoNextPage
            } else {
                AutoPaginationStopReason::Disabled
            };
            if let Some(token) = &next_token {
                self.maybe_schedule_prefetch(
                    state, sql, tenant_id, params, token, last_latency_ms, last_rows_returned,
                )
                .await;
            }
            return (
                rows,
                ResultCompleteness::from_parts(is_truncated, rows.len(), row_limit, Some(reason.as_str().to_string()), pages_fetched),
            );
        }

        let stop_reason = loop {
            if pages_fetched as u32 >= self.config.auto_pagination_max_pages {
                break AutoPaginationStopReason::MaxPages;
            }
            if rows.len() as u64 >= self.config.auto_pagination_max_rows {
                break AutoPaginationStopReason::MaxRows;
            }
            let remaining = Self::remaining_budget(state.deadline_ts);
            if remaining < self.config.grace_seconds {
                break AutoPaginationStopReason::BudgetExhausted;
            }
            let Some(token) = next_token.clone() else {
                break AutoPaginationStopReason::NoNextPage;
            };
            if !seen_tokens.insert(token.clone()) {
                break AutoPaginationStopReason::TokenRepeat;
            }

            let fetch_started = Self::now_unix();
            let page = self
                .db
                .execute_sql_query(ExecuteSqlQueryRequest {
                    sql: sql.to_string(),
                    tenant_id: Some(tenant_id.to_string()),
                    params: params.to_vec(),
                    include_columns: false,
                    timeout_seconds: remaining,
                    page_token: Some(token),
                    page_size: state.page_size.map(|p| p as u64),
                })
                .await;
            last_latency_ms = ((Self::now_unix() - fetch_started) * 1000.0).max(0.0) as u64;

            let page = match page {
                Ok(raw) => raw,
                Err(_) => break AutoPaginationStopReason::FetchException,
            };
            let envelope = match ToolResponseEnvelope::parse(&page) {
                Ok(e) => e,
                Err(_) => break AutoPaginationStopReason::FetchError,
            };
            if envelope.error.is_some() {
                break AutoPaginationStopReason::FetchError;
            }

            pages_fetched += 1;
            is_truncated = is_truncated || envelope.metadata.is_truncated;
            row_limit = row_limit.or(envelope.metadata.row_limit.map(|v| v as usize));
            next_token = envelope.metadata.next_page_token.clone();
            last_rows_returned = envelope.rows.len() as u64;

            if envelope.rows.is_empty() && next_token.is_some() {
                consecutive_empty_with_token += 1;
                if consecutive_empty_with_token >= 2 {
                    break AutoPaginationStopReason::PathologicalEmptyPages;
                }
            } else {
                consecutive_empty_with_token = 0;
            }

            rows.extend(envelope.rows);
        };

        // A budget/cap-driven stop still leaves a next page a follow-up
        // request will want; a cheap last page makes it worth prefetching
        // speculatively. Stops like `TokenRepeat`/`PathologicalEmptyPages`
        // signal a broken token stream, not a cap - no point prefetching.
        if matches!(
            stop_reason,
            AutoPaginationStopReason::MaxPages | AutoPaginationStopReason::MaxRows | AutoPaginationStopReason::BudgetExhausted
        ) {
            if let Some(token) = &next_token {
                self.maybe_schedule_prefetch(
                    state, sql, tenant_id, params, token, last_latency_ms, last_rows_returned,
                )
                .await;
            }
        }

        (
            rows,
            ResultCompleteness::from_parts(is_truncated, rows.len(), row_limit, Some(stop_reason.as_str().to_string()), pages_fetched),
        )
    }

    /// Opportunistically schedules a background fetch of the page after the
    /// last one served, so a follow-up request with that token can be
    /// served from `self.prefetch.cached(...)` instead of hitting the
    /// backend cold. Gated by `PrefetchHeuristic::is_cheap` on the last
    /// page's own latency/row count (§4.5 step 9).
    #[allow(clippy::too_many_arguments)]
    async fn maybe_schedule_prefetch(
        &self,
        state: &AgentState,
        sql: &str,
        tenant_id: &str,
        params: &[Value],
        next_token: &str,
        last_latency_ms: u64,
        last_rows_returned: u64,
    ) {
        let page_size = state.page_size.map(|p| p as u64);
        if !self
            .config
            .prefetch_heuristic
            .is_cheap(last_latency_ms, last_rows_returned, page_size.unwrap_or(last_rows_returned.max(1)))
        {
            return;
        }

        let key = prefetch_cache_key(
            sql,
            Some(tenant_id),
            Some(next_token),
            page_size,
            state.schema_snapshot_id.as_deref(),
            state.seed,
            None,
            None,
        );

        let db = self.db.clone();
        let sql = sql.to_string();
        let tenant_id = tenant_id.to_string();
        let params = params.to_vec();
        let next_token = next_token.to_string();
        let deadline = Self::remaining_budget(state.deadline_ts).min(self.config.prefetch_deadline_ceiling_seconds);

        self.prefetch
            .schedule(key, move || async move {
                db.execute_sql_query(ExecuteSqlQueryRequest {
                    sql,
                    tenant_id: Some(tenant_id),
                    params,
                    include_columns: true,
                    timeout_seconds: deadline,
                    page_token: Some(next_token),
                    page_size,
                })
                .await
                .ok()
            })
            .await;
    }

    fn classify_tool_error(
        &self,
        state: &AgentState,
        tool_error: &envelope::ToolErrorPayload,
        outcome: &mut ExecutionOutcome,
    ) -> ExecutionOutcome {
        let code = match tool_error.category.as_str() {
            "timeout" => ErrorCode::DbTimeout,
            "unsupported" => ErrorCode::UnsupportedCapability,
            "tenant_enforcement_unsupported" => ErrorCode::TenantEnforcementUnsupported,
            "transient" => ErrorCode::Transient,
            "connectivity" => ErrorCode::Connectivity,
            "auth" => ErrorCode::Auth,
            "resource_exhausted" => ErrorCode::ResourceExhausted,
            _ => ErrorCode::Unknown,
        };

        let message = if matches!(code, ErrorCode::TenantEnforcementUnsupported | ErrorCode::UnsupportedCapability) {
            "the requested operation is not supported for this provider".to_string()
        } else {
            tool_error.message.clone()
        };

        if self.config.schema_drift_hints_enabled {
            let known: std::collections::HashSet<String> = state
                .raw_schema_context
                .iter()
                .filter_map(|v| v.get("name").and_then(|n| n.as_str()).map(|s| s.to_lowercase()))
                .collect();
            if !known.is_empty() {
                let referenced = state
                    .current_sql
                    .as_deref()
                    .and_then(|sql| crate::sql::keyset::extract_keyset_table_names(sql).ok())
                    .unwrap_or_default();
                let report = drift::detect_drift(&referenced, &known);
                if report.suspected {
                    outcome.schema_drift_suspected = true;
                    outcome.missing_identifiers = report.missing_identifiers;
                    outcome.schema_drift_auto_refresh = self.config.schema_drift_auto_refresh;
                }
            }
        }

        ExecutionOutcome {
            error: Some(message),
            error_category: Some(code.as_str().to_string()),
            ..outcome.clone()
        }
    }

    pub fn db_topology(&self) -> BackendTopology {
        self.db.capabilities().topology
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::InMemoryTelemetryBackend;
    use dal::StaticQueryTargetDatabase;

    fn engine_with_fixture(sql: &str, response: Value) -> ExecutionEngine {
        let db = StaticQueryTargetDatabase::new("sqlite").with_fixture(sql, response);
        ExecutionEngine::new(
            ExecutionEngineConfig::default(),
            ValidatorConfig::default(),
            TenantRewriteSettings::default(),
            Arc::new(db),
            Arc::new(NullToolInvoker),
            Arc::new(InMemoryTelemetryBackend::new()),
        )
    }

    #[tokio::test]
    async fn happy_path_returns_query_result() {
        let sql = "SELECT 1 AS value";
        let engine = engine_with_fixture(
            sql,
            serde_json::json!({
                "schema_version": "1.0",
                "rows": [{"value": 1}],
                "metadata": {"rows_returned": 1, "is_truncated": false}
            }),
        );
        let mut state = AgentState::new("show one sample row", None);
        state.from_cache = true;
        state.current_sql = Some(sql.to_string());

        let outcome = engine.execute(&state).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.query_result.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn policy_violation_short_circuits_without_dispatch() {
        let engine = engine_with_fixture("unused", Value::Null);
        let mut state = AgentState::new("drop the table", None);
        state.current_sql = Some("DROP TABLE customer".to_string());

        let outcome = engine.execute(&state).await;
        assert_eq!(outcome.error_category.as_deref(), Some("SECURITY_POLICY_VIOLATION"));
        assert!(outcome.query_result.is_none());
    }

    #[tokio::test]
    async fn timeout_gate_fires_before_dispatch() {
        let engine = engine_with_fixture("unused", Value::Null);
        let mut state = AgentState::new("q", Some(1));
        state.current_sql = Some("SELECT 1".to_string());
        state.deadline_ts = Some(ExecutionEngine::now_unix() - 10.0);

        let outcome = engine.execute(&state).await;
        assert_eq!(outcome.error_category.as_deref(), Some("DB_TIMEOUT"));
    }

    #[tokio::test]
    async fn pathological_empty_pages_stop_auto_pagination() {
        let sql = "SELECT o.tenant_id, o.id FROM orders o WHERE o.tenant_id = ?";
        let db = StaticQueryTargetDatabase::new("sqlite").with_fixture(
            sql,
            serde_json::json!({
                "schema_version": "1.0",
                "rows": [],
                "metadata": {"rows_returned": 0, "is_truncated": false, "next_page_token": "t1"}
            }),
        );
        let engine = ExecutionEngine::new(
            ExecutionEngineConfig::default(),
            ValidatorConfig::default(),
            TenantRewriteSettings::default(),
            Arc::new(db),
            Arc::new(NullToolInvoker),
            Arc::new(InMemoryTelemetryBackend::new()),
        );

        let envelope = ToolResponseEnvelope::parse(&serde_json::json!({
            "schema_version": "1.0",
            "rows": [],
            "metadata": {"rows_returned": 0, "is_truncated": false, "next_page_token": "t1"}
        }))
        .unwrap();

        let mut state = AgentState::new("q", Some(1));
        state.current_sql = Some(sql.to_string());

        let (rows, completeness) = engine.run_auto_pagination(&state, sql, "1", &[], envelope, 0).await;
        assert!(rows.is_empty());
        assert_eq!(
            completeness.auto_pagination_stopped_reason.as_deref(),
            Some("PATHOLOGICAL_EMPTY_PAGES")
        );
    }
}
