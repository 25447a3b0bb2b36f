//! Data-access-layer interfaces. Concrete drivers (Postgres, SQLite,
//! BigQuery, ...) live outside this crate, behind a capability-typed
//! connection interface (§1 "out of scope, interfaces only"; §9 "deep
//! inheritance -> interfaces").

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// A single logical invocation of the `execute_sql_query` tool, as issued
/// by the execution engine to whatever transport (in-process call, RPC,
/// subprocess) fronts the target database.
#[derive(Debug, Clone)]
pub struct ExecuteSqlQueryRequest {
    pub sql: String,
    pub tenant_id: Option<String>,
    pub params: Vec<Value>,
    pub include_columns: bool,
    pub timeout_seconds: f64,
    pub page_token: Option<String>,
    pub page_size: Option<u64>,
}

/// The tool-call boundary the execution engine dispatches through. A
/// thin async interface so the engine never depends on a specific
/// transport (gRPC, in-process function, subprocess).
#[async_trait]
pub trait AsyncQueryExecutor: Send + Sync {
    async fn execute_sql_query(&self, request: ExecuteSqlQueryRequest) -> crate::error::Result<Value>;
}

/// Capability flags a concrete query-target backend advertises, consulted
/// by the execution engine's capability/fallback handling and by the
/// keyset module's federated-topology guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTopology {
    Single,
    Federated,
}

#[derive(Debug, Clone)]
pub struct BackendCapabilities {
    pub topology: BackendTopology,
    pub supports_keyset_pagination: bool,
    pub supports_offset_pagination: bool,
    pub deterministic_ordering_across_partitions: bool,
}

/// The capability-typed connection interface a query-target database
/// implements. `AsyncQueryExecutor` is the per-call RPC boundary;
/// `QueryTargetDatabase` additionally exposes pool lifecycle and
/// capability introspection used by the orchestrator/execution engine at
/// setup time and by the keyset federated-topology guard.
#[async_trait]
pub trait QueryTargetDatabase: AsyncQueryExecutor {
    fn provider_name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Backend-set signature: changes when the set of physical partitions
    /// backing a federated query changes, invalidating outstanding keyset
    /// cursors (`PAGINATION_BACKEND_SET_CHANGED`).
    async fn backend_set_signature(&self) -> crate::error::Result<Option<String>>;
}

/// In-memory `QueryTargetDatabase` used by tests: serves fixed rows for a
/// given SQL string, ignoring params.
pub struct StaticQueryTargetDatabase {
    provider: String,
    fixtures: HashMap<String, Value>,
}

impl StaticQueryTargetDatabase {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            fixtures: HashMap::new(),
        }
    }

    pub fn with_fixture(mut self, sql: impl Into<String>, response: Value) -> Self {
        self.fixtures.insert(sql.into(), response);
        self
    }
}

#[async_trait]
impl AsyncQueryExecutor for StaticQueryTargetDatabase {
    async fn execute_sql_query(&self, request: ExecuteSqlQueryRequest) -> crate::error::Result<Value> {
        self.fixtures
            .get(&request.sql)
            .cloned()
            .ok_or_else(|| crate::error::Error::execution(
                crate::error::ErrorCode::Unknown,
                format!("no fixture registered for sql: {}", request.sql),
            ))
    }
}

#[async_trait]
impl QueryTargetDatabase for StaticQueryTargetDatabase {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            topology: BackendTopology::Single,
            supports_keyset_pagination: true,
            supports_offset_pagination: true,
            deterministic_ordering_across_partitions: true,
        }
    }

    async fn backend_set_signature(&self) -> crate::error::Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_database_serves_registered_fixture() {
        let db = StaticQueryTargetDatabase::new("sqlite").with_fixture(
            "SELECT 1",
            serde_json::json!({"schema_version": "1.0", "rows": [{"value": 1}], "metadata": {"rows_returned": 1, "is_truncated": false}}),
        );
        let response = db
            .execute_sql_query(ExecuteSqlQueryRequest {
                sql: "SELECT 1".to_string(),
                tenant_id: None,
                params: vec![],
                include_columns: false,
                timeout_seconds: 5.0,
                page_token: None,
                page_size: None,
            })
            .await
            .unwrap();
        assert_eq!(response["rows"][0]["value"], 1);
    }

    #[tokio::test]
    async fn missing_fixture_is_an_error() {
        let db = StaticQueryTargetDatabase::new("sqlite");
        let result = db
            .execute_sql_query(ExecuteSqlQueryRequest {
                sql: "SELECT 2".to_string(),
                tenant_id: None,
                params: vec![],
                include_columns: false,
                timeout_seconds: 5.0,
                page_token: None,
                page_size: None,
            })
            .await;
        assert!(result.is_err());
    }
}
