//! # text2sql-core
//!
//! Core runtime for a tenant-scoped text-to-SQL agent. This crate owns the
//! parts of the system that must be correct and deterministic: SQL
//! validation, tenant-scoped predicate injection, keyset pagination,
//! telemetry, tool-mediated execution, workflow orchestration, evaluation
//! metrics, and few-shot recommendation/registry persistence.
//!
//! The LLM client, schema retriever, and concrete DAL drivers are external
//! collaborators; this crate only defines the interfaces it needs from them
//! (see [`llm`], [`schema`], [`execution::dal`]).

pub mod config;
pub mod error;
pub mod eval;
pub mod execution;
pub mod llm;
pub mod orchestrator;
pub mod registry;
pub mod schema;
pub mod sql;
pub mod state;
pub mod telemetry;

pub use error::{Error, ErrorCode, Result};

pub use state::{AgentState, ResultCompleteness};

pub use sql::keyset::{
    append_keyset_predicate, build_strictly_after_predicate, decode_keyset_cursor,
    encode_keyset_cursor, extract_keyset_order_keys, KeysetCursorPayload, KeysetOrderKey,
    KeysetPredicate, SchemaInfoProvider, StaticSchemaInfoProvider,
};
pub use sql::tenant_rewriter::{
    RewriteFailure, RewriteRequest, RewriteSuccess, TenantRewriteSettings, TenantRewriter,
    TransformerErrorKind,
};
pub use sql::validator::{
    AstValidationResult, AstValidator, SecurityViolation, SqlMetadata, ValidationMode,
    ViolationType,
};

pub use telemetry::{
    InMemoryTelemetryBackend, SpanGuard, SpanType, TelemetryBackend, TelemetryContext,
    TelemetrySpan,
};

pub use execution::{ExecutionEngine, ExecutionEngineConfig, ToolInvoker};
pub use execution::envelope::{
    EnvelopeError, ExecuteSqlQueryMetadata, ToolResponseEnvelope,
};
pub use execution::prefetch::PrefetchManager;

pub use orchestrator::{
    AgentGraph, CheckpointStore, InMemoryCheckpointer, NodeName, WorkflowConfig,
};

pub use eval::metrics::{MetricSuiteV1, StructuralScores};
pub use eval::metrics_v2::MetricSuiteV2;
pub use eval::runner::{EvalCase, EvalRunner, EvalSummary, RegressionVerdict};

pub use registry::{QueryPair, QueryPairRole, QueryPairStatus, RegistryStore, SqliteRegistryStore};
pub use registry::recommend::{
    Explanation, RecommendationInputs, RecommendationService, RecommendedExample,
};
