//! Crate-wide error taxonomy for the text2sql agent core.
//!
//! Every component boundary (validator, rewriter, keyset codec, execution
//! engine, orchestrator) maps its internal failure type onto one variant
//! here via `From` or a constructor helper, so `?` composes across seams
//! while still letting callers recover the canonical `error_code`.

use thiserror::Error;

/// Result type alias using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical error codes from the taxonomy. Carried alongside [`Error`] so
/// that API responses and telemetry attributes can surface a stable string
/// without matching on the full enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SecurityPolicyViolation,
    SyntaxError,
    RestrictedTable,
    ForbiddenCommand,
    ComplexityLimit,
    SensitiveColumn,
    ColumnAllowlist,
    ValidationError,
    TenantEnforcementUnsupported,
    DbTimeout,
    Transient,
    UnsupportedCapability,
    Connectivity,
    Auth,
    ResourceExhausted,
    Unknown,
    PaginationFederatedOrderingUnsafe,
    PaginationFederatedUnsupported,
    PaginationBackendSetChanged,
    KeysetRequiresStableTiebreaker,
    KeysetTiebreakerNullable,
    KeysetTiebreakerNotUnique,
    KeysetOrderMismatch,
    KeysetOrderColumnNotFound,
    #[serde(rename = "tool_response_malformed")]
    ToolResponseMalformed,
    SystemCrash,
    LlmBudgetExceeded,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecurityPolicyViolation => "SECURITY_POLICY_VIOLATION",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::RestrictedTable => "RESTRICTED_TABLE",
            Self::ForbiddenCommand => "FORBIDDEN_COMMAND",
            Self::ComplexityLimit => "COMPLEXITY_LIMIT",
            Self::SensitiveColumn => "SENSITIVE_COLUMN",
            Self::ColumnAllowlist => "COLUMN_ALLOWLIST",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::TenantEnforcementUnsupported => "TENANT_ENFORCEMENT_UNSUPPORTED",
            Self::DbTimeout => "DB_TIMEOUT",
            Self::Transient => "TRANSIENT",
            Self::UnsupportedCapability => "UNSUPPORTED_CAPABILITY",
            Self::Connectivity => "CONNECTIVITY",
            Self::Auth => "AUTH",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Unknown => "UNKNOWN",
            Self::PaginationFederatedOrderingUnsafe => "PAGINATION_FEDERATED_ORDERING_UNSAFE",
            Self::PaginationFederatedUnsupported => "PAGINATION_FEDERATED_UNSUPPORTED",
            Self::PaginationBackendSetChanged => "PAGINATION_BACKEND_SET_CHANGED",
            Self::KeysetRequiresStableTiebreaker => "KEYSET_REQUIRES_STABLE_TIEBREAKER",
            Self::KeysetTiebreakerNullable => "KEYSET_TIEBREAKER_NULLABLE",
            Self::KeysetTiebreakerNotUnique => "KEYSET_TIEBREAKER_NOT_UNIQUE",
            Self::KeysetOrderMismatch => "KEYSET_ORDER_MISMATCH",
            Self::KeysetOrderColumnNotFound => "KEYSET_ORDER_COLUMN_NOT_FOUND",
            Self::ToolResponseMalformed => "tool_response_malformed",
            Self::SystemCrash => "SYSTEM_CRASH",
            Self::LlmBudgetExceeded => "LLM_BUDGET_EXCEEDED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur anywhere in the text2sql core.
#[derive(Error, Debug)]
pub enum Error {
    /// SQL failed to parse, or parsed to a shape this crate does not handle.
    #[error("SQL parse error: {0}")]
    SqlParse(String),

    /// AST validator rejected the query. Carries the canonical code and a
    /// user-safe message; raw violation detail lives alongside, not here.
    #[error("security policy violation ({code}): {message}")]
    PolicyViolation { code: ErrorCode, message: String },

    /// Tenant rewriter could not produce a rewrite for this query shape.
    /// The message is always the generic, sanitized phrasing — see
    /// `sql::tenant_rewriter::sanitize_failure_detail`.
    #[error("tenant isolation is not supported for this provider: {message}")]
    TenantRewriteUnsupported { message: String },

    /// Keyset cursor encode/decode/validation failure.
    #[error("keyset pagination error ({code}): {message}")]
    Keyset { code: ErrorCode, message: String },

    /// Execution engine classified a tool-reported failure.
    #[error("execution error ({code}): {message}")]
    Execution {
        code: ErrorCode,
        message: String,
        retryable: bool,
        retry_after_seconds: Option<f64>,
    },

    /// The DAL tool returned a payload that does not match the envelope
    /// contract and no legacy shim applied.
    #[error("tool response malformed (trace_id={trace_id:?})")]
    ToolResponseMalformed { trace_id: Option<String> },

    /// Interaction persistence failed in fail-closed mode.
    #[error("interaction persistence failed: {0}")]
    Persistence(String),

    /// LLM token budget was exhausted before a required completion.
    #[error("LLM budget exceeded: {0}")]
    LlmBudgetExceeded(String),

    /// Uncaught failure inside a workflow node; mapped to SYSTEM_CRASH.
    #[error("system crash: {0}")]
    SystemCrash(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sqlite storage error (registry, semantic cache).
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error (invalid env value that could not be defaulted).
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out after {remaining_ms}ms remaining")]
    Timeout { remaining_ms: i64 },

    /// Internal invariant violated; should not occur outside tests/debug
    /// invariant checks, but is a typed variant rather than a panic so
    /// callers can decide how to surface it.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    pub fn policy_violation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::PolicyViolation {
            code,
            message: message.into(),
        }
    }

    pub fn tenant_rewrite_unsupported(message: impl Into<String>) -> Self {
        Self::TenantRewriteUnsupported {
            message: message.into(),
        }
    }

    pub fn keyset(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Keyset {
            code,
            message: message.into(),
        }
    }

    pub fn execution(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Execution {
            code,
            message: message.into(),
            retryable: false,
            retry_after_seconds: None,
        }
    }

    pub fn execution_retryable(
        code: ErrorCode,
        message: impl Into<String>,
        retry_after_seconds: Option<f64>,
    ) -> Self {
        Self::Execution {
            code,
            message: message.into(),
            retryable: true,
            retry_after_seconds,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The canonical `error_code` this error maps to, for telemetry
    /// attributes and API responses.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SqlParse(_) => ErrorCode::SyntaxError,
            Self::PolicyViolation { code, .. } => *code,
            Self::TenantRewriteUnsupported { .. } => ErrorCode::TenantEnforcementUnsupported,
            Self::Keyset { code, .. } => *code,
            Self::Execution { code, .. } => *code,
            Self::ToolResponseMalformed { .. } => ErrorCode::ToolResponseMalformed,
            Self::Persistence(_) => ErrorCode::SystemCrash,
            Self::LlmBudgetExceeded(_) => ErrorCode::LlmBudgetExceeded,
            Self::SystemCrash(_) => ErrorCode::SystemCrash,
            Self::Serialization(_) => ErrorCode::Unknown,
            Self::Storage(_) => ErrorCode::Unknown,
            Self::Config(_) => ErrorCode::Unknown,
            Self::Timeout { .. } => ErrorCode::DbTimeout,
            Self::Internal(_) => ErrorCode::Unknown,
        }
    }

    /// Whether the originating failure is safe to retry under the
    /// correction loop's `retry_count < MAX_CORRECTION_ROUNDS` policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trips_through_serde() {
        let code = ErrorCode::KeysetTiebreakerNullable;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"KEYSET_TIEBREAKER_NULLABLE\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), code.as_str());
    }

    #[test]
    fn execution_error_carries_retryability() {
        let err = Error::execution_retryable(ErrorCode::Transient, "pool exhausted", Some(1.5));
        assert!(err.is_retryable());
        assert_eq!(err.code(), ErrorCode::Transient);
    }

    #[test]
    fn policy_violation_is_not_retryable() {
        let err = Error::policy_violation(ErrorCode::ForbiddenCommand, "DROP rejected");
        assert!(!err.is_retryable());
    }
}
