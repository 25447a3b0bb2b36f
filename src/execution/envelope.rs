//! The wire contract between the execution engine and DAL tools (§6).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub db_type: Option<String>,
    pub nullable: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteSqlQueryMetadata {
    pub rows_returned: u64,
    pub is_truncated: bool,
    pub row_limit: Option<u64>,
    pub next_page_token: Option<String>,
    pub partial_reason: Option<String>,
    pub capability_required: Option<String>,
    pub capability_supported: Option<bool>,
    pub fallback_policy: Option<String>,
    pub fallback_applied: Option<bool>,
    pub fallback_mode: Option<String>,
    pub cap_detected: Option<bool>,
    pub cap_mitigation_applied: Option<bool>,
    pub cap_mitigation_mode: Option<String>,
    pub provider: Option<String>,
    pub execution_time_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorPayload {
    pub message: String,
    pub category: String,
    pub provider: String,
    pub code: Option<String>,
    pub error_code: Option<String>,
    pub retry_after_seconds: Option<f64>,
    pub is_retryable: bool,
    pub required_capability: Option<String>,
    pub capability_supported: Option<bool>,
    pub fallback_policy: Option<String>,
    pub fallback_applied: Option<bool>,
    pub fallback_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponseEnvelope {
    pub schema_version: String,
    pub rows: Vec<HashMap<String, Value>>,
    pub columns: Option<Vec<ColumnMeta>>,
    pub metadata: ExecuteSqlQueryMetadata,
    pub error: Option<ToolErrorPayload>,
}

/// Deserialization/contract failures distinct from the tool's own reported
/// `error` field: the payload itself doesn't match the envelope shape.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed tool response: {0}")]
    Malformed(String),

    #[error("unsupported schema_version major: {found}, expected {expected}")]
    SchemaVersionMismatch { found: String, expected: String },
}

impl ToolResponseEnvelope {
    const SUPPORTED_MAJOR: &'static str = "1";

    /// Parse and validate a raw tool payload. `schema_version`'s major
    /// component must match; anything else is accepted (semver-compatible
    /// minor/patch bumps are forwards-compatible by construction).
    pub fn parse(raw: &Value) -> Result<Self, EnvelopeError> {
        let envelope: ToolResponseEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        let major = envelope
            .schema_version
            .split('.')
            .next()
            .unwrap_or(&envelope.schema_version);
        if major != Self::SUPPORTED_MAJOR {
            return Err(EnvelopeError::SchemaVersionMismatch {
                found: envelope.schema_version.clone(),
                expected: format!("{}.x", Self::SUPPORTED_MAJOR),
            });
        }

        Ok(envelope)
    }

    /// Wrap a bare row list into a minimal envelope. Used only behind
    /// `AGENT_ENABLE_LEGACY_TOOL_SHIM`.
    pub fn from_legacy_rows(rows: Vec<HashMap<String, Value>>) -> Self {
        let rows_returned = rows.len() as u64;
        Self {
            schema_version: "1.0".to_string(),
            rows,
            columns: None,
            metadata: ExecuteSqlQueryMetadata {
                rows_returned,
                is_truncated: false,
                ..Default::default()
            },
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_envelope() {
        let raw = serde_json::json!({
            "schema_version": "1.0",
            "rows": [{"value": 1}],
            "metadata": {"rows_returned": 1, "is_truncated": false}
        });
        let parsed = ToolResponseEnvelope::parse(&raw).unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.metadata.rows_returned, 1);
    }

    #[test]
    fn rejects_major_version_mismatch() {
        let raw = serde_json::json!({
            "schema_version": "2.0",
            "rows": [],
            "metadata": {"rows_returned": 0, "is_truncated": false}
        });
        let err = ToolResponseEnvelope::parse(&raw).unwrap_err();
        assert!(matches!(err, EnvelopeError::SchemaVersionMismatch { .. }));
    }

    #[test]
    fn legacy_shim_wraps_bare_rows() {
        let mut row = HashMap::new();
        row.insert("value".to_string(), Value::from(1));
        let envelope = ToolResponseEnvelope::from_legacy_rows(vec![row]);
        assert_eq!(envelope.metadata.rows_returned, 1);
        assert!(envelope.error.is_none());
    }
}
