//! Span contract: attribute redaction/bounding, required-attribute
//! enforcement, and `input.`/`output.` attribute sugar.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const MAX_ATTR_STRING_CHARS: usize = 4096;
const MAX_ATTR_COLLECTION_ITEMS: usize = 256;
const SENSITIVE_KEY_PATTERNS: &[&str] = &["password", "secret", "token", "api_key", "authorization"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanType {
    Node,
    Tool,
    Llm,
    Cache,
    Dal,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementLevel {
    Off,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub seq: u64,
    pub attributes: HashMap<String, Value>,
}

/// A single span. Attributes always pass through [`redact_and_bound`]
/// before being stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySpan {
    pub name: String,
    pub span_type: SpanType,
    pub sticky: HashMap<String, Value>,
    pub attributes: HashMap<String, Value>,
    pub events: Vec<SpanEvent>,
    pub status: SpanStatus,
    pub required_attributes: Vec<String>,
    pub enforcement: EnforcementLevel,
    #[serde(skip, default = "default_seq_counter")]
    seq_counter: Arc<Mutex<u64>>,
}

fn default_seq_counter() -> Arc<Mutex<u64>> {
    Arc::new(Mutex::new(0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
    Unset,
}

impl TelemetrySpan {
    pub fn new(name: impl Into<String>, span_type: SpanType, sticky: HashMap<String, Value>) -> Self {
        Self {
            name: name.into(),
            span_type,
            sticky,
            attributes: HashMap::new(),
            events: Vec::new(),
            status: SpanStatus::Unset,
            required_attributes: Vec::new(),
            enforcement: EnforcementLevel::Off,
            seq_counter: default_seq_counter(),
        }
    }

    pub fn require(mut self, attrs: &[&str], level: EnforcementLevel) -> Self {
        self.required_attributes = attrs.iter().map(|s| s.to_string()).collect();
        self.enforcement = level;
        self
    }

    /// Draw this span's `event.seq` numbers from `counter` instead of its
    /// own, so spans sharing a trace lineage (via [`TelemetryContext::child`])
    /// produce one monotone sequence rather than each restarting at 0.
    pub(crate) fn set_seq_counter(&mut self, counter: Arc<Mutex<u64>>) {
        self.seq_counter = counter;
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        let (redacted, _truncated) = redact_and_bound(&key.into(), value);
        self.attributes.insert(redacted.0, redacted.1);
    }

    pub fn set_attributes(&mut self, attrs: HashMap<String, Value>) {
        for (k, v) in attrs {
            self.set_attribute(k, v);
        }
    }

    pub fn set_inputs(&mut self, inputs: HashMap<String, Value>) {
        for (k, v) in inputs {
            self.set_attribute(format!("input.{k}"), v);
        }
    }

    pub fn set_outputs(&mut self, outputs: HashMap<String, Value>) {
        for (k, v) in outputs {
            self.set_attribute(format!("output.{k}"), v);
        }
    }

    pub fn add_event(&mut self, name: impl Into<String>, attributes: HashMap<String, Value>) {
        let seq = {
            let mut counter = self.seq_counter.lock().expect("seq counter lock poisoned");
            let seq = *counter;
            *counter += 1;
            seq
        };
        self.events.push(SpanEvent {
            name: name.into(),
            seq,
            attributes,
        });
    }

    /// Called on span exit. Returns `Ok(())` unless enforcement is `Error`
    /// and a required attribute is missing.
    pub fn validate_span_contract(&mut self) -> Result<(), String> {
        let missing: Vec<&str> = self
            .required_attributes
            .iter()
            .filter(|a| !self.attributes.contains_key(*a))
            .map(|s| s.as_str())
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        let mut attrs = HashMap::new();
        attrs.insert("missing".to_string(), Value::from(missing.clone()));
        self.add_event("telemetry.contract_violation", attrs);

        match self.enforcement {
            EnforcementLevel::Error => Err(format!(
                "span '{}' missing required attributes: {:?}",
                self.name, missing
            )),
            EnforcementLevel::Warn | EnforcementLevel::Off => Ok(()),
        }
    }
}

/// Redact sensitive keys/values and bound attribute size. Returns the
/// (possibly replaced) key/value pair.
fn redact_and_bound(key: &str, value: Value) -> ((String, Value), bool) {
    let lower_key = key.to_lowercase();
    if SENSITIVE_KEY_PATTERNS.iter().any(|p| lower_key.contains(p)) {
        return ((key.to_string(), Value::String("[REDACTED]".to_string())), false);
    }

    match value {
        Value::String(s) if s.chars().count() > MAX_ATTR_STRING_CHARS => {
            let truncated: String = s.chars().take(MAX_ATTR_STRING_CHARS).collect();
            (
                (key.to_string(), Value::String(format!("{truncated}...[truncated]"))),
                true,
            )
        }
        Value::Array(items) if items.len() > MAX_ATTR_COLLECTION_ITEMS => {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(&items).unwrap_or_default());
            let hash = format!("{:x}", hasher.finalize());
            (
                (
                    key.to_string(),
                    serde_json::json!({ "hash": hash, "size": items.len() }),
                ),
                true,
            )
        }
        other => ((key.to_string(), other), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_attribute_is_redacted() {
        let mut span = TelemetrySpan::new("execute_sql", SpanType::Tool, HashMap::new());
        span.set_attribute("db_password", Value::from("hunter2"));
        assert_eq!(span.attributes["db_password"], Value::from("[REDACTED]"));
    }

    #[test]
    fn long_string_is_truncated() {
        let mut span = TelemetrySpan::new("n", SpanType::Node, HashMap::new());
        span.set_attribute("blob", Value::from("a".repeat(10_000)));
        let stored = span.attributes["blob"].as_str().unwrap();
        assert!(stored.len() < 10_000);
    }

    #[test]
    fn contract_violation_error_level_fails() {
        let mut span = TelemetrySpan::new("execute", SpanType::Tool, HashMap::new())
            .require(&["rows_returned"], EnforcementLevel::Error);
        assert!(span.validate_span_contract().is_err());
        assert_eq!(span.events[0].name, "telemetry.contract_violation");
    }

    #[test]
    fn contract_violation_warn_level_succeeds() {
        let mut span = TelemetrySpan::new("execute", SpanType::Tool, HashMap::new())
            .require(&["rows_returned"], EnforcementLevel::Warn);
        assert!(span.validate_span_contract().is_ok());
    }

    #[test]
    fn event_seq_is_monotone() {
        let mut span = TelemetrySpan::new("n", SpanType::Node, HashMap::new());
        span.add_event("a", HashMap::new());
        span.add_event("b", HashMap::new());
        assert_eq!(span.events[0].seq, 0);
        assert_eq!(span.events[1].seq, 1);
    }
}
