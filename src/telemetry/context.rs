//! Context propagation: capture/serialize/deserialize sticky metadata and
//! tracing context for cross-process and cross-node continuity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Context-local sticky metadata bag. Siblings share a parent's cell so a
/// counter (`event.seq`) can be coordinated; children always receive a
/// fresh copy so writes never leak upward (§9 "mutable state shared across
/// siblings").
#[derive(Clone)]
pub struct TelemetryContext {
    pub trace_id: String,
    pub span_id: String,
    sticky: Arc<Mutex<HashMap<String, Value>>>,
    seq_counter: Arc<Mutex<u64>>,
}

impl TelemetryContext {
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            sticky: Arc::new(Mutex::new(HashMap::new())),
            seq_counter: Arc::new(Mutex::new(0)),
        }
    }

    /// A child context: same trace, new span id, an independent copy of
    /// sticky metadata, and the parent's `seq_counter` cell so events
    /// recorded by this lineage's spans stay in one monotone sequence.
    pub fn child(&self, span_id: impl Into<String>) -> Self {
        let sticky = self.sticky.lock().expect("sticky metadata lock poisoned").clone();
        Self {
            trace_id: self.trace_id.clone(),
            span_id: span_id.into(),
            sticky: Arc::new(Mutex::new(sticky)),
            seq_counter: self.seq_counter.clone(),
        }
    }

    /// The shared cell spans started under this context should draw their
    /// `event.seq` numbers from.
    pub fn seq_counter(&self) -> Arc<Mutex<u64>> {
        self.seq_counter.clone()
    }

    pub fn set_sticky(&self, key: impl Into<String>, value: Value) {
        self.sticky
            .lock()
            .expect("sticky metadata lock poisoned")
            .insert(key.into(), value);
    }

    pub fn sticky_snapshot(&self) -> HashMap<String, Value> {
        self.sticky.lock().expect("sticky metadata lock poisoned").clone()
    }

    /// Serialize to a wire-safe map: W3C-style trace headers plus
    /// `_sticky_metadata`.
    pub fn serialize(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("traceparent".to_string(), Value::String(format!(
            "00-{}-{}-01",
            self.trace_id, self.span_id
        )));
        map.insert(
            "_sticky_metadata".to_string(),
            serde_json::to_value(self.sticky_snapshot()).unwrap_or(Value::Null),
        );
        Value::Object(map)
    }

    pub fn deserialize(value: &Value) -> Option<Self> {
        let traceparent = value.get("traceparent")?.as_str()?;
        let parts: Vec<&str> = traceparent.split('-').collect();
        if parts.len() != 4 {
            return None;
        }
        let ctx = Self::new(parts[1].to_string(), parts[2].to_string());
        if let Some(sticky) = value.get("_sticky_metadata").and_then(|v| v.as_object()) {
            for (k, v) in sticky {
                ctx.set_sticky(k.clone(), v.clone());
            }
        }
        Some(ctx)
    }
}

/// RAII guard: attaches a context on construction, detaches on drop. Used
/// both for span scopes and for `use_context` propagation scopes.
pub struct SpanGuard {
    restore: Option<Box<dyn FnOnce() + Send>>,
}

impl SpanGuard {
    pub fn new(restore: impl FnOnce() + Send + 'static) -> Self {
        Self {
            restore: Some(Box::new(restore)),
        }
    }

    pub fn noop() -> Self {
        Self { restore: None }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_context_copies_do_not_leak_upward() {
        let parent = TelemetryContext::new("trace-1", "span-1");
        parent.set_sticky("a", Value::from(1));

        let child = parent.child("span-2");
        child.set_sticky("b", Value::from(2));

        assert!(parent.sticky_snapshot().get("b").is_none());
        assert_eq!(child.sticky_snapshot().get("a"), Some(&Value::from(1)));
    }

    #[test]
    fn serialize_round_trips() {
        let ctx = TelemetryContext::new("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbbb");
        ctx.set_sticky("tenant_id", Value::from(7));
        let wire = ctx.serialize();
        let restored = TelemetryContext::deserialize(&wire).unwrap();
        assert_eq!(restored.trace_id, ctx.trace_id);
        assert_eq!(restored.sticky_snapshot().get("tenant_id"), Some(&Value::from(7)));
    }

    #[test]
    fn guard_restores_on_drop() {
        let restored = Arc::new(Mutex::new(false));
        let flag = restored.clone();
        {
            let _guard = SpanGuard::new(move || {
                *flag.lock().unwrap() = true;
            });
            assert!(!*restored.lock().unwrap());
        }
        assert!(*restored.lock().unwrap());
    }
}
