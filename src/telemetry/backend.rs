//! Telemetry backend interface, with an OTLP-exporting production backend
//! and an in-memory backend for tests and offline evaluation runs.

use super::context::{SpanGuard, TelemetryContext};
use super::span::{SpanType, TelemetrySpan};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A span that has been closed, retained for assertions in tests and for
/// offline evaluation-run analysis.
#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub span: TelemetrySpan,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
}

#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    fn configure(&self, service_name: &str);

    /// Start a span as a scoped acquisition. The returned guard releases
    /// the span (recording it and restoring the parent context) on drop,
    /// including on the panic/error unwind path.
    fn start_span(
        &self,
        name: &str,
        kind: SpanType,
        inputs: Option<HashMap<String, Value>>,
        attributes: Option<HashMap<String, Value>>,
    ) -> (Arc<Mutex<TelemetrySpan>>, SpanGuard);

    fn update_current_trace(&self, attributes: HashMap<String, Value>);

    fn capture_context(&self) -> TelemetryContext;

    fn use_context(&self, context: TelemetryContext) -> SpanGuard;

    fn get_current_span(&self) -> Option<Arc<Mutex<TelemetrySpan>>>;

    fn get_current_trace_id(&self) -> Option<String>;

    async fn flush(&self);
}

struct BackendState {
    current_context: Option<TelemetryContext>,
    current_span: Option<Arc<Mutex<TelemetrySpan>>>,
    trace_attributes: HashMap<String, Value>,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            current_context: None,
            current_span: None,
            trace_attributes: HashMap::new(),
        }
    }
}

/// In-memory backend: the default for tests and offline evaluation runs.
/// Closed spans are retained in `recorded()` for inspection.
///
/// Internal state lives behind `Arc<Mutex<_>>` rather than bare `Mutex<_>`
/// so that `start_span`'s release closure can hold its own owned handles
/// instead of borrowing `self`, keeping the guard genuinely `'static`.
pub struct InMemoryTelemetryBackend {
    state: Arc<Mutex<BackendState>>,
    recorded: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl InMemoryTelemetryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
            recorded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn recorded(&self) -> Vec<RecordedSpan> {
        self.recorded.lock().expect("recorded lock poisoned").clone()
    }
}

impl Default for InMemoryTelemetryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryBackend for InMemoryTelemetryBackend {
    fn configure(&self, _service_name: &str) {}

    fn start_span(
        &self,
        name: &str,
        kind: SpanType,
        inputs: Option<HashMap<String, Value>>,
        attributes: Option<HashMap<String, Value>>,
    ) -> (Arc<Mutex<TelemetrySpan>>, SpanGuard) {
        let mut state = self.state.lock().expect("state lock poisoned");

        let parent_context = state.current_context.clone();
        let trace_id = parent_context
            .as_ref()
            .map(|c| c.trace_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let span_id = Uuid::new_v4().simple().to_string();
        let parent_span_id = parent_context.as_ref().map(|c| c.span_id.clone());

        let sticky = parent_context
            .as_ref()
            .map(|c| c.sticky_snapshot())
            .unwrap_or_default();

        let new_context = match &parent_context {
            Some(parent) => parent.child(span_id.clone()),
            None => TelemetryContext::new(trace_id.clone(), span_id.clone()),
        };

        let mut span = TelemetrySpan::new(name, kind, sticky);
        span.set_seq_counter(new_context.seq_counter());
        if let Some(inputs) = inputs {
            span.set_inputs(inputs);
        }
        if let Some(attrs) = attributes {
            span.set_attributes(attrs);
        }

        let previous_context = state.current_context.replace(new_context);
        let span_handle = Arc::new(Mutex::new(span));
        let previous_span = state.current_span.replace(span_handle.clone());

        drop(state);

        let state_handle = self.state.clone();
        let recorded_handle = self.recorded.clone();
        let span_for_guard = span_handle.clone();
        let span_id_for_guard = span_id.clone();

        let guard = SpanGuard::new(move || {
            let mut st = state_handle.lock().expect("state lock poisoned");
            st.current_context = previous_context;
            st.current_span = previous_span;
            drop(st);

            let mut finished = span_for_guard.lock().expect("span lock poisoned").clone();
            let _ = finished.validate_span_contract();
            recorded_handle.lock().expect("recorded lock poisoned").push(RecordedSpan {
                span: finished,
                trace_id,
                span_id: span_id_for_guard,
                parent_span_id,
            });
        });

        (span_handle, guard)
    }

    fn update_current_trace(&self, attributes: HashMap<String, Value>) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.trace_attributes.extend(attributes);
    }

    fn capture_context(&self) -> TelemetryContext {
        let state = self.state.lock().expect("state lock poisoned");
        state
            .current_context
            .clone()
            .unwrap_or_else(|| TelemetryContext::new(Uuid::new_v4().simple().to_string(), "root"))
    }

    fn use_context(&self, context: TelemetryContext) -> SpanGuard {
        let mut state = self.state.lock().expect("state lock poisoned");
        let previous = state.current_context.replace(context);
        drop(state);

        let state_handle = self.state.clone();
        SpanGuard::new(move || {
            state_handle.lock().expect("state lock poisoned").current_context = previous;
        })
    }

    fn get_current_span(&self) -> Option<Arc<Mutex<TelemetrySpan>>> {
        self.state.lock().expect("state lock poisoned").current_span.clone()
    }

    fn get_current_trace_id(&self) -> Option<String> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .current_context
            .as_ref()
            .map(|c| c.trace_id.clone())
    }

    async fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_spans_share_trace_id_and_link_parent() {
        let backend = InMemoryTelemetryBackend::new();
        let (_outer_span, outer_guard) = backend.start_span("outer", SpanType::Node, None, None);
        let (_inner_span, inner_guard) = backend.start_span("inner", SpanType::Tool, None, None);
        drop(inner_guard);
        drop(outer_guard);

        let recorded = backend.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].span.name, "inner");
        assert_eq!(recorded[1].span.name, "outer");
        assert_eq!(recorded[0].trace_id, recorded[1].trace_id);
        assert_eq!(recorded[0].parent_span_id.as_deref(), Some(recorded[1].span_id.as_str()));
    }

    #[test]
    fn sibling_spans_share_one_monotone_event_sequence() {
        let backend = InMemoryTelemetryBackend::new();
        let (outer_span, outer_guard) = backend.start_span("outer", SpanType::Node, None, None);
        outer_span.lock().unwrap().add_event("outer.start", HashMap::new());

        let (first_child, first_guard) = backend.start_span("child_a", SpanType::Tool, None, None);
        first_child.lock().unwrap().add_event("child_a.event", HashMap::new());
        drop(first_guard);

        let (second_child, second_guard) = backend.start_span("child_b", SpanType::Tool, None, None);
        second_child.lock().unwrap().add_event("child_b.event", HashMap::new());
        drop(second_guard);

        outer_span.lock().unwrap().add_event("outer.end", HashMap::new());
        drop(outer_guard);

        let recorded = backend.recorded();
        let seq_for = |span_name: &str, event_name: &str| {
            recorded
                .iter()
                .find(|r| r.span.name == span_name)
                .unwrap()
                .span
                .events
                .iter()
                .find(|e| e.name == event_name)
                .unwrap()
                .seq
        };

        let seqs = [
            seq_for("outer", "outer.start"),
            seq_for("child_a", "child_a.event"),
            seq_for("child_b", "child_b.event"),
            seq_for("outer", "outer.end"),
        ];
        let mut sorted = seqs.to_vec();
        sorted.sort_unstable();
        assert_eq!(seqs.to_vec(), sorted, "events across sibling spans should be strictly increasing in recorded order");
        assert_eq!(seqs.iter().collect::<std::collections::HashSet<_>>().len(), 4, "seq numbers must be unique across the lineage");
    }

    #[test]
    fn context_round_trips_through_capture_and_use() {
        let backend = InMemoryTelemetryBackend::new();
        let (_span, guard) = backend.start_span("a", SpanType::Node, None, None);
        let captured = backend.capture_context();
        drop(guard);

        assert!(backend.get_current_trace_id().is_none());
        let restore_guard = backend.use_context(captured.clone());
        assert_eq!(backend.get_current_trace_id(), Some(captured.trace_id));
        drop(restore_guard);
    }
}
