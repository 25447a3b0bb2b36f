//! Telemetry spine (C4): hierarchical spans with sticky context inheritance,
//! bounded/redacted attributes, and contract validation.
//!
//! `TelemetryBackend`/`TelemetrySpan` are interfaces (§9 "deep inheritance
//! -> interfaces"); concrete implementations are selected by configuration,
//! never subclassed.

pub mod backend;
pub mod context;
pub mod span;

pub use backend::{InMemoryTelemetryBackend, RecordedSpan, TelemetryBackend};
pub use context::{SpanGuard, TelemetryContext};
pub use span::{EnforcementLevel, SpanType, TelemetrySpan};
