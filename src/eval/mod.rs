//! Evaluation runner (C7): structural and value-aware SQL comparison
//! against a golden dataset, with regression detection against a baseline.

pub mod metrics;
pub mod metrics_v2;
pub mod runner;

pub use metrics::{MetricSuiteV1, StructuralScores};
pub use metrics_v2::MetricSuiteV2;
pub use runner::{EvalCase, EvalRunner, EvalSummary, RegressionVerdict};
