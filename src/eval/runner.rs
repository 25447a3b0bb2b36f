//! Golden-dataset runner (§4.7): drives a SQL generator over a JSONL
//! dataset, scores each case with [`MetricSuiteV2`], and compares the
//! aggregate against a baseline summary for regressions.

use super::metrics::MetricSuiteV1;
use super::metrics_v2::MetricSuiteV2;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single golden-dataset row: at least `question` and `expected_sql`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvalCase {
    pub case_id: Option<String>,
    pub question: String,
    pub expected_sql: String,
    pub tenant_id: Option<i64>,
}

/// Per-case outcome: generated SQL (if generation succeeded), latency, and
/// composite/structural scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub case_id: String,
    pub question: String,
    pub expected_sql: String,
    pub actual_sql: Option<String>,
    pub error: Option<String>,
    pub latency_ms: f64,
    pub exact_match: bool,
    pub structural_score: f64,
    pub composite_score: f64,
}

/// The thing under test: anything that can turn a question into SQL.
/// Kept as a narrow interface so the runner does not depend on the full
/// orchestration graph's concrete type.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, question: &str, tenant_id: Option<i64>) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub concurrency: usize,
    pub limit: Option<usize>,
    pub seed: u64,
    pub dialect: String,
    pub accuracy_drop_max: f64,
    pub latency_p95_increase_max: f64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            limit: None,
            seed: 0,
            dialect: "postgres".to_string(),
            accuracy_drop_max: 0.05,
            latency_p95_increase_max: 0.20,
        }
    }
}

/// Aggregate metrics over a run, suitable for writing to `--output-dir` and
/// for use as a future baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalSummary {
    pub run_id: String,
    pub case_count: usize,
    pub exact_match_rate: f64,
    pub avg_structural_score: f64,
    pub min_structural_score: f64,
    pub avg_composite_score: f64,
    pub latency_mean_ms: f64,
    pub latency_p95_ms: f64,
    pub error_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionVerdict {
    pub is_regression: bool,
    pub accuracy_drop: f64,
    pub p95_latency_increase_ratio: f64,
    pub reasons: Vec<String>,
}

pub struct EvalRunner {
    generator: std::sync::Arc<dyn SqlGenerator>,
    config: RunnerConfig,
    v1: MetricSuiteV1,
    v2: MetricSuiteV2,
}

impl EvalRunner {
    pub fn new(generator: std::sync::Arc<dyn SqlGenerator>, config: RunnerConfig) -> Self {
        Self {
            generator,
            config,
            v1: MetricSuiteV1::default(),
            v2: MetricSuiteV2::default(),
        }
    }

    /// Parses a JSONL golden dataset (one [`EvalCase`] per line).
    pub fn parse_dataset(raw: &str) -> Result<Vec<EvalCase>> {
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<EvalCase>(line).map_err(Error::from))
            .collect()
    }

    pub async fn run(&self, run_id: impl Into<String>, mut cases: Vec<EvalCase>) -> (Vec<EvalResult>, EvalSummary) {
        if let Some(limit) = self.config.limit {
            cases.truncate(limit);
        }

        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::with_capacity(cases.len());

        for (index, case) in cases.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let generator = self.generator.clone();
            let dialect = self.config.dialect.clone();
            let v1_weights = MetricSuiteV1::default();
            let v2_weights = MetricSuiteV2::default();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                run_one_case(index, case, generator, &dialect, &v1_weights, &v2_weights).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_error) => tracing::error!(error = %join_error, "eval case task panicked"),
            }
        }

        let summary = self.summarize(run_id.into(), &results);
        (results, summary)
    }

    fn summarize(&self, run_id: String, results: &[EvalResult]) -> EvalSummary {
        let case_count = results.len();
        if case_count == 0 {
            return EvalSummary {
                run_id,
                case_count: 0,
                exact_match_rate: 0.0,
                avg_structural_score: 0.0,
                min_structural_score: 0.0,
                avg_composite_score: 0.0,
                latency_mean_ms: 0.0,
                latency_p95_ms: 0.0,
                error_count: 0,
            };
        }

        let exact_matches = results.iter().filter(|r| r.exact_match).count();
        let structural_scores: Vec<f64> = results.iter().map(|r| r.structural_score).collect();
        let composite_scores: Vec<f64> = results.iter().map(|r| r.composite_score).collect();
        let mut latencies: Vec<f64> = results.iter().map(|r| r.latency_ms).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        EvalSummary {
            run_id,
            case_count,
            exact_match_rate: exact_matches as f64 / case_count as f64,
            avg_structural_score: mean(&structural_scores),
            min_structural_score: structural_scores.iter().cloned().fold(f64::INFINITY, f64::min),
            avg_composite_score: mean(&composite_scores),
            latency_mean_ms: mean(&latencies),
            latency_p95_ms: percentile(&latencies, 0.95),
            error_count: results.iter().filter(|r| r.error.is_some()).count(),
        }
    }

    /// Flags a regression relative to `baseline` per the thresholds in
    /// this runner's config.
    pub fn detect_regression(&self, baseline: &EvalSummary, current: &EvalSummary) -> RegressionVerdict {
        let accuracy_drop = (baseline.avg_composite_score - current.avg_composite_score).max(0.0);
        let p95_latency_increase_ratio = if baseline.latency_p95_ms > 0.0 {
            (current.latency_p95_ms - baseline.latency_p95_ms) / baseline.latency_p95_ms
        } else {
            0.0
        };

        let mut reasons = Vec::new();
        if accuracy_drop > self.config.accuracy_drop_max {
            reasons.push(format!(
                "accuracy dropped {:.1}% (max {:.1}%)",
                accuracy_drop * 100.0,
                self.config.accuracy_drop_max * 100.0
            ));
        }
        if p95_latency_increase_ratio > self.config.latency_p95_increase_max {
            reasons.push(format!(
                "p95 latency increased {:.1}% (max {:.1}%)",
                p95_latency_increase_ratio * 100.0,
                self.config.latency_p95_increase_max * 100.0
            ));
        }

        RegressionVerdict {
            is_regression: !reasons.is_empty(),
            accuracy_drop,
            p95_latency_increase_ratio,
            reasons,
        }
    }
}

async fn run_one_case(
    index: usize,
    case: EvalCase,
    generator: std::sync::Arc<dyn SqlGenerator>,
    dialect: &str,
    v1: &MetricSuiteV1,
    v2: &MetricSuiteV2,
) -> EvalResult {
    let case_id = case.case_id.clone().unwrap_or_else(|| format!("case-{index}"));
    let started = std::time::Instant::now();
    let generated = generator.generate(&case.question, case.tenant_id).await;
    let latency_ms = duration_to_ms(started.elapsed());

    match generated {
        Ok(actual_sql) => {
            let composite = v2.score(&case.expected_sql, &actual_sql, dialect);
            EvalResult {
                case_id,
                question: case.question,
                expected_sql: case.expected_sql,
                actual_sql: Some(actual_sql),
                error: None,
                latency_ms,
                exact_match: composite.structural.exact_match,
                structural_score: composite.structural.composite,
                composite_score: composite.composite,
            }
        }
        Err(e) => {
            let _ = v1;
            EvalResult {
                case_id,
                question: case.question,
                expected_sql: case.expected_sql,
                actual_sql: None,
                error: Some(e.to_string()),
                latency_ms,
                exact_match: false,
                structural_score: 0.0,
                composite_score: 0.0,
            }
        }
    }
}

fn duration_to_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[rank.min(sorted_values.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoGenerator;

    #[async_trait]
    impl SqlGenerator for EchoGenerator {
        async fn generate(&self, question: &str, _tenant_id: Option<i64>) -> Result<String> {
            if question.contains("fail") {
                return Err(Error::Internal("forced failure".to_string()));
            }
            Ok("SELECT id FROM orders".to_string())
        }
    }

    fn case(question: &str, expected_sql: &str) -> EvalCase {
        EvalCase {
            case_id: None,
            question: question.to_string(),
            expected_sql: expected_sql.to_string(),
            tenant_id: None,
        }
    }

    #[test]
    fn parse_dataset_reads_one_case_per_line() {
        let raw = r#"{"question":"q1","expected_sql":"SELECT 1"}
{"question":"q2","expected_sql":"SELECT 2","tenant_id":7}"#;
        let cases = EvalRunner::parse_dataset(raw).unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[1].tenant_id, Some(7));
    }

    #[tokio::test]
    async fn run_scores_matching_and_failing_cases() {
        let runner = EvalRunner::new(std::sync::Arc::new(EchoGenerator), RunnerConfig::default());
        let cases = vec![case("how many orders", "SELECT id FROM orders"), case("please fail this one", "SELECT id FROM orders")];
        let (results, summary) = runner.run("run-1", cases).await;

        assert_eq!(results.len(), 2);
        assert_eq!(summary.error_count, 1);
        assert!(summary.exact_match_rate < 1.0 && summary.exact_match_rate > 0.0);
    }

    #[test]
    fn regression_detector_flags_accuracy_drop() {
        let runner = EvalRunner::new(std::sync::Arc::new(EchoGenerator), RunnerConfig::default());
        let baseline = EvalSummary {
            run_id: "baseline".to_string(),
            case_count: 10,
            exact_match_rate: 0.9,
            avg_structural_score: 0.9,
            min_structural_score: 0.7,
            avg_composite_score: 0.9,
            latency_mean_ms: 100.0,
            latency_p95_ms: 150.0,
            error_count: 0,
        };
        let current = EvalSummary {
            avg_composite_score: 0.80,
            latency_p95_ms: 150.0,
            ..baseline.clone()
        };
        let verdict = runner.detect_regression(&baseline, &current);
        assert!(verdict.is_regression);
    }

    #[test]
    fn regression_detector_allows_small_latency_increase() {
        let runner = EvalRunner::new(std::sync::Arc::new(EchoGenerator), RunnerConfig::default());
        let baseline = EvalSummary {
            run_id: "baseline".to_string(),
            case_count: 10,
            exact_match_rate: 0.9,
            avg_structural_score: 0.9,
            min_structural_score: 0.7,
            avg_composite_score: 0.9,
            latency_mean_ms: 100.0,
            latency_p95_ms: 150.0,
            error_count: 0,
        };
        let current = EvalSummary {
            latency_p95_ms: 160.0,
            ..baseline.clone()
        };
        let verdict = runner.detect_regression(&baseline, &current);
        assert!(!verdict.is_regression);
    }
}
