//! Value-aware comparison (MetricSuiteV2, §4.7): layers literal-value
//! proximity on top of [`super::metrics::MetricSuiteV1`]'s structural
//! scores. Each subscore degrades to a neutral value (rather than failing)
//! when the relevant predicate shape is absent from either side, so the
//! composite stays in `[0, 1]` for any pair of parseable queries.

use super::metrics::{jaccard, parse_shape, MetricSuiteV1, StructuralScores};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const NEUTRAL: f64 = 1.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValueAwareScores {
    pub numeric_proximity: f64,
    pub date_proximity: f64,
    pub set_overlap: f64,
    pub equality_match: f64,
    pub limit_distance: f64,
    pub v2_composite: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompositeScores {
    pub structural: StructuralScores,
    pub value_aware: ValueAwareScores,
    pub composite: f64,
}

pub struct MetricSuiteV2 {
    pub v1: MetricSuiteV1,
    pub structural_weight: f64,
    pub value_aware_weight: f64,
}

impl Default for MetricSuiteV2 {
    fn default() -> Self {
        Self {
            v1: MetricSuiteV1::default(),
            structural_weight: 0.6,
            value_aware_weight: 0.4,
        }
    }
}

impl MetricSuiteV2 {
    pub fn score(&self, expected_sql: &str, actual_sql: &str, dialect: &str) -> CompositeScores {
        let structural = self.v1.score(expected_sql, actual_sql, dialect);

        let value_aware = match (parse_shape(expected_sql, dialect), parse_shape(actual_sql, dialect)) {
            (Some(expected), Some(actual)) => {
                let numeric_proximity = numeric_proximity(&expected.numeric_predicates, &actual.numeric_predicates);
                let date_proximity = date_proximity(&expected.date_predicates, &actual.date_predicates);
                let set_overlap = set_overlap(&expected.in_list_values, &actual.in_list_values);
                let equality_match = equality_match(&expected.equality_values, &actual.equality_values);
                let limit_distance = limit_distance(expected.limit, actual.limit);
                let v2_composite = (numeric_proximity + date_proximity + set_overlap + equality_match + limit_distance) / 5.0;
                ValueAwareScores {
                    numeric_proximity,
                    date_proximity,
                    set_overlap,
                    equality_match,
                    limit_distance,
                    v2_composite,
                }
            }
            _ => ValueAwareScores {
                numeric_proximity: NEUTRAL,
                date_proximity: NEUTRAL,
                set_overlap: NEUTRAL,
                equality_match: NEUTRAL,
                limit_distance: NEUTRAL,
                v2_composite: NEUTRAL,
            },
        };

        let composite = structural.composite * self.structural_weight + value_aware.v2_composite * self.value_aware_weight;

        CompositeScores {
            structural,
            value_aware,
            composite,
        }
    }
}

fn numeric_proximity(expected: &[(String, f64)], actual: &[(String, f64)]) -> f64 {
    if expected.is_empty() || actual.is_empty() {
        return NEUTRAL;
    }
    let mut scores = Vec::new();
    for (column, expected_value) in expected {
        if let Some((_, actual_value)) = actual.iter().find(|(c, _)| c == column) {
            let delta = (expected_value - actual_value).abs();
            let scale = expected_value.abs().max(actual_value.abs()).max(1.0);
            scores.push((1.0 - delta / scale).max(0.0));
        }
    }
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

fn date_proximity(expected: &[(String, String)], actual: &[(String, String)]) -> f64 {
    if expected.is_empty() || actual.is_empty() {
        return NEUTRAL;
    }
    let mut scores = Vec::new();
    for (column, expected_value) in expected {
        if let Some((_, actual_value)) = actual.iter().find(|(c, _)| c == column) {
            scores.push(date_distance_score(expected_value, actual_value));
        }
    }
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

fn date_distance_score(expected: &str, actual: &str) -> f64 {
    match (parse_date_days(expected), parse_date_days(actual)) {
        (Some(e), Some(a)) => {
            let delta = (e - a).unsigned_abs() as f64;
            (1.0 - delta / 365.0).max(0.0)
        }
        _ => {
            if expected == actual {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// Days since an arbitrary epoch, only meaningful relative to another
/// value from this same function.
fn parse_date_days(s: &str) -> Option<i64> {
    let parts: Vec<&str> = s.splitn(3, '-').collect();
    if parts.len() != 3 {
        return None;
    }
    let year: i64 = parts[0].parse().ok()?;
    let month: i64 = parts[1].parse().ok()?;
    let day: i64 = parts[2].get(0..2).unwrap_or(parts[2]).parse().ok()?;
    Some(year * 365 + month * 30 + day)
}

fn set_overlap(expected: &[HashSet<String>], actual: &[HashSet<String>]) -> f64 {
    if expected.is_empty() || actual.is_empty() {
        return NEUTRAL;
    }
    let expected_union: HashSet<String> = expected.iter().flatten().cloned().collect();
    let actual_union: HashSet<String> = actual.iter().flatten().cloned().collect();
    jaccard(&expected_union, &actual_union)
}

fn equality_match(expected: &[(String, String)], actual: &[(String, String)]) -> f64 {
    if expected.is_empty() || actual.is_empty() {
        return NEUTRAL;
    }
    let matched = expected.iter().filter(|(c, v)| actual.iter().any(|(ac, av)| ac == c && av == v)).count();
    matched as f64 / expected.len() as f64
}

fn limit_distance(expected: Option<i64>, actual: Option<i64>) -> f64 {
    match (expected, actual) {
        (None, None) => NEUTRAL,
        (Some(e), Some(a)) => {
            let delta = (e - a).unsigned_abs() as f64;
            let scale = e.max(a).max(1) as f64;
            (1.0 - delta / scale).max(0.0)
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_predicates_score_full_value_agreement() {
        let suite = MetricSuiteV2::default();
        let sql = "SELECT id FROM orders WHERE total > 100 AND region = 'us' LIMIT 10";
        let scores = suite.score(sql, sql, "sqlite");
        assert_eq!(scores.value_aware.v2_composite, 1.0);
        assert_eq!(scores.composite, 1.0);
    }

    #[test]
    fn close_numeric_values_score_high_proximity() {
        let suite = MetricSuiteV2::default();
        let scores = suite.score(
            "SELECT id FROM orders WHERE total > 100",
            "SELECT id FROM orders WHERE total > 105",
            "sqlite",
        );
        assert!(scores.value_aware.numeric_proximity > 0.9);
    }

    #[test]
    fn missing_predicate_shape_on_one_side_is_neutral_not_zero() {
        let suite = MetricSuiteV2::default();
        let scores = suite.score("SELECT id FROM orders", "SELECT id FROM orders WHERE total > 100", "sqlite");
        assert_eq!(scores.value_aware.numeric_proximity, NEUTRAL);
    }

    #[test]
    fn composite_stays_within_unit_interval() {
        let suite = MetricSuiteV2::default();
        let scores = suite.score(
            "SELECT id FROM orders WHERE region IN ('us', 'eu') LIMIT 5",
            "SELECT id FROM customers WHERE region IN ('apac') LIMIT 500",
            "sqlite",
        );
        assert!(scores.composite >= 0.0 && scores.composite <= 1.0);
    }
}
