//! Structural comparison (MetricSuiteV1, §4.7): compares two SQL strings
//! purely on shape — referenced tables, join count, aggregation and
//! GROUP BY presence, predicate-type set, and LIMIT — without looking at
//! literal values. [`super::metrics_v2`] layers value-aware scoring on top
//! of the same extraction.

use serde::{Deserialize, Serialize};
use sqlparser::ast::{BinaryOperator, Expr, Query, Select, SelectItem, SetExpr, Statement, TableFactor};
use sqlparser::dialect::{Dialect, GenericDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredicateType {
    Equality,
    Range,
    In,
    Like,
    NullCheck,
}

/// Shape extracted from a parsed query: enough to compute both metric
/// suites without re-walking the AST per subscore.
#[derive(Debug, Clone, Default)]
pub struct QueryShape {
    pub tables: HashSet<String>,
    pub join_count: usize,
    pub has_aggregation: bool,
    pub has_group_by: bool,
    pub predicate_types: HashSet<PredicateType>,
    pub limit: Option<i64>,
    pub numeric_predicates: Vec<(String, f64)>,
    pub date_predicates: Vec<(String, String)>,
    pub in_list_values: Vec<HashSet<String>>,
    pub equality_values: Vec<(String, String)>,
}

fn dialect_for(name: &str) -> Box<dyn Dialect> {
    match name {
        "postgres" | "postgresql" => Box::new(PostgreSqlDialect {}),
        "sqlite" => Box::new(SQLiteDialect {}),
        _ => Box::new(GenericDialect {}),
    }
}

/// Parses `sql` and extracts its [`QueryShape`]. Returns `None` on parse
/// failure or a non-query root statement; callers fall back to string
/// comparison in that case.
pub fn parse_shape(sql: &str, dialect: &str) -> Option<QueryShape> {
    let dialect = dialect_for(dialect);
    let statements = Parser::parse_sql(dialect.as_ref(), sql).ok()?;
    let query = match statements.first()? {
        Statement::Query(q) => q.as_ref(),
        _ => return None,
    };

    let mut shape = QueryShape::default();
    walk_query(query, &mut shape);
    Some(shape)
}

fn walk_query(query: &Query, shape: &mut QueryShape) {
    if let Some(limit) = &query.limit {
        shape.limit = literal_as_i64(limit);
    }
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            walk_query(&cte.query, shape);
        }
    }
    walk_set_expr(&query.body, shape);
}

fn walk_set_expr(body: &SetExpr, shape: &mut QueryShape) {
    match body {
        SetExpr::Select(select) => walk_select(select, shape),
        SetExpr::Query(q) => walk_query(q, shape),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, shape);
            walk_set_expr(right, shape);
        }
        _ => {}
    }
}

fn walk_select(select: &Select, shape: &mut QueryShape) {
    for twj in &select.from {
        if let TableFactor::Table { name, .. } = &twj.relation {
            shape.tables.insert(name.to_string().to_lowercase());
        }
        shape.join_count += twj.joins.len();
        for join in &twj.joins {
            if let TableFactor::Table { name, .. } = &join.relation {
                shape.tables.insert(name.to_string().to_lowercase());
            }
        }
    }

    if select
        .projection
        .iter()
        .any(|p| matches!(p, SelectItem::UnnamedExpr(Expr::Function(_)) | SelectItem::ExprWithAlias { expr: Expr::Function(_), .. }))
    {
        shape.has_aggregation = true;
    }

    let group_by_present = match &select.group_by {
        sqlparser::ast::GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
        _ => true,
    };
    if group_by_present {
        shape.has_group_by = true;
        shape.has_aggregation = true;
    }

    if let Some(selection) = &select.selection {
        walk_predicate(selection, shape);
    }
}

fn walk_predicate(expr: &Expr, shape: &mut QueryShape) {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And | BinaryOperator::Or => {
                walk_predicate(left, shape);
                walk_predicate(right, shape);
            }
            BinaryOperator::Eq => {
                shape.predicate_types.insert(PredicateType::Equality);
                record_value(left, right, shape);
            }
            BinaryOperator::Gt | BinaryOperator::GtEq | BinaryOperator::Lt | BinaryOperator::LtEq => {
                shape.predicate_types.insert(PredicateType::Range);
                record_range(left, right, shape);
            }
            _ => {}
        },
        Expr::Between { negated, low, high, expr: column, .. } => {
            if !negated {
                shape.predicate_types.insert(PredicateType::Range);
                record_range(column, low, shape);
                record_range(column, high, shape);
            }
        }
        Expr::InList { expr: column, list, negated } => {
            if !negated {
                shape.predicate_types.insert(PredicateType::In);
                let values: HashSet<String> = list.iter().map(|e| e.to_string().trim_matches('\'').to_string()).collect();
                shape.in_list_values.push(values);
                let _ = column;
            }
        }
        Expr::InSubquery { .. } => {
            shape.predicate_types.insert(PredicateType::In);
        }
        Expr::Like { .. } | Expr::ILike { .. } => {
            shape.predicate_types.insert(PredicateType::Like);
        }
        Expr::IsNull(_) | Expr::IsNotNull(_) => {
            shape.predicate_types.insert(PredicateType::NullCheck);
        }
        Expr::Nested(inner) => walk_predicate(inner, shape),
        _ => {}
    }
}

fn record_value(left: &Expr, right: &Expr, shape: &mut QueryShape) {
    let column = left.to_string();
    let literal = right.to_string().trim_matches('\'').to_string();
    if is_probably_date(&literal) {
        shape.date_predicates.push((column, literal));
    } else {
        shape.equality_values.push((column, literal));
    }
}

fn record_range(left: &Expr, right: &Expr, shape: &mut QueryShape) {
    let column = left.to_string();
    let literal = right.to_string().trim_matches('\'').to_string();
    if is_probably_date(&literal) {
        shape.date_predicates.push((column, literal));
    } else if let Ok(n) = literal.parse::<f64>() {
        shape.numeric_predicates.push((column, n));
    }
}

fn is_probably_date(s: &str) -> bool {
    s.len() >= 8 && s.chars().filter(|c| *c == '-').count() >= 2
}

fn literal_as_i64(expr: &Expr) -> Option<i64> {
    expr.to_string().parse::<i64>().ok()
}

pub(crate) fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

fn canonicalize(sql: &str, dialect: &str) -> Option<String> {
    let dialect = dialect_for(dialect);
    let statements = Parser::parse_sql(dialect.as_ref(), sql).ok()?;
    Some(statements.first()?.to_string())
}

fn normalized_text(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Structural subscores and their weighted composite (§4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuralScores {
    pub exact_match: bool,
    pub table_overlap: f64,
    pub join_similarity: f64,
    pub aggregation_match: f64,
    pub groupby_match: f64,
    pub predicate_similarity: f64,
    pub limit_match: f64,
    pub composite: f64,
}

pub struct MetricSuiteV1 {
    pub table_overlap_weight: f64,
    pub join_similarity_weight: f64,
    pub aggregation_match_weight: f64,
    pub groupby_match_weight: f64,
    pub predicate_similarity_weight: f64,
    pub limit_match_weight: f64,
}

impl Default for MetricSuiteV1 {
    fn default() -> Self {
        Self {
            table_overlap_weight: 0.35,
            join_similarity_weight: 0.15,
            aggregation_match_weight: 0.15,
            groupby_match_weight: 0.10,
            predicate_similarity_weight: 0.15,
            limit_match_weight: 0.10,
        }
    }
}

impl MetricSuiteV1 {
    pub fn score(&self, expected_sql: &str, actual_sql: &str, dialect: &str) -> StructuralScores {
        let exact_match = self.exact_match(expected_sql, actual_sql, dialect);

        let (expected_shape, actual_shape) = (parse_shape(expected_sql, dialect), parse_shape(actual_sql, dialect));

        let (expected_shape, actual_shape) = match (expected_shape, actual_shape) {
            (Some(e), Some(a)) => (e, a),
            _ => {
                let value = if exact_match { 1.0 } else { 0.0 };
                return StructuralScores {
                    exact_match,
                    table_overlap: value,
                    join_similarity: value,
                    aggregation_match: value,
                    groupby_match: value,
                    predicate_similarity: value,
                    limit_match: value,
                    composite: value,
                };
            }
        };

        let table_overlap = jaccard(&expected_shape.tables, &actual_shape.tables);
        let join_similarity = similarity_ratio(expected_shape.join_count, actual_shape.join_count);
        let aggregation_match = if expected_shape.has_aggregation == actual_shape.has_aggregation { 1.0 } else { 0.0 };
        let groupby_match = if expected_shape.has_group_by == actual_shape.has_group_by { 1.0 } else { 0.0 };
        let predicate_similarity = jaccard(&expected_shape.predicate_types, &actual_shape.predicate_types);
        let limit_match = limit_similarity(expected_shape.limit, actual_shape.limit);

        let composite = table_overlap * self.table_overlap_weight
            + join_similarity * self.join_similarity_weight
            + aggregation_match * self.aggregation_match_weight
            + groupby_match * self.groupby_match_weight
            + predicate_similarity * self.predicate_similarity_weight
            + limit_match * self.limit_match_weight;

        StructuralScores {
            exact_match,
            table_overlap,
            join_similarity,
            aggregation_match,
            groupby_match,
            predicate_similarity,
            limit_match,
            composite,
        }
    }

    fn exact_match(&self, expected_sql: &str, actual_sql: &str, dialect: &str) -> bool {
        match (canonicalize(expected_sql, dialect), canonicalize(actual_sql, dialect)) {
            (Some(e), Some(a)) => e == a,
            _ => normalized_text(expected_sql) == normalized_text(actual_sql),
        }
    }
}

fn similarity_ratio(expected: usize, actual: usize) -> f64 {
    let delta = (expected as i64 - actual as i64).unsigned_abs() as f64;
    let max = expected.max(actual) as f64;
    if max == 0.0 {
        1.0
    } else {
        (1.0 - delta / max).max(0.0)
    }
}

fn limit_similarity(expected: Option<i64>, actual: Option<i64>) -> f64 {
    match (expected, actual) {
        (None, None) => 1.0,
        (Some(e), Some(a)) if e == a => 1.0,
        (Some(e), Some(a)) => {
            let delta = (e - a).unsigned_abs() as f64;
            let max = e.max(a) as f64;
            if max == 0.0 {
                1.0
            } else {
                (1.0 - delta / max).max(0.0)
            }
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_queries_score_one_across_every_subscore() {
        let suite = MetricSuiteV1::default();
        let sql = "SELECT o.id FROM orders o JOIN customers c ON o.customer_id = c.id WHERE o.status = 'open' LIMIT 10";
        let scores = suite.score(sql, sql, "sqlite");
        assert!(scores.exact_match);
        assert_eq!(scores.table_overlap, 1.0);
        assert_eq!(scores.composite, 1.0);
    }

    #[test]
    fn disjoint_tables_score_zero_overlap() {
        let suite = MetricSuiteV1::default();
        let scores = suite.score("SELECT * FROM orders", "SELECT * FROM customers", "sqlite");
        assert_eq!(scores.table_overlap, 0.0);
    }

    #[test]
    fn aggregation_mismatch_is_penalized() {
        let suite = MetricSuiteV1::default();
        let scores = suite.score("SELECT count(*) FROM orders", "SELECT id FROM orders", "sqlite");
        assert_eq!(scores.aggregation_match, 0.0);
    }

    #[test]
    fn limit_distance_degrades_gracefully() {
        let suite = MetricSuiteV1::default();
        let scores = suite.score("SELECT id FROM orders LIMIT 100", "SELECT id FROM orders LIMIT 90", "sqlite");
        assert!(scores.limit_match > 0.0 && scores.limit_match < 1.0);
    }

    #[test]
    fn unparseable_sql_falls_back_to_normalized_string_compare() {
        let suite = MetricSuiteV1::default();
        let scores = suite.score("not sql at all", "not   SQL at all", "sqlite");
        assert!(scores.exact_match);
        assert_eq!(scores.composite, 1.0);
    }
}
