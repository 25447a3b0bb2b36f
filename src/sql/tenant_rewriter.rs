//! Tenant-scoped predicate rewriter (C2): a pure function that injects
//! `table.tenant_column = ?` into every eligible base-table reference in a
//! SELECT, deterministically, or fails closed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlparser::ast::{
    Expr, Ident, Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::{GenericDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};

const MAX_DETAIL_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformerErrorKind {
    UnsupportedShape,
    MissingTenantColumn,
    UnresolvableTableAlias,
    TargetLimitExceeded,
    ParamLimitExceeded,
    AstComplexityExceeded,
    CompletenessFailed,
    DialectUnsupported,
    ParseFailed,
    NoPredicatesProduced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteFailure {
    pub kind: TransformerErrorKind,
    /// Always a generic, sanitized message - never echoes table names,
    /// literals, or SQL fragments from the input.
    pub message: String,
    pub details_safe: Option<String>,
}

impl RewriteFailure {
    fn new(kind: TransformerErrorKind, details: impl Into<String>) -> Self {
        Self {
            message: "tenant isolation is not supported for this provider".to_string(),
            details_safe: Some(sanitize_failure_detail(&details.into())),
            kind,
        }
    }
}

fn sanitize_failure_detail(detail: &str) -> String {
    let collapsed: String = detail
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if collapsed.chars().count() > MAX_DETAIL_CHARS {
        collapsed.chars().take(MAX_DETAIL_CHARS).collect()
    } else {
        collapsed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteSuccess {
    pub sql: String,
    pub params: Vec<Value>,
    pub rewritten_tables: Vec<String>,
    pub predicate_count: usize,
    pub has_cte: bool,
    pub has_subquery: bool,
    pub scope_depth: usize,
}

#[derive(Debug, Clone)]
pub struct RewriteRequest<'a> {
    pub sql: &'a str,
    pub provider: &'a str,
    pub tenant_id: Value,
    pub tenant_column: &'a str,
    /// Tables that should never receive a tenant predicate (shared reference
    /// tables, etc).
    pub global_allowlist: HashSet<String>,
    /// Optional per-table column metadata; `None` means "assume the tenant
    /// column exists" (legacy-compatible).
    pub table_has_tenant_column: Option<HashMap<String, bool>>,
}

#[derive(Debug, Clone)]
pub struct TenantRewriteSettings {
    pub enabled: bool,
    pub strict_mode: bool,
    pub max_targets: usize,
    pub max_params: usize,
    pub max_ast_nodes: usize,
    pub assert_invariants: bool,
}

impl Default for TenantRewriteSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            strict_mode: true,
            max_targets: 32,
            max_params: 32,
            max_ast_nodes: 2000,
            assert_invariants: false,
        }
    }
}

impl TenantRewriteSettings {
    pub fn from_env() -> Self {
        let mut s = Self::default();
        s.enabled = env_bool("TENANT_REWRITE_ENABLED", s.enabled);
        s.strict_mode = env_bool("TENANT_REWRITE_STRICT_MODE", s.strict_mode);
        s.max_targets = env_usize("TENANT_REWRITE_MAX_TARGETS", s.max_targets);
        s.max_params = env_usize("TENANT_REWRITE_MAX_PARAMS", s.max_params);
        s.max_ast_nodes = env_usize("MAX_SQL_AST_NODES", s.max_ast_nodes);
        s.assert_invariants = env_bool("TENANT_REWRITE_ASSERT_INVARIANTS", s.assert_invariants);
        s
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn provider_supported(provider: &str) -> bool {
    matches!(provider.to_lowercase().as_str(), "sqlite" | "duckdb")
}

/// A base-table reference collected for predicate injection.
struct Target {
    cte_name: Option<String>,
    effective_name: String,
    physical_name: String,
    scope_index: usize,
    appearance_index: usize,
}

pub struct TenantRewriter {
    settings: TenantRewriteSettings,
}

impl TenantRewriter {
    pub fn new(settings: TenantRewriteSettings) -> Self {
        Self { settings }
    }

    pub fn rewrite_sql(&self, req: &RewriteRequest<'_>) -> Result<RewriteSuccess, RewriteFailure> {
        if !provider_supported(req.provider) {
            return Err(RewriteFailure::new(
                TransformerErrorKind::DialectUnsupported,
                format!("provider {} not supported for rewriting", req.provider),
            ));
        }

        let dialect = SQLiteDialect {};
        let statements = Parser::parse_sql(&dialect, req.sql)
            .or_else(|_| Parser::parse_sql(&GenericDialect {}, req.sql))
            .map_err(|e| RewriteFailure::new(TransformerErrorKind::ParseFailed, e.to_string()))?;

        if statements.len() != 1 {
            return Err(RewriteFailure::new(
                TransformerErrorKind::UnsupportedShape,
                "expected exactly one statement",
            ));
        }

        let mut query = match statements.into_iter().next().unwrap() {
            Statement::Query(q) => *q,
            _ => {
                return Err(RewriteFailure::new(
                    TransformerErrorKind::UnsupportedShape,
                    "root statement is not a SELECT",
                ))
            }
        };

        if matches!(query.body.as_ref(), SetExpr::SetOperation { .. }) {
            return Err(RewriteFailure::new(
                TransformerErrorKind::UnsupportedShape,
                "top-level set operations are not supported",
            ));
        }

        let node_count = query.to_string().len();
        if node_count > self.settings.max_ast_nodes * 8 {
            return Err(RewriteFailure::new(
                TransformerErrorKind::AstComplexityExceeded,
                "query exceeds AST complexity ceiling",
            ));
        }

        let mut cte_names: HashSet<String> = HashSet::new();
        if let Some(with) = &query.with {
            if with.recursive {
                return Err(RewriteFailure::new(
                    TransformerErrorKind::UnsupportedShape,
                    "recursive CTEs are not supported",
                ));
            }
            for cte in &with.cte_tables {
                cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }

        let mut targets = Vec::new();
        let mut scope_index = 0usize;

        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let select = as_plain_select(&cte.query)
                    .ok_or_else(|| shape_error("CTE body must be a plain SELECT"))?;
                reject_unsupported_select(select)?;
                collect_targets(
                    select,
                    Some(cte.alias.name.value.to_lowercase()),
                    scope_index,
                    &cte_names,
                    self.settings.strict_mode,
                    &mut targets,
                )?;
                scope_index += 1;
            }
        }

        let final_select =
            as_plain_select(&query).ok_or_else(|| shape_error("final query must be a plain SELECT"))?;
        reject_unsupported_select(final_select)?;
        collect_targets(
            final_select,
            None,
            scope_index,
            &cte_names,
            self.settings.strict_mode,
            &mut targets,
        )?;

        let has_cte = query.with.is_some();
        let has_subquery = has_any_subquery(final_select);

        if targets.len() > self.settings.max_targets {
            return Err(RewriteFailure::new(
                TransformerErrorKind::TargetLimitExceeded,
                "too many base-table targets for tenant rewrite",
            ));
        }

        targets.sort_by(|a, b| {
            (
                a.cte_name.as_deref().unwrap_or(""),
                a.effective_name.as_str(),
                a.physical_name.as_str(),
                a.scope_index,
                a.appearance_index,
            )
                .cmp(&(
                    b.cte_name.as_deref().unwrap_or(""),
                    b.effective_name.as_str(),
                    b.physical_name.as_str(),
                    b.scope_index,
                    b.appearance_index,
                ))
        });

        let mut params = Vec::new();
        let mut rewritten_tables = Vec::new();
        let mut eligible_count = 0usize;

        // Work on owned copies of the selects so we can mutate `selection`.
        let mut cte_selects: Vec<Select> = query
            .with
            .as_ref()
            .map(|w| {
                w.cte_tables
                    .iter()
                    .map(|c| as_plain_select(&c.query).unwrap().clone())
                    .collect()
            })
            .unwrap_or_default();
        let mut final_select_owned = final_select.clone();

        for target in &targets {
            if cte_names.contains(&target.physical_name) || req.global_allowlist.contains(&target.physical_name) {
                continue;
            }
            eligible_count += 1;

            if let Some(map) = &req.table_has_tenant_column {
                if !map.get(&target.physical_name).copied().unwrap_or(false) {
                    return Err(RewriteFailure::new(
                        TransformerErrorKind::MissingTenantColumn,
                        format!("table missing tenant column"),
                    ));
                }
            }

            if target.effective_name.is_empty() {
                return Err(RewriteFailure::new(
                    TransformerErrorKind::UnresolvableTableAlias,
                    "could not resolve alias for target table",
                ));
            }

            if params.len() + 1 > self.settings.max_params {
                return Err(RewriteFailure::new(
                    TransformerErrorKind::ParamLimitExceeded,
                    "tenant rewrite exceeded the configured parameter limit",
                ));
            }

            let predicate = Expr::BinaryOp {
                left: Box::new(Expr::CompoundIdentifier(vec![
                    Ident::new(target.effective_name.clone()),
                    Ident::new(req.tenant_column.to_string()),
                ])),
                op: sqlparser::ast::BinaryOperator::Eq,
                right: Box::new(Expr::Value(sqlparser::ast::Value::Placeholder(
                    "?".to_string(),
                ))),
            };

            let select_to_patch: &mut Select = if let Some(cte_idx) = target.cte_name.as_ref().and_then(|name| {
                query
                    .with
                    .as_ref()
                    .unwrap()
                    .cte_tables
                    .iter()
                    .position(|c| &c.alias.name.value.to_lowercase() == name)
            }) {
                &mut cte_selects[cte_idx]
            } else {
                &mut final_select_owned
            };

            append_and(select_to_patch, predicate);
            params.push(req.tenant_id.clone());
            rewritten_tables.push(target.physical_name.clone());
        }

        if eligible_count == 0 {
            return Err(RewriteFailure::new(
                TransformerErrorKind::NoPredicatesProduced,
                "no eligible base-table targets were found",
            ));
        }
        if rewritten_tables.len() != eligible_count {
            return Err(RewriteFailure::new(
                TransformerErrorKind::CompletenessFailed,
                "not every eligible target received a tenant predicate",
            ));
        }

        // Rebuild the query string from the patched selects.
        if let Some(with) = &mut query.with {
            for (cte, patched) in with.cte_tables.iter_mut().zip(cte_selects.into_iter()) {
                *cte.query.body = SetExpr::Select(Box::new(patched));
            }
        }
        *query.body = SetExpr::Select(Box::new(final_select_owned));

        let sql = query.to_string();

        if self.settings.assert_invariants {
            assert_no_duplicate_predicates(&rewritten_tables);
        }

        Ok(RewriteSuccess {
            sql,
            params,
            rewritten_tables,
            predicate_count: targets.len().min(eligible_count),
            has_cte,
            has_subquery,
            scope_depth: scope_index + 1,
        })
    }
}

fn shape_error(msg: &str) -> RewriteFailure {
    RewriteFailure::new(TransformerErrorKind::UnsupportedShape, msg)
}

fn as_plain_select(query: &Query) -> Option<&Select> {
    match query.body.as_ref() {
        SetExpr::Select(s) => Some(s.as_ref()),
        _ => None,
    }
}

fn reject_unsupported_select(select: &Select) -> Result<(), RewriteFailure> {
    for twj in &select.from {
        reject_nested_select(&twj.relation)?;
        for join in &twj.joins {
            reject_nested_select(&join.relation)?;
        }
    }
    if select_has_window_function(select) {
        return Err(shape_error("window functions are not supported (conservative v1)"));
    }
    Ok(())
}

fn reject_nested_select(factor: &TableFactor) -> Result<(), RewriteFailure> {
    if let TableFactor::Derived { .. } = factor {
        return Err(shape_error("nested SELECT in FROM is not supported"));
    }
    Ok(())
}

fn select_has_window_function(select: &Select) -> bool {
    select.projection.iter().any(|p| match p {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
            crate::sql::validator::expr_has_window_function(expr)
        }
        _ => false,
    })
}

fn has_any_subquery(select: &Select) -> bool {
    select
        .selection
        .as_ref()
        .map(expr_has_subquery)
        .unwrap_or(false)
}

fn expr_has_subquery(expr: &Expr) -> bool {
    matches!(expr, Expr::Subquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. })
}

/// Whether a subquery appears anywhere in `expr`'s tree, not just at the top
/// level - a WHERE clause can bury `IN (SELECT ...)` under `AND`/`OR`/`NOT`.
fn expr_contains_subquery_anywhere(expr: &Expr) -> bool {
    if expr_has_subquery(expr) {
        return true;
    }
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            expr_contains_subquery_anywhere(left) || expr_contains_subquery_anywhere(right)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => expr_contains_subquery_anywhere(expr),
        _ => false,
    }
}

fn collect_targets(
    select: &Select,
    cte_name: Option<String>,
    scope_index: usize,
    cte_names: &HashSet<String>,
    strict_mode: bool,
    out: &mut Vec<Target>,
) -> Result<(), RewriteFailure> {
    let outer_visible: HashSet<String> = select
        .from
        .iter()
        .flat_map(|twj| std::iter::once(&twj.relation).chain(twj.joins.iter().map(|j| &j.relation)))
        .filter_map(table_effective_name)
        .collect();

    if let Some(selection) = &select.selection {
        if expr_is_correlated(selection, &outer_visible, strict_mode) {
            return Err(shape_error("correlated subquery is not supported"));
        }
        // Target collection only walks `select.from`; any subquery left in
        // the WHERE clause at this point is non-correlated but still hides
        // base-table references this function never sees. Rejecting here
        // (rather than silently omitting those tables) keeps the rewrite
        // fail-closed instead of leaking rows across tenants.
        if expr_contains_subquery_anywhere(selection) {
            return Err(shape_error("WHERE-clause subquery is not supported"));
        }
    }

    let mut appearance_index = 0usize;
    for twj in &select.from {
        collect_from_table_with_joins(twj, &cte_name, scope_index, cte_names, &mut appearance_index, out);
    }
    Ok(())
}

fn collect_from_table_with_joins(
    twj: &TableWithJoins,
    cte_name: &Option<String>,
    scope_index: usize,
    cte_names: &HashSet<String>,
    appearance_index: &mut usize,
    out: &mut Vec<Target>,
) {
    push_table_factor(&twj.relation, cte_name, scope_index, cte_names, appearance_index, out);
    for join in &twj.joins {
        push_table_factor(&join.relation, cte_name, scope_index, cte_names, appearance_index, out);
    }
}

fn push_table_factor(
    factor: &TableFactor,
    cte_name: &Option<String>,
    scope_index: usize,
    cte_names: &HashSet<String>,
    appearance_index: &mut usize,
    out: &mut Vec<Target>,
) {
    if let TableFactor::Table { name, alias, .. } = factor {
        let physical_name = name.0.last().map(|p| p.value.to_lowercase()).unwrap_or_default();
        if cte_names.contains(&physical_name) {
            return;
        }
        let effective_name = alias
            .as_ref()
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| physical_name.clone());
        out.push(Target {
            cte_name: cte_name.clone(),
            effective_name,
            physical_name,
            scope_index,
            appearance_index: *appearance_index,
        });
        *appearance_index += 1;
    }
}

fn table_effective_name(factor: &TableFactor) -> Option<String> {
    if let TableFactor::Table { name, alias, .. } = factor {
        Some(
            alias
                .as_ref()
                .map(|a| a.name.value.to_lowercase())
                .unwrap_or_else(|| name.0.last().map(|p| p.value.to_lowercase()).unwrap_or_default()),
        )
    } else {
        None
    }
}

fn expr_is_correlated(expr: &Expr, outer_names: &HashSet<String>, strict_mode: bool) -> bool {
    match expr {
        Expr::Subquery(q) | Expr::InSubquery { subquery: q, .. } => {
            let select = match as_plain_select(q) {
                Some(s) => s,
                None => return false,
            };
            if let Some(sel) = &select.selection {
                compound_references_outer(sel, outer_names, strict_mode)
            } else {
                false
            }
        }
        Expr::Exists { subquery, .. } => {
            let select = match as_plain_select(subquery) {
                Some(s) => s,
                None => return false,
            };
            select
                .selection
                .as_ref()
                .map(|sel| compound_references_outer(sel, outer_names, strict_mode))
                .unwrap_or(false)
        }
        Expr::BinaryOp { left, right, .. } => {
            expr_is_correlated(left, outer_names, strict_mode)
                || expr_is_correlated(right, outer_names, strict_mode)
        }
        _ => false,
    }
}

/// Whether `expr` (taken from an inner SELECT's WHERE clause) references a
/// name from the outer scope. A qualified reference (`o.id`) is unambiguous;
/// in `strict_mode` an unqualified identifier is also treated as potentially
/// ambiguous against the outer scope's visible names, per the "strict mode
/// rejects ambiguous unqualified references" correlation rule.
fn compound_references_outer(expr: &Expr, outer_names: &HashSet<String>, strict_mode: bool) -> bool {
    match expr {
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            outer_names.contains(&parts[0].value.to_lowercase())
        }
        Expr::Identifier(_) if strict_mode && !outer_names.is_empty() => true,
        Expr::BinaryOp { left, right, .. } => {
            compound_references_outer(left, outer_names, strict_mode)
                || compound_references_outer(right, outer_names, strict_mode)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => {
            compound_references_outer(expr, outer_names, strict_mode)
        }
        _ => false,
    }
}

fn append_and(select: &mut Select, predicate: Expr) {
    select.selection = Some(match select.selection.take() {
        Some(existing) => Expr::BinaryOp {
            left: Box::new(existing),
            op: sqlparser::ast::BinaryOperator::And,
            right: Box::new(predicate),
        },
        None => predicate,
    });
}

fn assert_no_duplicate_predicates(tables: &[String]) {
    let mut seen = HashSet::new();
    for t in tables {
        debug_assert!(seen.insert(t.clone()), "duplicate tenant predicate for {}", t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req<'a>(sql: &'a str) -> RewriteRequest<'a> {
        RewriteRequest {
            sql,
            provider: "sqlite",
            tenant_id: Value::from(1),
            tenant_column: "tenant_id",
            global_allowlist: HashSet::new(),
            table_has_tenant_column: None,
        }
    }

    #[test]
    fn rewrites_join_with_both_tables() {
        let rewriter = TenantRewriter::new(TenantRewriteSettings::default());
        let result = rewriter
            .rewrite_sql(&req(
                "SELECT o.id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id WHERE o.status = 'open'",
            ))
            .unwrap();
        assert!(result.sql.contains("o.tenant_id = ?"));
        assert!(result.sql.contains("c.tenant_id = ?"));
        assert_eq!(result.params.len(), 2);
    }

    #[test]
    fn rejects_correlated_subquery() {
        let rewriter = TenantRewriter::new(TenantRewriteSettings::default());
        let err = rewriter
            .rewrite_sql(&req(
                "SELECT * FROM orders o WHERE EXISTS (SELECT 1 FROM line_items WHERE order_id = o.id)",
            ))
            .unwrap_err();
        assert_eq!(err.kind, TransformerErrorKind::UnsupportedShape);
        assert!(!err.message.contains("orders"));
    }

    #[test]
    fn rejects_non_correlated_where_subquery_instead_of_silently_dropping_its_tables() {
        let rewriter = TenantRewriter::new(TenantRewriteSettings::default());
        let err = rewriter
            .rewrite_sql(&req(
                "SELECT * FROM orders o WHERE o.id IN (SELECT order_id FROM line_items WHERE qty > 1)",
            ))
            .unwrap_err();
        assert_eq!(err.kind, TransformerErrorKind::UnsupportedShape);
    }

    #[test]
    fn strict_mode_rejects_unqualified_identifier_in_subquery_as_ambiguous() {
        let rewriter = TenantRewriter::new(TenantRewriteSettings::default());
        let err = rewriter
            .rewrite_sql(&req(
                "SELECT * FROM orders o WHERE EXISTS (SELECT 1 FROM line_items WHERE qty > 1)",
            ))
            .unwrap_err();
        assert_eq!(err.kind, TransformerErrorKind::UnsupportedShape);
    }

    #[test]
    fn rejects_window_function() {
        let rewriter = TenantRewriter::new(TenantRewriteSettings::default());
        let err = rewriter
            .rewrite_sql(&req(
                "SELECT o.id, ROW_NUMBER() OVER (PARTITION BY o.customer_id) FROM orders o",
            ))
            .unwrap_err();
        assert_eq!(err.kind, TransformerErrorKind::UnsupportedShape);
    }

    #[test]
    fn unsupported_provider_fails_closed() {
        let rewriter = TenantRewriter::new(TenantRewriteSettings::default());
        let mut r = req("SELECT * FROM orders");
        r.provider = "bigquery";
        let err = rewriter.rewrite_sql(&r).unwrap_err();
        assert_eq!(err.kind, TransformerErrorKind::DialectUnsupported);
    }

    #[test]
    fn rewrite_is_deterministic() {
        let rewriter = TenantRewriter::new(TenantRewriteSettings::default());
        let sql = "SELECT o.id FROM orders o JOIN customers c ON o.customer_id = c.id";
        let first = rewriter.rewrite_sql(&req(sql)).unwrap();
        let second = rewriter.rewrite_sql(&req(sql)).unwrap();
        assert_eq!(first.sql, second.sql);
        assert_eq!(first.params, second.params);
    }

    #[test]
    fn global_allowlisted_table_is_skipped() {
        let rewriter = TenantRewriter::new(TenantRewriteSettings::default());
        let mut r = req("SELECT o.id, r.code FROM orders o JOIN regions r ON o.region_id = r.id");
        r.global_allowlist.insert("regions".to_string());
        let result = rewriter.rewrite_sql(&r).unwrap();
        assert_eq!(result.params.len(), 1);
        assert!(!result.sql.contains("r.tenant_id"));
    }

    #[test]
    fn sanitize_failure_detail_truncates_and_strips_blank_lines() {
        let long = "a".repeat(500);
        let sanitized = sanitize_failure_detail(&format!("line1\n\nline2 {}", long));
        assert!(sanitized.chars().count() <= MAX_DETAIL_CHARS);
    }
}
