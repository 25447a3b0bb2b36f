//! AST-based SQL validator (C1): rejects unsafe SQL before it reaches a
//! tool, and extracts lineage metadata used for audit even on failure.

use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, Query, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::{Dialect, GenericDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::collections::HashSet;

const RESTRICTED_TABLES: &[&str] = &["payroll", "credentials", "audit_logs", "secrets"];
const SYSTEM_PREFIXES: &[&str] = &["pg_", "information_schema."];
const SENSITIVE_COLUMN_PATTERNS: &[&str] =
    &["ssn", "password", "secret", "api_key", "credit_card", "tax_id"];

/// Column/table allowlist enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Off,
    Warn,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    ForbiddenCommand,
    RestrictedTable,
    ColumnAllowlist,
    ComplexityLimit,
    SensitiveColumn,
    SyntaxError,
    MultipleStatements,
    DangerousUnion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub violation_type: ViolationType,
    pub message: String,
    pub details: Option<String>,
}

impl SecurityViolation {
    fn new(violation_type: ViolationType, message: impl Into<String>) -> Self {
        Self {
            violation_type,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Lineage and shape metadata extracted from the parsed statement, returned
/// even when validation ultimately fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlMetadata {
    pub table_lineage: Vec<String>,
    pub column_usage: Vec<String>,
    pub join_complexity: usize,
    pub has_aggregation: bool,
    pub has_subquery: bool,
    pub has_window_function: bool,
    pub normalized_sql: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AstValidationResult {
    pub is_valid: bool,
    pub violations: Vec<SecurityViolation>,
    pub warnings: Vec<SecurityViolation>,
    pub metadata: SqlMetadata,
}

impl AstValidationResult {
    fn failed(violations: Vec<SecurityViolation>, metadata: SqlMetadata) -> Self {
        Self {
            is_valid: false,
            violations,
            warnings: Vec::new(),
            metadata,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub max_join_complexity: usize,
    pub column_allowlist_mode: ValidationMode,
    pub block_sensitive_columns: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_join_complexity: 10,
            column_allowlist_mode: ValidationMode::Off,
            block_sensitive_columns: false,
        }
    }
}

impl ValidatorConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("AGENT_MAX_JOIN_COMPLEXITY") {
            if let Ok(n) = v.parse() {
                cfg.max_join_complexity = n;
            }
        }
        if let Ok(v) = std::env::var("AGENT_COLUMN_ALLOWLIST_MODE") {
            cfg.column_allowlist_mode = match v.as_str() {
                "warn" => ValidationMode::Warn,
                "block" => ValidationMode::Block,
                _ => ValidationMode::Off,
            };
        }
        cfg.block_sensitive_columns = std::env::var("AGENT_BLOCK_SENSITIVE_COLUMNS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        cfg
    }
}

/// Stateless AST validator: one instance can be reused across calls.
pub struct AstValidator {
    config: ValidatorConfig,
}

impl AstValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    fn dialect_for(name: &str) -> Box<dyn Dialect> {
        match name {
            "postgres" | "postgresql" => Box::new(PostgreSqlDialect {}),
            "sqlite" => Box::new(SQLiteDialect {}),
            _ => Box::new(GenericDialect {}),
        }
    }

    pub fn validate(
        &self,
        sql: &str,
        dialect: &str,
        allowed_tables: Option<&HashSet<String>>,
        allowed_columns: Option<&HashSet<String>>,
    ) -> AstValidationResult {
        let mut metadata = SqlMetadata::default();

        if sql.trim().is_empty() {
            return AstValidationResult::failed(
                vec![SecurityViolation::new(
                    ViolationType::SyntaxError,
                    "empty SQL is not a valid query",
                )],
                metadata,
            );
        }

        let dialect = Self::dialect_for(dialect);
        let statements = match Parser::parse_sql(dialect.as_ref(), sql) {
            Ok(s) => s,
            Err(e) => {
                return AstValidationResult::failed(
                    vec![SecurityViolation::new(
                        ViolationType::SyntaxError,
                        "SQL failed to parse",
                    )
                    .with_details(e.to_string())],
                    metadata,
                );
            }
        };

        if statements.is_empty() {
            return AstValidationResult::failed(
                vec![SecurityViolation::new(
                    ViolationType::SyntaxError,
                    "no statement found",
                )],
                metadata,
            );
        }
        if statements.len() > 1 {
            return AstValidationResult::failed(
                vec![SecurityViolation::new(
                    ViolationType::MultipleStatements,
                    "SQL chaining (multiple statements) is not permitted",
                )],
                metadata,
            );
        }

        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        let query = match &statements[0] {
            Statement::Query(q) => q.as_ref(),
            other => {
                violations.push(SecurityViolation::new(
                    ViolationType::ForbiddenCommand,
                    format!("statement root '{}' is not a read-only query", root_kind(other)),
                ));
                return AstValidationResult::failed(violations, metadata);
            }
        };

        walk_query(
            query,
            &self.config,
            allowed_tables,
            allowed_columns,
            &mut metadata,
            &mut violations,
            &mut warnings,
            &HashSet::new(),
        );

        if metadata.join_complexity > self.config.max_join_complexity {
            violations.push(SecurityViolation::new(
                ViolationType::ComplexityLimit,
                format!(
                    "join complexity {} exceeds limit {}",
                    metadata.join_complexity, self.config.max_join_complexity
                ),
            ));
        }

        metadata.normalized_sql = Some(query.to_string());

        AstValidationResult {
            is_valid: violations.is_empty(),
            violations,
            warnings,
            metadata,
        }
    }
}

fn root_kind(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::AlterTable { .. } => "ALTER",
        Statement::CreateTable { .. } => "CREATE",
        Statement::Grant { .. } => "GRANT",
        _ => "UNSUPPORTED",
    }
}

#[allow(clippy::too_many_arguments)]
fn walk_query(
    query: &Query,
    config: &ValidatorConfig,
    allowed_tables: Option<&HashSet<String>>,
    allowed_columns: Option<&HashSet<String>>,
    metadata: &mut SqlMetadata,
    violations: &mut Vec<SecurityViolation>,
    warnings: &mut Vec<SecurityViolation>,
    cte_names: &HashSet<String>,
) {
    let mut local_cte_names = cte_names.clone();
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            local_cte_names.insert(cte.alias.name.value.to_lowercase());
            walk_query(
                &cte.query,
                config,
                allowed_tables,
                allowed_columns,
                metadata,
                violations,
                warnings,
                &local_cte_names,
            );
        }
    }

    walk_set_expr(
        &query.body,
        config,
        allowed_tables,
        allowed_columns,
        metadata,
        violations,
        warnings,
        &local_cte_names,
        0,
    );
}

#[allow(clippy::too_many_arguments)]
fn walk_set_expr(
    body: &SetExpr,
    config: &ValidatorConfig,
    allowed_tables: Option<&HashSet<String>>,
    allowed_columns: Option<&HashSet<String>>,
    metadata: &mut SqlMetadata,
    violations: &mut Vec<SecurityViolation>,
    warnings: &mut Vec<SecurityViolation>,
    cte_names: &HashSet<String>,
    union_depth: usize,
) {
    match body {
        SetExpr::Select(select) => {
            if select.projection.iter().any(|p| matches!(p, SelectItem::Wildcard(_))) {
                let violation = SecurityViolation::new(
                    ViolationType::ColumnAllowlist,
                    "SELECT * is not permitted under the active column policy",
                );
                match config.column_allowlist_mode {
                    ValidationMode::Block => violations.push(violation),
                    ValidationMode::Warn => warnings.push(violation),
                    ValidationMode::Off => {}
                }
            }

            for twj in &select.from {
                walk_table_with_joins(
                    twj,
                    config,
                    allowed_tables,
                    metadata,
                    violations,
                    cte_names,
                );
            }

            if select.group_by.to_string() != "" && !matches!(select.group_by, sqlparser::ast::GroupByExpr::Expressions(ref v, _) if v.is_empty())
            {
                metadata.has_aggregation = true;
            }
            if select
                .projection
                .iter()
                .any(|p| matches!(p, SelectItem::UnnamedExpr(Expr::Function(_)) | SelectItem::ExprWithAlias { expr: Expr::Function(_), .. }))
            {
                metadata.has_aggregation = true;
            }
            if select.projection.iter().any(|p| match p {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    expr_has_window_function(expr)
                }
                _ => false,
            }) {
                metadata.has_window_function = true;
            }

            for column_name in collect_column_names(select) {
                metadata.column_usage.push(column_name.clone());
                if let Some(allowlist) = allowed_columns {
                    if config.block_sensitive_columns
                        && SENSITIVE_COLUMN_PATTERNS
                            .iter()
                            .any(|p| column_name.to_lowercase().contains(p))
                    {
                        violations.push(SecurityViolation::new(
                            ViolationType::SensitiveColumn,
                            format!("column '{}' matches a sensitive-data pattern", column_name),
                        ));
                    }
                    if !column_name.contains('.') {
                        continue;
                    }
                    if !allowlist.contains(&column_name) {
                        let violation = SecurityViolation::new(
                            ViolationType::ColumnAllowlist,
                            format!("column '{}' is not in the allowlist", column_name),
                        );
                        match config.column_allowlist_mode {
                            ValidationMode::Block => violations.push(violation),
                            ValidationMode::Warn => warnings.push(violation),
                            ValidationMode::Off => {}
                        }
                    }
                } else if SENSITIVE_COLUMN_PATTERNS
                    .iter()
                    .any(|p| column_name.to_lowercase().contains(p))
                {
                    let violation = SecurityViolation::new(
                        ViolationType::SensitiveColumn,
                        format!("column '{}' matches a sensitive-data pattern", column_name),
                    );
                    if config.block_sensitive_columns {
                        violations.push(violation);
                    } else {
                        warnings.push(violation);
                    }
                }
            }

            if select.selection.as_ref().map(contains_subquery).unwrap_or(false) {
                metadata.has_subquery = true;
            }
        }
        SetExpr::Query(q) => {
            metadata.has_subquery = true;
            walk_query(
                q,
                config,
                allowed_tables,
                allowed_columns,
                metadata,
                violations,
                warnings,
                cte_names,
            );
        }
        SetExpr::SetOperation { left, right, .. } => {
            let depth = union_depth + 1;
            if depth > 2 && metadata.has_subquery {
                violations.push(SecurityViolation::new(
                    ViolationType::DangerousUnion,
                    "deeply nested UNION combined with subqueries is not permitted",
                ));
            }
            walk_set_expr(
                left,
                config,
                allowed_tables,
                allowed_columns,
                metadata,
                violations,
                warnings,
                cte_names,
                depth,
            );
            walk_set_expr(
                right,
                config,
                allowed_tables,
                allowed_columns,
                metadata,
                violations,
                warnings,
                cte_names,
                depth,
            );
        }
        _ => {}
    }
}

fn contains_subquery(expr: &Expr) -> bool {
    matches!(expr, Expr::Subquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. })
}

/// Whether `expr` is, or wraps, a window function call (`Expr::Function`
/// with an `OVER` clause). Walks the common wrapper shapes a window call
/// can appear under in a projection item.
pub(crate) fn expr_has_window_function(expr: &Expr) -> bool {
    match expr {
        Expr::Function(f) => f.over.is_some(),
        Expr::Nested(inner) => expr_has_window_function(inner),
        Expr::UnaryOp { expr, .. } => expr_has_window_function(expr),
        Expr::BinaryOp { left, right, .. } => {
            expr_has_window_function(left) || expr_has_window_function(right)
        }
        Expr::Cast { expr, .. } => expr_has_window_function(expr),
        Expr::Case {
            conditions,
            results,
            else_result,
            ..
        } => {
            conditions.iter().any(expr_has_window_function)
                || results.iter().any(expr_has_window_function)
                || else_result.as_deref().map(expr_has_window_function).unwrap_or(false)
        }
        _ => false,
    }
}

fn collect_column_names(select: &sqlparser::ast::Select) -> Vec<String> {
    select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents))
            | SelectItem::ExprWithAlias {
                expr: Expr::CompoundIdentifier(idents),
                ..
            } => Some(
                idents
                    .iter()
                    .map(|i| i.value.clone())
                    .collect::<Vec<_>>()
                    .join("."),
            ),
            SelectItem::UnnamedExpr(Expr::Identifier(ident))
            | SelectItem::ExprWithAlias {
                expr: Expr::Identifier(ident),
                ..
            } => Some(ident.value.clone()),
            _ => None,
        })
        .collect()
}

fn walk_table_with_joins(
    twj: &TableWithJoins,
    config: &ValidatorConfig,
    allowed_tables: Option<&HashSet<String>>,
    metadata: &mut SqlMetadata,
    violations: &mut Vec<SecurityViolation>,
    cte_names: &HashSet<String>,
) {
    check_table_factor(&twj.relation, allowed_tables, metadata, violations, cte_names);
    metadata.join_complexity += twj.joins.len();
    let _ = config;
    for join in &twj.joins {
        check_table_factor(&join.relation, allowed_tables, metadata, violations, cte_names);
    }
}

fn check_table_factor(
    factor: &TableFactor,
    allowed_tables: Option<&HashSet<String>>,
    metadata: &mut SqlMetadata,
    violations: &mut Vec<SecurityViolation>,
    cte_names: &HashSet<String>,
) {
    if let TableFactor::Table { name, .. } = factor {
        let full_name = name.to_string().to_lowercase();
        let bare_name = name
            .0
            .last()
            .map(|p| p.value.to_lowercase())
            .unwrap_or_default();

        if cte_names.contains(&bare_name) {
            return;
        }

        metadata.table_lineage.push(full_name.clone());

        if RESTRICTED_TABLES.contains(&bare_name.as_str())
            || SYSTEM_PREFIXES.iter().any(|p| full_name.starts_with(p))
        {
            violations.push(SecurityViolation::new(
                ViolationType::RestrictedTable,
                format!("table '{}' is restricted", full_name),
            ));
            return;
        }

        if let Some(allowlist) = allowed_tables {
            if !allowlist.contains(&bare_name) && !allowlist.contains(&full_name) {
                violations.push(SecurityViolation::new(
                    ViolationType::RestrictedTable,
                    format!("table '{}' is not in the allowlist", full_name),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> AstValidator {
        AstValidator::new(ValidatorConfig::default())
    }

    #[test]
    fn rejects_non_select_root() {
        let result = validator().validate("DROP TABLE customer", "sqlite", None, None);
        assert!(!result.is_valid);
        assert_eq!(result.violations[0].violation_type, ViolationType::ForbiddenCommand);
    }

    #[test]
    fn rejects_restricted_table() {
        let result = validator().validate("SELECT * FROM payroll", "sqlite", None, None);
        assert!(!result.is_valid);
        assert!(result
            .violations
            .iter()
            .any(|v| v.violation_type == ViolationType::RestrictedTable));
    }

    #[test]
    fn accepts_simple_select_and_extracts_lineage() {
        let result = validator().validate(
            "SELECT o.id FROM orders o JOIN customers c ON o.customer_id = c.id",
            "sqlite",
            None,
            None,
        );
        assert!(result.is_valid);
        assert_eq!(result.metadata.join_complexity, 1);
        assert!(result.metadata.table_lineage.contains(&"orders".to_string()));
    }

    #[test]
    fn rejects_multiple_statements() {
        let result = validator().validate(
            "SELECT 1; SELECT 2",
            "sqlite",
            None,
            None,
        );
        assert!(!result.is_valid);
        assert_eq!(
            result.violations[0].violation_type,
            ViolationType::MultipleStatements
        );
    }

    #[test]
    fn join_complexity_over_limit_is_rejected() {
        let mut config = ValidatorConfig::default();
        config.max_join_complexity = 0;
        let validator = AstValidator::new(config);
        let result = validator.validate(
            "SELECT a.id FROM a JOIN b ON a.id = b.a_id",
            "sqlite",
            None,
            None,
        );
        assert!(!result.is_valid);
        assert!(result
            .violations
            .iter()
            .any(|v| v.violation_type == ViolationType::ComplexityLimit));
    }

    #[test]
    fn cte_alias_is_excluded_from_table_allowlist_check() {
        let mut allowed = HashSet::new();
        allowed.insert("orders".to_string());
        let result = validator().validate(
            "WITH recent AS (SELECT id FROM orders) SELECT id FROM recent",
            "sqlite",
            Some(&allowed),
            None,
        );
        assert!(result.is_valid);
    }
}
