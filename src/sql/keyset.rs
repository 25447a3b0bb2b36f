//! Keyset pagination (C3): deterministic, optionally-signed cursors over
//! ORDER-BY-terminated SELECTs, with stable tie-breaker validation.

use crate::error::{Error, ErrorCode, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use sqlparser::ast::{Expr, OrderByExpr, SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;

type HmacSha256 = Hmac<Sha256>;

const NONDETERMINISTIC_FUNCTIONS: &[&str] = &[
    "rand",
    "random",
    "uuid",
    "gen_random_uuid",
    "now",
    "current_timestamp",
];

/// A single ORDER BY key, structurally described.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysetOrderKey {
    pub expression: String,
    pub alias: Option<String>,
    pub descending: bool,
    pub nulls_first: bool,
    pub explicit_nulls_order: bool,
}

/// Schema metadata lookups required to validate a stable tie-breaker.
pub trait SchemaInfoProvider {
    fn has_column(&self, table: &str, column: &str) -> bool;
    fn is_nullable(&self, table: &str, column: &str) -> bool;
    /// `None` means "no uniqueness information is known for this table",
    /// which is distinct from "known, and not unique".
    fn is_unique_key(&self, table: &str, columns: &[String]) -> Option<bool>;
}

/// Static, test/fixture-friendly implementation of [`SchemaInfoProvider`].
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaInfoProvider {
    columns: std::collections::HashMap<String, HashSet<String>>,
    nullable: std::collections::HashSet<(String, String)>,
    unique_keys: std::collections::HashMap<String, Vec<Vec<String>>>,
}

impl StaticSchemaInfoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, table: &str, column: &str, nullable: bool) -> Self {
        self.columns
            .entry(normalize_identifier(table))
            .or_default()
            .insert(normalize_identifier(column));
        if nullable {
            self.nullable
                .insert((normalize_identifier(table), normalize_identifier(column)));
        }
        self
    }

    pub fn with_unique_key(mut self, table: &str, columns: &[&str]) -> Self {
        let cols: Vec<String> = columns.iter().map(|c| normalize_identifier(c)).collect();
        self.unique_keys
            .entry(normalize_identifier(table))
            .or_default()
            .push(cols);
        self
    }

    /// Legacy constructor from a flat `table.column -> nullable` map.
    pub fn from_column_metadata(flat: &std::collections::HashMap<String, bool>) -> Self {
        let mut provider = Self::default();
        for (key, nullable) in flat {
            if let Some((table, column)) = key.split_once('.') {
                provider = provider.with_column(table, column, *nullable);
            }
        }
        provider
    }
}

impl SchemaInfoProvider for StaticSchemaInfoProvider {
    fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns
            .get(&normalize_identifier(table))
            .map(|cols| cols.contains(&normalize_identifier(column)))
            .unwrap_or(false)
    }

    fn is_nullable(&self, table: &str, column: &str) -> bool {
        self.nullable
            .contains(&(normalize_identifier(table), normalize_identifier(column)))
    }

    fn is_unique_key(&self, table: &str, columns: &[String]) -> Option<bool> {
        let keys = self.unique_keys.get(&normalize_identifier(table))?;
        let normalized: Vec<String> = columns.iter().map(|c| normalize_identifier(c)).collect();
        Some(keys.iter().any(|k| {
            let mut a = k.clone();
            let mut b = normalized.clone();
            a.sort();
            b.sort();
            a == b
        }))
    }
}

fn normalize_identifier(s: &str) -> String {
    s.trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
        .to_lowercase()
}

fn normalize_table_name(s: &str) -> String {
    s.split('.')
        .map(normalize_identifier)
        .collect::<Vec<_>>()
        .join(".")
}

const LEGACY_TIEBREAKER_ALLOWLIST: &[&str] = &["id"];

fn is_legacy_allowed_tiebreaker(table: &str, column: &str) -> bool {
    let column = normalize_identifier(column);
    LEGACY_TIEBREAKER_ALLOWLIST.contains(&column.as_str())
        || column == format!("{}_id", normalize_identifier(table))
}

/// Extract ORDER BY keys from a single SELECT, applying dialect-specific
/// null-ordering defaults and rejecting nondeterministic expressions.
pub fn extract_keyset_order_keys(sql: &str, dialect: &str) -> Result<Vec<KeysetOrderKey>> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| Error::keyset(ErrorCode::SyntaxError, e.to_string()))?;
    if statements.len() != 1 {
        return Err(Error::keyset(
            ErrorCode::ValidationError,
            "keyset pagination requires exactly one SELECT statement",
        ));
    }
    let query = match &statements[0] {
        Statement::Query(q) => q.as_ref(),
        _ => {
            return Err(Error::keyset(
                ErrorCode::ValidationError,
                "keyset pagination requires a SELECT statement",
            ))
        }
    };
    if !matches!(query.body.as_ref(), SetExpr::Select(_)) {
        return Err(Error::keyset(
            ErrorCode::ValidationError,
            "keyset pagination does not support set operations",
        ));
    }

    let is_postgres = matches!(dialect.to_lowercase().as_str(), "postgres" | "postgresql");
    let order_by = query
        .order_by
        .as_ref()
        .map(|o| o.exprs.clone())
        .unwrap_or_default();

    if order_by.is_empty() {
        return Err(Error::keyset(
            ErrorCode::KeysetRequiresStableTiebreaker,
            "query has no ORDER BY clause",
        ));
    }

    order_by
        .into_iter()
        .map(|key| build_order_key(key, is_postgres))
        .collect()
}

fn build_order_key(key: OrderByExpr, is_postgres: bool) -> Result<KeysetOrderKey> {
    let expression = key.expr.to_string();
    if contains_nondeterministic_call(&key.expr) {
        return Err(Error::keyset(
            ErrorCode::KeysetRequiresStableTiebreaker,
            format!("ORDER BY key '{}' is not deterministic", expression),
        ));
    }

    let descending = key.asc == Some(false);
    let (nulls_first, explicit_nulls_order) = match key.nulls_first {
        Some(explicit) => {
            let default = if is_postgres { !descending } else { false };
            (explicit, explicit != default)
        }
        None => {
            if is_postgres {
                (!descending, false)
            } else {
                (false, false)
            }
        }
    };

    let alias = match &key.expr {
        Expr::Identifier(i) => Some(i.value.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.clone()),
        _ => None,
    };

    Ok(KeysetOrderKey {
        expression,
        alias,
        descending,
        nulls_first,
        explicit_nulls_order,
    })
}

fn contains_nondeterministic_call(expr: &Expr) -> bool {
    match expr {
        Expr::Function(f) => {
            let name = f.name.to_string().to_lowercase();
            NONDETERMINISTIC_FUNCTIONS.contains(&name.as_str())
        }
        Expr::BinaryOp { left, right, .. } => {
            contains_nondeterministic_call(left) || contains_nondeterministic_call(right)
        }
        _ => {
            let text = expr.to_string().to_lowercase();
            NONDETERMINISTIC_FUNCTIONS
                .iter()
                .any(|f| text.contains(&format!("{}(", f)))
        }
    }
}

/// Extract base (non-CTE) table names referenced by the query, normalized.
pub fn extract_keyset_table_names(sql: &str) -> Result<Vec<String>> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| Error::keyset(ErrorCode::SyntaxError, e.to_string()))?;
    let query = match statements.first() {
        Some(Statement::Query(q)) => q.as_ref(),
        _ => {
            return Err(Error::keyset(
                ErrorCode::ValidationError,
                "expected a SELECT statement",
            ))
        }
    };

    let mut cte_names = HashSet::new();
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            cte_names.insert(normalize_identifier(&cte.alias.name.value));
        }
    }

    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s.as_ref(),
        _ => {
            return Err(Error::keyset(
                ErrorCode::ValidationError,
                "keyset pagination does not support set operations",
            ))
        }
    };

    let mut tables = Vec::new();
    for twj in &select.from {
        collect_table_name(&twj.relation, &cte_names, &mut tables);
        for join in &twj.joins {
            collect_table_name(&join.relation, &cte_names, &mut tables);
        }
    }
    Ok(tables)
}

fn collect_table_name(
    factor: &sqlparser::ast::TableFactor,
    cte_names: &HashSet<String>,
    out: &mut Vec<String>,
) {
    if let sqlparser::ast::TableFactor::Table { name, .. } = factor {
        let normalized = normalize_table_name(&name.to_string());
        let bare = normalized.rsplit('.').next().unwrap_or(&normalized).to_string();
        if !cte_names.contains(&bare) {
            out.push(normalized);
        }
    }
}

/// Validate that the final ORDER BY key is a stable, unique tie-breaker.
/// `table` is the table the tie-breaker column is assumed to belong to in
/// legacy/metadata-map mode.
pub fn validate_stable_tiebreaker(
    keys: &[KeysetOrderKey],
    table: &str,
    schema_info: Option<&dyn SchemaInfoProvider>,
) -> Result<()> {
    let last = keys
        .last()
        .ok_or_else(|| Error::keyset(ErrorCode::KeysetRequiresStableTiebreaker, "no ORDER BY keys"))?;

    let column = last.alias.clone().unwrap_or_else(|| last.expression.clone());
    if column.contains('(') {
        return Err(Error::keyset(
            ErrorCode::KeysetRequiresStableTiebreaker,
            "final ORDER BY key must be a plain column",
        ));
    }

    if let Some(provider) = schema_info {
        // Try progressively shorter suffixes of the order-by column list as
        // candidate composite unique keys.
        let columns: Vec<String> = keys
            .iter()
            .map(|k| k.alias.clone().unwrap_or_else(|| k.expression.clone()))
            .collect();

        let mut resolved_unique = false;
        for start in 0..columns.len() {
            let suffix = &columns[start..];
            if let Some(true) = provider.is_unique_key(table, suffix) {
                resolved_unique = true;
                break;
            }
        }

        if !resolved_unique {
            if is_legacy_allowed_tiebreaker(table, &column) {
                return Ok(());
            }
            return if provider.is_unique_key(table, &[column.clone()]).is_some() {
                Err(Error::keyset(
                    ErrorCode::KeysetTiebreakerNotUnique,
                    "no ORDER BY suffix resolves to a known unique key",
                ))
            } else {
                Err(Error::keyset(
                    ErrorCode::KeysetRequiresStableTiebreaker,
                    "tie-breaker uniqueness is unknown",
                ))
            };
        }

        if provider.has_column(table, &column)
            && provider.is_nullable(table, &column)
            && !last.explicit_nulls_order
        {
            return Err(Error::keyset(
                ErrorCode::KeysetTiebreakerNullable,
                "tie-breaker column is nullable without explicit NULLS ordering",
            ));
        }
        Ok(())
    } else if is_legacy_allowed_tiebreaker(table, &column) {
        Ok(())
    } else {
        Err(Error::keyset(
            ErrorCode::KeysetRequiresStableTiebreaker,
            "no schema metadata available to validate tie-breaker uniqueness",
        ))
    }
}

/// A "strictly after" predicate built from a decoded cursor, ready to be
/// AND-ed onto the paginated query's WHERE clause.
#[derive(Debug, Clone, PartialEq)]
pub struct KeysetPredicate {
    /// SQL boolean expression text with positional `?` placeholders.
    pub sql: String,
    /// Values for the placeholders, in order.
    pub params: Vec<Value>,
}

/// Build the lexicographic "strictly after" predicate for a decoded cursor:
/// at each key, `key_i > v_i`/`<` (direction-dependent) is OR-ed with an
/// equality tie-break AND-ed with the predicate for the remaining keys, so
/// the whole expression is true only for rows strictly past the cursor in
/// ORDER BY order.
pub fn build_strictly_after_predicate(
    keys: &[KeysetOrderKey],
    cursor_values: &[Value],
    is_postgres: bool,
) -> Result<KeysetPredicate> {
    if keys.len() != cursor_values.len() {
        return Err(Error::keyset(
            ErrorCode::KeysetOrderMismatch,
            "cursor value count does not match the number of ORDER BY keys",
        ));
    }
    let (sql, params) = build_strictly_after_branch(keys, cursor_values, 0, is_postgres);
    Ok(KeysetPredicate { sql, params })
}

fn build_strictly_after_branch(
    keys: &[KeysetOrderKey],
    values: &[Value],
    idx: usize,
    is_postgres: bool,
) -> (String, Vec<Value>) {
    if idx == keys.len() {
        return ("FALSE".to_string(), Vec::new());
    }

    let key = &keys[idx];
    let value = &values[idx];
    let column = key.alias.clone().unwrap_or_else(|| key.expression.clone());

    let (cmp_sql, eq_sql, mut params) = if matches!(value, Value::Null) {
        if is_postgres && key.nulls_first {
            (format!("{column} IS NOT NULL"), format!("{column} IS NULL"), Vec::new())
        } else {
            // NULLS LAST (or any non-Postgres dialect): a null cursor value
            // is already the terminal position for this key, so nothing can
            // be "after" it via a plain comparison or via an equality tie.
            ("FALSE".to_string(), "FALSE".to_string(), Vec::new())
        }
    } else {
        let op = if key.descending { "<" } else { ">" };
        (
            format!("{column} {op} ?"),
            format!("{column} = ?"),
            vec![value.clone()],
        )
    };
    // Both branches reference the same cursor value, so the equality branch
    // needs its own copy of the placeholder param.
    let eq_params = params.clone();
    let (rest_sql, rest_params) = build_strictly_after_branch(keys, values, idx + 1, is_postgres);

    params.extend(eq_params);
    params.extend(rest_params);

    (format!("({cmp_sql} OR ({eq_sql} AND {rest_sql}))"), params)
}

/// Re-parse `sql` and AND `predicate_sql` onto its WHERE clause. `predicate_sql`
/// must be a standalone boolean expression (as produced by
/// [`build_strictly_after_predicate`]).
pub fn append_keyset_predicate(sql: &str, predicate_sql: &str) -> Result<String> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| Error::keyset(ErrorCode::SyntaxError, e.to_string()))?;
    if statements.len() != 1 {
        return Err(Error::keyset(
            ErrorCode::ValidationError,
            "expected exactly one statement",
        ));
    }
    let mut query = match statements.into_iter().next().unwrap() {
        Statement::Query(q) => *q,
        _ => {
            return Err(Error::keyset(
                ErrorCode::ValidationError,
                "expected a SELECT statement",
            ))
        }
    };
    let predicate = parse_standalone_predicate(predicate_sql)?;
    let select = match query.body.as_mut() {
        SetExpr::Select(s) => s.as_mut(),
        _ => {
            return Err(Error::keyset(
                ErrorCode::ValidationError,
                "keyset pagination does not support set operations",
            ))
        }
    };
    select.selection = Some(match select.selection.take() {
        Some(existing) => Expr::BinaryOp {
            left: Box::new(existing),
            op: sqlparser::ast::BinaryOperator::And,
            right: Box::new(predicate),
        },
        None => predicate,
    });
    Ok(query.to_string())
}

fn parse_standalone_predicate(predicate_sql: &str) -> Result<Expr> {
    let wrapped = format!("SELECT 1 WHERE {predicate_sql}");
    let statements = Parser::parse_sql(&GenericDialect {}, &wrapped)
        .map_err(|e| Error::keyset(ErrorCode::SyntaxError, e.to_string()))?;
    match statements.into_iter().next() {
        Some(Statement::Query(q)) => match *q.body {
            SetExpr::Select(s) => s.selection.ok_or_else(|| {
                Error::keyset(ErrorCode::ValidationError, "predicate did not parse to an expression")
            }),
            _ => Err(Error::keyset(
                ErrorCode::ValidationError,
                "predicate did not parse to an expression",
            )),
        },
        _ => Err(Error::keyset(
            ErrorCode::ValidationError,
            "predicate did not parse to an expression",
        )),
    }
}

/// Structural signature of the ORDER BY clause, used in the cursor
/// fingerprint to detect a changed ORDER BY between calls.
pub fn build_keyset_order_signature(keys: &[KeysetOrderKey]) -> String {
    let parts: Vec<String> = keys
        .iter()
        .map(|k| format!("{}:{}:{}", k.expression, k.descending, k.nulls_first))
        .collect();
    parts.join("|")
}

/// Cursor payload prior to encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysetCursorPayload {
    #[serde(rename = "v")]
    pub values: Vec<Value>,
    #[serde(rename = "k")]
    pub keys: String,
    #[serde(rename = "f")]
    pub fingerprint: String,
}

fn canonical_json(payload: &KeysetCursorPayload) -> Result<String> {
    let value = serde_json::to_value(payload)?;
    Ok(serde_json::to_string(&sort_keys(value))?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Build a fingerprint incorporating schema snapshot, backend-set signature
/// (federated only), and the ORDER BY structural signature.
pub fn compute_fingerprint(
    schema_snapshot_id: &str,
    order_signature: &str,
    backend_set_signature: Option<&str>,
) -> String {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(schema_snapshot_id.as_bytes());
    hasher.update(b"|");
    hasher.update(order_signature.as_bytes());
    if let Some(bs) = backend_set_signature {
        hasher.update(b"|");
        hasher.update(bs.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Encode a keyset cursor, optionally HMAC-signed when `secret` is supplied.
pub fn encode_keyset_cursor(payload: &KeysetCursorPayload, secret: Option<&[u8]>) -> Result<String> {
    let json = canonical_json(payload)?;
    let mut wire = serde_json::from_str::<Value>(&json)?;

    if let Some(secret) = secret {
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::keyset(ErrorCode::Unknown, e.to_string()))?;
        mac.update(json.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        if let Value::Object(ref mut map) = wire {
            map.insert("s".to_string(), Value::String(sig));
        }
    }

    let final_json = serde_json::to_string(&sort_keys(wire))?;
    Ok(URL_SAFE_NO_PAD.encode(final_json.as_bytes()))
}

/// Decode and validate a keyset cursor against the expected fingerprint and
/// (optionally) expected key structure and HMAC secret.
pub fn decode_keyset_cursor(
    cursor: &str,
    expected_fingerprint: &str,
    expected_keys: Option<&str>,
    secret: Option<&[u8]>,
) -> Result<KeysetCursorPayload> {
    let raw = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| Error::keyset(ErrorCode::ValidationError, "cursor is not valid base64url"))?;
    let wire: Value = serde_json::from_slice(&raw)
        .map_err(|_| Error::keyset(ErrorCode::ValidationError, "cursor payload is not valid JSON"))?;

    let fingerprint = wire
        .get("f")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::keyset(ErrorCode::ValidationError, "cursor missing fingerprint"))?;
    if fingerprint != expected_fingerprint {
        return Err(Error::keyset(
            ErrorCode::PaginationBackendSetChanged,
            "cursor fingerprint does not match current schema/query/backend context",
        ));
    }

    if let Some(expected) = expected_keys {
        let keys = wire.get("k").and_then(Value::as_str).unwrap_or_default();
        if keys != expected {
            return Err(Error::keyset(
                ErrorCode::KeysetOrderMismatch,
                "cursor ORDER BY structure does not match the current query",
            ));
        }
    }

    if let Some(secret) = secret {
        let signature = wire
            .get("s")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::keyset(ErrorCode::ValidationError, "cursor is missing its signature"))?
            .to_string();

        let mut unsigned = wire.clone();
        if let Value::Object(ref mut map) = unsigned {
            map.remove("s");
        }
        let unsigned_json = serde_json::to_string(&sort_keys(unsigned))?;

        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::keyset(ErrorCode::Unknown, e.to_string()))?;
        mac.update(unsigned_json.as_bytes());
        let expected_sig = hex::encode(mac.finalize().into_bytes());

        if !constant_time_eq(signature.as_bytes(), expected_sig.as_bytes()) {
            return Err(Error::keyset(
                ErrorCode::ValidationError,
                "cursor signature verification failed",
            ));
        }
    }

    serde_json::from_value(wire)
        .map_err(|e| Error::keyset(ErrorCode::ValidationError, format!("malformed cursor payload: {e}")))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// A lightweight hex encoder so we don't pull in the `hex` crate solely for
/// this; kept local and infallible for fixed-size digest output.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_order_keys_with_postgres_defaults() {
        let keys = extract_keyset_order_keys(
            "SELECT id FROM orders ORDER BY created_at DESC, id ASC",
            "postgres",
        )
        .unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].descending);
        assert!(keys[0].nulls_first);
        assert!(!keys[1].descending);
        assert!(!keys[1].nulls_first);
    }

    #[test]
    fn rejects_nondeterministic_order_key() {
        let err = extract_keyset_order_keys("SELECT id FROM t ORDER BY RANDOM()", "sqlite")
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeysetRequiresStableTiebreaker);
    }

    #[test]
    fn cursor_round_trips() {
        let payload = KeysetCursorPayload {
            values: vec![Value::from(42), Value::from("2024-01-01")],
            keys: "id:false:false".to_string(),
            fingerprint: "abc123".to_string(),
        };
        let cursor = encode_keyset_cursor(&payload, None).unwrap();
        let decoded = decode_keyset_cursor(&cursor, "abc123", Some("id:false:false"), None).unwrap();
        assert_eq!(decoded.values, payload.values);
    }

    #[test]
    fn cursor_rejects_fingerprint_mismatch() {
        let payload = KeysetCursorPayload {
            values: vec![Value::from(1)],
            keys: "id".to_string(),
            fingerprint: "aaa".to_string(),
        };
        let cursor = encode_keyset_cursor(&payload, None).unwrap();
        let err = decode_keyset_cursor(&cursor, "bbb", None, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PaginationBackendSetChanged);
    }

    #[test]
    fn cursor_hmac_tamper_is_rejected() {
        let payload = KeysetCursorPayload {
            values: vec![Value::from(1)],
            keys: "id".to_string(),
            fingerprint: "fp".to_string(),
        };
        let secret = b"topsecret";
        let cursor = encode_keyset_cursor(&payload, Some(secret)).unwrap();
        let mut tampered = cursor.clone();
        tampered.push('A');
        let err = decode_keyset_cursor(&tampered, "fp", None, Some(secret)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn legacy_tiebreaker_allowlist_accepts_id() {
        let keys = vec![KeysetOrderKey {
            expression: "id".to_string(),
            alias: Some("id".to_string()),
            descending: false,
            nulls_first: false,
            explicit_nulls_order: false,
        }];
        assert!(validate_stable_tiebreaker(&keys, "orders", None).is_ok());
    }

    #[test]
    fn strictly_after_predicate_two_keys_ascending() {
        let keys = vec![
            KeysetOrderKey {
                expression: "created_at".to_string(),
                alias: Some("created_at".to_string()),
                descending: false,
                nulls_first: false,
                explicit_nulls_order: false,
            },
            KeysetOrderKey {
                expression: "id".to_string(),
                alias: Some("id".to_string()),
                descending: false,
                nulls_first: false,
                explicit_nulls_order: false,
            },
        ];
        let values = vec![Value::from("2024-01-01"), Value::from(42)];
        let predicate = build_strictly_after_predicate(&keys, &values, false).unwrap();
        assert_eq!(
            predicate.sql,
            "(created_at > ? OR (created_at = ? AND (id > ? OR (id = ? AND FALSE))))"
        );
        assert_eq!(predicate.params.len(), 4);
    }

    #[test]
    fn strictly_after_predicate_rejects_length_mismatch() {
        let keys = vec![KeysetOrderKey {
            expression: "id".to_string(),
            alias: Some("id".to_string()),
            descending: false,
            nulls_first: false,
            explicit_nulls_order: false,
        }];
        let err = build_strictly_after_predicate(&keys, &[], false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeysetOrderMismatch);
    }

    #[test]
    fn append_keyset_predicate_ands_onto_existing_where() {
        let sql = "SELECT id FROM orders WHERE status = 'open' ORDER BY id";
        let out = append_keyset_predicate(sql, "id > ?").unwrap();
        assert!(out.contains("status = 'open'"));
        assert!(out.contains("id > ?"));
        assert!(out.to_uppercase().contains("AND"));
    }

    #[test]
    fn schema_info_mode_rejects_nullable_tiebreaker_without_explicit_nulls() {
        let provider = StaticSchemaInfoProvider::new()
            .with_column("orders", "email", true)
            .with_unique_key("orders", &["email"]);
        let keys = vec![KeysetOrderKey {
            expression: "email".to_string(),
            alias: Some("email".to_string()),
            descending: false,
            nulls_first: false,
            explicit_nulls_order: false,
        }];
        let err = validate_stable_tiebreaker(&keys, "orders", Some(&provider)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeysetTiebreakerNullable);
    }
}
