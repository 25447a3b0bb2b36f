//! SQLite-backed [`RegistryStore`] implementation.

use super::{cosine_similarity, QueryPair, QueryPairRole, QueryPairStatus, RegistryStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS query_pairs (
    signature_key TEXT NOT NULL,
    tenant_key INTEGER NOT NULL,
    question TEXT NOT NULL,
    sql_query TEXT NOT NULL,
    embedding BLOB,
    roles TEXT NOT NULL,
    status TEXT NOT NULL,
    metadata TEXT,
    performance TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (signature_key, tenant_key)
);
";

/// Sentinel `tenant_key` used for cross-tenant (global) examples, since
/// SQLite treats every `NULL` in a composite primary key as distinct.
const GLOBAL_TENANT_KEY: i64 = -1;

fn tenant_key(tenant_id: Option<i64>) -> i64 {
    tenant_id.unwrap_or(GLOBAL_TENANT_KEY)
}

fn tenant_from_key(key: i64) -> Option<i64> {
    if key == GLOBAL_TENANT_KEY {
        None
    } else {
        Some(key)
    }
}

pub struct SqliteRegistryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::storage(e.to_string()))?;
        conn.execute_batch(SCHEMA).map_err(|e| Error::storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage(e.to_string()))?;
        conn.execute_batch(SCHEMA).map_err(|e| Error::storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| Error::internal(format!("registry connection lock poisoned: {e}")))?;
        f(&conn).map_err(|e| Error::storage(e.to_string()))
    }

    fn row_to_pair(row: &rusqlite::Row) -> rusqlite::Result<QueryPair> {
        let tenant_key_raw: i64 = row.get("tenant_key")?;
        let roles_json: String = row.get("roles")?;
        let status_str: String = row.get("status")?;
        let metadata_json: Option<String> = row.get("metadata")?;
        let performance_json: Option<String> = row.get("performance")?;
        let embedding: Option<Vec<u8>> = row.get("embedding")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        let roles: Vec<QueryPairRole> = serde_json::from_str::<Vec<String>>(&roles_json)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| QueryPairRole::parse(&r))
            .collect();

        Ok(QueryPair {
            signature_key: row.get("signature_key")?,
            tenant_id: tenant_from_key(tenant_key_raw),
            question: row.get("question")?,
            sql_query: row.get("sql_query")?,
            embedding: embedding.map(|bytes| {
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap_or([0; 4])))
                    .collect()
            }),
            roles,
            status: QueryPairStatus::parse(&status_str).unwrap_or(QueryPairStatus::Seeded),
            metadata: metadata_json.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default(),
            performance: performance_json.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_datetime(created_at),
            updated_at: parse_datetime(updated_at),
        })
    }

    const SELECT_COLUMNS: &'static str =
        "signature_key, tenant_key, question, sql_query, embedding, roles, status, metadata, performance, created_at, updated_at";
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn embedding_to_blob(embedding: &Option<Vec<f32>>) -> Option<Vec<u8>> {
    embedding.as_ref().map(|e| e.iter().flat_map(|f| f.to_le_bytes()).collect())
}

fn roles_json(roles: &[QueryPairRole]) -> String {
    serde_json::to_string(&roles.iter().map(|r| r.as_str()).collect::<Vec<_>>()).unwrap_or_else(|_| "[]".to_string())
}

#[async_trait]
impl RegistryStore for SqliteRegistryStore {
    async fn store_pair(&self, pair: QueryPair) -> Result<QueryPair> {
        self.with_conn(|conn| {
            let metadata = serde_json::to_string(&pair.metadata).ok();
            let performance = pair.performance.as_ref().and_then(|p| serde_json::to_string(p).ok());
            conn.execute(
                &format!(
                    "INSERT INTO query_pairs ({cols}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(signature_key, tenant_key) DO UPDATE SET
                        question = excluded.question,
                        sql_query = excluded.sql_query,
                        embedding = excluded.embedding,
                        roles = excluded.roles,
                        status = excluded.status,
                        metadata = excluded.metadata,
                        performance = excluded.performance,
                        updated_at = excluded.updated_at",
                    cols = Self::SELECT_COLUMNS
                ),
                params![
                    pair.signature_key,
                    tenant_key(pair.tenant_id),
                    pair.question,
                    pair.sql_query,
                    embedding_to_blob(&pair.embedding),
                    roles_json(&pair.roles),
                    pair.status.as_str(),
                    metadata,
                    performance,
                    pair.created_at.to_rfc3339(),
                    pair.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(pair)
        })
    }

    async fn lookup_by_signature(&self, signature_key: &str, tenant_id: Option<i64>) -> Result<Option<QueryPair>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM query_pairs WHERE signature_key = ?1 AND tenant_key = ?2", Self::SELECT_COLUMNS),
                params![signature_key, tenant_key(tenant_id)],
                Self::row_to_pair,
            )
            .optional()
        })
    }

    async fn lookup_semantic_candidates(
        &self,
        embedding: &[f32],
        role: Option<QueryPairRole>,
        tenant_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(QueryPair, f64)>> {
        let candidates = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM query_pairs WHERE status != 'tombstoned' AND (tenant_key = ?1 OR tenant_key = ?2)",
                Self::SELECT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![tenant_key(tenant_id), GLOBAL_TENANT_KEY], Self::row_to_pair)?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            Ok(rows)
        })?;

        let mut scored: Vec<(QueryPair, f64)> = candidates
            .into_iter()
            .filter(|p| role.map(|r| p.has_role(r)).unwrap_or(true))
            .filter_map(|p| {
                let score = p.embedding.as_ref().map(|e| cosine_similarity(e, embedding))?;
                Some((p, score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn fetch_by_role(&self, role: QueryPairRole, tenant_id: Option<i64>, limit: usize) -> Result<Vec<QueryPair>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM query_pairs WHERE status != 'tombstoned' AND (tenant_key = ?1 OR tenant_key = ?2) ORDER BY updated_at DESC",
                Self::SELECT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![tenant_key(tenant_id), GLOBAL_TENANT_KEY], Self::row_to_pair)?
                .filter_map(|r| r.ok())
                .filter(|p: &QueryPair| p.has_role(role))
                .take(limit)
                .collect();
            Ok(rows)
        })
    }

    async fn fetch_by_signatures(&self, signature_keys: &[String], tenant_id: Option<i64>) -> Result<Vec<QueryPair>> {
        if signature_keys.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let placeholders: Vec<String> = (0..signature_keys.len()).map(|i| format!("?{}", i + 3)).collect();
            let sql = format!(
                "SELECT {} FROM query_pairs WHERE (tenant_key = ?1 OR tenant_key = ?2) AND signature_key IN ({})",
                Self::SELECT_COLUMNS,
                placeholders.join(",")
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tenant_key(tenant_id)), Box::new(GLOBAL_TENANT_KEY)];
            for key in signature_keys {
                bound.push(Box::new(key.clone()));
            }
            let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(refs.as_slice(), Self::row_to_pair)?.filter_map(|r| r.ok()).collect();
            Ok(rows)
        })
    }

    async fn tombstone_pair(&self, signature_key: &str, tenant_id: Option<i64>, reason: &str) -> Result<()> {
        let existing = self.lookup_by_signature(signature_key, tenant_id).await?;
        let mut metadata = existing.map(|p| p.metadata).unwrap_or_default();
        metadata.insert("tombstone_reason".to_string(), serde_json::Value::String(reason.to_string()));
        let metadata_json = serde_json::to_string(&metadata).ok();

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE query_pairs SET status = 'tombstoned', metadata = ?3, updated_at = ?4
                 WHERE signature_key = ?1 AND tenant_key = ?2",
                params![signature_key, tenant_key(tenant_id), metadata_json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::QueryPair;

    fn sample(signature: &str, tenant_id: Option<i64>) -> QueryPair {
        let mut pair = QueryPair::new(signature, "how many orders", "SELECT count(*) FROM orders");
        pair.tenant_id = tenant_id;
        pair.embedding = Some(vec![1.0, 0.0, 0.0]);
        pair.status = QueryPairStatus::Verified;
        pair
    }

    #[tokio::test]
    async fn store_then_lookup_by_signature_round_trips() {
        let store = SqliteRegistryStore::in_memory().unwrap();
        store.store_pair(sample("sig-1", Some(7))).await.unwrap();

        let found = store.lookup_by_signature("sig-1", Some(7)).await.unwrap().unwrap();
        assert_eq!(found.question, "how many orders");
        assert_eq!(found.status, QueryPairStatus::Verified);
    }

    #[tokio::test]
    async fn upsert_overwrites_prior_value() {
        let store = SqliteRegistryStore::in_memory().unwrap();
        store.store_pair(sample("sig-1", Some(7))).await.unwrap();
        let mut updated = sample("sig-1", Some(7));
        updated.sql_query = "SELECT count(*) FROM orders WHERE status = 'open'".to_string();
        store.store_pair(updated).await.unwrap();

        let found = store.lookup_by_signature("sig-1", Some(7)).await.unwrap().unwrap();
        assert!(found.sql_query.contains("status = 'open'"));
    }

    #[tokio::test]
    async fn semantic_candidates_rank_by_cosine_similarity() {
        let store = SqliteRegistryStore::in_memory().unwrap();
        let mut near = sample("sig-near", Some(7));
        near.embedding = Some(vec![1.0, 0.0, 0.0]);
        let mut far = sample("sig-far", Some(7));
        far.embedding = Some(vec![0.0, 1.0, 0.0]);
        store.store_pair(near).await.unwrap();
        store.store_pair(far).await.unwrap();

        let results = store.lookup_semantic_candidates(&[1.0, 0.0, 0.0], None, Some(7), 10).await.unwrap();
        assert_eq!(results[0].0.signature_key, "sig-near");
    }

    #[tokio::test]
    async fn tombstoned_pair_is_excluded_from_semantic_candidates() {
        let store = SqliteRegistryStore::in_memory().unwrap();
        store.store_pair(sample("sig-1", Some(7))).await.unwrap();
        store.tombstone_pair("sig-1", Some(7), "superseded").await.unwrap();

        let results = store.lookup_semantic_candidates(&[1.0, 0.0, 0.0], None, Some(7), 10).await.unwrap();
        assert!(results.is_empty());

        let fetched = store.lookup_by_signature("sig-1", Some(7)).await.unwrap().unwrap();
        assert_eq!(fetched.status, QueryPairStatus::Tombstoned);
    }

    #[tokio::test]
    async fn global_example_is_visible_to_any_tenant() {
        let store = SqliteRegistryStore::in_memory().unwrap();
        store.store_pair(sample("sig-global", None)).await.unwrap();

        let results = store.lookup_semantic_candidates(&[1.0, 0.0, 0.0], None, Some(99), 10).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn fetch_by_signatures_batches_lookup() {
        let store = SqliteRegistryStore::in_memory().unwrap();
        store.store_pair(sample("sig-1", Some(7))).await.unwrap();
        store.store_pair(sample("sig-2", Some(7))).await.unwrap();

        let found = store
            .fetch_by_signatures(&["sig-1".to_string(), "sig-2".to_string(), "sig-missing".to_string()], Some(7))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }
}
