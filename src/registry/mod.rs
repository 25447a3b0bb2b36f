//! Few-shot example registry (C8): `QueryPair` persistence plus the
//! recommendation pipeline in [`recommend`].

pub mod recommend;
pub mod store;

pub use store::SqliteRegistryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryPairRole {
    Example,
    Interaction,
}

impl QueryPairRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Example => "example",
            Self::Interaction => "interaction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "example" => Some(Self::Example),
            "interaction" => Some(Self::Interaction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryPairStatus {
    Seeded,
    Verified,
    Tombstoned,
}

impl QueryPairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seeded => "seeded",
            Self::Verified => "verified",
            Self::Tombstoned => "tombstoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seeded" => Some(Self::Seeded),
            "verified" => Some(Self::Verified),
            "tombstoned" => Some(Self::Tombstoned),
            _ => None,
        }
    }

    /// Rank used by the recommendation ranking step: lower sorts first.
    /// Verified examples outrank seeded, which outrank interaction-sourced
    /// fallback candidates (interaction isn't a status but reuses this
    /// ordering when blended with role during ranking).
    pub fn priority(&self) -> u8 {
        match self {
            Self::Verified => 0,
            Self::Seeded => 1,
            Self::Tombstoned => 255,
        }
    }
}

/// A stored question/SQL example. Uniqueness is `(signature_key, tenant_id)`;
/// `tenant_id = None` is a global (cross-tenant) example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPair {
    pub signature_key: String,
    pub tenant_id: Option<i64>,
    pub question: String,
    pub sql_query: String,
    pub embedding: Option<Vec<f32>>,
    pub roles: Vec<QueryPairRole>,
    pub status: QueryPairStatus,
    pub metadata: HashMap<String, Value>,
    pub performance: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueryPair {
    pub fn new(signature_key: impl Into<String>, question: impl Into<String>, sql_query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            signature_key: signature_key.into(),
            tenant_id: None,
            question: question.into(),
            sql_query: sql_query.into(),
            embedding: None,
            roles: vec![QueryPairRole::Example],
            status: QueryPairStatus::Seeded,
            metadata: HashMap::new(),
            performance: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_role(&self, role: QueryPairRole) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_complete(&self) -> bool {
        !self.question.trim().is_empty() && !self.sql_query.trim().is_empty() && !self.signature_key.trim().is_empty()
    }
}

/// Registry persistence interface (§4.8 "Registry persistence"). Kept async
/// for uniformity with the crate's other external-collaborator interfaces
/// even though the reference implementation is SQLite-backed and blocking
/// under its own lock.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn store_pair(&self, pair: QueryPair) -> Result<QueryPair>;

    async fn lookup_by_signature(&self, signature_key: &str, tenant_id: Option<i64>) -> Result<Option<QueryPair>>;

    /// Embedding-similarity search bounded by `limit`, optionally scoped to
    /// a role and/or tenant. Returns pairs with their cosine-similarity
    /// score against `embedding`, highest first.
    async fn lookup_semantic_candidates(
        &self,
        embedding: &[f32],
        role: Option<QueryPairRole>,
        tenant_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(QueryPair, f64)>>;

    async fn fetch_by_role(&self, role: QueryPairRole, tenant_id: Option<i64>, limit: usize) -> Result<Vec<QueryPair>>;

    async fn fetch_by_signatures(&self, signature_keys: &[String], tenant_id: Option<i64>) -> Result<Vec<QueryPair>>;

    async fn tombstone_pair(&self, signature_key: &str, tenant_id: Option<i64>, reason: &str) -> Result<()>;
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0_f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn query_pair_completeness_requires_non_empty_fields() {
        let pair = QueryPair::new("sig", "", "SELECT 1");
        assert!(!pair.is_complete());
    }
}
