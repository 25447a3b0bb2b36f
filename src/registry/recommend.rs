//! Few-shot recommendation pipeline (§4.8): pin resolution, candidate
//! retrieval, validity filtering, ranking, dedup, diversity, fallback.

use super::{QueryPair, QueryPairRole, QueryPairStatus, RegistryStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMatchType {
    Exact,
    Contains,
}

/// A configured pin rule: questions matching `pattern` always surface
/// `signature_key` first, subject to priority ordering among rules that
/// both match.
#[derive(Debug, Clone)]
pub struct PinRule {
    pub pattern: String,
    pub match_type: PinMatchType,
    pub signature_key: String,
    pub priority: i32,
}

impl PinRule {
    fn matches(&self, question: &str) -> bool {
        match self.match_type {
            PinMatchType::Exact => question.eq_ignore_ascii_case(&self.pattern),
            PinMatchType::Contains => question.to_lowercase().contains(&self.pattern.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecommendationInputs {
    pub question: String,
    pub question_embedding: Vec<f32>,
    pub tenant_id: Option<i64>,
    pub limit: usize,
    pub enable_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendedExample {
    pub question: String,
    pub sql: String,
    pub score: f64,
    pub source: String,
    pub canonical_group_id: String,
    pub metadata: std::collections::HashMap<String, Value>,
}

/// Describes how the final recommendation list was assembled, for
/// observability and offline tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Explanation {
    pub pins_matched: Vec<String>,
    pub candidates_per_source: std::collections::HashMap<String, usize>,
    pub filters_applied: Vec<String>,
    pub diversity_applied: bool,
    pub fallback_used: bool,
}

#[derive(Debug, Clone)]
pub struct RecommendationConfig {
    /// Candidates fetched per source = `limit * candidate_multiplier`.
    pub candidate_multiplier: usize,
    pub stale_max_age_days: i64,
    pub max_question_len: usize,
    pub blocklist: Vec<String>,
    pub diversity_min_verified: usize,
    pub diversity_max_per_source: usize,
    pub fallback_similarity_threshold: f64,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            candidate_multiplier: 3,
            stale_max_age_days: 0,
            max_question_len: 2000,
            blocklist: Vec::new(),
            diversity_min_verified: 1,
            diversity_max_per_source: 2,
            fallback_similarity_threshold: 0.55,
        }
    }
}

pub struct RecommendationService {
    store: Arc<dyn RegistryStore>,
    pin_rules: Vec<PinRule>,
    config: RecommendationConfig,
}

struct Candidate {
    pair: QueryPair,
    score: f64,
    source: &'static str,
}

impl RecommendationService {
    pub fn new(store: Arc<dyn RegistryStore>, pin_rules: Vec<PinRule>, config: RecommendationConfig) -> Self {
        Self { store, pin_rules, config }
    }

    pub async fn recommend(&self, inputs: &RecommendationInputs) -> crate::error::Result<(Vec<RecommendedExample>, Explanation)> {
        let mut explanation = Explanation::default();

        // 1. Pin resolution.
        let mut pinned_rules: Vec<&PinRule> = self.pin_rules.iter().filter(|r| r.matches(&inputs.question)).collect();
        pinned_rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        let pinned_signatures: Vec<String> = pinned_rules.iter().map(|r| r.signature_key.clone()).collect();
        explanation.pins_matched = pinned_signatures.clone();

        let mut pinned_pairs = if pinned_signatures.is_empty() {
            Vec::new()
        } else {
            self.store.fetch_by_signatures(&pinned_signatures, inputs.tenant_id).await?
        };
        pinned_pairs.retain(|p| p.status != QueryPairStatus::Tombstoned);
        // preserve rule priority order, not storage order
        pinned_pairs.sort_by_key(|p| pinned_signatures.iter().position(|s| s == &p.signature_key).unwrap_or(usize::MAX));

        let mut candidates: Vec<Candidate> = pinned_pairs.into_iter().map(|pair| Candidate { pair, score: 1.0, source: "pinned" }).collect();

        // 2. Candidate retrieval.
        let fetch_limit = inputs.limit * self.config.candidate_multiplier.max(1);
        for (role, source) in [(QueryPairRole::Example, "verified_or_seeded")] {
            let semantic = self
                .store
                .lookup_semantic_candidates(&inputs.question_embedding, Some(role), inputs.tenant_id, fetch_limit)
                .await?;
            explanation.candidates_per_source.insert(source.to_string(), semantic.len());
            for (pair, score) in semantic {
                candidates.push(Candidate { pair, score, source });
            }
        }

        // 3. Validity filtering.
        let before = candidates.len();
        candidates.retain(|c| self.is_valid(&c.pair));
        if candidates.len() != before {
            explanation.filters_applied.push("validity".to_string());
        }

        // 4. Ranking: status priority first, then semantic score (pinned
        // candidates already carry score 1.0 and outrank everything else
        // structurally via source, handled by stable sort on a composite key).
        candidates.sort_by(|a, b| {
            let source_rank = |c: &Candidate| if c.source == "pinned" { 0 } else { 1 };
            source_rank(a)
                .cmp(&source_rank(b))
                .then(a.pair.status.priority().cmp(&b.pair.status.priority()))
                .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
        });

        // 5. Deduplication by signature_key, first (highest-ranked) wins.
        let mut seen: HashSet<String> = HashSet::new();
        candidates.retain(|c| seen.insert(c.pair.signature_key.clone()));

        // 6. Diversity policy.
        let selected = self.apply_diversity(candidates, inputs.limit, &mut explanation);

        let mut selected = selected;

        // 7. Fallback.
        if selected.len() < inputs.limit && inputs.enable_fallback {
            let needed = inputs.limit - selected.len();
            let fallback_candidates = self
                .store
                .lookup_semantic_candidates(&inputs.question_embedding, Some(QueryPairRole::Interaction), inputs.tenant_id, fetch_limit)
                .await?;
            let already: HashSet<String> = selected.iter().map(|c: &Candidate| c.pair.signature_key.clone()).collect();
            let mut added = 0;
            for (pair, score) in fallback_candidates {
                if added >= needed {
                    break;
                }
                if score < self.config.fallback_similarity_threshold {
                    continue;
                }
                if already.contains(&pair.signature_key) || !self.is_valid(&pair) {
                    continue;
                }
                selected.push(Candidate { pair, score, source: "interaction_fallback" });
                added += 1;
            }
            if added > 0 {
                explanation.fallback_used = true;
            }
        }

        let results = selected
            .into_iter()
            .map(|c| RecommendedExample {
                question: c.pair.question.clone(),
                sql: c.pair.sql_query.clone(),
                score: c.score,
                source: c.source.to_string(),
                canonical_group_id: c.pair.signature_key.clone(),
                metadata: c.pair.metadata.clone(),
            })
            .collect();

        Ok((results, explanation))
    }

    fn is_valid(&self, pair: &QueryPair) -> bool {
        if pair.status == QueryPairStatus::Tombstoned {
            return false;
        }
        if !pair.is_complete() {
            return false;
        }
        if self.config.stale_max_age_days > 0 {
            let age_days = (chrono::Utc::now() - pair.updated_at).num_days();
            if age_days > self.config.stale_max_age_days {
                return false;
            }
        }
        if pair.question.len() > self.config.max_question_len {
            return false;
        }
        let lowered = pair.sql_query.to_lowercase();
        if self.config.blocklist.iter().any(|blocked| lowered.contains(&blocked.to_lowercase())) {
            return false;
        }
        true
    }

    /// Pass A fills a verified floor; pass B fills remaining capacity
    /// respecting a per-source cap, skipping anything that would exceed it.
    fn apply_diversity(&self, candidates: Vec<Candidate>, limit: usize, explanation: &mut Explanation) -> Vec<Candidate> {
        if self.config.diversity_min_verified == 0 && self.config.diversity_max_per_source == 0 {
            let mut truncated = candidates;
            truncated.truncate(limit);
            return truncated;
        }

        explanation.diversity_applied = true;
        let mut selected: Vec<Candidate> = Vec::new();
        let mut per_source: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut remaining: Vec<Candidate> = Vec::new();

        // Pass A: verified floor.
        let mut verified_filled = 0usize;
        let mut rest = Vec::new();
        for candidate in candidates {
            if verified_filled < self.config.diversity_min_verified && candidate.pair.status == QueryPairStatus::Verified {
                *per_source.entry(candidate.source.to_string()).or_insert(0) += 1;
                verified_filled += 1;
                selected.push(candidate);
            } else {
                rest.push(candidate);
            }
        }
        remaining.extend(rest);

        // Pass B: fill remaining capacity respecting the per-source cap.
        for candidate in remaining {
            if selected.len() >= limit {
                break;
            }
            let count = per_source.entry(candidate.source.to_string()).or_insert(0);
            if self.config.diversity_max_per_source > 0 && *count >= self.config.diversity_max_per_source {
                continue;
            }
            *count += 1;
            selected.push(candidate);
        }

        selected.truncate(limit);
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::store::SqliteRegistryStore;
    use crate::registry::QueryPair;

    fn verified(sig: &str, sql: &str, embedding: Vec<f32>) -> QueryPair {
        let mut pair = QueryPair::new(sig, "how many orders", sql);
        pair.embedding = Some(embedding);
        pair.status = QueryPairStatus::Verified;
        pair
    }

    #[tokio::test]
    async fn pin_rule_surfaces_matching_example_first() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        store.store_pair(verified("sig-pinned", "SELECT 1", vec![0.0, 1.0])).await.unwrap();
        store.store_pair(verified("sig-other", "SELECT 2", vec![1.0, 0.0])).await.unwrap();

        let pin_rules = vec![PinRule {
            pattern: "how many orders".to_string(),
            match_type: PinMatchType::Contains,
            signature_key: "sig-pinned".to_string(),
            priority: 10,
        }];
        let service = RecommendationService::new(store, pin_rules, RecommendationConfig::default());

        let inputs = RecommendationInputs {
            question: "how many orders are open".to_string(),
            question_embedding: vec![1.0, 0.0],
            tenant_id: None,
            limit: 2,
            enable_fallback: false,
        };
        let (results, explanation) = service.recommend(&inputs).await.unwrap();
        assert_eq!(results[0].canonical_group_id, "sig-pinned");
        assert_eq!(results[0].source, "pinned");
        assert_eq!(explanation.pins_matched, vec!["sig-pinned".to_string()]);
    }

    #[tokio::test]
    async fn dedup_keeps_first_occurrence_of_signature() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        store.store_pair(verified("sig-1", "SELECT 1", vec![1.0, 0.0])).await.unwrap();
        let pin_rules = vec![PinRule {
            pattern: "orders".to_string(),
            match_type: PinMatchType::Contains,
            signature_key: "sig-1".to_string(),
            priority: 1,
        }];
        let service = RecommendationService::new(store, pin_rules, RecommendationConfig::default());

        let inputs = RecommendationInputs {
            question: "how many orders".to_string(),
            question_embedding: vec![1.0, 0.0],
            tenant_id: None,
            limit: 5,
            enable_fallback: false,
        };
        let (results, _) = service.recommend(&inputs).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn fallback_draws_from_interaction_role_when_short() {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let mut interaction = QueryPair::new("sig-interaction", "how many orders last week", "SELECT count(*) FROM orders");
        interaction.embedding = Some(vec![1.0, 0.0]);
        interaction.roles = vec![QueryPairRole::Interaction];
        interaction.status = QueryPairStatus::Seeded;
        store.store_pair(interaction).await.unwrap();

        let service = RecommendationService::new(store, Vec::new(), RecommendationConfig::default());
        let inputs = RecommendationInputs {
            question: "how many orders".to_string(),
            question_embedding: vec![1.0, 0.0],
            tenant_id: None,
            limit: 1,
            enable_fallback: true,
        };
        let (results, explanation) = service.recommend(&inputs).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(explanation.fallback_used);
        assert_eq!(results[0].source, "interaction_fallback");
    }
}
