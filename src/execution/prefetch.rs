//! Opportunistic next-page prefetch under a structured-concurrency scope:
//! every task spawned by a `PrefetchManager` is cancelled and awaited when
//! the manager is dropped, and slots are single-flight keyed so a page
//! already scheduled or cached is never re-fetched (§5, §9 "structured
//! concurrency").

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchSuppressionReason {
    AutoPaginationActive,
    AutoPaginationEnabled,
    NoNextPage,
    NotCheap,
    LowBudget,
    AlreadyCachedOrInflight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchAdmission {
    Scheduled,
    CacheHit,
    Suppressed(PrefetchSuppressionReason),
}

#[derive(Clone)]
enum Slot {
    InFlight,
    Ready(Value),
    Cancelled,
}

/// Builds the stable prefetch cache key from the inputs named in §4.5 step
/// 6: `(sql, tenant_id, page_token, page_size, schema_snapshot_id, seed,
/// completeness_hint, scope_id)`.
#[allow(clippy::too_many_arguments)]
pub fn prefetch_cache_key(
    sql: &str,
    tenant_id: Option<&str>,
    page_token: Option<&str>,
    page_size: Option<u64>,
    schema_snapshot_id: Option<&str>,
    seed: Option<u64>,
    completeness_hint: Option<&str>,
    scope_id: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        sql,
        tenant_id.unwrap_or(""),
        page_token.unwrap_or(""),
        &page_size.map(|v| v.to_string()).unwrap_or_default(),
        schema_snapshot_id.unwrap_or(""),
        &seed.map(|v| v.to_string()).unwrap_or_default(),
        completeness_hint.unwrap_or(""),
        scope_id.unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

/// A cheap-first-page heuristic: latency under a second and row count no
/// more than twice the requested page size. Kept as instance config per
/// §9 open-question resolution (overridable per `ExecutionEngineConfig`,
/// not global).
#[derive(Debug, Clone, Copy)]
pub struct PrefetchHeuristic {
    pub max_cheap_latency_ms: u64,
    pub max_cheap_row_multiple: u64,
}

impl Default for PrefetchHeuristic {
    fn default() -> Self {
        Self {
            max_cheap_latency_ms: 1000,
            max_cheap_row_multiple: 2,
        }
    }
}

impl PrefetchHeuristic {
    pub fn is_cheap(&self, latency_ms: u64, rows_returned: u64, page_size: u64) -> bool {
        latency_ms <= self.max_cheap_latency_ms && rows_returned <= self.max_cheap_row_multiple * page_size
    }
}

/// Scoped prefetch group. All tasks spawned via `schedule` are aborted
/// when the manager is dropped, so a request never leaks background work
/// past its own lifetime.
pub struct PrefetchManager {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    max_concurrency: usize,
    in_flight_count: Arc<Mutex<usize>>,
}

impl PrefetchManager {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(Vec::new()),
            max_concurrency: max_concurrency.max(1),
            in_flight_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Returns a cached page if one is ready for `key`.
    pub async fn cached(&self, key: &str) -> Option<Value> {
        let slots = self.slots.lock().await;
        match slots.get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub async fn is_inflight_or_cached(&self, key: &str) -> bool {
        self.slots.lock().await.contains_key(key)
    }

    /// Admit a prefetch: single-flight (a key already scheduled or cached
    /// is not re-scheduled), bounded by `max_concurrency`.
    pub async fn schedule<F, Fut>(&self, key: String, fetch: F) -> PrefetchAdmission
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Option<Value>> + Send + 'static,
    {
        {
            let slots = self.slots.lock().await;
            if slots.contains_key(&key) {
                return PrefetchAdmission::Suppressed(PrefetchSuppressionReason::AlreadyCachedOrInflight);
            }
        }

        {
            let count = self.in_flight_count.lock().await;
            if *count >= self.max_concurrency {
                return PrefetchAdmission::Suppressed(PrefetchSuppressionReason::LowBudget);
            }
        }

        self.slots.lock().await.insert(key.clone(), Slot::InFlight);
        *self.in_flight_count.lock().await += 1;

        let slots = self.slots.clone();
        let in_flight_count = self.in_flight_count.clone();
        let key_for_task = key.clone();

        let handle = tokio::spawn(async move {
            let result = fetch().await;
            let mut slots = slots.lock().await;
            if let Some(Slot::InFlight) = slots.get(&key_for_task) {
                match result {
                    Some(value) => {
                        slots.insert(key_for_task, Slot::Ready(value));
                    }
                    None => {
                        slots.insert(key_for_task, Slot::Cancelled);
                    }
                }
            }
            drop(slots);
            *in_flight_count.lock().await -= 1;
        });

        self.handles.lock().await.push(handle);
        PrefetchAdmission::Scheduled
    }

    /// Cancel and await every scheduled task. Called when the owning
    /// request's scope exits; cancelled slots are marked so they never
    /// poison a subsequent lookup (they simply read as "not cached").
    pub async fn shutdown(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
        let mut slots = self.slots.lock().await;
        for slot in slots.values_mut() {
            if matches!(slot, Slot::InFlight) {
                *slot = Slot::Cancelled;
            }
        }
    }
}

impl Drop for PrefetchManager {
    fn drop(&mut self) {
        if let Ok(mut handles) = self.handles.try_lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schedule_then_cached_returns_the_fetched_value() {
        let manager = PrefetchManager::new(2);
        let admission = manager
            .schedule("k1".to_string(), || async { Some(Value::from(42)) })
            .await;
        assert_eq!(admission, PrefetchAdmission::Scheduled);

        // give the spawned task a chance to complete
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(manager.cached("k1").await, Some(Value::from(42)));
    }

    #[tokio::test]
    async fn duplicate_schedule_is_single_flight() {
        let manager = PrefetchManager::new(2);
        manager
            .schedule("k1".to_string(), || async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Some(Value::from(1))
            })
            .await;
        let second = manager.schedule("k1".to_string(), || async { Some(Value::from(2)) }).await;
        assert_eq!(
            second,
            PrefetchAdmission::Suppressed(PrefetchSuppressionReason::AlreadyCachedOrInflight)
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_inflight_slots() {
        let manager = PrefetchManager::new(2);
        manager
            .schedule("k1".to_string(), || async {
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                Some(Value::from(1))
            })
            .await;
        manager.shutdown().await;
        assert!(manager.cached("k1").await.is_none());
    }

    #[test]
    fn cache_key_is_stable_for_identical_inputs() {
        let k1 = prefetch_cache_key("SELECT 1", Some("t1"), None, Some(50), None, None, None, None);
        let k2 = prefetch_cache_key("SELECT 1", Some("t1"), None, Some(50), None, None, None, None);
        assert_eq!(k1, k2);
    }

    #[test]
    fn prefetch_heuristic_accepts_cheap_pages() {
        let heuristic = PrefetchHeuristic::default();
        assert!(heuristic.is_cheap(500, 80, 50));
        assert!(!heuristic.is_cheap(2000, 80, 50));
        assert!(!heuristic.is_cheap(500, 200, 50));
    }
}
