//! Checkpoint persistence (§4.6): `save(thread_id, state)` /
//! `load(thread_id) -> state?`, so a suspended run (e.g. awaiting
//! clarification) can resume from its last transition.

use crate::error::Result;
use crate::state::AgentState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, thread_id: &str, state: &AgentState) -> Result<()>;

    async fn load(&self, thread_id: &str) -> Result<Option<AgentState>>;
}

/// Reference implementation: process-local, lost on restart. A persistent
/// backend (e.g. the registry's SQLite connection) implements the same
/// interface for production use.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    states: Mutex<HashMap<String, AgentState>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointer {
    async fn save(&self, thread_id: &str, state: &AgentState) -> Result<()> {
        self.states
            .lock()
            .expect("checkpoint lock poisoned")
            .insert(thread_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<AgentState>> {
        Ok(self.states.lock().expect("checkpoint lock poisoned").get(thread_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let checkpointer = InMemoryCheckpointer::new();
        let mut state = AgentState::new("how many orders", Some(7));
        state.retry_count = 2;
        checkpointer.save("thread-1", &state).await.unwrap();

        let loaded = checkpointer.load("thread-1").await.unwrap().unwrap();
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.tenant_id, Some(7));
    }

    #[tokio::test]
    async fn load_of_unknown_thread_is_none() {
        let checkpointer = InMemoryCheckpointer::new();
        assert!(checkpointer.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_prior_checkpoint() {
        let checkpointer = InMemoryCheckpointer::new();
        let mut state = AgentState::new("q", None);
        checkpointer.save("thread-1", &state).await.unwrap();
        state.retry_count = 1;
        checkpointer.save("thread-1", &state).await.unwrap();

        let loaded = checkpointer.load("thread-1").await.unwrap().unwrap();
        assert_eq!(loaded.retry_count, 1);
    }
}
