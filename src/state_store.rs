use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Pluggable persistence backend for conversational state keyed by session
/// id (§3 GLOSSARY, §4.5 "StateStore middleware"). Implementations must
/// serialize calls that target the same session id; calls for distinct
/// session ids may run concurrently.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<Value>>;
    async fn save(&self, session_id: &str, state: Value) -> Result<()>;
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// Reference implementation for tests and small embeddings: an in-memory
/// map guarded by a single mutex (the teacher's file-backed `SessionManager`
/// instead guards an LRU behind a `tokio::sync::Mutex`; a plain `std::sync::
/// Mutex` suffices here since every operation is non-blocking).
#[derive(Default)]
pub struct InMemoryStateStore {
    sessions: Mutex<HashMap<String, Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, session_id: &str) -> Result<Option<Value>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| PipelineError::StateStore("lock poisoned".into()))?;
        Ok(sessions.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, state: Value) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| PipelineError::StateStore("lock poisoned".into()))?;
        sessions.insert(session_id.to_string(), state);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| PipelineError::StateStore("lock poisoned".into()))?;
        sessions.remove(session_id);
        Ok(())
    }
}
