//! In-process store, used in tests and when no state directory is configured.

use super::{is_live, SessionRecord, SessionStore, StoredChunk};
use ptyhub_core::{HubResult, OutputChunk, SessionState};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<String, SessionRecord>,
    output: HashMap<String, Vec<StoredChunk>>,
    next_chunk_id: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for MemoryStore {
    fn upsert_session(&self, record: &SessionRecord) -> HubResult<()> {
        self.state()
            .sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn append_output(&self, session_id: &str, chunk: &OutputChunk) -> HubResult<u64> {
        let mut state = self.state();
        state.next_chunk_id += 1;
        let id = state.next_chunk_id;
        state
            .output
            .entry(session_id.to_string())
            .or_default()
            .push(StoredChunk {
                id,
                session_id: session_id.to_string(),
                chunk: chunk.clone(),
            });
        Ok(id)
    }

    fn sessions_for_user(&self, user_id: &str) -> HubResult<Vec<SessionRecord>> {
        let mut records: Vec<_> = self
            .state()
            .sessions
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_ms);
        Ok(records)
    }

    fn active_sessions(&self) -> HubResult<Vec<SessionRecord>> {
        Ok(self
            .state()
            .sessions
            .values()
            .filter(|r| is_live(r.status))
            .cloned()
            .collect())
    }

    fn output_for_session(&self, session_id: &str) -> HubResult<Vec<StoredChunk>> {
        Ok(self
            .state()
            .output
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    fn reconcile_after_restart(&self) -> HubResult<usize> {
        let mut state = self.state();
        let mut changed = 0;
        for record in state.sessions.values_mut().filter(|r| is_live(r.status)) {
            record.status = SessionState::Terminated;
            changed += 1;
        }
        Ok(changed)
    }
}
