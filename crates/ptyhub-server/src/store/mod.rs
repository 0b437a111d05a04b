//! Durable session metadata and output history.
//!
//! The session layer only talks to [`SessionStore`]; credentials reach it
//! already encrypted.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use ptyhub_core::{HubResult, OutputChunk, SessionState};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Attempts made by [`upsert_with_retry`] before giving up.
const UPSERT_ATTEMPTS: u32 = 3;
const UPSERT_BACKOFF: Duration = Duration::from_millis(50);

/// Persisted view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub workspace_path: String,
    pub status: SessionState,
    /// Hex of the cipher output; `None` when no credentials were stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_credentials: Option<String>,
    pub created_ms: u64,
    pub updated_ms: u64,
}

/// An output chunk as stored, with its store-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: u64,
    pub session_id: String,
    #[serde(flatten)]
    pub chunk: OutputChunk,
}

/// Backing store for session records and output history.
///
/// Methods block; call them from a blocking context.
pub trait SessionStore: Send + Sync {
    /// Insert or replace the record keyed by `record.session_id`.
    fn upsert_session(&self, record: &SessionRecord) -> HubResult<()>;

    /// Append a chunk, returning its id. Ids increase monotonically across the store.
    fn append_output(&self, session_id: &str, chunk: &OutputChunk) -> HubResult<u64>;

    fn sessions_for_user(&self, user_id: &str) -> HubResult<Vec<SessionRecord>>;

    /// Records whose status is `active` or `initializing`.
    fn active_sessions(&self) -> HubResult<Vec<SessionRecord>>;

    fn output_for_session(&self, session_id: &str) -> HubResult<Vec<StoredChunk>>;

    /// Mark every `active`/`initializing` record `terminated`. No in-memory
    /// session survives a restart. Returns the number of records changed.
    fn reconcile_after_restart(&self) -> HubResult<usize>;
}

/// Upserts are idempotent, so transient failures are retried.
pub fn upsert_with_retry(store: &dyn SessionStore, record: &SessionRecord) -> HubResult<()> {
    let mut attempt = 1;
    loop {
        match store.upsert_session(record) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < UPSERT_ATTEMPTS => {
                warn!(session_id = %record.session_id, attempt, error = %e, "session upsert failed, retrying");
                std::thread::sleep(UPSERT_BACKOFF * attempt);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_live(status: SessionState) -> bool {
    matches!(status, SessionState::Active | SessionState::Initializing)
}
