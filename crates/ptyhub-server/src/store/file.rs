//! JSON-file store.
//!
//! Layout under the state directory:
//! - `sessions.json`: every session record, rewritten atomically on upsert.
//! - `output/<session_id>.jsonl`: one [`StoredChunk`] per line, append-only.

use super::{is_live, SessionRecord, SessionStore, StoredChunk};
use ptyhub_core::{HubError, HubResult, OutputChunk, SessionState};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

const SESSIONS_FILE: &str = "sessions.json";
const OUTPUT_DIR: &str = "output";

#[derive(Debug)]
struct FileState {
    sessions: BTreeMap<String, SessionRecord>,
    next_chunk_id: u64,
}

#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    state: Mutex<FileState>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> HubResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(OUTPUT_DIR))?;

        let sessions_path = dir.join(SESSIONS_FILE);
        let sessions = if sessions_path.exists() {
            let content = std::fs::read_to_string(&sessions_path)?;
            serde_json::from_str::<BTreeMap<String, SessionRecord>>(&content).map_err(|e| {
                HubError::Internal(format!("corrupt {}: {e}", sessions_path.display()))
            })?
        } else {
            BTreeMap::new()
        };

        let last_chunk_id = scan_last_chunk_id(&dir.join(OUTPUT_DIR))?;
        info!(
            path = %dir.display(),
            sessions = sessions.len(),
            last_chunk_id,
            "opened file store"
        );

        Ok(Self {
            dir,
            state: Mutex::new(FileState {
                sessions,
                next_chunk_id: last_chunk_id + 1,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn output_path(&self, session_id: &str) -> HubResult<PathBuf> {
        if session_id.is_empty() || !session_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(HubError::NotFound(session_id.to_string()));
        }
        Ok(self.dir.join(OUTPUT_DIR).join(format!("{session_id}.jsonl")))
    }

    /// Write the full record map to a temp file, then rename over the old one.
    fn flush_sessions(&self, sessions: &BTreeMap<String, SessionRecord>) -> HubResult<()> {
        let json = serde_json::to_vec_pretty(sessions)
            .map_err(|e| HubError::Internal(format!("failed to encode sessions: {e}")))?;
        let tmp = self.dir.join(format!("{SESSIONS_FILE}.tmp"));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.dir.join(SESSIONS_FILE))?;
        Ok(())
    }
}

impl SessionStore for FileStore {
    fn upsert_session(&self, record: &SessionRecord) -> HubResult<()> {
        let mut state = self.state();
        let previous = state
            .sessions
            .insert(record.session_id.clone(), record.clone());
        if let Err(e) = self.flush_sessions(&state.sessions) {
            // keep memory and disk in agreement
            match previous {
                Some(prev) => state.sessions.insert(record.session_id.clone(), prev),
                None => state.sessions.remove(&record.session_id),
            };
            return Err(e);
        }
        debug!(session_id = %record.session_id, status = %record.status, "session record saved");
        Ok(())
    }

    fn append_output(&self, session_id: &str, chunk: &OutputChunk) -> HubResult<u64> {
        let path = self.output_path(session_id)?;
        let mut state = self.state();
        let stored = StoredChunk {
            id: state.next_chunk_id,
            session_id: session_id.to_string(),
            chunk: chunk.clone(),
        };
        let mut line = serde_json::to_string(&stored)
            .map_err(|e| HubError::Internal(format!("failed to encode chunk: {e}")))?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        state.next_chunk_id += 1;
        Ok(stored.id)
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
        let path = self.output_path(session_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_chunks(&path)
    }

    fn reconcile_after_restart(&self) -> HubResult<usize> {
        let mut state = self.state();
        let mut updated = state.sessions.clone();
        let mut changed = 0;
        for record in updated.values_mut().filter(|r| is_live(r.status)) {
            record.status = SessionState::Terminated;
            changed += 1;
        }
        if changed > 0 {
            self.flush_sessions(&updated)?;
            state.sessions = updated;
        }
        Ok(changed)
    }
}

/// Load chunks from a JSONL file, skipping malformed lines.
fn read_chunks(path: &Path) -> HubResult<Vec<StoredChunk>> {
    let content = std::fs::read_to_string(path)?;
    let mut chunks = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredChunk>(line) {
            Ok(chunk) => chunks.push(chunk),
            Err(e) => {
                error!(path = %path.display(), error = %e, "skipping malformed output line");
            }
        }
    }
    Ok(chunks)
}

fn scan_last_chunk_id(output_dir: &Path) -> HubResult<u64> {
    let mut last = 0;
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        if let Some(max) = read_chunks(&path)?.iter().map(|c| c.id).max() {
            last = last.max(max);
        }
    }
    Ok(last)
}
