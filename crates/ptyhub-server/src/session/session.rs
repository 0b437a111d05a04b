//! One PTY-backed agent process and its state machine.
//!
//! `initializing → active → {terminated | error}`. Terminal states are sinks:
//! by the time one is recorded the process has been reaped, the terminal
//! closed and (for isolated workspaces) the directory removed.

use super::output_buffer::OutputBuffer;
use super::pty::PtyProcess;
use super::sanitize::sanitize_command;
use super::workspace::Workspace;
use crate::store::{upsert_with_retry, SessionRecord, SessionStore};
use ptyhub_core::{HubError, HubResult, OutputChunk, SessionSnapshot, SessionState};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Read size for the draining thread.
const READ_BUF_SIZE: usize = 4096;

/// Everything needed to assemble a [`Session`] around a spawned process.
pub struct SessionParams {
    pub id: String,
    pub user_id: String,
    pub workspace: Workspace,
    pub output_buffer_size: usize,
    pub kill_grace: Duration,
    pub encrypted_credentials: Option<Vec<u8>>,
    pub store: Option<Arc<dyn SessionStore>>,
}

/// Mutable fields, guarded by the session's own lock.
struct SessionInner {
    status: SessionState,
    last_activity: SystemTime,
    output: OutputBuffer,
}

pub struct Session {
    id: String,
    user_id: String,
    workspace: Workspace,
    created: SystemTime,
    inner: Mutex<SessionInner>,
    /// Exclusively owned process; `None` once released.
    process: Mutex<Option<Box<dyn PtyProcess>>>,
    /// Stops the draining thread.
    cancel: CancellationToken,
    /// Set by the first caller into `finish`.
    closing: AtomicBool,
    kill_grace: Duration,
    encrypted_credentials: Option<Vec<u8>>,
    store: Option<Arc<dyn SessionStore>>,
    /// Held across each record write.
    persisting: Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("workspace", &self.workspace.path())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap a freshly spawned process. The session starts `initializing`.
    pub fn new(params: SessionParams, process: Box<dyn PtyProcess>) -> Self {
        let now = SystemTime::now();
        Self {
            id: params.id,
            user_id: params.user_id,
            workspace: params.workspace,
            created: now,
            inner: Mutex::new(SessionInner {
                status: SessionState::Initializing,
                last_activity: now,
                output: OutputBuffer::new(params.output_buffer_size),
            }),
            process: Mutex::new(Some(process)),
            cancel: CancellationToken::new(),
            closing: AtomicBool::new(false),
            kill_grace: params.kill_grace,
            encrypted_credentials: params.encrypted_credentials,
            store: params.store,
            persisting: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> SessionState {
        self.inner().status
    }

    pub fn last_activity(&self) -> SystemTime {
        self.inner().last_activity
    }

    /// Start the draining thread and move to `active`.
    ///
    /// If the process exits on its own before `cleanup`, the session moves to
    /// `error`, releases its resources and its id is sent on `exited`.
    pub fn start(self: &Arc<Self>, exited: Option<mpsc::UnboundedSender<String>>) -> HubResult<()> {
        let reader = {
            let mut process = self.process();
            let process = process.as_mut().ok_or_else(|| self.invalid_state())?;
            process.take_reader()?
        };

        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let short_id: String = self.id.chars().take(8).collect();
        std::thread::Builder::new()
            .name(format!("pty-drain-{short_id}"))
            .spawn(move || drain_output(weak, reader, cancel, exited))
            .map_err(|e| HubError::SpawnFailure(format!("failed to start output thread: {e}")))?;

        let mut inner = self.inner();
        if inner.status == SessionState::Initializing {
            inner.status = SessionState::Active;
        }
        Ok(())
    }

    /// Sanitize `text` and write it to the process input.
    pub fn send_command(&self, text: &str) -> HubResult<()> {
        self.ensure_active()?;
        let clean = sanitize_command(text);

        let mut guard = self.process();
        let process = guard.as_mut().ok_or_else(|| self.invalid_state())?;
        process.write_all(clean.as_bytes())?;
        drop(guard);

        debug!(session_id = %self.id, bytes = clean.len(), "command written");
        self.touch();
        Ok(())
    }

    /// Record output produced by the process.
    pub fn handle_output(&self, data: String) {
        let now = SystemTime::now();
        let chunk = OutputChunk {
            timestamp_ms: unix_ms(now),
            data,
        };

        {
            let mut inner = self.inner();
            if inner.status.is_terminal() {
                return;
            }
            inner.output.push(chunk.clone());
            inner.last_activity = now;
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.append_output(&self.id, &chunk) {
                warn!(session_id = %self.id, error = %e, "failed to persist output chunk");
            }
        }
    }

    /// Copy of the buffered output, oldest first. With `clear`, the buffer is
    /// emptied in the same critical section as the copy.
    pub fn output(&self, clear: bool) -> Vec<OutputChunk> {
        let mut inner = self.inner();
        if clear {
            inner.output.drain()
        } else {
            inner.output.snapshot()
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) -> HubResult<()> {
        if cols == 0 || rows == 0 {
            return Err(HubError::Validation(format!(
                "terminal size must be non-zero, got {cols}x{rows}"
            )));
        }
        self.ensure_active()?;

        let mut guard = self.process();
        let process = guard.as_mut().ok_or_else(|| self.invalid_state())?;
        process.resize(cols, rows)?;
        drop(guard);

        self.touch();
        Ok(())
    }

    /// Side-effect-free snapshot.
    pub fn status(&self) -> SessionSnapshot {
        let inner = self.inner();
        SessionSnapshot {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            status: inner.status,
            workspace_path: self.workspace.path().display().to_string(),
            workspace_type: self.workspace.kind(),
            created_ms: unix_ms(self.created),
            last_activity_ms: unix_ms(inner.last_activity),
            output_buffer_len: inner.output.len(),
        }
    }

    /// Refresh the activity clock.
    pub fn touch(&self) {
        let mut inner = self.inner();
        if !inner.status.is_terminal() {
            inner.last_activity = SystemTime::now();
        }
    }

    /// Stop the process and release everything. Idempotent.
    pub fn cleanup(&self) -> HubResult<()> {
        self.finish(SessionState::Terminated, "cleanup")
    }

    /// The record persisted for this session.
    pub fn record(&self) -> SessionRecord {
        let inner = self.inner();
        SessionRecord {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            workspace_path: self.workspace.path().display().to_string(),
            status: inner.status,
            encrypted_credentials: self.encrypted_credentials.as_ref().map(hex::encode),
            created_ms: unix_ms(self.created),
            updated_ms: unix_ms(SystemTime::now()),
        }
    }

    /// Save the current record, if a store is attached. Errors are logged.
    ///
    /// Writes are serialized and each reads the status under the lock, so the
    /// last record stored always carries the latest status.
    pub fn persist(&self) {
        if let Some(store) = &self.store {
            let _writing = self.persisting.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = upsert_with_retry(store.as_ref(), &self.record()) {
                error!(session_id = %self.id, error = %e, "failed to persist session record");
            }
        }
    }

    fn finish(&self, final_state: SessionState, reason: &str) -> HubResult<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();

        let mut result = Ok(());
        // Dropping the process closes the PTY.
        if let Some(mut process) = self.process().take() {
            debug!(session_id = %self.id, pid = ?process.pid(), "stopping process");
            if let Err(e) = process.terminate(self.kill_grace) {
                warn!(session_id = %self.id, error = %e, "failed to terminate process");
                result = Err(e);
            }
        }
        if let Err(e) = self.workspace.release() {
            warn!(session_id = %self.id, error = %e, "failed to remove workspace");
            result = result.and(Err(e));
        }

        let dropped_chunks = {
            let mut inner = self.inner();
            inner.status = final_state;
            inner.output.dropped()
        };
        info!(
            session_id = %self.id,
            user_id = %self.user_id,
            status = %final_state,
            reason,
            dropped_chunks,
            "session closed"
        );
        self.persist();
        result
    }

    fn ensure_active(&self) -> HubResult<()> {
        let status = self.state();
        if status != SessionState::Active || self.closing.load(Ordering::Acquire) {
            return Err(HubError::InvalidState {
                status: status.to_string(),
            });
        }
        Ok(())
    }

    fn invalid_state(&self) -> HubError {
        HubError::InvalidState {
            status: self.state().to_string(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self) -> MutexGuard<'_, Option<Box<dyn PtyProcess>>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut inner = self.inner();
        inner.last_activity = inner.last_activity - by;
    }
}

/// Body of the per-session draining thread.
fn drain_output(
    session: Weak<Session>,
    mut reader: Box<dyn Read + Send>,
    cancel: CancellationToken,
    exited: Option<mpsc::UnboundedSender<String>>,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut carry = Vec::new();

    let failure = loop {
        match reader.read(&mut buf) {
            Ok(0) => break None,
            Ok(n) => {
                if cancel.is_cancelled() {
                    break None;
                }
                let Some(session) = session.upgrade() else {
                    return;
                };
                let text = decode_utf8(&mut carry, &buf[..n]);
                if !text.is_empty() {
                    session.handle_output(text);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => break Some(e),
        }
    };

    if cancel.is_cancelled() {
        debug!("output drain stopped");
        return;
    }

    // The stream ended before anyone asked the session to stop.
    let Some(session) = session.upgrade() else {
        return;
    };
    let reason = match failure {
        Some(e) => format!("output stream failed: {e}"),
        None => "process exited".to_string(),
    };
    warn!(session_id = %session.id, reason = %reason, "agent process ended unexpectedly");
    if let Err(e) = session.finish(SessionState::Error, &reason) {
        warn!(session_id = %session.id, error = %e, "cleanup after process exit failed");
    }
    if let Some(tx) = exited {
        let _ = tx.send(session.id.clone());
    }
}

/// Decode as much of `carry + bytes` as forms complete UTF-8, keeping a
/// trailing partial sequence for the next read.
fn decode_utf8(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

pub(crate) fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{FakeControl, FakeSpawner};
    use crate::session::pty::{PtySpawner, SpawnRequest};
    use crate::store::{MemoryStore, StoredChunk};
    use ptyhub_core::WorkspaceType;
    use std::path::Path;
    use std::time::Instant;

    fn make_session(
        base: &Path,
        kind: WorkspaceType,
        buffer: usize,
        store: Option<Arc<dyn SessionStore>>,
    ) -> (Arc<Session>, FakeControl) {
        let spawner = FakeSpawner::new();
        let workspace = Workspace::allocate(base, kind, "alice", "sess0001").unwrap();
        let process = spawner
            .spawn(SpawnRequest {
                program: "agent",
                args: &[],
                cwd: workspace.path(),
                env: Vec::new(),
                cols: 80,
                rows: 24,
            })
            .unwrap();
        let session = Arc::new(Session::new(
            SessionParams {
                id: "sess0001".into(),
                user_id: "alice".into(),
                workspace,
                output_buffer_size: buffer,
                kill_grace: Duration::from_millis(100),
                encrypted_credentials: None,
                store,
            },
            process,
        ));
        (session, spawner.last())
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn starts_initializing_then_active() {
        let base = tempfile::tempdir().unwrap();
        let (session, _ctl) = make_session(base.path(), WorkspaceType::Isolated, 10, None);
        assert_eq!(session.state(), SessionState::Initializing);
        assert!(matches!(
            session.send_command("hi"),
            Err(HubError::InvalidState { .. })
        ));
        session.start(None).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        session.cleanup().unwrap();
    }

    #[test]
    fn command_is_sanitized_before_write() {
        let base = tempfile::tempdir().unwrap();
        let (session, ctl) = make_session(base.path(), WorkspaceType::Isolated, 10, None);
        session.start(None).unwrap();
        session.send_command("echo \u{1b}[31mhi\u{7}\n").unwrap();
        assert_eq!(ctl.input(), b"echo [31mhi\n");
        session.cleanup().unwrap();
    }

    #[test]
    fn commands_and_resizes_refresh_activity() {
        let base = tempfile::tempdir().unwrap();
        let (session, ctl) = make_session(base.path(), WorkspaceType::Isolated, 10, None);
        session.start(None).unwrap();

        session.backdate(Duration::from_secs(600));
        let stale = session.last_activity();
        session.send_command("ls\n").unwrap();
        assert!(session.last_activity() > stale);

        session.backdate(Duration::from_secs(600));
        let stale = session.last_activity();
        session.resize(100, 30).unwrap();
        assert!(session.last_activity() > stale);

        // the process is free again for cleanup
        session.cleanup().unwrap();
        assert_eq!(ctl.terminate_calls(), 1);
    }

    #[test]
    fn drained_output_lands_in_buffer() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (session, ctl) = make_session(
            base.path(),
            WorkspaceType::Isolated,
            10,
            Some(store.clone() as Arc<dyn SessionStore>),
        );
        session.start(None).unwrap();
        ctl.emit("hello ");
        ctl.emit("world");
        wait_for(|| session.status().output_buffer_len == 2);

        let chunks = session.output(false);
        let data: Vec<&str> = chunks.iter().map(|c| c.data.as_str()).collect();
        assert_eq!(data, vec!["hello ", "world"]);
        assert_eq!(store.output_for_session("sess0001").unwrap().len(), 2);
        session.cleanup().unwrap();
    }

    #[test]
    fn get_output_without_clear_is_repeatable() {
        let base = tempfile::tempdir().unwrap();
        let (session, _ctl) = make_session(base.path(), WorkspaceType::Isolated, 10, None);
        session.handle_output("a".into());
        session.handle_output("b".into());
        let first = session.output(false);
        let second = session.output(false);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn get_output_with_clear_returns_once() {
        let base = tempfile::tempdir().unwrap();
        let (session, _ctl) = make_session(base.path(), WorkspaceType::Isolated, 10, None);
        session.handle_output("a".into());
        session.handle_output("b".into());
        assert_eq!(session.output(true).len(), 2);
        assert!(session.output(true).is_empty());
        assert!(session.output(false).is_empty());
    }

    #[test]
    fn buffer_keeps_most_recent_chunks() {
        let base = tempfile::tempdir().unwrap();
        let (session, _ctl) = make_session(base.path(), WorkspaceType::Isolated, 100, None);
        for i in 0..150 {
            session.handle_output(format!("{i}"));
        }
        let chunks = session.output(false);
        assert_eq!(chunks.len(), 100);
        assert_eq!(chunks[0].data, "50");
        assert_eq!(chunks[99].data, "149");
    }

    #[test]
    fn concurrent_output_and_clear_lose_nothing() {
        let base = tempfile::tempdir().unwrap();
        let (session, _ctl) = make_session(base.path(), WorkspaceType::Isolated, 10_000, None);

        let writer = {
            let session = session.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    session.handle_output(i.to_string());
                }
            })
        };
        let mut seen = Vec::new();
        while !writer.is_finished() {
            seen.extend(session.output(true));
        }
        writer.join().unwrap();
        seen.extend(session.output(true));

        let values: Vec<u32> = seen.iter().map(|c| c.data.parse().unwrap()).collect();
        assert_eq!(values, (0..2000).collect::<Vec<_>>());
    }

    #[test]
    fn resize_forwards_geometry() {
        let base = tempfile::tempdir().unwrap();
        let (session, ctl) = make_session(base.path(), WorkspaceType::Isolated, 10, None);
        session.start(None).unwrap();
        session.resize(132, 43).unwrap();
        assert_eq!(ctl.size(), (132, 43));
        assert!(matches!(session.resize(0, 10), Err(HubError::Validation(_))));
        session.cleanup().unwrap();
        assert!(matches!(
            session.resize(100, 30),
            Err(HubError::InvalidState { .. })
        ));
    }

    #[test]
    fn resize_failure_is_io_failure() {
        let base = tempfile::tempdir().unwrap();
        let (session, ctl) = make_session(base.path(), WorkspaceType::Isolated, 10, None);
        session.start(None).unwrap();
        ctl.fail_io();
        assert!(matches!(session.resize(100, 30), Err(HubError::Io(_))));
        assert!(matches!(session.send_command("x"), Err(HubError::Io(_))));
        session.cleanup().unwrap();
    }

    #[test]
    fn cleanup_is_idempotent_and_releases_everything() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (session, ctl) = make_session(
            base.path(),
            WorkspaceType::Isolated,
            10,
            Some(store.clone() as Arc<dyn SessionStore>),
        );
        session.start(None).unwrap();
        let workspace = std::path::PathBuf::from(session.status().workspace_path);
        assert!(workspace.is_dir());

        session.cleanup().unwrap();
        session.cleanup().unwrap();

        assert_eq!(session.state(), SessionState::Terminated);
        assert!(ctl.terminated());
        assert_eq!(ctl.terminate_calls(), 1);
        assert!(!workspace.exists());
        let records = store.sessions_for_user("alice").unwrap();
        assert_eq!(records[0].status, SessionState::Terminated);
        assert!(matches!(
            session.send_command("x"),
            Err(HubError::InvalidState { .. })
        ));
    }

    /// Parks the first upsert until the test lets it through.
    struct GatedStore {
        inner: MemoryStore,
        entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
        gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    }

    impl SessionStore for GatedStore {
        fn upsert_session(&self, record: &SessionRecord) -> HubResult<()> {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                if let Some(entered) = self.entered.lock().unwrap().take() {
                    entered.send(()).unwrap();
                }
                gate.recv().unwrap();
            }
            self.inner.upsert_session(record)
        }

        fn append_output(&self, session_id: &str, chunk: &OutputChunk) -> HubResult<u64> {
            self.inner.append_output(session_id, chunk)
        }

        fn sessions_for_user(&self, user_id: &str) -> HubResult<Vec<SessionRecord>> {
            self.inner.sessions_for_user(user_id)
        }

        fn active_sessions(&self) -> HubResult<Vec<SessionRecord>> {
            self.inner.active_sessions()
        }

        fn output_for_session(&self, session_id: &str) -> HubResult<Vec<StoredChunk>> {
            self.inner.output_for_session(session_id)
        }

        fn reconcile_after_restart(&self) -> HubResult<usize> {
            self.inner.reconcile_after_restart()
        }
    }

    #[test]
    fn slow_active_write_cannot_overwrite_terminated_record() {
        let base = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            entered: Mutex::new(Some(entered_tx)),
            gate: Mutex::new(Some(gate_rx)),
        });
        let (session, _ctl) = make_session(
            base.path(),
            WorkspaceType::Isolated,
            10,
            Some(store.clone() as Arc<dyn SessionStore>),
        );
        session.start(None).unwrap();

        // an `active` record write stalls inside the store
        let writer = {
            let session = session.clone();
            std::thread::spawn(move || session.persist())
        };
        entered_rx.recv().unwrap();

        let closer = {
            let session = session.clone();
            std::thread::spawn(move || session.cleanup())
        };
        wait_for(|| session.state() == SessionState::Terminated);
        std::thread::sleep(Duration::from_millis(50));

        gate_tx.send(()).unwrap();
        writer.join().unwrap();
        closer.join().unwrap().unwrap();

        let records = store.sessions_for_user("alice").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SessionState::Terminated);
    }

    #[test]
    fn persistent_workspace_survives_cleanup() {
        let base = tempfile::tempdir().unwrap();
        let (session, _ctl) = make_session(base.path(), WorkspaceType::Persistent, 10, None);
        session.start(None).unwrap();
        let workspace = std::path::PathBuf::from(session.status().workspace_path);
        session.cleanup().unwrap();
        assert!(workspace.is_dir());
    }

    #[test]
    fn process_exit_moves_to_error_and_notifies() {
        let base = tempfile::tempdir().unwrap();
        let (session, ctl) = make_session(base.path(), WorkspaceType::Isolated, 10, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.start(Some(tx)).unwrap();

        ctl.exit();
        wait_for(|| session.state() == SessionState::Error);
        wait_for(|| !matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)));
        // cleanup after an error keeps the error status
        session.cleanup().unwrap();
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn explicit_cleanup_is_not_an_error() {
        let base = tempfile::tempdir().unwrap();
        let (session, _ctl) = make_session(base.path(), WorkspaceType::Isolated, 10, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.start(Some(tx)).unwrap();
        session.cleanup().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn status_is_side_effect_free() {
        let base = tempfile::tempdir().unwrap();
        let (session, _ctl) = make_session(base.path(), WorkspaceType::Isolated, 10, None);
        session.backdate(Duration::from_secs(120));
        let before = session.last_activity();
        let snap = session.status();
        assert_eq!(session.last_activity(), before);
        assert_eq!(snap.user_id, "alice");
        assert_eq!(snap.workspace_type, WorkspaceType::Isolated);
        session.touch();
        assert!(session.last_activity() > before);
    }

    #[test]
    fn decode_utf8_across_reads() {
        let mut carry = Vec::new();
        let bytes = "é€".as_bytes();
        assert_eq!(decode_utf8(&mut carry, &bytes[..1]), "");
        assert_eq!(decode_utf8(&mut carry, &bytes[1..3]), "é");
        assert_eq!(decode_utf8(&mut carry, &bytes[3..]), "€");
        assert!(carry.is_empty());
        assert_eq!(decode_utf8(&mut carry, b"\xffok"), "\u{fffd}ok");
    }
}
