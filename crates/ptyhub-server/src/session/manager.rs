//! Session lifecycle management.
//!
//! Tracks all live sessions, enforces per-user quotas and ownership, and
//! reclaims idle sessions and sessions whose process exited.
//!
//! The registry lock only guards map membership. Workspace setup, spawning,
//! process I/O and cleanup all happen with the lock released.

use super::pty::{PtySpawner, SpawnRequest};
use super::session::{Session, SessionParams};
use super::workspace::Workspace;
use crate::store::SessionStore;
use futures_util::future::join_all;
use ptyhub_core::{
    CredentialCipher, Credentials, HubError, HubResult, OutputChunk, SessionSnapshot,
    WorkspaceType,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Longest accepted user id, in bytes.
pub const MAX_USER_ID_LEN: usize = 128;

/// Tunables for a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Non-terminal sessions allowed per user.
    pub max_per_user: usize,
    /// Inactivity after which the sweep reclaims a session.
    pub idle_timeout: Duration,
    /// Chunks retained per session.
    pub output_buffer_size: usize,
    pub workspace_base: PathBuf,
    /// Used when a create request does not name one.
    pub workspace_type: WorkspaceType,
    pub agent_command: String,
    pub agent_args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    /// Time between SIGTERM and SIGKILL on cleanup.
    pub kill_grace: Duration,
    pub sweep_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_per_user: 3,
            idle_timeout: Duration::from_secs(30 * 60),
            output_buffer_size: 1000,
            workspace_base: std::env::temp_dir().join("ptyhub"),
            workspace_type: WorkspaceType::Isolated,
            agent_command: "/bin/sh".to_string(),
            agent_args: Vec::new(),
            cols: 120,
            rows: 40,
            kill_grace: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    /// Per-user creations in flight, counted against the quota.
    reserved: HashMap<String, usize>,
}

impl Registry {
    fn live_count(&self, user_id: &str) -> usize {
        self.sessions
            .values()
            .filter(|s| s.user_id() == user_id && !s.state().is_terminal())
            .count()
    }

    fn release_reservation(&mut self, user_id: &str) {
        if let Some(count) = self.reserved.get_mut(user_id) {
            *count -= 1;
            if *count == 0 {
                self.reserved.remove(user_id);
            }
        }
    }
}

/// Manages all live sessions.
pub struct SessionManager {
    registry: Arc<RwLock<Registry>>,
    config: ManagerConfig,
    spawner: Arc<dyn PtySpawner>,
    store: Option<Arc<dyn SessionStore>>,
    cipher: Option<Arc<CredentialCipher>>,
    exited_tx: mpsc::UnboundedSender<String>,
    exited_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl SessionManager {
    /// Create a new session manager.
    pub fn new(config: ManagerConfig, spawner: Arc<dyn PtySpawner>) -> Self {
        let (exited_tx, exited_rx) = mpsc::unbounded_channel();
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            config,
            spawner,
            store: None,
            cipher: None,
            exited_tx,
            exited_rx: Mutex::new(Some(exited_rx)),
        }
    }

    /// Persist session records and output to `store`.
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Encrypt credentials with `cipher` before they are persisted.
    pub fn with_cipher(mut self, cipher: Arc<CredentialCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Spawn the idle sweep and the exited-process reaper.
    ///
    /// Both tasks hold only a weak reference and stop once the manager is dropped.
    pub fn start_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let weak = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.check_timeouts().await;
            }
            debug!("session sweep stopped");
        }));

        let receiver = self
            .exited_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(mut rx) = receiver {
            let weak: Weak<Self> = Arc::downgrade(self);
            handles.push(tokio::spawn(async move {
                while let Some(session_id) = rx.recv().await {
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    manager.reap(&session_id).await;
                }
                debug!("session reaper stopped");
            }));
        } else {
            warn!("background tasks already started");
        }

        handles
    }

    /// Create a session for `user_id`, spawning the agent in a new workspace.
    ///
    /// The spawn and registration run on their own task. If the caller stops
    /// waiting, that task still finishes and discards the new session, so no
    /// workspace, process, or quota slot is left behind.
    pub async fn create_session(
        &self,
        user_id: &str,
        credentials: Credentials,
        workspace_type: Option<WorkspaceType>,
    ) -> HubResult<Arc<Session>> {
        validate_user_id(user_id)?;
        let reservation =
            Reservation::acquire(&self.registry, user_id, self.config.max_per_user).await?;
        let encrypted_credentials = self.seal_credentials(&credentials)?;

        let launch = Launch {
            registry: self.registry.clone(),
            config: self.config.clone(),
            spawner: self.spawner.clone(),
            store: self.store.clone(),
            exited_tx: self.exited_tx.clone(),
        };
        let kind = workspace_type.unwrap_or(self.config.workspace_type);
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::spawn(launch.run(
            reservation,
            LaunchRequest {
                user_id: user_id.to_string(),
                credentials,
                encrypted_credentials,
                kind,
            },
            reply_tx,
        ));

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(HubError::Internal("session creation task failed".into())),
        }
    }

    /// Look up a session owned by `user_id`.
    ///
    /// A missing session and someone else's session produce the same error.
    pub async fn get_session_for_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> HubResult<Arc<Session>> {
        let registry = self.registry.read().await;
        match registry.sessions.get(session_id) {
            Some(session) if session.user_id() == user_id => Ok(session.clone()),
            _ => Err(HubError::NotFound(session_id.to_string())),
        }
    }

    /// Remove and clean up a session owned by `user_id`.
    pub async fn terminate_session_for_user(&self, session_id: &str, user_id: &str) -> HubResult<()> {
        let session = {
            let mut registry = self.registry.write().await;
            match registry.sessions.get(session_id) {
                Some(session) if session.user_id() == user_id => {}
                _ => return Err(HubError::NotFound(session_id.to_string())),
            }
            registry.sessions.remove(session_id)
        };
        let Some(session) = session else {
            return Err(HubError::NotFound(session_id.to_string()));
        };

        info!(session_id, user_id, "terminating session");
        cleanup_blocking(session).await
    }

    /// Snapshots of every session owned by `user_id`, oldest first.
    pub async fn list_sessions_for_user(&self, user_id: &str) -> Vec<SessionSnapshot> {
        let owned: Vec<Arc<Session>> = {
            let registry = self.registry.read().await;
            registry
                .sessions
                .values()
                .filter(|s| s.user_id() == user_id)
                .cloned()
                .collect()
        };
        let mut snapshots: Vec<SessionSnapshot> = owned.iter().map(|s| s.status()).collect();
        snapshots.sort_by(|a, b| {
            a.created_ms
                .cmp(&b.created_ms)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        snapshots
    }

    /// Number of registered sessions.
    pub async fn active_session_count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    pub async fn send_command(&self, session_id: &str, user_id: &str, text: String) -> HubResult<()> {
        let session = self.get_session_for_user(session_id, user_id).await?;
        run_blocking(move || session.send_command(&text)).await
    }

    pub async fn get_output(
        &self,
        session_id: &str,
        user_id: &str,
        clear: bool,
    ) -> HubResult<Vec<OutputChunk>> {
        let session = self.get_session_for_user(session_id, user_id).await?;
        Ok(session.output(clear))
    }

    /// Status read through the API; counts as activity.
    pub async fn get_status(&self, session_id: &str, user_id: &str) -> HubResult<SessionSnapshot> {
        let session = self.get_session_for_user(session_id, user_id).await?;
        session.touch();
        Ok(session.status())
    }

    pub async fn resize(&self, session_id: &str, user_id: &str, cols: u16, rows: u16) -> HubResult<()> {
        let session = self.get_session_for_user(session_id, user_id).await?;
        run_blocking(move || session.resize(cols, rows)).await
    }

    /// Reclaim sessions idle longer than the configured timeout.
    ///
    /// Returns the ids of the sessions evicted. Terminal sessions still in the
    /// map are dropped without a second cleanup.
    pub async fn check_timeouts(&self) -> Vec<String> {
        let cutoff = SystemTime::now()
            .checked_sub(self.config.idle_timeout)
            .unwrap_or(UNIX_EPOCH);

        let expired: Vec<Arc<Session>> = {
            let mut registry = self.registry.write().await;
            let mut expired = Vec::new();
            registry.sessions.retain(|_, session| {
                if session.state().is_terminal() {
                    debug!(session_id = %session.id(), "dropping closed session from registry");
                    return false;
                }
                if session.last_activity() < cutoff {
                    expired.push(session.clone());
                    return false;
                }
                true
            });
            expired
        };

        if expired.is_empty() {
            return Vec::new();
        }

        let ids: Vec<String> = expired.iter().map(|s| s.id().to_string()).collect();
        for session in &expired {
            let idle_secs = session
                .last_activity()
                .elapsed()
                .map(|d| d.as_secs())
                .unwrap_or(0);
            warn!(session_id = %session.id(), user_id = %session.user_id(), idle_secs, "session expired (idle)");
        }

        let results = join_all(expired.into_iter().map(cleanup_blocking)).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                error!(session_id = %id, error = %e, "cleanup of idle session failed");
            }
        }
        debug!(count = ids.len(), "idle sweep reclaimed sessions");
        ids
    }

    /// Remove and clean up every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut registry = self.registry.write().await;
            registry.sessions.drain().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "shutting down sessions");
        for result in join_all(sessions.into_iter().map(cleanup_blocking)).await {
            if let Err(e) = result {
                error!(error = %e, "session cleanup failed during shutdown");
            }
        }
    }

    /// Drop a session whose process exited on its own.
    async fn reap(&self, session_id: &str) {
        let mut registry = self.registry.write().await;
        let closed = registry
            .sessions
            .get(session_id)
            .is_some_and(|s| s.state().is_terminal());
        if closed {
            registry.sessions.remove(session_id);
            info!(session_id, "session removed after process exit");
        }
    }

    /// Encrypt credentials for storage. Without a cipher they are not kept.
    fn seal_credentials(&self, credentials: &Credentials) -> HubResult<Option<Vec<u8>>> {
        if credentials.is_empty() || self.store.is_none() {
            return Ok(None);
        }
        let Some(cipher) = &self.cipher else {
            debug!("no encryption key configured, credentials will not be persisted");
            return Ok(None);
        };
        let plaintext = serde_json::to_vec(credentials)
            .map_err(|e| HubError::Internal(format!("failed to encode credentials: {e}")))?;
        Ok(Some(cipher.encrypt(&plaintext)?))
    }
}

/// A quota slot held for a creation in flight.
///
/// Released explicitly under the registry lock that inserts the session, or on
/// drop if the creating task goes away first.
struct Reservation {
    registry: Arc<RwLock<Registry>>,
    user_id: String,
    held: bool,
}

impl Reservation {
    async fn acquire(
        registry: &Arc<RwLock<Registry>>,
        user_id: &str,
        max_per_user: usize,
    ) -> HubResult<Self> {
        let mut guard = registry.write().await;
        let in_flight = guard.reserved.get(user_id).copied().unwrap_or(0);
        if guard.live_count(user_id) + in_flight >= max_per_user {
            warn!(user_id, max = max_per_user, "per-user session limit reached");
            return Err(HubError::LimitExceeded { max: max_per_user });
        }
        *guard.reserved.entry(user_id.to_string()).or_insert(0) += 1;
        Ok(Self {
            registry: registry.clone(),
            user_id: user_id.to_string(),
            held: true,
        })
    }

    fn release(mut self, registry: &mut Registry) {
        registry.release_reservation(&self.user_id);
        self.held = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Ok(mut registry) = self.registry.try_write() {
            registry.release_reservation(&self.user_id);
            return;
        }
        let registry = self.registry.clone();
        let user_id = std::mem::take(&mut self.user_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    registry.write().await.release_reservation(&user_id);
                });
            }
            Err(_) => warn!(user_id = %user_id, "quota reservation leaked, no runtime to release it"),
        }
    }
}

struct LaunchRequest {
    user_id: String,
    credentials: Credentials,
    encrypted_credentials: Option<Vec<u8>>,
    kind: WorkspaceType,
}

/// Everything a creation task needs, owned so it can outlive the caller.
struct Launch {
    registry: Arc<RwLock<Registry>>,
    config: ManagerConfig,
    spawner: Arc<dyn PtySpawner>,
    store: Option<Arc<dyn SessionStore>>,
    exited_tx: mpsc::UnboundedSender<String>,
}

impl Launch {
    async fn run(
        self,
        reservation: Reservation,
        request: LaunchRequest,
        reply: oneshot::Sender<HubResult<Arc<Session>>>,
    ) {
        let user_id = request.user_id.clone();
        let kind = request.kind;
        let session = match self.spawn_session(request).await {
            Ok(session) => session,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "session creation failed");
                reservation.release(&mut *self.registry.write().await);
                let _ = reply.send(Err(e));
                return;
            }
        };

        // Written before the session is reachable, so nothing can terminate
        // it ahead of this first record.
        let persisted = session.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || persisted.persist()).await {
            error!(session_id = %session.id(), error = %e, "persist task failed");
        }

        let mut registry = self.registry.write().await;
        reservation.release(&mut registry);
        if reply.is_closed() {
            drop(registry);
            info!(session_id = %session.id(), user_id = %user_id, "creator went away, discarding session");
            discard(session).await;
            return;
        }
        if session.state().is_terminal() {
            // The process died during startup and has already been cleaned up.
            drop(registry);
            let _ = reply.send(Err(HubError::SpawnFailure(
                "agent process exited during startup".into(),
            )));
            return;
        }
        registry
            .sessions
            .insert(session.id().to_string(), session.clone());
        let total = registry.sessions.len();
        drop(registry);

        info!(session_id = %session.id(), user_id = %user_id, workspace = ?kind, total, "session created");

        if let Err(Ok(session)) = reply.send(Ok(session)) {
            self.registry.write().await.sessions.remove(session.id());
            info!(session_id = %session.id(), "creator went away, discarding session");
            discard(session).await;
        }
    }

    async fn spawn_session(&self, request: LaunchRequest) -> HubResult<Arc<Session>> {
        let LaunchRequest {
            user_id,
            credentials,
            encrypted_credentials,
            kind,
        } = request;
        let session_id = generate_session_id();

        let spawner = self.spawner.clone();
        let config = self.config.clone();
        let user = user_id.clone();
        let sid = session_id.clone();
        let (workspace, process) = tokio::task::spawn_blocking(move || {
            let workspace = Workspace::allocate(&config.workspace_base, kind, &user, &sid)?;
            let env: Vec<(String, String)> = credentials
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let spawned = spawner.spawn(SpawnRequest {
                program: &config.agent_command,
                args: &config.agent_args,
                cwd: workspace.path(),
                env,
                cols: config.cols,
                rows: config.rows,
            });
            match spawned {
                Ok(process) => Ok((workspace, process)),
                Err(e) => {
                    if let Err(re) = workspace.release() {
                        warn!(session_id = %sid, error = %re, "failed to roll back workspace");
                    }
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| HubError::Internal(format!("spawn task failed: {e}")))??;

        let session = Arc::new(Session::new(
            SessionParams {
                id: session_id,
                user_id,
                workspace,
                output_buffer_size: self.config.output_buffer_size,
                kill_grace: self.config.kill_grace,
                encrypted_credentials,
                store: self.store.clone(),
            },
            process,
        ));

        if let Err(e) = session.start(Some(self.exited_tx.clone())) {
            if let Err(ce) = cleanup_blocking(session.clone()).await {
                warn!(session_id = %session.id(), error = %ce, "rollback cleanup failed");
            }
            return Err(e);
        }
        Ok(session)
    }
}

async fn discard(session: Arc<Session>) {
    let id = session.id().to_string();
    if let Err(e) = cleanup_blocking(session).await {
        warn!(session_id = %id, error = %e, "cleanup of discarded session failed");
    }
}

/// Reject user ids that are empty, too long, contain `..`, or contain any
/// control byte.
pub fn validate_user_id(user_id: &str) -> HubResult<()> {
    if user_id.is_empty() {
        return Err(HubError::Validation("user id must not be empty".into()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(HubError::Validation(format!(
            "user id too long ({} bytes, max {MAX_USER_ID_LEN})",
            user_id.len()
        )));
    }
    if user_id.contains("..") {
        return Err(HubError::Validation("user id must not contain '..'".into()));
    }
    if user_id.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err(HubError::Validation(
            "user id must not contain control characters".into(),
        ));
    }
    Ok(())
}

async fn cleanup_blocking(session: Arc<Session>) -> HubResult<()> {
    run_blocking(move || session.cleanup()).await
}

async fn run_blocking<T, F>(f: F) -> HubResult<T>
where
    F: FnOnce() -> HubResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HubError::Internal(format!("join error: {e}")))?
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
