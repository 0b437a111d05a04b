//! Core server: accepts connections and dispatches API requests to the
//! session manager.

use crate::auth::{AuthGate, RateLimiter};
use crate::config::ServerConfig;
use crate::session::SessionManager;
use crate::transport::websocket::{self, WebSocketConnection};
use ptyhub_core::messages::{decode_request, Operation};
use ptyhub_core::{HubError, HubResult, Request, Response};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The ptyhub server instance.
pub struct PtyHubServer {
    sessions: Arc<SessionManager>,
    gate: Arc<AuthGate>,
    /// Per-IP limiter shared by connects and requests.
    rate_limits: Arc<Mutex<RateLimiter>>,
    max_message_bytes: usize,
    limiter_sweep: Duration,
}

impl PtyHubServer {
    pub fn new(config: &ServerConfig, sessions: Arc<SessionManager>, gate: AuthGate) -> Self {
        let limiter = RateLimiter::new(config.rate_limit.capacity, config.rate_limit.refill_per_sec)
            .with_retention(config.rate_limit.retention);
        Self {
            sessions,
            gate: Arc::new(gate),
            rate_limits: Arc::new(Mutex::new(limiter)),
            max_message_bytes: config.max_message_bytes,
            limiter_sweep: config.rate_limit.sweep_interval,
        }
    }

    /// Serve connections from `listener` until it fails or the task is dropped.
    pub async fn run(self, listener: TcpListener) -> HubResult<()> {
        let server = Arc::new(self);

        let mut ws_rx =
            websocket::start_listener(listener, server.gate.clone(), server.rate_limits.clone());

        // GC rate limiters periodically
        let gc_rate_limits = Arc::downgrade(&server.rate_limits);
        let sweep = server.limiter_sweep;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep);
            loop {
                interval.tick().await;
                let Some(limits) = gc_rate_limits.upgrade() else {
                    break;
                };
                let mut limits = limits.lock().await;
                let removed = limits.gc();
                if removed > 0 {
                    debug!(removed, tracked = limits.len(), "purged idle rate-limit buckets");
                }
            }
        });

        info!("ptyhub-server ready");

        while let Some(conn) = ws_rx.recv().await {
            let srv = server.clone();
            tokio::spawn(async move {
                if let Err(e) = srv.handle_websocket(conn).await {
                    warn!(error = %e, "WebSocket connection error");
                }
            });
        }

        info!("listener closed, shutting down");
        Ok(())
    }

    async fn handle_websocket(&self, mut conn: WebSocketConnection) -> HubResult<()> {
        let remote = conn.remote_addr;
        info!(remote = %remote, "client connected");

        loop {
            let text = match websocket::ws_recv_text(&mut conn.ws_stream, self.max_message_bytes).await
            {
                Ok(Some(text)) => text,
                Ok(None) => break,
                Err(e @ HubError::InvalidMessage(_)) => {
                    self.reply(&mut conn, Response::failure(0, &e)).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let request = match decode_request(&text) {
                Ok(request) => request,
                Err(e) => {
                    debug!(remote = %remote, error = %e, "undecodable request");
                    self.reply(&mut conn, Response::failure(0, &e)).await?;
                    continue;
                }
            };

            let allowed = self.rate_limits.lock().await.check(remote.ip());
            let response = if allowed {
                handle_request(&self.sessions, request).await
            } else {
                warn!(remote = %remote, op = request.op.name(), "request rate limited");
                Response::failure(request.id, &HubError::RateLimited)
            };
            self.reply(&mut conn, response).await?;
        }

        info!(remote = %remote, "client disconnected");
        Ok(())
    }

    async fn reply(&self, conn: &mut WebSocketConnection, response: Response) -> HubResult<()> {
        let text = serde_json::to_string(&response)
            .map_err(|e| HubError::Internal(format!("failed to encode response: {e}")))?;
        websocket::ws_send_text(&mut conn.ws_stream, text).await
    }
}

/// Run one request and wrap the outcome in a response with the same id.
pub async fn handle_request(sessions: &SessionManager, request: Request) -> Response {
    let id = request.id;
    let op = request.op.name();
    match dispatch(sessions, request.op).await {
        Ok(result) => Response {
            id,
            ok: true,
            result: Some(result),
            error: None,
        },
        Err(e) => {
            debug!(op, code = e.code(), error = %e, "request failed");
            Response::failure(id, &e)
        }
    }
}

async fn dispatch(sessions: &SessionManager, op: Operation) -> HubResult<Value> {
    match op {
        Operation::Create {
            user_id,
            credentials,
            workspace_type,
        } => {
            let session = sessions
                .create_session(&user_id, credentials, workspace_type)
                .await?;
            to_value(&session.status())
        }
        Operation::SendCommand {
            user_id,
            session_id,
            command,
        } => {
            sessions.send_command(&session_id, &user_id, command).await?;
            Ok(json!({ "session_id": session_id }))
        }
        Operation::GetOutput {
            user_id,
            session_id,
            clear,
        } => {
            let chunks = sessions.get_output(&session_id, &user_id, clear).await?;
            Ok(json!({ "session_id": session_id, "chunks": to_value(&chunks)? }))
        }
        Operation::GetStatus {
            user_id,
            session_id,
        } => to_value(&sessions.get_status(&session_id, &user_id).await?),
        Operation::Resize {
            user_id,
            session_id,
            cols,
            rows,
        } => {
            sessions.resize(&session_id, &user_id, cols, rows).await?;
            Ok(json!({ "session_id": session_id, "cols": cols, "rows": rows }))
        }
        Operation::Terminate {
            user_id,
            session_id,
        } => {
            sessions
                .terminate_session_for_user(&session_id, &user_id)
                .await?;
            Ok(json!({ "session_id": session_id }))
        }
        Operation::ListForUser { user_id } => {
            to_value(&sessions.list_sessions_for_user(&user_id).await)
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> HubResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| HubError::Internal(format!("failed to encode result: {e}")))
}
