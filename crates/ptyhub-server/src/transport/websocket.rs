//! WebSocket listener using tokio-tungstenite.
//!
//! Connections are rate limited per IP before the handshake, and the upgrade
//! request must carry a valid `Authorization: Bearer` header. Requests and
//! responses travel as JSON text frames.

use crate::auth::{AuthGate, RateLimiter};
use futures_util::{SinkExt, StreamExt};
use ptyhub_core::{HubError, HubResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted, authenticated WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start accepting WebSocket connections on `tcp_listener`.
///
/// Returns a receiver that yields connections that passed the rate limiter
/// and the auth gate.
pub fn start_listener(
    tcp_listener: TcpListener,
    gate: Arc<AuthGate>,
    limiter: Arc<Mutex<RateLimiter>>,
) -> mpsc::Receiver<WebSocketConnection> {
    if let Ok(addr) = tcp_listener.local_addr() {
        info!(addr = %addr, auth = gate.is_enabled(), "WebSocket listener started");
    }

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let allowed = limiter.lock().await.check(addr.ip());
                    if !allowed {
                        warn!(remote = %addr, "connection rate limited");
                        continue;
                    }

                    let tx = tx.clone();
                    let gate = gate.clone();
                    tokio::spawn(async move {
                        let callback = |req: &Request, resp: Response| authorize(&gate, req, resp);
                        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                debug!("WebSocket listener stopped");
                break;
            }
        }
    });

    rx
}

/// Handshake callback: reject the upgrade with 401 unless the gate accepts
/// the request's bearer token.
fn authorize(gate: &AuthGate, req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match gate.check_authorization_header(value) {
        Ok(()) => Ok(resp),
        Err(e) => {
            warn!(error = %e, "rejected WebSocket upgrade");
            let mut reject = ErrorResponse::new(Some(e.code().to_string()));
            *reject.status_mut() = StatusCode::UNAUTHORIZED;
            Err(reject)
        }
    }
}

/// Helper: send a text message over a WebSocket.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> HubResult<()> {
    ws.send(Message::Text(text))
        .await
        .map_err(|e| transport_error("WS send failed", e))
}

/// Helper: receive the next text message from a WebSocket.
///
/// Returns `None` if the connection is closed. Binary frames and frames
/// larger than `max_bytes` are rejected with `InvalidMessage`, leaving the
/// connection usable.
pub async fn ws_recv_text(
    ws: &mut WebSocketStream<TcpStream>,
    max_bytes: usize,
) -> HubResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > max_bytes {
                    return Err(HubError::InvalidMessage(format!(
                        "frame too large: {} bytes (max {max_bytes})",
                        text.len()
                    )));
                }
                return Ok(Some(text));
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(HubError::InvalidMessage(
                    "binary frames are not supported, send JSON text".into(),
                ));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(transport_error("WS recv failed", e)),
            None => return Ok(None),
        }
    }
}

fn transport_error(context: &str, e: tokio_tungstenite::tungstenite::Error) -> HubError {
    HubError::Io(std::io::Error::other(format!("{context}: {e}")))
}
