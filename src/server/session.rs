//! Per-connection MCP session.
//!
//! After the auth gate admits a socket, one session task owns it for the
//! rest of its life: it reads newline-delimited JSON-RPC requests, serves
//! them strictly in receipt order, and delivers `tools/list_changed`
//! notifications pushed by the broadcaster. Sessions are independent; a
//! fault here never touches another connection.
//!
//! State machine: AUTHED -> (initialize) -> RUNNING -> CLOSED. Setup must
//! complete within 10 seconds, and a 30-second liveness probe (a heartbeat
//! sideband frame) catches silently dead peers between requests.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{auth, ServerShared};
use crate::mcp::{
    self, error_codes, heartbeat, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::tokens::Token;

/// Setup (auth already done) must reach RUNNING within this window.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval of the transport liveness probe.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

/// Whether an I/O error kind means the peer is gone (tear the session
/// down) as opposed to something worth only logging.
pub fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Why a session left its read loop. Logged on teardown.
#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    SetupTimeout,
    TransportError(io::Error),
    Cancelled,
}

pub(crate) struct Session {
    id: Uuid,
    token: Token,
    peer: SocketAddr,
    /// Name the client declared in `initialize`. Diagnostics only — the
    /// token's name is canonical for every permission decision.
    client_name: Option<String>,
    running: bool,
}

/// Entry point for one accepted TCP connection: gate, then session loop.
pub(crate) async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    shutdown: watch::Receiver<bool>,
) {
    // An empty token store rejects before reading a single byte.
    let snapshot = shared.tokens.snapshot();
    if snapshot.is_empty() {
        debug!(%peer, "Rejecting connection: token store is empty");
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let line = match timeout(auth::AUTH_TIMEOUT, auth::read_token_line(&mut reader)).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) | Ok(Err(_)) => {
            debug!(%peer, "Connection closed before a valid token line");
            return;
        }
        Err(_) => {
            debug!(%peer, "Timed out waiting for token line");
            return;
        }
    };

    let token = match auth::match_token(&snapshot, &line) {
        Some(token) => token,
        None => {
            // No further data is written on a failed handshake.
            info!(%peer, "Authentication failed");
            return;
        }
    };

    let mut session = Session {
        id: Uuid::new_v4(),
        token,
        peer,
        client_name: None,
        running: false,
    };
    info!(session_id = %session.id, token_name = %session.token.name, %peer, "Session authenticated");

    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    shared.sessions.register(session.id, notify_tx);

    let reason = session
        .run(reader, write_half, &shared, notify_rx, shutdown)
        .await;

    shared.sessions.remove(&session.id);
    match reason {
        CloseReason::PeerClosed | CloseReason::Cancelled => {
            info!(session_id = %session.id, ?reason, "Session closed")
        }
        CloseReason::SetupTimeout => {
            warn!(session_id = %session.id, "Session closed: setup did not complete in time")
        }
        CloseReason::TransportError(e) => {
            info!(session_id = %session.id, error = %e, "Session closed on transport error")
        }
    }
}

impl Session {
    /// The token as it exists in the current snapshot.
    ///
    /// Identity is pinned at admission, but permission edits (and
    /// revocation) apply to requests made after the change: a revoked
    /// token resolves to an empty permission map, so every tool
    /// disappears without re-running the handshake.
    fn effective_token(&self, shared: &ServerShared) -> Token {
        shared
            .tokens
            .snapshot()
            .tokens
            .iter()
            .find(|t| t.id == self.token.id)
            .cloned()
            .unwrap_or_else(|| {
                let mut revoked = self.token.clone();
                revoked.permissions.clear();
                revoked
            })
    }

    async fn run<R, W>(
        &mut self,
        reader: BufReader<R>,
        mut writer: W,
        shared: &Arc<ServerShared>,
        mut notify_rx: mpsc::UnboundedReceiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> CloseReason
    where
        R: tokio::io::AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let setup_deadline = Instant::now() + SETUP_TIMEOUT;
        let mut liveness = interval_at(Instant::now() + LIVENESS_INTERVAL, LIVENESS_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return CloseReason::Cancelled,

                _ = tokio::time::sleep_until(setup_deadline), if !self.running => {
                    return CloseReason::SetupTimeout;
                }

                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => return CloseReason::PeerClosed,
                        Err(e) => return CloseReason::TransportError(e),
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some(response) = self.handle_line(&line, shared).await {
                        if let Err(e) = write_json(&mut writer, &response).await {
                            return CloseReason::TransportError(e);
                        }
                    }
                }

                Some(()) = notify_rx.recv() => {
                    // Best effort: disconnect-class errors end the session,
                    // anything else is only logged.
                    if !self.running {
                        continue;
                    }
                    let note = JsonRpcNotification::tools_list_changed();
                    match write_json(&mut writer, &note).await {
                        Ok(()) => debug!(session_id = %self.id, "Sent tools/list_changed"),
                        Err(e) if is_disconnect(e.kind()) => {
                            return CloseReason::TransportError(e);
                        }
                        Err(e) => warn!(session_id = %self.id, error = %e, "Notification send failed"),
                    }
                }

                _ = liveness.tick() => {
                    let frame = heartbeat::frame();
                    let probe = match writer.write_all(&frame).await {
                        Ok(()) => writer.flush().await,
                        Err(e) => Err(e),
                    };
                    match probe {
                        Ok(()) => {}
                        Err(e) if is_disconnect(e.kind()) => {
                            return CloseReason::TransportError(e);
                        }
                        Err(e) => warn!(session_id = %self.id, error = %e, "Liveness probe failed"),
                    }
                }
            }
        }
    }

    /// Parse one line and produce the response to write, if any.
    async fn handle_line(&mut self, line: &str, shared: &Arc<ServerShared>) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    error_codes::PARSE_ERROR,
                    format!("Invalid JSON: {}", e),
                ));
            }
        };

        if request.jsonrpc != "2.0" {
            return request.id.map(|id| {
                JsonRpcResponse::failure(id, error_codes::INVALID_REQUEST, "Invalid JSON-RPC version")
            });
        }

        let is_notification = request.id.is_none();
        let response = self.handle_request(request, shared).await;
        if is_notification {
            None
        } else {
            response
        }
    }

    async fn handle_request(
        &mut self,
        request: JsonRpcRequest,
        shared: &Arc<ServerShared>,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone().unwrap_or(Value::Null);

        match request.method.as_str() {
            "initialize" => {
                self.client_name = request
                    .params
                    .get("clientInfo")
                    .and_then(|c| c.get("name"))
                    .and_then(|n| n.as_str())
                    .map(String::from);
                debug!(
                    session_id = %self.id,
                    peer = %self.peer,
                    client = self.client_name.as_deref().unwrap_or("unknown"),
                    "Client initialized"
                );
                self.running = true;
                Some(JsonRpcResponse::result(id, mcp::initialize_result()))
            }

            "notifications/initialized" | "initialized" => None,

            "notifications/cancelled" => {
                debug!(session_id = %self.id, "Client cancelled a request");
                None
            }

            "tools/list" => {
                let bindings = shared.bindings.snapshot();
                let token = self.effective_token(shared);
                let tools = shared.registry.list_tools(
                    shared.enabled.load(Ordering::SeqCst),
                    &bindings,
                    &token,
                );
                Some(JsonRpcResponse::result(id, json!({ "tools": tools })))
            }

            "tools/call" => {
                let name = match request.params.get("name").and_then(|v| v.as_str()) {
                    Some(name) => name,
                    None => {
                        return Some(JsonRpcResponse::failure(
                            id,
                            error_codes::INVALID_PARAMS,
                            "Missing tool name in params",
                        ));
                    }
                };
                let args = request
                    .params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));

                // Snapshots taken at the permission check stay in effect
                // for this whole call.
                let bindings = shared.bindings.snapshot();
                let token = self.effective_token(shared);
                let result = shared
                    .registry
                    .dispatch(
                        name,
                        &args,
                        shared.enabled.load(Ordering::SeqCst),
                        &bindings,
                        &token,
                    )
                    .await;
                match serde_json::to_value(&result) {
                    Ok(value) => Some(JsonRpcResponse::result(id, value)),
                    Err(e) => Some(JsonRpcResponse::failure(
                        id,
                        error_codes::INVALID_REQUEST,
                        format!("Failed to serialize result: {}", e),
                    )),
                }
            }

            "prompts/list" => Some(JsonRpcResponse::result(id, json!({ "prompts": [] }))),

            "resources/list" => Some(JsonRpcResponse::result(id, json!({ "resources": [] }))),

            other => Some(JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Unknown method: {}", other),
            )),
        }
    }
}

/// Serialize a message and write it as one newline-terminated line.
async fn write_json<W: AsyncWrite + Unpin, T: serde::Serialize>(
    writer: &mut W,
    message: &T,
) -> io::Result<()> {
    let mut line = serde_json::to_vec(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
