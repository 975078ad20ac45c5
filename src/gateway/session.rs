//! Client sessions and the proxy bridge.
//!
//! A session is the client-facing half of the gateway: a collision-resistant
//! id, an outbound channel the HTTP layer streams from, and a cancel token.
//! The proxy bridge pumps the backing connection's inbound messages into the
//! session, wrapping backend stderr chunks as `notifications/stderr`
//! protocol messages so diagnostics travel the same channel as traffic.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::transport::{BackendConnection, TransportKind};

/// Mint a session id: `{serverName}-{uuid4}`.
///
/// The server-name prefix is load-bearing: batch-stop and the
/// active-servers view group sessions by it.
pub fn new_session_id(server_name: Option<&str>) -> String {
    let prefix = server_name.unwrap_or("session");
    format!("{prefix}-{}", Uuid::new_v4())
}

/// One client-facing session.
pub struct ClientSession {
    pub id: String,
    pub server_name: Option<String>,
    pub kind: TransportKind,
    outbound_tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
}

impl ClientSession {
    /// Create a session plus the receiver half its HTTP response streams from.
    pub fn new(
        server_name: Option<String>,
        kind: TransportKind,
    ) -> (Self, mpsc::Receiver<Value>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let session = Self {
            id: new_session_id(server_name.as_deref()),
            server_name,
            kind,
            outbound_tx,
            cancel: CancellationToken::new(),
        };
        (session, outbound_rx)
    }

    /// Push a message toward the client. Errors mean the client is gone.
    pub async fn push(&self, message: Value) -> Result<(), ()> {
        self.outbound_tx.send(message).await.map_err(|_| ())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close the client-facing transport. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// In-memory map of live sessions for the process lifetime.
///
/// Entries leave only by explicit close, batch-stop, or the bridge's
/// transport-closed path.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<ClientSession>) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close and remove every session whose id is prefixed `{server}-`.
    ///
    /// Individual close failures are tolerated — close is cancel-based and
    /// cannot fail here, but removal still counts only what was present.
    /// Returns the number of sessions actually closed.
    pub async fn close_for_server(&self, server: &str) -> usize {
        let prefix = format!("{server}-");
        let mut sessions = self.sessions.write().await;
        let ids: Vec<String> = sessions
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();
        for id in &ids {
            if let Some(session) = sessions.remove(id) {
                session.close();
                tracing::info!(session = %id, server = %server, "session closed");
            }
        }
        ids.len()
    }

    /// Derived view: live sessions grouped by server-name prefix, with
    /// per-server counts. Sessions opened without a server name group
    /// under their `session` prefix.
    pub async fn active_by_server(&self) -> HashMap<String, usize> {
        let sessions = self.sessions.read().await;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for session in sessions.values() {
            let key = session
                .server_name
                .clone()
                .unwrap_or_else(|| "session".to_string());
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}

/// Wrap a backend stderr chunk as a protocol notification.
fn stderr_notification(chunk: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "notifications/stderr",
        "params": { "content": chunk }
    })
}

/// Start the proxy bridge between a session and the backing connection.
///
/// Two pump tasks: backend inbound → client channel, and (stdio only)
/// backend stderr → client channel as `notifications/stderr`. A session
/// leaves the registry only through explicit close, batch-stop, or its
/// client transport going away (a failed push means the client receiver
/// was dropped); a closed backend stops the pumps but leaves the session
/// registered, matching the single-slot design.
pub fn start_bridge(
    session: Arc<ClientSession>,
    backend: &BackendConnection,
    registry: Arc<SessionRegistry>,
) {
    if let Some(mut incoming) = backend.take_incoming() {
        let session_for_messages = session.clone();
        let registry_for_messages = registry;
        let cancel = session.cancel_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_msg = incoming.recv() => {
                        let Some(msg) = maybe_msg else {
                            tracing::debug!(
                                session = %session_for_messages.id,
                                "backend closed, bridge stopping"
                            );
                            return;
                        };
                        if session_for_messages.push(msg).await.is_err() {
                            // Client transport closed — the one removal
                            // path that is not an explicit close.
                            tracing::info!(
                                session = %session_for_messages.id,
                                "client transport closed, removing session"
                            );
                            session_for_messages.close();
                            registry_for_messages
                                .remove(&session_for_messages.id)
                                .await;
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    if let Some(mut stderr) = backend.take_stderr() {
        let cancel = session.cancel_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_line = stderr.recv() => {
                        let Some(line) = maybe_line else { break };
                        if session.push(stderr_notification(&line)).await.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}
