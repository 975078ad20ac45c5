//! Transport factory — one outbound connection to a backend MCP server.
//!
//! Three wire protocols are supported: subprocess stdio, Server-Sent
//! Events, and streamable HTTP. All three surface the same
//! `BackendConnection`: an outbound channel of JSON-RPC values, an inbound
//! channel the proxy bridge drains, and (stdio only) a separate stderr
//! channel so diagnostics can travel as protocol notifications instead of
//! polluting logs.

pub mod http;
pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::WharfError;

/// Supported wire transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable-http",
        };
        f.write_str(s)
    }
}

impl FromStr for TransportKind {
    type Err = WharfError;

    /// Unknown discriminators fail with a descriptive error — there is no
    /// default transport to fall back to.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(TransportKind::Stdio),
            "sse" => Ok(TransportKind::Sse),
            "streamable-http" | "streamableHttp" => Ok(TransportKind::StreamableHttp),
            other => Err(WharfError::UnsupportedTransport(other.to_string())),
        }
    }
}

/// Parameters for opening a backend connection.
///
/// `args` is a single shell-style string (the form the `/stdio` endpoint
/// receives), split by the stdio transport's own parser.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRequest {
    pub server_name: Option<String>,
    pub command: Option<String>,
    pub args: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Gateway-wide transport configuration: a default environment layer for
/// spawned subprocesses and the allow-list of request headers forwarded to
/// HTTP backends.
#[derive(Debug, Clone)]
pub struct TransportDefaults {
    pub env: HashMap<String, String>,
    pub allowed_headers: Vec<String>,
}

impl Default for TransportDefaults {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            allowed_headers: vec![
                "authorization".to_string(),
                "mcp-session-id".to_string(),
                "last-event-id".to_string(),
            ],
        }
    }
}

impl TransportDefaults {
    /// Filter request headers down to the configured allow-list
    /// (case-insensitive names).
    pub fn filter_headers(&self, headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .filter(|(k, _)| {
                self.allowed_headers
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(k))
            })
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect()
    }
}

/// The single live outbound connection from the gateway to a backend.
///
/// At most one exists process-wide at any instant — the `Gateway` owns the
/// slot and closes the previous connection before opening a new one.
pub struct BackendConnection {
    kind: TransportKind,
    /// Command or URL, for error context only.
    target: String,
    outbound_tx: mpsc::Sender<Value>,
    incoming_rx: std::sync::Mutex<Option<mpsc::Receiver<Value>>>,
    stderr_rx: std::sync::Mutex<Option<mpsc::Receiver<String>>>,
    cancel: CancellationToken,
}

impl BackendConnection {
    pub(crate) fn new(
        kind: TransportKind,
        target: String,
        outbound_tx: mpsc::Sender<Value>,
        incoming_rx: mpsc::Receiver<Value>,
        stderr_rx: Option<mpsc::Receiver<String>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kind,
            target,
            outbound_tx,
            incoming_rx: std::sync::Mutex::new(Some(incoming_rx)),
            stderr_rx: std::sync::Mutex::new(stderr_rx),
            cancel,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Send a JSON-RPC message toward the backend.
    pub async fn send(&self, message: Value) -> crate::Result<()> {
        self.outbound_tx.send(message).await.map_err(|_| {
            WharfError::ConnectFailed(self.target.clone(), "backend channel closed".to_string())
        })
    }

    /// Take the inbound message stream. Yields `None` after the first call —
    /// exactly one proxy bridge drains a connection.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<Value>> {
        self.incoming_rx.lock().expect("incoming lock poisoned").take()
    }

    /// Take the stderr stream, if this transport has one (stdio only).
    pub fn take_stderr(&self) -> Option<mpsc::Receiver<String>> {
        self.stderr_rx.lock().expect("stderr lock poisoned").take()
    }

    /// True once the connection's tasks have been told to stop.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tear the connection down: IO tasks observe the token, the stdio
    /// transport kills its child. Idempotent.
    pub async fn close(&self) {
        tracing::info!(kind = %self.kind, target = %self.target, "closing backend connection");
        self.cancel.cancel();
    }
}

/// Build and start a backend connection for the requested transport.
///
/// The connection is live when this returns: the subprocess is spawned or
/// the HTTP stream is open. Failures distinguish `AuthFailed` (HTTP 401)
/// from generic `ConnectFailed` so the caller can prompt for credentials.
pub async fn connect(
    request: &TransportRequest,
    kind: TransportKind,
    defaults: &TransportDefaults,
) -> crate::Result<BackendConnection> {
    match kind {
        TransportKind::Stdio => stdio::connect(request, defaults).await,
        TransportKind::Sse => sse::connect(request, defaults).await,
        TransportKind::StreamableHttp => http::connect(request, defaults).await,
    }
}
