//! The Gateway — one owned object holding what used to be process-wide
//! mutable singletons: the session registry, the single backing-connection
//! slot, the persisted store, and the runtime registry.
//!
//! The backing slot is deliberately a single slot, not a pool: opening a
//! session closes whatever connection was there first. The slot lives
//! behind a mutex so the close-old/open-new pair is serialized — two
//! concurrent opens cannot leave a dangling reference.

pub mod routes;
pub mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::error::WharfError;
use crate::gateway::session::{start_bridge, ClientSession, SessionRegistry};
use crate::install::Installer;
use crate::persist::PersistStore;
use crate::registry::RuntimeRegistry;
use crate::transport::{
    self, BackendConnection, TransportDefaults, TransportKind, TransportRequest,
};

/// Gateway construction parameters.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Directory servers are installed under.
    pub install_root: PathBuf,
    /// Path of the persisted install/session JSON store.
    pub store_path: PathBuf,
    /// Transport defaults: subprocess env layer + header allow-list.
    pub defaults: TransportDefaults,
}

/// A freshly opened session: the id for the response header plus the
/// receiver the HTTP layer streams messages from.
pub struct OpenedSession {
    pub session_id: String,
    pub outbound: mpsc::Receiver<Value>,
}

/// One entry of a batch-start request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStartEntry {
    pub server_name: String,
    pub command: String,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Per-server result of a batch operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub server_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_removed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a batch operation: independent settlement, one line per server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BatchResult>,
}

/// The gateway: transport factory consumer, session owner, backing-slot
/// keeper. Shared with the axum boundary as `Arc<Gateway>`.
pub struct Gateway {
    sessions: Arc<SessionRegistry>,
    backing: Mutex<Option<Arc<BackendConnection>>>,
    store: Arc<PersistStore>,
    registry: Arc<RuntimeRegistry>,
    installer: Installer,
    defaults: TransportDefaults,
}

impl Gateway {
    /// Build a gateway, seeding the store from disk and restoring
    /// previously installed servers into the runtime registry.
    pub async fn new(config: GatewayConfig) -> crate::Result<Self> {
        let store = Arc::new(PersistStore::open(config.store_path)?);
        let registry = Arc::new(RuntimeRegistry::with_process_launcher());
        let restored = registry.restore_from_disk(&config.install_root).await;
        if restored > 0 {
            tracing::info!(count = restored, "restored installed servers from disk");
        }
        let installer = Installer::new(
            config.install_root,
            store.clone(),
            registry.clone(),
        );
        Ok(Self {
            sessions: Arc::new(SessionRegistry::new()),
            backing: Mutex::new(None),
            store,
            registry,
            installer,
            defaults: config.defaults,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn store(&self) -> &Arc<PersistStore> {
        &self.store
    }

    pub fn defaults(&self) -> &TransportDefaults {
        &self.defaults
    }

    /// Open a session: close the previous backing connection, connect a new
    /// one, register a client session, persist the session fields, and wire
    /// the proxy bridge.
    ///
    /// Holding the slot lock across close-and-connect is what guarantees
    /// the "at most one backing connection" invariant — the second of two
    /// concurrent opens waits until the first has fully replaced the slot.
    pub async fn open_session(
        &self,
        kind: TransportKind,
        request: TransportRequest,
    ) -> crate::Result<OpenedSession> {
        let mut slot = self.backing.lock().await;
        if let Some(previous) = slot.take() {
            previous.close().await;
        }

        let connection = Arc::new(transport::connect(&request, kind, &self.defaults).await?);
        *slot = Some(connection.clone());
        drop(slot);

        let server_name = request.server_name.clone();
        let (client_session, outbound) = ClientSession::new(server_name.clone(), kind);
        let client_session = Arc::new(client_session);
        let session_id = client_session.id.clone();
        self.sessions.insert(client_session.clone()).await;

        if let Some(server) = &server_name {
            if let Err(e) = self.store.record_session(server, &session_id, kind) {
                tracing::warn!(server = %server, error = %e, "failed to persist session");
            }
        }

        start_bridge(client_session, &connection, self.sessions.clone());

        tracing::info!(session = %session_id, kind = %kind, "session opened");
        Ok(OpenedSession {
            session_id,
            outbound,
        })
    }

    /// Look up an existing session for a resume request.
    ///
    /// An unknown id is a client-visible not-found, never silently ignored.
    pub async fn resume_session(&self, session_id: &str) -> crate::Result<Arc<ClientSession>> {
        self.sessions
            .get(session_id)
            .await
            .ok_or_else(|| WharfError::SessionNotFound(session_id.to_string()))
    }

    /// Relay a client message into the backing connection behind a session.
    pub async fn relay(&self, session_id: &str, message: Value) -> crate::Result<()> {
        if self.sessions.get(session_id).await.is_none() {
            return Err(WharfError::SessionNotFound(session_id.to_string()));
        }
        let slot = self.backing.lock().await;
        match slot.as_ref() {
            Some(connection) => connection.send(message).await,
            None => Err(WharfError::RelayFailed(
                session_id.to_string(),
                "no backing connection".to_string(),
            )),
        }
    }

    /// Close every session belonging to a server, then the backing
    /// connection. Returns how many sessions were removed.
    pub async fn close_server_sessions(&self, server: &str) -> usize {
        let removed = self.sessions.close_for_server(server).await;

        if let Err(e) = self.store.clear_session(server) {
            tracing::warn!(server = %server, error = %e, "failed to persist session close");
        }

        let mut slot = self.backing.lock().await;
        if let Some(connection) = slot.take() {
            connection.close().await;
        }
        removed
    }

    /// Derived view: live sessions grouped by server name with counts.
    pub async fn active_servers(&self) -> HashMap<String, usize> {
        self.sessions.active_by_server().await
    }

    /// Whether a backing connection currently occupies the slot.
    pub async fn has_backing_connection(&self) -> bool {
        self.backing.lock().await.is_some()
    }

    /// Start a group of stdio-backed servers, settling independently.
    pub async fn batch_start(&self, entries: Vec<BatchStartEntry>) -> BatchSummary {
        let futures = entries.into_iter().map(|entry| async move {
            let request = TransportRequest {
                server_name: Some(entry.server_name.clone()),
                command: Some(entry.command),
                args: entry.args,
                env: entry.env,
                url: None,
                headers: HashMap::new(),
            };
            match self.open_session(TransportKind::Stdio, request).await {
                Ok(opened) => BatchResult {
                    server_name: entry.server_name,
                    success: true,
                    session_id: Some(opened.session_id),
                    sessions_removed: None,
                    error: None,
                },
                Err(e) => BatchResult {
                    server_name: entry.server_name,
                    success: false,
                    session_id: None,
                    sessions_removed: None,
                    error: Some(e.to_string()),
                },
            }
        });

        summarize(join_all(futures).await)
    }

    /// Stop a group of servers by name, settling independently.
    pub async fn batch_stop(&self, server_names: Vec<String>) -> BatchSummary {
        let futures = server_names.into_iter().map(|name| async move {
            let removed = self.close_server_sessions(&name).await;
            if let Err(e) = self.registry.stop(&name).await {
                tracing::debug!(server = %name, error = %e, "registry stop during batch");
            }
            BatchResult {
                server_name: name,
                success: true,
                session_id: None,
                sessions_removed: Some(removed),
                error: None,
            }
        });

        summarize(join_all(futures).await)
    }
}

fn summarize(results: Vec<BatchResult>) -> BatchSummary {
    let total = results.len();
    let succeeded = results.iter().filter(|r| r.success).count();
    BatchSummary {
        total,
        succeeded,
        failed: total - succeeded,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_gateway() -> (tempfile::TempDir, Arc<Gateway>) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(GatewayConfig {
            install_root: dir.path().join("servers"),
            store_path: dir.path().join("servers.json"),
            defaults: TransportDefaults::default(),
        })
        .await
        .unwrap();
        (dir, Arc::new(gateway))
    }

    fn stdio_request(server: &str, command: &str, args: &str) -> TransportRequest {
        TransportRequest {
            server_name: Some(server.to_string()),
            command: Some(command.to_string()),
            args: Some(args.to_string()),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_session_replaces_backing_connection() {
        let (_dir, gateway) = make_gateway().await;

        let first = gateway
            .open_session(TransportKind::Stdio, stdio_request("a", "sleep", "30"))
            .await
            .unwrap();
        assert!(gateway.has_backing_connection().await);

        let second = gateway
            .open_session(TransportKind::Stdio, stdio_request("b", "sleep", "30"))
            .await
            .unwrap();

        // Both sessions registered, one backing connection.
        assert!(gateway.sessions().get(&first.session_id).await.is_some());
        assert!(gateway.sessions().get(&second.session_id).await.is_some());
        assert!(gateway.has_backing_connection().await);
        assert_ne!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn test_resume_unknown_session_is_not_found() {
        let (_dir, gateway) = make_gateway().await;
        let result = gateway.resume_session("weather-nope").await;
        assert!(matches!(result, Err(WharfError::SessionNotFound(id)) if id == "weather-nope"));
    }

    #[tokio::test]
    async fn test_relay_unknown_session_is_not_found() {
        let (_dir, gateway) = make_gateway().await;
        let result = gateway
            .relay("weather-nope", serde_json::json!({"jsonrpc": "2.0"}))
            .await;
        assert!(matches!(result, Err(WharfError::SessionNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_persisted_against_server() {
        let (_dir, gateway) = make_gateway().await;
        let opened = gateway
            .open_session(TransportKind::Stdio, stdio_request("weather", "sleep", "30"))
            .await
            .unwrap();

        let record = gateway.store().session_info("weather").unwrap();
        assert_eq!(record.active, Some(true));
        assert_eq!(record.session_id.as_deref(), Some(opened.session_id.as_str()));
        assert_eq!(record.transport_type, Some(TransportKind::Stdio));

        gateway.close_server_sessions("weather").await;
        let record = gateway.store().session_info("weather").unwrap();
        assert_eq!(record.active, Some(false));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_server_sessions_clears_backing() {
        let (_dir, gateway) = make_gateway().await;
        gateway
            .open_session(TransportKind::Stdio, stdio_request("weather", "sleep", "30"))
            .await
            .unwrap();
        assert!(gateway.has_backing_connection().await);

        let removed = gateway.close_server_sessions("weather").await;
        assert_eq!(removed, 1);
        assert!(!gateway.has_backing_connection().await);
        assert!(gateway.sessions().is_empty().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_batch_start_settles_independently() {
        let (_dir, gateway) = make_gateway().await;
        let summary = gateway
            .batch_start(vec![
                BatchStartEntry {
                    server_name: "good".to_string(),
                    command: "sleep".to_string(),
                    args: Some("30".to_string()),
                    env: HashMap::new(),
                },
                BatchStartEntry {
                    server_name: "bad".to_string(),
                    command: "/this/command/does/not/exist-wharf".to_string(),
                    args: None,
                    env: HashMap::new(),
                },
            ])
            .await;

        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        let bad = summary
            .results
            .iter()
            .find(|r| r.server_name == "bad")
            .unwrap();
        assert!(!bad.success);
        assert!(bad.error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_batch_stop_counts_removed_sessions() {
        let (_dir, gateway) = make_gateway().await;
        gateway
            .open_session(TransportKind::Stdio, stdio_request("a", "sleep", "30"))
            .await
            .unwrap();
        gateway
            .open_session(TransportKind::Stdio, stdio_request("a", "sleep", "30"))
            .await
            .unwrap();
        gateway
            .open_session(TransportKind::Stdio, stdio_request("b", "sleep", "30"))
            .await
            .unwrap();

        let summary = gateway
            .batch_stop(vec!["a".to_string(), "b".to_string(), "ghost".to_string()])
            .await;

        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 0);
        let by_name: HashMap<_, _> = summary
            .results
            .iter()
            .map(|r| (r.server_name.clone(), r.sessions_removed.unwrap()))
            .collect();
        assert_eq!(by_name["a"], 2);
        assert_eq!(by_name["b"], 1);
        assert_eq!(by_name["ghost"], 0, "absent name stops zero sessions, not an error");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_arrives_as_protocol_notification() {
        let (_dir, gateway) = make_gateway().await;
        let mut opened = gateway
            .open_session(
                TransportKind::Stdio,
                stdio_request("weather", "sh", "-c 'echo oops >&2; sleep 1'"),
            )
            .await
            .unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), opened.outbound.recv())
            .await
            .expect("timed out waiting for stderr notification")
            .expect("session channel closed");
        assert_eq!(msg["method"], "notifications/stderr");
        assert_eq!(msg["params"]["content"], "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_active_servers_derived_view() {
        let (_dir, gateway) = make_gateway().await;
        gateway
            .open_session(TransportKind::Stdio, stdio_request("a", "sleep", "30"))
            .await
            .unwrap();
        gateway
            .open_session(TransportKind::Stdio, stdio_request("a", "sleep", "30"))
            .await
            .unwrap();

        let active = gateway.active_servers().await;
        assert_eq!(active["a"], 2);
    }
}
