//! Persisted install/session state — one JSON file, rewritten wholesale.
//!
//! The store is read once at process start and every update synchronously
//! rewrites the whole file. Last writer wins; there is no file locking.
//! That is acceptable for a single-process desktop companion — see
//! DESIGN.md before adding concurrent writers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptor::MethodKind;
use crate::error::WharfError;
use crate::transport::TransportKind;

const SCHEMA_VERSION: &str = "1";

/// Per-server persisted state, keyed by server id.
///
/// Every field is optional — records accrete over a server's life and are
/// never deleted automatically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_installed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_method: Option<MethodKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_type: Option<TransportKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    schema_version: String,
    #[serde(default)]
    mcp_servers: HashMap<String, ServerRecord>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            mcp_servers: HashMap::new(),
        }
    }
}

/// File-backed store of per-server install and session state.
pub struct PersistStore {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl PersistStore {
    /// Open the store at `path`, seeding from the existing file if present.
    ///
    /// A missing file is an empty store. A corrupt file is an error — better
    /// to fail loudly at startup than silently discard install history.
    pub fn open(path: PathBuf) -> crate::Result<Self> {
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| WharfError::Persist(format!("parse {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => {
                return Err(WharfError::Persist(format!(
                    "read {}: {e}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Apply `update` to the record for `server_id` (created if absent) and
    /// rewrite the file.
    pub fn record(
        &self,
        server_id: &str,
        update: impl FnOnce(&mut ServerRecord),
    ) -> crate::Result<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        update(state.mcp_servers.entry(server_id.to_string()).or_default());
        self.flush(&state)
    }

    /// Mark a server installed with its resolved method and directory.
    pub fn record_install_status(
        &self,
        server_id: &str,
        method: MethodKind,
        dir: &std::path::Path,
    ) -> crate::Result<()> {
        self.record(server_id, |rec| {
            rec.is_installed = Some(true);
            rec.installed_method = Some(method);
            rec.installed_dir = Some(dir.to_path_buf());
            rec.current_mode = Some(method.to_string());
        })
    }

    /// Record a freshly opened session against a server.
    pub fn record_session(
        &self,
        server_id: &str,
        session_id: &str,
        transport: TransportKind,
    ) -> crate::Result<()> {
        self.record(server_id, |rec| {
            rec.session_id = Some(session_id.to_string());
            rec.transport_type = Some(transport);
            rec.last_connected = Some(Utc::now());
            rec.active = Some(true);
            rec.is_running = Some(true);
        })
    }

    /// Mark a server's session closed. The session id and timestamp are
    /// kept for diagnostics; only `active` flips.
    pub fn clear_session(&self, server_id: &str) -> crate::Result<()> {
        self.record(server_id, |rec| {
            rec.active = Some(false);
            rec.is_running = Some(false);
        })
    }

    /// Snapshot of a server's record, or None if it was never written.
    pub fn session_info(&self, server_id: &str) -> Option<ServerRecord> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .mcp_servers
            .get(server_id)
            .cloned()
    }

    /// All server ids present in the store.
    pub fn server_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .mcp_servers
            .keys()
            .cloned()
            .collect()
    }

    fn flush(&self, state: &StoreFile) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WharfError::Persist(format!("create {}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| WharfError::Persist(format!("serialize store: {e}")))?;
        std::fs::write(&self.path, json)
            .map_err(|e| WharfError::Persist(format!("write {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, PersistStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistStore::open(dir.path().join("servers.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let (_dir, store) = temp_store();
        assert!(store.session_info("weather").is_none());
        assert!(store.server_ids().is_empty());
    }

    #[test]
    fn test_record_install_status_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        {
            let store = PersistStore::open(path.clone()).unwrap();
            store
                .record_install_status("weather", MethodKind::Npx, std::path::Path::new("/tmp/w"))
                .unwrap();
        }
        // Re-open — the wholesale rewrite must survive a restart.
        let store = PersistStore::open(path).unwrap();
        let rec = store.session_info("weather").unwrap();
        assert_eq!(rec.is_installed, Some(true));
        assert_eq!(rec.installed_method, Some(MethodKind::Npx));
    }

    #[test]
    fn test_session_record_and_clear() {
        let (_dir, store) = temp_store();
        store
            .record_session("weather", "weather-abc123", TransportKind::Stdio)
            .unwrap();
        let rec = store.session_info("weather").unwrap();
        assert_eq!(rec.active, Some(true));
        assert_eq!(rec.session_id.as_deref(), Some("weather-abc123"));
        assert!(rec.last_connected.is_some());

        store.clear_session("weather").unwrap();
        let rec = store.session_info("weather").unwrap();
        assert_eq!(rec.active, Some(false));
        // Session id stays behind for diagnostics
        assert_eq!(rec.session_id.as_deref(), Some("weather-abc123"));
    }

    #[test]
    fn test_camel_case_wire_shape() {
        let (dir, store) = temp_store();
        store
            .record_install_status("weather", MethodKind::Git, std::path::Path::new("/tmp/w"))
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("servers.json")).unwrap();
        assert!(raw.contains("\"schemaVersion\""));
        assert!(raw.contains("\"mcpServers\""));
        assert!(raw.contains("\"isInstalled\""));
        assert!(raw.contains("\"installedMethod\""));
        assert!(!raw.contains("is_installed"));
    }

    #[test]
    fn test_corrupt_file_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(&path, "{not json").unwrap();
        let result = PersistStore::open(path);
        assert!(matches!(result, Err(WharfError::Persist(_))));
    }
}
