//! Per-method install metadata files and install-root discovery.
//!
//! Every successful install leaves a `<method>-meta.json` in the server's
//! install directory recording what was installed and when. Zero-install
//! servers persist the descriptor itself as `config.json`. At startup the
//! registry's bulk loader scans the install root for these leftovers and
//! reconstructs one runtime instance per discovered server — that is how
//! servers survive a process restart without a database.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptor::{ExecutionSpec, MethodKind, ServerDescriptor};
use crate::error::WharfError;

/// Filename holding a zero-install server's descriptor, verbatim.
pub const ZERO_INSTALL_CONFIG: &str = "config.json";

/// Per-method metadata filenames, in discovery priority order. The
/// zero-install `config.json` is more specific than any of these and is
/// checked first.
pub const META_PRIORITY: [&str; 7] = [
    "git-meta.json",
    "docker-meta.json",
    "npm-meta.json",
    "npx-meta.json",
    "uv-meta.json",
    "uvx-meta.json",
    "local-meta.json",
];

/// What a method-driven install left behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodMeta {
    pub server: String,
    pub method: MethodKind,
    pub installed_at: DateTime<Utc>,
    pub execution: ExecutionSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

impl MethodMeta {
    /// Rebuild a minimal descriptor so the registry factory can construct
    /// an instance from a discovered install.
    pub fn to_descriptor(&self) -> ServerDescriptor {
        ServerDescriptor {
            id: self.server.clone(),
            name: self.server.clone(),
            preferred: self.method,
            execution: self.execution.clone(),
            source: self.source.clone(),
            branch: None,
            build_command: None,
            image: self.image.clone(),
            compose_file: None,
            ports: vec![],
            package: self.package.clone(),
            version: None,
            post_install: None,
            zero_install: false,
            supervised: true,
        }
    }
}

/// The metadata filename for a method kind (`git` → `git-meta.json`).
pub fn meta_filename(kind: MethodKind) -> String {
    format!("{kind}-meta.json")
}

/// Write a method metadata file into the server's install directory.
pub fn write_method_meta(dir: &Path, meta: &MethodMeta) -> crate::Result<()> {
    let path = dir.join(meta_filename(meta.method));
    let json = serde_json::to_string_pretty(meta)
        .map_err(|e| WharfError::Persist(format!("serialize meta: {e}")))?;
    std::fs::write(&path, json)
        .map_err(|e| WharfError::Persist(format!("write {}: {e}", path.display())))
}

/// Write a zero-install server's descriptor verbatim as `config.json`.
pub fn write_zero_install_config(dir: &Path, desc: &ServerDescriptor) -> crate::Result<()> {
    let path = dir.join(ZERO_INSTALL_CONFIG);
    let json = serde_json::to_string_pretty(desc)
        .map_err(|e| WharfError::Persist(format!("serialize descriptor: {e}")))?;
    std::fs::write(&path, json)
        .map_err(|e| WharfError::Persist(format!("write {}: {e}", path.display())))
}

/// A server found under the install root.
#[derive(Debug, Clone)]
pub struct DiscoveredInstall {
    pub name: String,
    pub dir: PathBuf,
    pub descriptor: ServerDescriptor,
    pub method: Option<MethodKind>,
}

/// Scan the install root for leftover metadata and reconstruct descriptors.
///
/// Per server directory the most specific file wins: `config.json` (the
/// full zero-install descriptor), then the per-method files in
/// `META_PRIORITY` order. Unreadable or unparseable files are logged and
/// skipped — a corrupt leftover must not block discovery of the rest.
pub fn discover_installs(root: &Path) -> Vec<DiscoveredInstall> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(root = %root.display(), error = %e, "install root not readable");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();

        match read_server_dir(&name, &dir) {
            Some(install) => found.push(install),
            None => {
                tracing::debug!(server = %name, "no metadata found, skipping directory");
            }
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    found
}

fn read_server_dir(name: &str, dir: &Path) -> Option<DiscoveredInstall> {
    let config_path = dir.join(ZERO_INSTALL_CONFIG);
    if config_path.is_file() {
        match read_json::<ServerDescriptor>(&config_path) {
            Ok(descriptor) => {
                return Some(DiscoveredInstall {
                    name: name.to_string(),
                    dir: dir.to_path_buf(),
                    descriptor,
                    method: None,
                });
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "corrupt config.json, trying method metadata");
            }
        }
    }

    for filename in META_PRIORITY {
        let path = dir.join(filename);
        if !path.is_file() {
            continue;
        }
        match read_json::<MethodMeta>(&path) {
            Ok(meta) => {
                return Some(DiscoveredInstall {
                    name: name.to_string(),
                    dir: dir.to_path_buf(),
                    descriptor: meta.to_descriptor(),
                    method: Some(meta.method),
                });
            }
            Err(e) => {
                tracing::warn!(
                    server = %name,
                    file = %filename,
                    error = %e,
                    "corrupt metadata file, trying next"
                );
            }
        }
    }
    None
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> crate::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| WharfError::Persist(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| WharfError::Persist(format!("parse {}: {e}", path.display())))
}
