//! Runtime Registry — the in-memory directory of server instances.
//!
//! A name-keyed map of `RuntimeServerInstance` with uniform start / stop /
//! status operations. Instances are created once per server name and
//! replaced only by explicit re-registration. Start and stop delegate to an
//! `InstanceLauncher` — the seam the gateway, the desktop-shell bridge, and
//! tests all plug into — and flip the instance's status from the outcome.
//! A full status sweep tolerates individual failures: one misbehaving
//! backend must never block visibility into the rest of the fleet.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::descriptor::ServerDescriptor;
use crate::error::WharfError;
use crate::install::meta;

/// Instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Running,
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Running => "running",
            InstanceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Read-only view of a registered instance.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub name: String,
    pub status: InstanceStatus,
    pub descriptor: ServerDescriptor,
    pub last_error: Option<String>,
}

struct RuntimeServerInstance {
    descriptor: ServerDescriptor,
    status: InstanceStatus,
    last_error: Option<String>,
}

/// Backend operations an instance delegates to.
///
/// Implemented by the process launcher below, by the gateway (sessions as
/// the start/stop mechanism), and by test mocks.
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    async fn start(&self, descriptor: &ServerDescriptor) -> crate::Result<()>;
    async fn stop(&self, descriptor: &ServerDescriptor) -> crate::Result<()>;
    async fn check(&self, descriptor: &ServerDescriptor) -> crate::Result<InstanceStatus>;
}

/// Launcher that runs each server's execution command as a child process
/// owned by the registry, so stop and status checks have a real handle.
#[derive(Default)]
pub struct ProcessLauncher {
    children: Mutex<HashMap<String, tokio::process::Child>>,
}

#[async_trait]
impl InstanceLauncher for ProcessLauncher {
    async fn start(&self, descriptor: &ServerDescriptor) -> crate::Result<()> {
        let mut cmd = tokio::process::Command::new(&descriptor.execution.command);
        cmd.args(&descriptor.execution.args)
            .envs(&descriptor.execution.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        let child = cmd.spawn().map_err(|e| {
            WharfError::SpawnFailed(descriptor.name.clone(), e.to_string())
        })?;
        self.children
            .lock()
            .await
            .insert(descriptor.name.clone(), child);
        Ok(())
    }

    async fn stop(&self, descriptor: &ServerDescriptor) -> crate::Result<()> {
        let mut children = self.children.lock().await;
        if let Some(mut child) = children.remove(&descriptor.name) {
            child.kill().await.map_err(|e| {
                WharfError::SpawnFailed(descriptor.name.clone(), format!("kill failed: {e}"))
            })?;
        }
        Ok(())
    }

    async fn check(&self, descriptor: &ServerDescriptor) -> crate::Result<InstanceStatus> {
        let mut children = self.children.lock().await;
        match children.get_mut(&descriptor.name) {
            None => Ok(InstanceStatus::Stopped),
            Some(child) => match child.try_wait() {
                Ok(None) => Ok(InstanceStatus::Running),
                Ok(Some(_)) => {
                    children.remove(&descriptor.name);
                    Ok(InstanceStatus::Stopped)
                }
                Err(e) => Err(WharfError::SpawnFailed(
                    descriptor.name.clone(),
                    format!("status check failed: {e}"),
                )),
            },
        }
    }
}

/// Name-keyed directory of runtime server instances.
pub struct RuntimeRegistry {
    instances: RwLock<HashMap<String, RuntimeServerInstance>>,
    launcher: Arc<dyn InstanceLauncher>,
}

impl RuntimeRegistry {
    pub fn new(launcher: Arc<dyn InstanceLauncher>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            launcher,
        }
    }

    /// Registry backed by the in-process child launcher.
    pub fn with_process_launcher() -> Self {
        Self::new(Arc::new(ProcessLauncher::default()))
    }

    /// Register (or explicitly replace) an instance from its descriptor.
    ///
    /// The full descriptor is copied into the instance's config snapshot.
    /// New instances start `Stopped`.
    pub async fn register(&self, descriptor: &ServerDescriptor) {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&descriptor.name) {
            tracing::info!(server = %descriptor.name, "replacing registered instance");
        }
        instances.insert(
            descriptor.name.clone(),
            RuntimeServerInstance {
                descriptor: descriptor.clone(),
                status: InstanceStatus::Stopped,
                last_error: None,
            },
        );
    }

    pub async fn get(&self, name: &str) -> Option<InstanceSnapshot> {
        self.instances.read().await.get(name).map(|inst| snapshot(name, inst))
    }

    pub async fn get_all(&self) -> Vec<InstanceSnapshot> {
        let instances = self.instances.read().await;
        let mut all: Vec<InstanceSnapshot> = instances
            .iter()
            .map(|(name, inst)| snapshot(name, inst))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Force an instance's status (supervision give-up, session close).
    pub async fn set_status(&self, name: &str, status: InstanceStatus, error: Option<&str>) {
        if let Some(inst) = self.instances.write().await.get_mut(name) {
            inst.status = status;
            inst.last_error = error.map(String::from);
        }
    }

    /// Start an instance. No-op when already running.
    ///
    /// Delegates to the launcher and flips status from the outcome:
    /// `Running` on success, `Error` (with the message kept) on failure.
    pub async fn start(&self, name: &str) -> crate::Result<()> {
        let descriptor = {
            let instances = self.instances.read().await;
            let inst = instances
                .get(name)
                .ok_or_else(|| WharfError::ServerNotFound(name.to_string()))?;
            if inst.status == InstanceStatus::Running {
                tracing::debug!(server = %name, "already running, start is a no-op");
                return Ok(());
            }
            inst.descriptor.clone()
        };

        match self.launcher.start(&descriptor).await {
            Ok(()) => {
                tracing::info!(server = %name, "instance started");
                self.set_status(name, InstanceStatus::Running, None).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "instance start failed");
                self.set_status(name, InstanceStatus::Error, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Stop an instance. No-op when already stopped.
    ///
    /// On failure the last known status is kept — a failed stop does not
    /// mean the server stopped.
    pub async fn stop(&self, name: &str) -> crate::Result<()> {
        let descriptor = {
            let instances = self.instances.read().await;
            let inst = instances
                .get(name)
                .ok_or_else(|| WharfError::ServerNotFound(name.to_string()))?;
            if inst.status == InstanceStatus::Stopped {
                tracing::debug!(server = %name, "already stopped, stop is a no-op");
                return Ok(());
            }
            inst.descriptor.clone()
        };

        match self.launcher.stop(&descriptor).await {
            Ok(()) => {
                tracing::info!(server = %name, "instance stopped");
                self.set_status(name, InstanceStatus::Stopped, None).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "instance stop failed, keeping status");
                Err(e)
            }
        }
    }

    /// Sweep every instance's status via the launcher.
    ///
    /// Individual failures mark that one instance `Error` and the sweep
    /// continues — the result always covers every registered instance.
    pub async fn update_statuses(&self) -> Vec<(String, InstanceStatus)> {
        let targets: Vec<(String, ServerDescriptor)> = {
            let instances = self.instances.read().await;
            instances
                .iter()
                .map(|(name, inst)| (name.clone(), inst.descriptor.clone()))
                .collect()
        };

        let mut results = Vec::with_capacity(targets.len());
        for (name, descriptor) in targets {
            match self.launcher.check(&descriptor).await {
                Ok(status) => {
                    self.set_status(&name, status, None).await;
                    results.push((name, status));
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "status check failed");
                    self.set_status(&name, InstanceStatus::Error, Some(&e.to_string()))
                        .await;
                    results.push((name, InstanceStatus::Error));
                }
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Reconstruct and register instances from install-root leftovers.
    ///
    /// Returns how many were restored. This is how installed servers
    /// survive a process restart without a dedicated database.
    pub async fn restore_from_disk(&self, root: &std::path::Path) -> usize {
        let discovered = meta::discover_installs(root);
        let count = discovered.len();
        for install in discovered {
            tracing::info!(
                server = %install.name,
                method = ?install.method,
                "restoring installed server"
            );
            self.register(&install.descriptor).await;
        }
        count
    }
}

fn snapshot(name: &str, inst: &RuntimeServerInstance) -> InstanceSnapshot {
    InstanceSnapshot {
        name: name.to_string(),
        status: inst.status,
        descriptor: inst.descriptor.clone(),
        last_error: inst.last_error.clone(),
    }
}
