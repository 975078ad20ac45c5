//! Installer — turns a server descriptor into an installed, registered server.
//!
//! Two top-level paths: zero-install (persist the descriptor, register,
//! done — no process is spawned) and method-driven (resolve a mechanism via
//! the Method Selector, provision it, write provenance metadata, register).
//! Failures settle as `InstallOutcome { success: false }` with a
//! human-readable message; partially written files are not rolled back.
//!
//! Progress events stream to subscribers as `{server_name, status, percent}`
//! tuples. Percent is monotonic advisory progress, not an exact measure.

pub mod docker;
pub mod git;
pub mod meta;
pub mod node;
pub mod spawn;
pub mod uv;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::descriptor::{InstallMethod, MethodKind, ServerDescriptor};
use crate::error::WharfError;
use crate::install::spawn::{SpawnSpec, SupervisedEvent};
use crate::method::select_install_method;
use crate::persist::PersistStore;
use crate::probe::{SystemProbe, ToolProbe};
use crate::registry::{InstanceStatus, RuntimeRegistry};

/// Progress event delivered to installer subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallProgress {
    pub server_name: String,
    pub status: String,
    pub percent: u8,
}

/// Settled result of one install attempt.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub success: bool,
    pub method: Option<MethodKind>,
    pub message: Option<String>,
}

/// Run one provisioning command to completion, capturing its output.
///
/// Non-zero exit or spawn failure both settle as `InstallFailed` carrying
/// a stderr tail for the human-readable message.
pub(crate) async fn run_step(
    server: &str,
    command: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> crate::Result<()> {
    let mut cmd = tokio::process::Command::new(command);
    cmd.args(args).stdin(std::process::Stdio::null());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let output = cmd.output().await.map_err(|e| {
        WharfError::InstallFailed(server.to_string(), format!("{command} failed to spawn: {e}"))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(WharfError::InstallFailed(
            server.to_string(),
            format!("{command} exited {}: {tail}", output.status),
        ));
    }
    Ok(())
}

/// Installer for MCP servers, bound to an install root, persisted store,
/// and the runtime registry it populates.
pub struct Installer {
    root: PathBuf,
    store: Arc<PersistStore>,
    registry: Arc<RuntimeRegistry>,
    probe: Arc<dyn ToolProbe>,
    progress: broadcast::Sender<InstallProgress>,
    cancel: CancellationToken,
}

impl Installer {
    pub fn new(root: PathBuf, store: Arc<PersistStore>, registry: Arc<RuntimeRegistry>) -> Self {
        Self::with_probe(root, store, registry, Arc::new(SystemProbe))
    }

    /// Construct with an injected prober (tests, or a cached prober).
    pub fn with_probe(
        root: PathBuf,
        store: Arc<PersistStore>,
        registry: Arc<RuntimeRegistry>,
        probe: Arc<dyn ToolProbe>,
    ) -> Self {
        let (progress, _) = broadcast::channel(64);
        Self {
            root,
            store,
            registry,
            probe,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to install progress events.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<InstallProgress> {
        self.progress.subscribe()
    }

    /// Cancellation token handed to supervised children spawned by installs.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, server: &str, status: &str, percent: u8) {
        // No subscribers is fine — progress is advisory.
        let _ = self.progress.send(InstallProgress {
            server_name: server.to_string(),
            status: status.to_string(),
            percent,
        });
    }

    /// Install a server from its descriptor.
    ///
    /// Never returns an error: failures settle as `success: false` with a
    /// message, mirroring how the result crosses the gateway boundary.
    pub async fn install_server(&self, name: &str, desc: &ServerDescriptor) -> InstallOutcome {
        match self.try_install(name, desc).await {
            Ok(method) => {
                self.emit(name, "installed", 100);
                InstallOutcome {
                    success: true,
                    method,
                    message: None,
                }
            }
            Err(e) => {
                tracing::error!(server = %name, error = %e, "install failed");
                self.emit(name, "failed", 100);
                InstallOutcome {
                    success: false,
                    method: None,
                    message: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_install(
        &self,
        name: &str,
        desc: &ServerDescriptor,
    ) -> crate::Result<Option<MethodKind>> {
        let dir = self.root.join(name);

        if desc.zero_install {
            // Registration alone is the installation — the Method Selector
            // is never consulted and no process is spawned.
            self.emit(name, "registering", 50);
            create_install_dir(name, &dir)?;
            meta::write_zero_install_config(&dir, desc)?;
            self.registry.register(desc).await;
            self.store.record(&desc.id, |rec| {
                rec.is_installed = Some(true);
                rec.installed_dir = Some(dir.clone());
                rec.current_mode = Some("zero-install".to_string());
            })?;
            return Ok(None);
        }

        self.emit(name, "resolving install method", 5);
        let method = select_install_method(desc, self.probe.as_ref()).await?;
        let kind = method.kind();
        tracing::info!(server = %name, method = %kind, "install method resolved");

        create_install_dir(name, &dir)?;
        self.emit(name, "provisioning", 20);

        match &method {
            InstallMethod::Git {
                source,
                branch,
                build_command,
                ..
            } => {
                self.emit(name, "cloning repository", 30);
                git::install(
                    name,
                    &dir,
                    source,
                    branch.as_deref(),
                    build_command.as_deref(),
                )
                .await?;
            }
            InstallMethod::Docker {
                image,
                compose_file,
                ports,
                execution,
            } => {
                self.emit(name, "pulling image", 30);
                docker::install(
                    name,
                    &dir,
                    image.as_deref(),
                    compose_file.as_deref(),
                    ports,
                    &execution.env,
                )
                .await?;
            }
            InstallMethod::Npm {
                package,
                version,
                post_install,
                execution,
            } => {
                node::ensure_helper(name, &execution.command).await?;
                self.emit(name, "installing package", 40);
                node::install_package(name, &dir, package, version.as_deref(), post_install.as_deref())
                    .await?;
                self.emit(name, "starting", 80);
                self.launch(name, desc, execution_spec(desc, &dir))?;
            }
            InstallMethod::Npx { package, execution } => {
                node::ensure_helper(name, &execution.command).await?;
                if let Some(package) = package {
                    self.emit(name, "installing package", 40);
                    node::install_package(name, &dir, package, desc.version.as_deref(), None)
                        .await?;
                }
                self.emit(name, "starting", 80);
                self.launch(name, desc, execution_spec(desc, &dir))?;
            }
            InstallMethod::Uv { execution } | InstallMethod::Uvx { execution, .. } => {
                self.emit(name, "writing runner script", 40);
                let script = uv::write_runner_script(name, &dir, execution)?;
                self.emit(name, "starting", 80);
                self.launch(name, desc, uv::runner_spawn_spec(&script, &dir))?;
            }
            InstallMethod::Local { .. } => {
                self.emit(name, "starting", 80);
                self.launch(name, desc, execution_spec(desc, &dir))?;
            }
        }

        self.emit(name, "recording metadata", 90);
        meta::write_method_meta(
            &dir,
            &meta::MethodMeta {
                server: name.to_string(),
                method: kind,
                installed_at: Utc::now(),
                execution: desc.execution.clone(),
                source: desc.source.clone(),
                image: desc.image.clone(),
                package: desc.package.clone(),
            },
        )?;
        self.store.record_install_status(&desc.id, kind, &dir)?;
        self.registry.register(desc).await;

        Ok(Some(kind))
    }

    /// Launch the installed server's process.
    ///
    /// Supervised descriptors get the restart-with-backoff monitor; a
    /// supervisor that gives up flips the registry entry to `Error` so the
    /// crash loop is visible. `supervised: false` preserves fire-and-forget
    /// for servers that hand off to an external process manager.
    fn launch(&self, name: &str, desc: &ServerDescriptor, spec: SpawnSpec) -> crate::Result<()> {
        if !desc.supervised {
            spawn::spawn_detached(name, &spec)?;
            return Ok(());
        }

        let (events_tx, mut events_rx) = mpsc::channel::<SupervisedEvent>(16);
        spawn::spawn_supervised(name.to_string(), spec, events_tx, self.cancel.clone());

        let registry = self.registry.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if event == SupervisedEvent::GaveUp {
                    registry
                        .set_status(&name, InstanceStatus::Error, Some("process crash loop"))
                        .await;
                }
            }
        });
        Ok(())
    }
}

fn execution_spec(desc: &ServerDescriptor, dir: &Path) -> SpawnSpec {
    SpawnSpec {
        command: desc.execution.command.clone(),
        args: desc.execution.args.clone(),
        env: desc.execution.env.clone(),
        cwd: Some(dir.to_path_buf()),
    }
}

fn create_install_dir(server: &str, dir: &Path) -> crate::Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        WharfError::InstallFailed(server.to_string(), format!("create {}: {e}", dir.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ExecutionSpec;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe that counts invocations — zero-install must never touch it.
    struct CountingProbe {
        calls: AtomicUsize,
        available: bool,
    }

    #[async_trait]
    impl ToolProbe for CountingProbe {
        async fn available(&self, kind: MethodKind) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            kind == MethodKind::Local || self.available
        }
    }

    fn make_descriptor(name: &str, preferred: MethodKind) -> ServerDescriptor {
        ServerDescriptor {
            id: format!("{name}-id"),
            name: name.to_string(),
            preferred,
            execution: ExecutionSpec {
                command: "echo".to_string(),
                args: vec!["hello".to_string()],
                env: HashMap::new(),
            },
            source: None,
            branch: None,
            build_command: None,
            image: None,
            compose_file: None,
            ports: vec![],
            package: None,
            version: None,
            post_install: None,
            zero_install: false,
            supervised: false,
        }
    }

    fn make_installer(
        root: &Path,
        probe_available: bool,
    ) -> (Installer, Arc<RuntimeRegistry>, Arc<CountingProbe>) {
        let store = Arc::new(PersistStore::open(root.join("servers.json")).unwrap());
        let registry = Arc::new(RuntimeRegistry::with_process_launcher());
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            available: probe_available,
        });
        let installer = Installer::with_probe(
            root.join("servers"),
            store,
            registry.clone(),
            probe.clone(),
        );
        (installer, registry, probe)
    }

    #[tokio::test]
    async fn test_zero_install_skips_method_selection() {
        let root = tempfile::tempdir().unwrap();
        let (installer, registry, probe) = make_installer(root.path(), false);

        let mut desc = make_descriptor("weather", MethodKind::Npx);
        desc.zero_install = true;

        let outcome = installer.install_server("weather", &desc).await;
        assert!(outcome.success, "zero-install should succeed: {:?}", outcome.message);
        assert_eq!(outcome.method, None);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0, "prober never invoked");

        // Exactly one registry entry
        let all = registry.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "weather");

        // Descriptor persisted verbatim as config.json
        let config = root.path().join("servers/weather/config.json");
        let raw = std::fs::read_to_string(config).unwrap();
        let parsed: ServerDescriptor = serde_json::from_str(&raw).unwrap();
        assert!(parsed.zero_install);
    }

    #[tokio::test]
    async fn test_no_method_settles_as_failure() {
        let root = tempfile::tempdir().unwrap();
        let (installer, registry, _probe) = make_installer(root.path(), false);

        let desc = make_descriptor("weather", MethodKind::Docker);
        let outcome = installer.install_server("weather", &desc).await;
        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("no install method"));
        assert!(registry.get("weather").await.is_none(), "failed install registers nothing");
    }

    #[tokio::test]
    async fn test_local_install_spawns_and_registers() {
        let root = tempfile::tempdir().unwrap();
        let (installer, registry, _probe) = make_installer(root.path(), false);

        let desc = make_descriptor("weather", MethodKind::Local);
        let outcome = installer.install_server("weather", &desc).await;
        assert!(outcome.success, "{:?}", outcome.message);
        assert_eq!(outcome.method, Some(MethodKind::Local));

        // meta file written
        let meta_path = root.path().join("servers/weather/local-meta.json");
        assert!(meta_path.is_file());

        assert!(registry.get("weather").await.is_some());
    }

    #[tokio::test]
    async fn test_progress_events_are_monotonic() {
        let root = tempfile::tempdir().unwrap();
        let (installer, _registry, _probe) = make_installer(root.path(), false);
        let mut progress = installer.subscribe_progress();

        let mut desc = make_descriptor("weather", MethodKind::Npx);
        desc.zero_install = true;
        installer.install_server("weather", &desc).await;

        let mut last = 0u8;
        while let Ok(event) = progress.try_recv() {
            assert_eq!(event.server_name, "weather");
            assert!(event.percent >= last, "percent must not regress");
            last = event.percent;
        }
        assert_eq!(last, 100, "final event reports completion");
    }

    #[tokio::test]
    async fn test_invalid_descriptor_settles_as_failure() {
        let root = tempfile::tempdir().unwrap();
        let (installer, _registry, _probe) = make_installer(root.path(), true);

        // git preferred, probe says available, but no source field
        let desc = make_descriptor("weather", MethodKind::Git);
        let outcome = installer.install_server("weather", &desc).await;
        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("source"));
    }
}
