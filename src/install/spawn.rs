//! Process launching for installed servers.
//!
//! Two modes:
//! - **Detached**: spawn and forget. The child is never waited on; a later
//!   crash is invisible. Used for methods that hand off to an external
//!   process manager (docker, a uvx runner script).
//! - **Supervised**: the child's exit is monitored and restarts follow an
//!   exponential backoff (1s → 30s cap). After `MAX_FAILURES` consecutive
//!   short-lived runs the supervisor gives up and reports it, so a
//!   crash-looping server ends up visibly `error` instead of silently gone.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::WharfError;

/// Maximum consecutive short-lived runs before the supervisor gives up.
const MAX_FAILURES: u32 = 5;

/// Initial backoff duration.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Maximum backoff duration cap.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// A run shorter than this counts as a failure; longer runs reset the
/// failure counter before the next restart.
const STABLE_RUN: Duration = Duration::from_secs(30);

/// What to launch: command, argv, extra env, working directory.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Lifecycle notifications from a supervised child.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisedEvent {
    Started { pid: Option<u32> },
    Exited { code: Option<i32> },
    GaveUp,
}

fn build_command(spec: &SpawnSpec) -> Command {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);
    if !spec.env.is_empty() {
        cmd.envs(&spec.env);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    cmd
}

/// Spawn a child and let go of it.
///
/// The handle is dropped without kill-on-drop, so the process outlives the
/// caller. Returns the pid when the OS reports one.
pub fn spawn_detached(name: &str, spec: &SpawnSpec) -> crate::Result<Option<u32>> {
    let mut cmd = build_command(spec);
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let child = cmd
        .spawn()
        .map_err(|e| WharfError::SpawnFailed(name.to_string(), e.to_string()))?;
    let pid = child.id();
    tracing::info!(server = %name, pid = ?pid, "spawned detached process");
    Ok(pid)
}

/// Spawn a child under supervision in a background task.
///
/// The task restarts the child on exit with exponential backoff, emits
/// `SupervisedEvent`s for each transition, and stops either when cancelled
/// (killing the child) or after `MAX_FAILURES` consecutive short-lived runs.
pub fn spawn_supervised(
    name: String,
    spec: SpawnSpec,
    events: mpsc::Sender<SupervisedEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut consecutive_failures: u32 = 0;
        let mut backoff = BACKOFF_INITIAL;

        loop {
            let mut cmd = build_command(&spec);
            cmd.stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());

            let started_at = Instant::now();
            match cmd.spawn() {
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "supervised spawn failed");
                    consecutive_failures += 1;
                }
                Ok(mut child) => {
                    let _ = events
                        .send(SupervisedEvent::Started { pid: child.id() })
                        .await;
                    tokio::select! {
                        status = child.wait() => {
                            let code = status.ok().and_then(|s| s.code());
                            tracing::warn!(server = %name, code = ?code, "supervised process exited");
                            let _ = events.send(SupervisedEvent::Exited { code }).await;
                            if started_at.elapsed() >= STABLE_RUN {
                                consecutive_failures = 0;
                                backoff = BACKOFF_INITIAL;
                            } else {
                                consecutive_failures += 1;
                            }
                        }
                        _ = cancel.cancelled() => {
                            tracing::info!(server = %name, "supervision cancelled, killing child");
                            let _ = child.kill().await;
                            return;
                        }
                    }
                }
            }

            if consecutive_failures >= MAX_FAILURES {
                tracing::error!(
                    server = %name,
                    failures = consecutive_failures,
                    "supervised process exceeded max consecutive failures — giving up"
                );
                let _ = events.send(SupervisedEvent::GaveUp).await;
                return;
            }

            tracing::info!(
                server = %name,
                backoff_secs = backoff.as_secs(),
                "backing off before restart"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return,
            }
            backoff = std::cmp::min(backoff * 2, BACKOFF_MAX);
        }
    });
}
