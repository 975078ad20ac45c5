//! Subprocess stdio transport.
//!
//! Spawns the backend as a child process and speaks newline-delimited
//! JSON-RPC over its pipes. Key decisions:
//! - The argument string arrives shell-style (`"-y weather-mcp --port 80"`)
//!   and is split by a small quote-aware scanner, never a shell.
//! - The executable is resolved through PATH up front so a missing command
//!   fails as `SpawnFailed` before any pipes exist.
//! - Three environment layers merge: ambient process env, configured
//!   defaults, per-request overrides — request wins.
//! - stderr is piped separately (not inherited) so the proxy bridge can
//!   forward chunks as `notifications/stderr` protocol messages.
//! - Non-JSON stdout lines are discarded with a debug log; noisy servers
//!   that print banners to stdout must not corrupt the message stream.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::WharfError;
use crate::transport::{BackendConnection, TransportDefaults, TransportKind, TransportRequest};

/// Split a shell-style argument string into argv tokens.
///
/// Honors single and double quotes and backslash escapes outside single
/// quotes. This is a scanner, not a shell: no globbing, no substitution.
pub fn parse_command_line(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                for inner in chars.by_ref() {
                    if inner == '\'' {
                        break;
                    }
                    current.push(inner);
                }
            }
            '"' => {
                in_token = true;
                while let Some(inner) = chars.next() {
                    match inner {
                        '"' => break,
                        '\\' => {
                            if let Some(&next) = chars.peek() {
                                if next == '"' || next == '\\' {
                                    current.push(next);
                                    chars.next();
                                } else {
                                    current.push('\\');
                                }
                            }
                        }
                        _ => current.push(inner),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            _ => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Resolve a command name to an executable path.
///
/// Absolute and relative paths that exist are taken as-is; bare names go
/// through PATH lookup, which also picks up platform wrapper scripts
/// (`.cmd` shims on Windows, shebang scripts on POSIX).
pub fn resolve_executable(command: &str) -> crate::Result<PathBuf> {
    let direct = PathBuf::from(command);
    if direct.is_absolute() && direct.exists() {
        return Ok(direct);
    }
    which::which(command)
        .map_err(|e| WharfError::SpawnFailed(command.to_string(), e.to_string()))
}

/// Merge the three environment layers. Later layers win: ambient process
/// env < configured defaults < per-request overrides.
pub fn merge_env(
    defaults: &HashMap<String, String>,
    request: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged: HashMap<String, String> = std::env::vars().collect();
    merged.extend(defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.extend(request.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Spawn the backend subprocess and wire up the pipe tasks.
pub(crate) async fn connect(
    request: &TransportRequest,
    defaults: &TransportDefaults,
) -> crate::Result<BackendConnection> {
    let command_str = request.command.as_deref().ok_or_else(|| {
        WharfError::ConnectFailed(
            "stdio".to_string(),
            "stdio transport requires 'command'".to_string(),
        )
    })?;

    let mut argv = parse_command_line(command_str);
    if let Some(args) = request.args.as_deref() {
        argv.extend(parse_command_line(args));
    }
    if argv.is_empty() {
        return Err(WharfError::ConnectFailed(
            "stdio".to_string(),
            "empty command".to_string(),
        ));
    }

    let exe = resolve_executable(&argv[0])?;
    let env = merge_env(&defaults.env, &request.env);

    let mut cmd = Command::new(&exe);
    cmd.args(&argv[1..])
        .env_clear()
        .envs(&env)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| WharfError::SpawnFailed(argv[0].clone(), e.to_string()))?;

    let child_stdin = child.stdin.take().ok_or_else(|| {
        WharfError::SpawnFailed(argv[0].clone(), "failed to open stdin pipe".to_string())
    })?;
    let child_stdout = child.stdout.take().ok_or_else(|| {
        WharfError::SpawnFailed(argv[0].clone(), "failed to open stdout pipe".to_string())
    })?;
    let child_stderr = child.stderr.take().ok_or_else(|| {
        WharfError::SpawnFailed(argv[0].clone(), "failed to open stderr pipe".to_string())
    })?;

    let target = argv.join(" ");
    let cancel = CancellationToken::new();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(32);
    let (incoming_tx, incoming_rx) = mpsc::channel::<Value>(64);
    let (stderr_tx, stderr_rx) = mpsc::channel::<String>(64);

    // Writer: outbound messages → child stdin, newline-delimited.
    let writer_cancel = cancel.clone();
    let writer_target = target.clone();
    tokio::spawn(async move {
        let mut stdin = child_stdin;
        loop {
            tokio::select! {
                maybe_msg = outbound_rx.recv() => {
                    let Some(msg) = maybe_msg else { break };
                    let mut line = msg.to_string();
                    line.push('\n');
                    if let Err(e) = stdin.write_all(line.as_bytes()).await {
                        tracing::warn!(target = %writer_target, error = %e, "stdin write failed");
                        break;
                    }
                }
                _ = writer_cancel.cancelled() => break,
            }
        }
    });

    // Reader: child stdout lines → incoming channel, non-JSON discarded.
    let reader_cancel = cancel.clone();
    let reader_target = target.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stdout).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            match serde_json::from_str::<Value>(&line) {
                                Ok(msg) => {
                                    if incoming_tx.send(msg).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => {
                                    tracing::debug!(
                                        target = %reader_target,
                                        line = %line,
                                        "discarding non-JSON stdout line"
                                    );
                                }
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = reader_cancel.cancelled() => break,
            }
        }
        // incoming_tx dropped here — the bridge observes the close
    });

    // Stderr drain: chunks travel to the bridge, which wraps them as
    // notifications/stderr messages for the client.
    let stderr_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stderr).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            if stderr_tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = stderr_cancel.cancelled() => break,
            }
        }
    });

    // Supervisor: kill the child on close, observe natural exit.
    let supervise_cancel = cancel.clone();
    let supervise_target = target.clone();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => tracing::info!(
                        target = %supervise_target,
                        code = ?status.code(),
                        "backend subprocess exited"
                    ),
                    Err(e) => tracing::warn!(
                        target = %supervise_target,
                        error = %e,
                        "backend subprocess wait failed"
                    ),
                }
                supervise_cancel.cancel();
            }
            _ = supervise_cancel.cancelled() => {
                let _ = child.kill().await;
            }
        }
    });

    tracing::info!(command = %target, "stdio backend connection started");

    Ok(BackendConnection::new(
        TransportKind::Stdio,
        target,
        outbound_tx,
        incoming_rx,
        Some(stderr_rx),
        cancel,
    ))
}
