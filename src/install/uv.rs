//! uv / uvx install path — synthesize a standalone runner script.
//!
//! The script pins the resolved command, arguments, and merged environment,
//! so the server can be relaunched identically outside this process (or by
//! an external process manager). POSIX gets an `exec` shell script spawned
//! directly; Windows gets a `.cmd` launched through the shell so it lands
//! in its own console.

use std::path::{Path, PathBuf};

use crate::descriptor::ExecutionSpec;
use crate::error::WharfError;
use crate::install::spawn::SpawnSpec;

/// Quote a token for safe embedding in a POSIX shell script.
#[cfg(unix)]
fn shell_quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

/// Write the runner script into the install directory and return its path.
pub(crate) fn write_runner_script(
    server: &str,
    dir: &Path,
    execution: &ExecutionSpec,
) -> crate::Result<PathBuf> {
    let script_path;
    let contents;

    #[cfg(unix)]
    {
        script_path = dir.join(format!("run-{server}.sh"));
        let mut lines = vec!["#!/bin/sh".to_string()];
        let mut env_sorted: Vec<_> = execution.env.iter().collect();
        env_sorted.sort();
        for (key, value) in env_sorted {
            lines.push(format!("export {key}={}", shell_quote(value)));
        }
        let mut exec_line = format!("exec {}", shell_quote(&execution.command));
        for arg in &execution.args {
            exec_line.push(' ');
            exec_line.push_str(&shell_quote(arg));
        }
        lines.push(exec_line);
        lines.push(String::new());
        contents = lines.join("\n");
    }

    #[cfg(windows)]
    {
        script_path = dir.join(format!("run-{server}.cmd"));
        let mut lines = vec!["@echo off".to_string()];
        let mut env_sorted: Vec<_> = execution.env.iter().collect();
        env_sorted.sort();
        for (key, value) in env_sorted {
            lines.push(format!("set {key}={value}"));
        }
        let mut exec_line = execution.command.clone();
        for arg in &execution.args {
            exec_line.push(' ');
            exec_line.push_str(arg);
        }
        lines.push(exec_line);
        lines.push(String::new());
        contents = lines.join("\r\n");
    }

    std::fs::write(&script_path, &contents).map_err(|e| {
        WharfError::InstallFailed(
            server.to_string(),
            format!("write {}: {e}", script_path.display()),
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).map_err(
            |e| {
                WharfError::InstallFailed(
                    server.to_string(),
                    format!("chmod {}: {e}", script_path.display()),
                )
            },
        )?;
    }

    Ok(script_path)
}

/// How to launch the runner script on this platform.
pub(crate) fn runner_spawn_spec(script: &Path, dir: &Path) -> SpawnSpec {
    #[cfg(unix)]
    {
        SpawnSpec {
            command: script.to_string_lossy().into_owned(),
            args: vec![],
            env: std::collections::HashMap::new(),
            cwd: Some(dir.to_path_buf()),
        }
    }
    #[cfg(windows)]
    {
        // `start` detaches into a new console window.
        SpawnSpec {
            command: "cmd".to_string(),
            args: vec![
                "/C".to_string(),
                "start".to_string(),
                String::new(),
                script.to_string_lossy().into_owned(),
            ],
            env: std::collections::HashMap::new(),
            cwd: Some(dir.to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_execution() -> ExecutionSpec {
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "it's secret".to_string());
        ExecutionSpec {
            command: "uvx".to_string(),
            args: vec!["weather-mcp".to_string(), "--port".to_string(), "8080".to_string()],
            env,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_script_content_and_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = write_runner_script("weather", dir.path(), &sample_execution()).unwrap();
        let contents = std::fs::read_to_string(&script).unwrap();

        assert!(contents.starts_with("#!/bin/sh\n"));
        assert!(contents.contains(r"export API_KEY='it'\''s secret'"));
        assert!(contents.contains("exec uvx weather-mcp --port 8080"));

        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-token_1.0"), "plain-token_1.0");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("don't"), r"'don'\''t'");
        assert_eq!(shell_quote(""), "''");
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_spec_is_script_itself() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_runner_script("weather", dir.path(), &sample_execution()).unwrap();
        let spec = runner_spawn_spec(&script, dir.path());
        assert_eq!(spec.command, script.to_string_lossy());
        assert!(spec.args.is_empty());
    }
}
