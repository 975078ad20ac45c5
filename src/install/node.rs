//! npm / npx install path.
//!
//! Synthesizes a minimal package manifest naming the target package at its
//! declared version or tag, installs dependencies, and runs the optional
//! post-install command. Spawning the resulting command is the installer's
//! final step, shared with the other spawn-at-the-end methods.

use std::path::Path;

use serde_json::json;

use crate::error::WharfError;
use crate::install::run_step;
use crate::transport::stdio::parse_command_line;

/// Verify a global helper tool is invocable, installing it with
/// `npm install -g` when missing.
pub(crate) async fn ensure_helper(server: &str, tool: &str) -> crate::Result<()> {
    if run_step(server, tool, &["--version"], None).await.is_ok() {
        return Ok(());
    }
    tracing::info!(server = %server, tool = %tool, "helper tool missing, installing globally");
    run_step(server, "npm", &["install", "-g", tool], None).await
}

/// Write the synthesized manifest and install dependencies.
pub(crate) async fn install_package(
    server: &str,
    dir: &Path,
    package: &str,
    version: Option<&str>,
    post_install: Option<&str>,
) -> crate::Result<()> {
    let manifest = json!({
        "name": format!("{server}-runner"),
        "private": true,
        "dependencies": {
            package: version.unwrap_or("latest"),
        }
    });
    let path = dir.join("package.json");
    let contents = serde_json::to_string_pretty(&manifest).map_err(|e| {
        WharfError::InstallFailed(server.to_string(), format!("serialize package.json: {e}"))
    })?;
    std::fs::write(&path, contents).map_err(|e| {
        WharfError::InstallFailed(server.to_string(), format!("write package.json: {e}"))
    })?;

    run_step(server, "npm", &["install"], Some(dir)).await?;

    if let Some(post) = post_install {
        let argv = parse_command_line(post);
        if let Some((command, rest)) = argv.split_first() {
            let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
            run_step(server, command, &rest, Some(dir)).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manifest_names_package_at_version() {
        let dir = tempfile::tempdir().unwrap();
        // npm install will fail on a nonexistent package, but the manifest
        // must land first either way.
        let _ = install_package(
            "weather",
            dir.path(),
            "@wharf-test/does-not-exist",
            Some("1.2.3"),
            None,
        )
        .await;

        let manifest = std::fs::read_to_string(dir.path().join("package.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(parsed["name"], "weather-runner");
        assert_eq!(parsed["dependencies"]["@wharf-test/does-not-exist"], "1.2.3");
    }

    #[tokio::test]
    async fn test_version_defaults_to_latest() {
        let dir = tempfile::tempdir().unwrap();
        let _ = install_package("weather", dir.path(), "left-pad", None, None).await;
        let manifest = std::fs::read_to_string(dir.path().join("package.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(parsed["dependencies"]["left-pad"], "latest");
    }
}
