//! Docker install path — compose apply, or pull-and-run a named image.

use std::collections::HashMap;
use std::path::Path;

use crate::error::WharfError;
use crate::install::run_step;

/// Provision a docker-backed server.
///
/// With a compose file: `docker compose -f <file> pull` then `up -d`.
/// With an image: `docker pull` then a detached `docker run` carrying the
/// port mappings and per-key `-e` environment flags. The container itself
/// is the running server — nothing else is spawned for this method.
pub(crate) async fn install(
    server: &str,
    dir: &Path,
    image: Option<&str>,
    compose_file: Option<&Path>,
    ports: &[String],
    env: &HashMap<String, String>,
) -> crate::Result<()> {
    if let Some(compose) = compose_file {
        let compose = compose.to_string_lossy();
        run_step(server, "docker", &["compose", "-f", &compose, "pull"], Some(dir)).await?;
        run_step(
            server,
            "docker",
            &["compose", "-f", &compose, "up", "-d"],
            Some(dir),
        )
        .await?;
        return Ok(());
    }

    let image = image.ok_or_else(|| {
        WharfError::InstallFailed(
            server.to_string(),
            "docker method requires an image or compose file".to_string(),
        )
    })?;

    run_step(server, "docker", &["pull", image], Some(dir)).await?;

    let container = format!("wharf-{server}");
    let mut args: Vec<String> = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container,
    ];
    for port in ports {
        args.push("-p".to_string());
        args.push(port.clone());
    }
    let mut env_sorted: Vec<_> = env.iter().collect();
    env_sorted.sort();
    for (key, value) in env_sorted {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(image.to_string());

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    run_step(server, "docker", &arg_refs, Some(dir)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_image_and_compose() {
        let dir = tempfile::tempdir().unwrap();
        let result = install("weather", dir.path(), None, None, &[], &HashMap::new()).await;
        assert!(
            matches!(result, Err(WharfError::InstallFailed(_, msg)) if msg.contains("image"))
        );
    }
}
