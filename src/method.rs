//! Method Selector — decides which execution mechanism provisions a server.
//!
//! Algorithm: probe the descriptor's preferred method first. If the
//! underlying tool is unavailable, fall back to `npx` (the most universally
//! available path) iff *its* probe succeeds. There is no further fallback
//! chain — when neither probes, selection fails with `NoMethodAvailable`.

use crate::descriptor::{InstallMethod, MethodKind, ServerDescriptor};
use crate::error::WharfError;
use crate::probe::ToolProbe;

/// Resolve the best install method for a descriptor.
///
/// Probe failures never propagate as errors — they only steer the
/// fallback. Descriptor validation failures (a `git` preference with no
/// `source`, say) do propagate, since no amount of probing fixes those.
pub async fn select_install_method(
    desc: &ServerDescriptor,
    probe: &dyn ToolProbe,
) -> crate::Result<InstallMethod> {
    if probe.available(desc.preferred).await {
        return InstallMethod::for_kind(desc.preferred, desc);
    }

    tracing::info!(
        server = %desc.name,
        preferred = %desc.preferred,
        "preferred method unavailable, trying npx fallback"
    );

    if desc.preferred != MethodKind::Npx && probe.available(MethodKind::Npx).await {
        return InstallMethod::for_kind(MethodKind::Npx, desc);
    }

    Err(WharfError::NoMethodAvailable(desc.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};

    /// Probe with a fixed availability set, recording what was asked.
    struct MockProbe {
        available: HashSet<MethodKind>,
        probed: std::sync::Mutex<Vec<MethodKind>>,
    }

    impl MockProbe {
        fn with_available(kinds: &[MethodKind]) -> Self {
            Self {
                available: kinds.iter().copied().collect(),
                probed: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn probed(&self) -> Vec<MethodKind> {
            self.probed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolProbe for MockProbe {
        async fn available(&self, kind: MethodKind) -> bool {
            self.probed.lock().unwrap().push(kind);
            kind == MethodKind::Local || self.available.contains(&kind)
        }
    }

    fn make_descriptor(name: &str, preferred: MethodKind) -> ServerDescriptor {
        ServerDescriptor {
            id: format!("{name}-id"),
            name: name.to_string(),
            preferred,
            execution: crate::descriptor::ExecutionSpec {
                command: "npx".to_string(),
                args: vec!["-y".to_string(), "weather-mcp".to_string()],
                env: HashMap::new(),
            },
            source: None,
            branch: None,
            build_command: None,
            image: None,
            compose_file: None,
            ports: vec![],
            package: Some("weather-mcp".to_string()),
            version: None,
            post_install: None,
            zero_install: false,
            supervised: true,
        }
    }

    #[tokio::test]
    async fn test_preferred_method_wins_when_available() {
        let probe = MockProbe::with_available(&[MethodKind::Uvx, MethodKind::Npx]);
        let desc = make_descriptor("weather", MethodKind::Uvx);
        let method = select_install_method(&desc, &probe).await.unwrap();
        assert_eq!(method.kind(), MethodKind::Uvx);
        assert_eq!(probe.probed(), vec![MethodKind::Uvx]);
    }

    #[tokio::test]
    async fn test_falls_back_to_npx() {
        // Docker preferred on a host with no daemon but a working npx.
        let probe = MockProbe::with_available(&[MethodKind::Npx]);
        let desc = make_descriptor("weather", MethodKind::Docker);
        let method = select_install_method(&desc, &probe).await.unwrap();
        assert_eq!(method.kind(), MethodKind::Npx);
        assert_eq!(probe.probed(), vec![MethodKind::Docker, MethodKind::Npx]);
    }

    #[tokio::test]
    async fn test_fails_when_nothing_probes() {
        let probe = MockProbe::with_available(&[]);
        let desc = make_descriptor("weather", MethodKind::Docker);
        let result = select_install_method(&desc, &probe).await;
        assert!(
            matches!(result, Err(WharfError::NoMethodAvailable(name)) if name == "weather")
        );
    }

    #[tokio::test]
    async fn test_npx_preferred_not_probed_twice() {
        // When npx itself is the unavailable preference there is no fallback.
        let probe = MockProbe::with_available(&[MethodKind::Git]);
        let mut desc = make_descriptor("weather", MethodKind::Npx);
        desc.package = None;
        let result = select_install_method(&desc, &probe).await;
        assert!(matches!(result, Err(WharfError::NoMethodAvailable(_))));
        assert_eq!(probe.probed(), vec![MethodKind::Npx]);
    }

    #[tokio::test]
    async fn test_local_always_selectable() {
        let probe = MockProbe::with_available(&[]);
        let mut desc = make_descriptor("weather", MethodKind::Local);
        desc.execution.command = "./run.sh".to_string();
        let method = select_install_method(&desc, &probe).await.unwrap();
        assert_eq!(method.kind(), MethodKind::Local);
    }

    #[tokio::test]
    async fn test_invalid_descriptor_beats_fallback() {
        // git is available but the descriptor has no source — that is a
        // descriptor error, not a probe miss, so no npx fallback happens.
        let probe = MockProbe::with_available(&[MethodKind::Git, MethodKind::Npx]);
        let mut desc = make_descriptor("weather", MethodKind::Git);
        desc.source = None;
        let result = select_install_method(&desc, &probe).await;
        assert!(matches!(result, Err(WharfError::InvalidDescriptor(_, _))));
    }

    #[tokio::test]
    async fn test_all_orderings_of_availability() {
        // preferred ∈ {available, unavailable} × npx ∈ {available, unavailable}
        for (preferred_ok, npx_ok) in [(true, true), (true, false), (false, true), (false, false)]
        {
            let mut kinds = Vec::new();
            if preferred_ok {
                kinds.push(MethodKind::Uvx);
            }
            if npx_ok {
                kinds.push(MethodKind::Npx);
            }
            let probe = MockProbe::with_available(&kinds);
            let desc = make_descriptor("weather", MethodKind::Uvx);
            let result = select_install_method(&desc, &probe).await;
            match (preferred_ok, npx_ok) {
                (true, _) => assert_eq!(result.unwrap().kind(), MethodKind::Uvx),
                (false, true) => assert_eq!(result.unwrap().kind(), MethodKind::Npx),
                (false, false) => {
                    assert!(matches!(result, Err(WharfError::NoMethodAvailable(_))));
                }
            }
        }
    }
}
