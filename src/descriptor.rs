//! Server descriptors and resolved install methods.
//!
//! A `ServerDescriptor` is the immutable input to installation: identity,
//! a preferred execution method, the command to run, and method-specific
//! extras. The Method Selector turns a descriptor into an `InstallMethod` —
//! a closed tagged union with one variant per mechanism, so dispatch in the
//! Installer is exhaustive instead of stringly-typed.

use crate::error::WharfError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Command, argument list, and environment for running a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// The closed set of execution mechanisms a descriptor can prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodKind {
    Git,
    Docker,
    Npm,
    Npx,
    Uv,
    Uvx,
    Local,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MethodKind::Git => "git",
            MethodKind::Docker => "docker",
            MethodKind::Npm => "npm",
            MethodKind::Npx => "npx",
            MethodKind::Uv => "uv",
            MethodKind::Uvx => "uvx",
            MethodKind::Local => "local",
        };
        f.write_str(s)
    }
}

/// Descriptor for a single MCP server, as supplied by the desktop app.
///
/// Deserialized from camelCase JSON. Immutable input to installation —
/// the Installer copies what it needs and never writes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    pub id: String,
    pub name: String,
    /// Preferred execution mechanism, tried first by the Method Selector.
    #[serde(rename = "type")]
    pub preferred: MethodKind,
    pub execution: ExecutionSpec,
    // git fields
    pub source: Option<String>,
    pub branch: Option<String>,
    pub build_command: Option<String>,
    // docker fields
    pub image: Option<String>,
    pub compose_file: Option<PathBuf>,
    #[serde(default)]
    pub ports: Vec<String>,
    // npm / uvx fields
    pub package: Option<String>,
    pub version: Option<String>,
    pub post_install: Option<String>,
    /// Registration alone makes this server runnable — no provisioning step.
    #[serde(default)]
    pub zero_install: bool,
    /// When false, spawned processes are detached and never monitored.
    #[serde(default = "default_supervised")]
    pub supervised: bool,
}

fn default_supervised() -> bool {
    true
}

/// Resolved execution mechanism, produced by the Method Selector.
///
/// One variant per method, each carrying exactly the fields that method
/// needs. Construction validates the descriptor's method-specific fields;
/// a descriptor that prefers `git` but has no `source` fails here, before
/// any filesystem or process side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InstallMethod {
    Git {
        source: String,
        branch: Option<String>,
        build_command: Option<String>,
        execution: ExecutionSpec,
    },
    Docker {
        image: Option<String>,
        compose_file: Option<PathBuf>,
        ports: Vec<String>,
        execution: ExecutionSpec,
    },
    Npm {
        package: String,
        version: Option<String>,
        post_install: Option<String>,
        execution: ExecutionSpec,
    },
    Npx {
        package: Option<String>,
        execution: ExecutionSpec,
    },
    Uv {
        execution: ExecutionSpec,
    },
    Uvx {
        package: Option<String>,
        execution: ExecutionSpec,
    },
    Local {
        execution: ExecutionSpec,
    },
}

impl InstallMethod {
    /// Build the method variant for `kind` from a descriptor's fields.
    ///
    /// Fails with `InvalidDescriptor` when the descriptor lacks a field the
    /// method requires. Does not probe tool availability — that is the
    /// selector's job.
    pub fn for_kind(kind: MethodKind, desc: &ServerDescriptor) -> crate::Result<Self> {
        let execution = desc.execution.clone();
        match kind {
            MethodKind::Git => {
                let source = desc.source.clone().ok_or_else(|| {
                    WharfError::InvalidDescriptor(
                        desc.name.clone(),
                        "git method requires 'source' field".to_string(),
                    )
                })?;
                Ok(InstallMethod::Git {
                    source,
                    branch: desc.branch.clone(),
                    build_command: desc.build_command.clone(),
                    execution,
                })
            }
            MethodKind::Docker => {
                if desc.image.is_none() && desc.compose_file.is_none() {
                    return Err(WharfError::InvalidDescriptor(
                        desc.name.clone(),
                        "docker method requires 'image' or 'composeFile' field".to_string(),
                    ));
                }
                Ok(InstallMethod::Docker {
                    image: desc.image.clone(),
                    compose_file: desc.compose_file.clone(),
                    ports: desc.ports.clone(),
                    execution,
                })
            }
            MethodKind::Npm => {
                let package = desc.package.clone().ok_or_else(|| {
                    WharfError::InvalidDescriptor(
                        desc.name.clone(),
                        "npm method requires 'package' field".to_string(),
                    )
                })?;
                Ok(InstallMethod::Npm {
                    package,
                    version: desc.version.clone(),
                    post_install: desc.post_install.clone(),
                    execution,
                })
            }
            MethodKind::Npx => Ok(InstallMethod::Npx {
                package: desc.package.clone(),
                execution,
            }),
            MethodKind::Uv => Ok(InstallMethod::Uv { execution }),
            MethodKind::Uvx => Ok(InstallMethod::Uvx {
                package: desc.package.clone(),
                execution,
            }),
            MethodKind::Local => {
                if execution.command.is_empty() {
                    return Err(WharfError::InvalidDescriptor(
                        desc.name.clone(),
                        "local method requires a non-empty execution command".to_string(),
                    ));
                }
                Ok(InstallMethod::Local { execution })
            }
        }
    }

    /// The kind tag of this method.
    pub fn kind(&self) -> MethodKind {
        match self {
            InstallMethod::Git { .. } => MethodKind::Git,
            InstallMethod::Docker { .. } => MethodKind::Docker,
            InstallMethod::Npm { .. } => MethodKind::Npm,
            InstallMethod::Npx { .. } => MethodKind::Npx,
            InstallMethod::Uv { .. } => MethodKind::Uv,
            InstallMethod::Uvx { .. } => MethodKind::Uvx,
            InstallMethod::Local { .. } => MethodKind::Local,
        }
    }

    /// The concrete command/args/env this method runs.
    pub fn execution(&self) -> &ExecutionSpec {
        match self {
            InstallMethod::Git { execution, .. }
            | InstallMethod::Docker { execution, .. }
            | InstallMethod::Npm { execution, .. }
            | InstallMethod::Npx { execution, .. }
            | InstallMethod::Uv { execution }
            | InstallMethod::Uvx { execution, .. }
            | InstallMethod::Local { execution } => execution,
        }
    }
}
