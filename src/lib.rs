//! wharf — MCP server provisioner and transport gateway.
//! Resolves how an abstract server descriptor should run on this host
//! (git / docker / npm / npx / uv / uvx / local), materializes it, keeps a
//! runtime directory of instances, and bridges client sessions to one live
//! backend connection over stdio, SSE, or streamable HTTP.

pub mod descriptor;
pub mod error;
pub mod gateway;
pub mod install;
pub mod method;
pub mod persist;
pub mod probe;
pub mod registry;
pub mod transport;

pub use descriptor::{ExecutionSpec, InstallMethod, MethodKind, ServerDescriptor};
pub use error::{Result, WharfError};
pub use gateway::routes::create_router;
pub use gateway::{BatchStartEntry, BatchSummary, Gateway, GatewayConfig};
pub use install::{InstallOutcome, InstallProgress, Installer};
pub use method::select_install_method;
pub use persist::{PersistStore, ServerRecord};
pub use probe::{probe_tool, SystemProbe, ToolProbe};
pub use registry::{InstanceLauncher, InstanceStatus, RuntimeRegistry};
pub use transport::{BackendConnection, TransportDefaults, TransportKind, TransportRequest};
