//! wharf — MCP server provisioner and transport gateway CLI.
//!
//! Two subcommands:
//! - `wharf serve`: run the HTTP gateway (sessions, batch ops, health)
//! - `wharf install <descriptor.json>`: provision one server and exit

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wharf::{Gateway, GatewayConfig, ServerDescriptor, TransportDefaults};

/// wharf — MCP server provisioner and transport gateway.
#[derive(Parser)]
#[command(
    name = "wharf",
    version,
    about = "wharf — MCP server provisioner and transport gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the transport gateway HTTP server
    Serve {
        /// HTTP port to listen on
        #[arg(short, long, default_value = "3789")]
        port: u16,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Install root directory [default: <data dir>/wharf/servers]
        #[arg(long)]
        root: Option<PathBuf>,
        /// Persisted store path [default: <data dir>/wharf/servers.json]
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Install a server from a descriptor JSON file
    Install {
        /// Path to the server descriptor (camelCase JSON)
        descriptor: PathBuf,
        /// Install root directory [default: <data dir>/wharf/servers]
        #[arg(long)]
        root: Option<PathBuf>,
        /// Persisted store path [default: <data dir>/wharf/servers.json]
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity; logs go to stderr so stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // Ctrl-C handler — cancels the root token for graceful shutdown
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down wharf...");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve {
            port,
            host,
            root,
            store,
        } => {
            run_serve(gateway_config(root, store)?, host, port, cancel).await?;
        }
        Commands::Install {
            descriptor,
            root,
            store,
        } => {
            run_install(gateway_config(root, store)?, descriptor).await?;
        }
    }

    Ok(())
}

/// Resolve the gateway config: explicit flags, else the user data dir.
fn gateway_config(root: Option<PathBuf>, store: Option<PathBuf>) -> Result<GatewayConfig> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("no user data directory available; pass --root and --store"))?
        .join("wharf");
    Ok(GatewayConfig {
        install_root: root.unwrap_or_else(|| data_dir.join("servers")),
        store_path: store.unwrap_or_else(|| data_dir.join("servers.json")),
        defaults: TransportDefaults::default(),
    })
}

/// Run the gateway HTTP server until cancelled.
async fn run_serve(
    config: GatewayConfig,
    host: String,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let gateway = Gateway::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to build gateway: {}", e))?;
    let app = wharf::create_router(std::sync::Arc::new(gateway));

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind to {}: {}", addr, e))?;

    tracing::info!(host = %host, port = %port, "wharf gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| anyhow::anyhow!("wharf gateway error: {}", e))?;

    tracing::info!("wharf gateway stopped");
    Ok(())
}

/// Install one server from a descriptor file, streaming progress to stderr.
async fn run_install(config: GatewayConfig, descriptor_path: PathBuf) -> Result<()> {
    let content = tokio::fs::read_to_string(&descriptor_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read {:?}: {}", descriptor_path, e))?;
    let descriptor: ServerDescriptor = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse {:?}: {}", descriptor_path, e))?;

    let gateway = Gateway::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to build gateway: {}", e))?;
    let installer = gateway.installer();

    let mut progress = installer.subscribe_progress();
    let progress_task = tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            eprintln!("[{:>3}%] {} — {}", event.percent, event.server_name, event.status);
        }
    });

    let name = descriptor.name.clone();
    let outcome = installer.install_server(&name, &descriptor).await;
    progress_task.abort();

    if outcome.success {
        match outcome.method {
            Some(method) => println!("installed '{}' via {}", name, method),
            None => println!("registered '{}' (zero-install)", name),
        }
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "install failed for '{}': {}",
            name,
            outcome.message.unwrap_or_else(|| "unknown error".to_string())
        ))
    }
}
