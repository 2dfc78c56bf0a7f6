#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # relay-tunnel
//!
//! Exposes local HTTP/WebSocket services through Azure Relay Hybrid
//! Connections. Each configured tunnel gets its own dispatcher: a directory
//! browser page, a JSON directory-listing API, file downloads, and a
//! pass-through proxy for everything else.
//!
//! ## Subcommands
//!
//! - `relay-tunnel run [--tunnel ID]...` (default) - start enabled tunnels
//! - `relay-tunnel list` - show configured tunnels
//! - `relay-tunnel seal-key <KEY>` - seal a policy key for `encrypted_policy_key`
//!
//! ## Tunnel surface
//!
//! | Method | Path (under `/{name}`) | Description                              |
//! |--------|------------------------|------------------------------------------|
//! | GET    | `/`                    | Directory browser page                   |
//! | any    | `/api/list?path=P`     | Upstream index of `P` as JSON            |
//! | any    | `/file?path=P`         | Upstream file `P`, streamed              |
//! | GET    | `/anything-without-dot`| Directory browser page (client routing)  |
//! | any    | everything else        | Proxied to the upstream target           |
//! | WS     | any                    | Bridged to the upstream WebSocket target |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          - entry point, clap subcommands, signal handling, shutdown budget
//! config.rs        - TOML + env-var configuration
//! dispatcher/      - DispatcherService state machine, request handlers
//! routing/         - RouteDecision
//! proxy/
//!   forwarder.rs   - HttpForwarder (reqwest)
//!   headers.rs     - hop-by-hop header policy
//!   websocket.rs   - WebSocket bridge
//! html/            - listing parser, path rewriter
//! transport/
//!   hybrid.rs      - Hybrid Connection listener (control channel, rendezvous)
//!   local.rs       - loopback listener for development
//!   sas.rs         - SAS tokens
//! provisioning/    - ARM create/delete of hybrid connections
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_tunnel::assets::AssetRoot;
use relay_tunnel::config::{Config, TransportKind, TunnelConfig};
use relay_tunnel::credentials::{Base64Protector, CredentialProtector};
use relay_tunnel::provisioning::{ArmProvisioner, ResourceProvisioner};
use relay_tunnel::transport::{HybridOptions, HybridTransport, LocalTransport, TunnelTransport};
use relay_tunnel::DispatcherService;

/// Extra time past the close budget before the process stops waiting.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Relay tunnel dispatcher.
#[derive(Parser)]
#[command(name = "relay-tunnel", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start tunnels (default when no subcommand given).
    Run {
        /// Only start these tunnels (matched on id or name). Repeatable.
        #[arg(long = "tunnel")]
        tunnels: Vec<String>,
    },
    /// List configured tunnels.
    List,
    /// Print the sealed form of a policy key.
    SealKey { key: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        tunnels: Vec::new(),
    });

    if let Commands::SealKey { key } = &command {
        println!("{}", Base64Protector.protect(key));
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match command {
        Commands::List => list(&config),
        Commands::Run { tunnels } => {
            let log_filter =
                std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
            tracing_subscriber::fmt().with_env_filter(log_filter).init();
            run(&config, &tunnels).await
        }
        Commands::SealKey { .. } => ExitCode::SUCCESS,
    }
}

fn list(config: &Config) -> ExitCode {
    if config.tunnels.is_empty() {
        println!("No tunnels configured");
        return ExitCode::SUCCESS;
    }
    println!("{:<16} {:<36} {:<8} {:<8} TARGET", "TUNNEL", "NAMESPACE", "ENABLED", "DYNAMIC");
    for tunnel in &config.tunnels {
        println!(
            "{:<16} {:<36} {:<8} {:<8} {}",
            tunnel.label(),
            tunnel.namespace,
            tunnel.enabled,
            tunnel.dynamic_resource_creation,
            tunnel.target
        );
    }
    ExitCode::SUCCESS
}

async fn run(config: &Config, selectors: &[String]) -> ExitCode {
    info!("relay-tunnel v{} starting", env!("CARGO_PKG_VERSION"));

    let assets = AssetRoot::resolve(&config.assets.root);
    info!("Assets: {}", assets.root().display());

    let provisioner: Option<Arc<dyn ResourceProvisioner>> = match config.management_settings() {
        Ok(Some(settings)) => match ArmProvisioner::new(settings) {
            Ok(arm) => Some(Arc::new(arm)),
            Err(e) => {
                error!("Resource manager unavailable: {e}");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            error!("{e}");
            None
        }
    };

    let mut services = Vec::new();
    for tunnel in config.selected_tunnels(selectors) {
        match build_service(tunnel, &Base64Protector, &assets, provisioner.clone()) {
            Ok(service) => services.push(service),
            Err(e) => error!(tunnel = tunnel.label(), "Skipping tunnel: {e}"),
        }
    }
    if services.is_empty() {
        error!("No tunnels to start");
        return ExitCode::FAILURE;
    }

    let startup = CancellationToken::new();
    let mut interrupted = false;
    let results = {
        let opening = join_all(services.iter().map(|s| s.open(&startup)));
        tokio::pin!(opening);
        tokio::select! {
            results = &mut opening => results,
            () = shutdown_signal() => {
                interrupted = true;
                startup.cancel();
                opening.await
            }
        }
    };

    let mut open = Vec::new();
    for (service, result) in services.into_iter().zip(results) {
        match result {
            Ok(()) => {
                info!(
                    "Tunnel {} -> {}",
                    service.address().unwrap_or_default(),
                    service.target().http_base()
                );
                open.push(service);
            }
            Err(e) => error!(tunnel = %service.descriptor().display_name(), "Failed to open: {e}"),
        }
    }
    if open.is_empty() {
        error!("No tunnel could be opened");
        return ExitCode::FAILURE;
    }

    if !interrupted {
        info!("{} tunnel(s) running, press Ctrl+C to stop", open.len());
        shutdown_signal().await;
    }

    info!("Shutting down...");
    let budget = CancellationToken::new();
    let timeout = config.shutdown_timeout();
    let timer = {
        let budget = budget.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            budget.cancel();
        })
    };

    let closing = join_all(open.iter().map(|s| s.close(&budget)));
    match tokio::time::timeout(timeout + SHUTDOWN_SLACK, closing).await {
        Ok(results) => {
            for (service, result) in open.iter().zip(results) {
                if let Err(e) = result {
                    warn!(tunnel = %service.descriptor().display_name(), "Close failed: {e}");
                }
            }
        }
        Err(_) => warn!("Shutdown timeout exceeded, exiting anyway"),
    }
    timer.abort();

    info!("Goodbye");
    ExitCode::SUCCESS
}

fn build_service(
    tunnel: &TunnelConfig,
    protector: &dyn CredentialProtector,
    assets: &AssetRoot,
    provisioner: Option<Arc<dyn ResourceProvisioner>>,
) -> Result<DispatcherService, Box<dyn std::error::Error>> {
    tunnel.validate()?;
    let descriptor = tunnel.descriptor(protector)?;
    let target = tunnel.upstream()?;

    let transport: Arc<dyn TunnelTransport> = match tunnel.transport {
        TransportKind::Hybrid => Arc::new(HybridTransport::new(HybridOptions {
            mode: tunnel.connection_mode,
            ..HybridOptions::default()
        })),
        TransportKind::Local => Arc::new(LocalTransport::new(
            tunnel.local_listen_addr()?,
            tunnel.connection_mode,
        )),
    };

    let service = DispatcherService::new(
        descriptor,
        target,
        tunnel.dispatcher_options(),
        transport,
        assets.clone(),
    )?;
    Ok(match provisioner {
        Some(provisioner) => service.with_provisioner(provisioner),
        None => service,
    })
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
