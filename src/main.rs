//! Fleetlink daemon - control plane for headless device agents
//!
//! Listens for inbound agent connections, routes operator intents through
//! the command lanes, and supervises the local reverse-tunnel agent that
//! exposes the listening port to the outside world.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleetlink_control::{RegistryConfig, SessionRegistry};
use fleetlink_lanes::{DispatchLane, Intent, NetEvent, NetworkLane, TunnelEvent, TunnelLane};
use fleetlink_tunnel::{parse_local_port, TunnelAgentPaths, TunnelAgentSupervisor};

/// Fleetlink - administer a fleet of headless device agents
#[derive(Parser, Debug)]
#[command(name = "fleetlinkd")]
#[command(about = "Fleetlink - administer a fleet of headless device agents")]
#[command(version)]
#[command(long_about = r#"
The fleetlink daemon accepts inbound connections from device agents over
raw TCP and supervises the local reverse-tunnel agent that exposes the
listening port to a remote relay.

EXAMPLES:
  # Listen on the port named in the tunnel config
  fleetlinkd --data-dir /var/lib/fleetlink \
    --tunnel-config /etc/fleetlink/tunnel.ini \
    --tunnel-resource /usr/share/fleetlink/tunnel-agent

  # Explicit port and tunnel autostart
  fleetlinkd --port 7001 --start-tunnel

ENVIRONMENT VARIABLES:
  FLEETLINK_PORT         Listening port
  FLEETLINK_DATA_DIR     Writable directory for the extracted tunnel binary
"#)]
struct Args {
    /// Listening port (defaults to the tunnel config's localPort, then 7001)
    #[arg(long, env = "FLEETLINK_PORT")]
    port: Option<u16>,

    /// Writable directory the tunnel binary is extracted into
    #[arg(long, env = "FLEETLINK_DATA_DIR", default_value = "/var/lib/fleetlink")]
    data_dir: PathBuf,

    /// Tunnel agent config file, passed to the binary via -c
    #[arg(long, default_value = "/etc/fleetlink/tunnel.ini")]
    tunnel_config: PathBuf,

    /// Bundled tunnel agent binary to extract on first start
    #[arg(long, default_value = "/usr/share/fleetlink/tunnel-agent")]
    tunnel_resource: PathBuf,

    /// Start the tunnel agent immediately
    #[arg(long)]
    start_tunnel: bool,

    /// Launch the tunnel agent through the privilege helper
    #[arg(long)]
    privileged: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let port = match args.port {
        Some(port) => port,
        None => default_port(&args.tunnel_config),
    };

    let registry = SessionRegistry::new(RegistryConfig::default());
    let supervisor = TunnelAgentSupervisor::with_su(TunnelAgentPaths {
        resource: args.tunnel_resource.clone(),
        binary: args.data_dir.join("tunnel-agent"),
        config: args.tunnel_config.clone(),
    });

    let network = Arc::new(NetworkLane::new(registry.clone()));
    let tunnel = Arc::new(TunnelLane::new(supervisor));
    let dispatch = DispatchLane::new(network.clone(), tunnel.clone());

    spawn_event_logger(&network, &tunnel);

    network.start_server(port);
    info!(port, "Fleetlink control plane starting");

    if args.start_tunnel {
        dispatch.send(Intent::StartTunnel {
            privileged: args.privileged,
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    info!("Shutting down");

    dispatch.shutdown().await;
    tunnel.shutdown().await;
    network.shutdown().await;
    Ok(())
}

/// Listening port from the tunnel config's localPort, falling back to 7001.
fn default_port(tunnel_config: &Path) -> u16 {
    match std::fs::read_to_string(tunnel_config) {
        Ok(text) => parse_local_port(&text).unwrap_or(7001),
        Err(err) => {
            warn!(
                config = %tunnel_config.display(),
                error = %err,
                "Could not read tunnel config, using port 7001"
            );
            7001
        }
    }
}

/// Log lane events for operators following the daemon's output.
fn spawn_event_logger(network: &NetworkLane, tunnel: &TunnelLane) {
    let mut net_events = network.subscribe();
    let mut tunnel_events = tunnel.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = net_events.recv() => match event {
                    Ok(NetEvent::ClientsChanged(ids)) => info!(clients = ids.len(), "Client set changed"),
                    Ok(NetEvent::ShellOutput { id, line }) => info!(session = %id, %line, "Shell output"),
                    Ok(NetEvent::ShellEnded { id }) => info!(session = %id, "Shell command finished"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                event = tunnel_events.recv() => match event {
                    Ok(TunnelEvent::Running) => info!("Tunnel agent running"),
                    Ok(TunnelEvent::Stopped) => info!("Tunnel agent stopped"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}
