//! Botlink CLI
//!
//! `botlink daemon` runs the dongle broker; the other subcommands talk to
//! a running daemon over its control endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use botlink_client::DaemonClient;
use botlink_core::proto::Broadcast;
use botlink_core::CONTROL_ADDR;
use botlink_daemon::{ControlServer, DaemonService, UsbDongleIo};
use botlink_logging::LogLevel;

/// Botlink - broker between local robot clients and the USB radio dongle
#[derive(Parser)]
#[command(name = "botlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Control endpoint of the daemon
    #[arg(long, default_value_t = CONTROL_ADDR)]
    control: SocketAddr,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (usually started by a system service)
    Daemon,

    /// Resolve the local TCP endpoint proxying a robot
    Resolve {
        /// Four-character robot serial id
        serial_id: String,
    },

    /// Radio-ping one or more robots
    Ping {
        /// Four-character robot serial ids
        #[arg(required = true)]
        serial_ids: Vec<String>,
    },

    /// Force the daemon to drop and reacquire the dongle
    Cycle {
        /// Seconds of downtime before reacquisition
        #[arg(default_value = "0")]
        seconds: u32,
    },

    /// Watch dongle and robot events as they happen
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    botlink_logging::init(LogLevel::from_verbose(cli.verbose));

    match cli.command {
        Commands::Daemon => run_daemon(cli.control).await,
        Commands::Resolve { serial_id } => resolve(cli.control, &serial_id).await,
        Commands::Ping { serial_ids } => ping(cli.control, serial_ids).await,
        Commands::Cycle { seconds } => cycle(cli.control, seconds).await,
        Commands::Watch => watch(cli.control).await,
    }
}

async fn run_daemon(control: SocketAddr) -> Result<()> {
    info!("starting botlink daemon");

    let service = DaemonService::start(Arc::new(UsbDongleIo));
    let server = ControlServer::bind(control, service.clone())
        .await
        .with_context(|| format!("failed to bind control endpoint {control}"))?;

    wait_for_shutdown_signal().await?;

    // Ordered teardown: stop accepting control clients, then drain the
    // proxies and close the dongle.
    server.stop().await;
    service.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received interrupt");
    Ok(())
}

async fn resolve(control: SocketAddr, serial_id: &str) -> Result<()> {
    let client = DaemonClient::new(control);
    let endpoint = client
        .resolve_serial_id(serial_id)
        .await
        .with_context(|| format!("failed to resolve {serial_id}"))?;
    println!("{} {}", endpoint.address(), endpoint.port());
    Ok(())
}

async fn ping(control: SocketAddr, serial_ids: Vec<String>) -> Result<()> {
    let client = DaemonClient::new(control);
    client
        .send_robot_ping(&serial_ids)
        .await
        .context("robot ping failed")?;
    println!("pinged {}", serial_ids.join(", "));
    Ok(())
}

async fn cycle(control: SocketAddr, seconds: u32) -> Result<()> {
    let client = DaemonClient::new(control);
    client.cycle_dongle(seconds).await.context("cycle failed")?;
    println!("dongle cycling with {seconds}s downtime");
    Ok(())
}

async fn watch(control: SocketAddr) -> Result<()> {
    let client = DaemonClient::new(control);
    let mut events = client
        .subscribe()
        .await
        .context("failed to subscribe to daemon events")?;

    println!("watching daemon events (ctrl-c to stop)");
    while let Some(event) = events.next().await {
        match event? {
            Broadcast::DongleEvent { status } => println!("dongle: {status}"),
            Broadcast::RobotEvent(event) => println!(
                "robot {} powered on: firmware v{}, rpc v{}, interface v{}",
                event.serial_id,
                event.firmware_version,
                event.rpc_version,
                event.interface_version
            ),
        }
    }
    println!("daemon closed the event stream");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn resolve_takes_a_serial() {
        use clap::CommandFactory;
        let matches = Cli::command().try_get_matches_from(vec!["botlink", "resolve", "ABCD"]);
        assert!(matches.is_ok());
    }

    #[test]
    fn ping_requires_at_least_one_serial() {
        use clap::CommandFactory;
        assert!(Cli::command()
            .try_get_matches_from(vec!["botlink", "ping"])
            .is_err());
        assert!(Cli::command()
            .try_get_matches_from(vec!["botlink", "ping", "ABCD", "WXYZ"])
            .is_ok());
    }

    #[test]
    fn cycle_defaults_to_zero_seconds() {
        use clap::CommandFactory;
        assert!(Cli::command()
            .try_get_matches_from(vec!["botlink", "cycle"])
            .is_ok());
        assert!(Cli::command()
            .try_get_matches_from(vec!["botlink", "cycle", "5"])
            .is_ok());
    }

    #[test]
    fn custom_control_endpoint_parses() {
        use clap::CommandFactory;
        assert!(Cli::command()
            .try_get_matches_from(vec!["botlink", "--control", "127.0.0.1:9000", "watch"])
            .is_ok());
    }
}
