//! CLI command definitions and dispatch.

pub mod bridge;
pub mod dhcp;
pub mod dns;
pub mod network;
pub mod route;
pub mod tap;

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use guestnet_common::config::GuestnetConfig;
use tokio_util::sync::CancellationToken;

/// guestnet: network plumbing for virtual machines and guests.
#[derive(Parser, Debug)]
#[command(name = "guestnet", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file overriding the built-in defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level regardless of `RUST_LOG`.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a bridge carrying the first usable address of a subnet.
    CreateBridge(bridge::CreateBridgeArgs),
    /// Create a tap device attached to a bridge.
    CreateTap(tap::CreateTapArgs),
    /// Install the firewall rules giving a bridge outbound access.
    ConfigureBridge(bridge::ConfigureBridgeArgs),
    /// Run the DNS failover forwarder until interrupted.
    ForwardDns(dns::ForwardDnsArgs),
    /// Run a DHCP server for a bridge until interrupted.
    ServeDhcp(dhcp::ServeDhcpArgs),
    /// Print the interface carrying the default route.
    DefaultInterface(route::DefaultInterfaceArgs),
    /// Manage isolated per-workload networks.
    Network(network::NetworkArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => GuestnetConfig::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => GuestnetConfig::default(),
    };

    match cli.command {
        Command::CreateBridge(args) => bridge::create(args, &config),
        Command::CreateTap(args) => tap::execute(args, &config),
        Command::ConfigureBridge(args) => bridge::configure(args, &config),
        Command::ForwardDns(args) => dns::execute(args, &config),
        Command::ServeDhcp(args) => dhcp::execute(args, &config),
        Command::DefaultInterface(args) => route::execute(args),
        Command::Network(args) => network::execute(args, &config),
    }
}

/// Multi-threaded runtime for the long-running commands.
fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// Token cancelled on the first Ctrl+C.
fn shutdown_token() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let t = token.clone();
    ctrlc::set_handler(move || {
        t.cancel();
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;
    Ok(token)
}
