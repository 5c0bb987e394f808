//! `guestnet serve-dhcp`.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use guestnet_common::config::GuestnetConfig;
use guestnet_dhcp::{CoreDhcpEngine, DhcpConfig, DhcpServer};

/// Arguments for the `serve-dhcp` command.
#[derive(Args, Debug)]
pub struct ServeDhcpArgs {
    /// Interface to serve, usually a bridge.
    #[arg(short, long)]
    pub interface: String,

    /// Address of the interface, handed out as router and server id.
    #[arg(long)]
    pub router: Ipv4Addr,

    /// First address of the lease range.
    #[arg(long)]
    pub range_start: IpAddr,

    /// Last address of the lease range.
    #[arg(long)]
    pub range_end: IpAddr,

    /// DNS servers handed to clients.
    #[arg(long, value_delimiter = ',')]
    pub dns: Vec<Ipv4Addr>,

    /// Lease database. Defaults to the configured path.
    #[arg(long)]
    pub lease_file: Option<PathBuf>,

    /// Lease duration in seconds. Defaults to the configured duration.
    #[arg(long)]
    pub lease_time_secs: Option<u64>,
}

/// Executes the `serve-dhcp` command, serving until Ctrl+C.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or coredhcp cannot be
/// started.
pub fn execute(args: ServeDhcpArgs, config: &GuestnetConfig) -> anyhow::Result<()> {
    let lease_time = args
        .lease_time_secs
        .map_or_else(|| config.lease_time(), Duration::from_secs);
    let dhcp = DhcpConfig::new()
        .with_interface(&args.interface, args.router)?
        .range(args.range_start, args.range_end)
        .lease_time(lease_time)
        .dns(args.dns)
        .lease_file(args.lease_file.unwrap_or_else(|| config.lease_file.clone()));

    let shutdown = super::shutdown_token()?;
    let server = Arc::new(DhcpServer::start(&dhcp, &CoreDhcpEngine::new())?);
    tracing::info!(interface = %args.interface, "serving DHCP, Ctrl+C to stop");

    let waiter = server.clone();
    super::runtime()?.block_on(async move {
        tokio::select! {
            () = shutdown.cancelled() => {}
            exited = tokio::task::spawn_blocking(move || waiter.wait()) => {
                exited??;
                tracing::warn!("DHCP server exited");
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;
    server.stop();
    Ok(())
}
