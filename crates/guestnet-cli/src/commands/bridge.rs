//! `guestnet create-bridge` and `guestnet configure-bridge`.

use clap::Args;
use guestnet_common::config::GuestnetConfig;
use guestnet_core::firewall::Firewall;
use guestnet_core::link::{self, NetlinkLinkManager};
use guestnet_core::route;

/// Arguments for the `create-bridge` command.
#[derive(Args, Debug)]
pub struct CreateBridgeArgs {
    /// Name of the bridge to create.
    #[arg(short, long)]
    pub name: String,

    /// Subnet of the bridge; it takes the first usable address.
    #[arg(long)]
    pub cidr: String,

    /// Turn TX checksum offloading off on the bridge.
    #[arg(long)]
    pub disable_tx_offload: bool,
}

/// Arguments for the `configure-bridge` command.
#[derive(Args, Debug)]
pub struct ConfigureBridgeArgs {
    /// Name of the bridge to configure.
    #[arg(short, long)]
    pub name: String,

    /// Host interface the bridge reaches the outside through.
    #[arg(long, alias = "hostIf", required_unless_present = "follow")]
    pub host_if: Option<String>,

    /// Prefix of the bridge chains. Defaults to the configured prefix.
    #[arg(long, alias = "nftPrefix")]
    pub nft_prefix: Option<String>,

    /// Keep running and move the rules whenever the default interface
    /// changes.
    #[arg(long)]
    pub follow: bool,
}

/// Executes the `create-bridge` command.
///
/// # Errors
///
/// Returns an error if the bridge cannot be created or configured.
pub fn create(args: CreateBridgeArgs, config: &GuestnetConfig) -> anyhow::Result<()> {
    let links = NetlinkLinkManager::new().with_netns_dir(&config.netns_dir);
    link::create_bridge(&links, &args.name, &args.cidr, args.disable_tx_offload)?;
    Ok(())
}

/// Executes the `configure-bridge` command.
///
/// # Errors
///
/// Returns an error if a firewall step fails or, with `--follow`, the
/// default-interface watcher cannot start.
pub fn configure(args: ConfigureBridgeArgs, config: &GuestnetConfig) -> anyhow::Result<()> {
    let prefix = args.nft_prefix.unwrap_or_else(|| config.nft_prefix.clone());
    let firewall = Firewall::system();

    if !args.follow {
        let host_if = args
            .host_if
            .ok_or_else(|| anyhow::anyhow!("--host-if is required without --follow"))?;
        firewall.configure_bridge(&args.name, &host_if, &prefix)?;
        return Ok(());
    }

    let shutdown = super::shutdown_token()?;
    super::runtime()?.block_on(async move {
        let mut changes = route::subscribe_default_interface_changes()?;
        let mut current = args.host_if.filter(|s| !s.is_empty());
        if let Some(host_if) = &current {
            firewall.configure_bridge(&args.name, host_if, &prefix)?;
        }

        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => break,
                next = changes.recv() => next,
            };
            let Some(next) = next else {
                anyhow::bail!("default interface watcher stopped");
            };
            let next = Some(next).filter(|s| !s.is_empty());
            if next == current {
                continue;
            }
            firewall.switch_host_interface(
                current.as_deref(),
                next.as_deref(),
                &args.name,
                &prefix,
            )?;
            current = next;
        }

        changes.stop();
        Ok::<(), anyhow::Error>(())
    })
}
