//! `guestnet network`: isolated per-workload networks.

use std::net::Ipv4Addr;
use std::sync::Arc;

use clap::{Args, Subcommand};
use guestnet_common::config::GuestnetConfig;
use guestnet_core::firewall::Firewall;
use guestnet_core::link::NetlinkLinkManager;
use guestnet_core::namespace::{KernelNamespaces, Network, NetworkBuilder};
use ipnetwork::Ipv4Network;

/// Arguments for the `network` command.
#[derive(Args, Debug)]
pub struct NetworkArgs {
    /// Network operation.
    #[command(subcommand)]
    pub action: NetworkAction,
}

/// Network operations.
#[derive(Subcommand, Debug)]
pub enum NetworkAction {
    /// Provision a namespace wired to the host through a veth pair.
    Create {
        /// Network name, also the namespace and bridge name.
        name: String,
        /// Subnet shared by the gateway and the bridge.
        #[arg(long)]
        subnet: Ipv4Network,
        /// Host-side address, the namespace's default gateway.
        #[arg(long)]
        gateway: Ipv4Addr,
        /// Address of the bridge inside the namespace.
        #[arg(long)]
        bridge: Ipv4Addr,
        /// Connect the network to this host interface once built.
        #[arg(long, alias = "hostIf")]
        host_if: Option<String>,
    },
    /// Tear a network down.
    Destroy {
        /// Network name.
        name: String,
    },
    /// Give a network outbound access through a host interface.
    Connect {
        /// Network name.
        name: String,
        /// Host interface.
        #[arg(long, alias = "hostIf")]
        host_if: String,
    },
    /// Withdraw the access granted by `connect`.
    Disconnect {
        /// Network name.
        name: String,
        /// Host interface.
        #[arg(long, alias = "hostIf")]
        host_if: String,
    },
}

fn builder(name: String, config: &GuestnetConfig) -> NetworkBuilder {
    NetworkBuilder::new()
        .name(name)
        .link_manager(Arc::new(
            NetlinkLinkManager::new().with_netns_dir(&config.netns_dir),
        ))
        .namespaces(Arc::new(KernelNamespaces::with_dir(&config.netns_dir)))
        .firewall(Firewall::system())
}

fn open(name: String, config: &GuestnetConfig) -> anyhow::Result<Network> {
    Ok(builder(name, config).open()?)
}

fn connect(network: &Network, host_if: &str) -> guestnet_core::Result<()> {
    Firewall::system().ensure_standard_tables()?;
    network.connect(host_if)
}

/// Executes a `network` operation.
///
/// # Errors
///
/// Returns an error if the operation fails.
pub fn execute(args: NetworkArgs, config: &GuestnetConfig) -> anyhow::Result<()> {
    match args.action {
        NetworkAction::Create {
            name,
            subnet,
            gateway,
            bridge,
            host_if,
        } => {
            let mut network = builder(name, config)
                .subnet(subnet)
                .gateway(gateway)
                .bridge(bridge)
                .build()?;
            if let Some(host_if) = host_if {
                if let Err(e) = connect(&network, &host_if) {
                    if let Err(cleanup) = network.destroy() {
                        tracing::warn!(error = %cleanup, "failed to destroy network");
                    }
                    return Err(e.into());
                }
            }
        }
        NetworkAction::Destroy { name } => open(name, config)?.destroy()?,
        NetworkAction::Connect { name, host_if } => connect(&open(name, config)?, &host_if)?,
        NetworkAction::Disconnect { name, host_if } => {
            open(name, config)?.disconnect(&host_if)?;
        }
    }
    Ok(())
}
