//! `guestnet create-tap`.

use clap::Args;
use guestnet_common::config::GuestnetConfig;
use guestnet_core::link::{self, NetlinkLinkManager};

/// Arguments for the `create-tap` command.
#[derive(Args, Debug)]
pub struct CreateTapArgs {
    /// Name of the tap device to create.
    #[arg(short, long)]
    pub name: String,

    /// Bridge to attach the tap device to.
    #[arg(long)]
    pub bridge: String,
}

/// Executes the `create-tap` command.
///
/// # Errors
///
/// Returns an error if the tap cannot be created or attached.
pub fn execute(args: CreateTapArgs, config: &GuestnetConfig) -> anyhow::Result<()> {
    let links = NetlinkLinkManager::new().with_netns_dir(&config.netns_dir);
    link::create_tap(&links, &args.name, &args.bridge)?;
    Ok(())
}
