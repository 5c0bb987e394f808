//! # guestnet: guest network CLI
//!
//! Creates host bridges and tap devices, wires their firewall rules,
//! provisions isolated per-workload networks and runs the DNS and DHCP
//! services that go with them.

mod commands;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    commands::execute(cli)
}
