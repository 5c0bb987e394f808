//! `guestnet default-interface`.

use clap::Args;
use guestnet_core::route;

/// Arguments for the `default-interface` command.
#[derive(Args, Debug)]
pub struct DefaultInterfaceArgs {
    /// Keep running and print every change. An empty line means the host
    /// lost its default route.
    #[arg(short, long)]
    pub watch: bool,
}

/// Executes the `default-interface` command.
///
/// # Errors
///
/// Returns an error if there is no default route or, with `--watch`, the
/// watcher cannot start.
#[allow(clippy::print_stdout)]
pub fn execute(args: DefaultInterfaceArgs) -> anyhow::Result<()> {
    if !args.watch {
        println!("{}", route::get_default_interface()?);
        return Ok(());
    }

    let shutdown = super::shutdown_token()?;
    super::runtime()?.block_on(async move {
        let mut changes = route::subscribe_default_interface_changes()?;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                next = changes.recv() => match next {
                    Some(name) => println!("{name}"),
                    None => anyhow::bail!("default interface watcher stopped"),
                },
            }
        }
        changes.stop();
        Ok::<(), anyhow::Error>(())
    })
}
