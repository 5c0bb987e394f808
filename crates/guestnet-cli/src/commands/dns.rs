//! `guestnet forward-dns`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use guestnet_common::config::GuestnetConfig;
use guestnet_dns::{CoreDnsServer, DnsFailoverForwarder, DnsService, ForwarderConfig};

/// Forwarder implementation.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    /// Built-in failover forwarder.
    #[default]
    Failover,
    /// CoreDNS driven by a generated Corefile.
    Coredns,
}

/// Arguments for the `forward-dns` command.
#[derive(Args, Debug)]
pub struct ForwardDnsArgs {
    /// Address to serve on, `ip` or `ip:port` (port 53 by default).
    #[arg(short, long)]
    pub listen: String,

    /// Resolver configuration to follow. Defaults to the configured path.
    #[arg(long)]
    pub resolv_conf: Option<PathBuf>,

    /// Per-upstream timeout in seconds. Defaults to the configured timeout.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Forwarder implementation.
    #[arg(long, value_enum, default_value_t)]
    pub backend: Backend,

    /// Zone served by the CoreDNS backend.
    #[arg(long, default_value = ".")]
    pub zone: String,
}

impl ForwardDnsArgs {
    fn forwarder_config(&self, config: &GuestnetConfig) -> ForwarderConfig {
        let timeout = self
            .timeout_secs
            .map_or_else(|| config.dns_timeout(), Duration::from_secs);
        ForwarderConfig::new(self.listen.clone())
            .resolv_conf(self.resolv_conf.clone().unwrap_or_else(|| config.resolv_conf.clone()))
            .timeout(timeout)
            .zone(self.zone.clone())
    }
}

/// Executes the `forward-dns` command, serving until Ctrl+C.
///
/// # Errors
///
/// Returns an error if the forwarder cannot start.
pub fn execute(args: ForwardDnsArgs, config: &GuestnetConfig) -> anyhow::Result<()> {
    let forwarder_config = args.forwarder_config(config);
    forwarder_config.validate()?;
    let shutdown = super::shutdown_token()?;
    let runtime = super::runtime()?;

    match args.backend {
        Backend::Failover => runtime.block_on(async move {
            let forwarder = DnsFailoverForwarder::start(&forwarder_config).await?;
            tracing::info!(address = %forwarder.local_addr(), "serving DNS, Ctrl+C to stop");
            shutdown.cancelled().await;
            forwarder.stop();
            Ok::<(), anyhow::Error>(())
        }),
        Backend::Coredns => {
            let server = Arc::new(CoreDnsServer::start(&forwarder_config)?);
            let waiter = server.clone();
            runtime.block_on(async move {
                tokio::select! {
                    () = shutdown.cancelled() => {}
                    exited = tokio::task::spawn_blocking(move || waiter.wait()) => {
                        let status = exited??;
                        tracing::warn!(%status, "coredns exited");
                    }
                }
                Ok::<(), anyhow::Error>(())
            })?;
            server.stop();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_configuration() {
        let args = ForwardDnsArgs {
            listen: "10.0.0.1".into(),
            resolv_conf: Some(PathBuf::from("/tmp/resolv.conf")),
            timeout_secs: Some(5),
            backend: Backend::Failover,
            zone: ".".into(),
        };
        let config = args.forwarder_config(&GuestnetConfig::default());
        assert_eq!(config.upstream_timeout(), Duration::from_secs(5));
        assert_eq!(config.resolv_conf_path(), std::path::Path::new("/tmp/resolv.conf"));
    }

    #[test]
    fn configuration_fills_missing_flags() {
        let args = ForwardDnsArgs {
            listen: "10.0.0.1:5353".into(),
            resolv_conf: None,
            timeout_secs: None,
            backend: Backend::Coredns,
            zone: "guest.".into(),
        };
        let defaults = GuestnetConfig::default();
        let config = args.forwarder_config(&defaults);
        assert_eq!(config.upstream_timeout(), defaults.dns_timeout());
        assert_eq!(config.resolv_conf_path(), defaults.resolv_conf.as_path());
        assert_eq!(config.zone_name(), "guest.");
    }
}
