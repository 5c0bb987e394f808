//! CoreDNS backend: a generated Corefile and a supervised `coredns` process.

use std::ffi::OsStr;
use std::fmt::Write as _;
use std::io::Write as _;
use std::process::ExitStatus;

use guestnet_common::error::{NetError, Result};
use guestnet_common::process::{ManagedProcess, find_binary};
use tempfile::NamedTempFile;

use crate::DnsService;
use crate::forwarder::ForwarderConfig;

/// Name of the CoreDNS executable looked up on `PATH`.
pub const COREDNS_BINARY: &str = "coredns";

/// Renders the Corefile serving `config`: one server block for the zone,
/// bound to the listen address and forwarding to the resolver file, with
/// query and error logging.
///
/// # Errors
///
/// Returns [`NetError::Config`] when the configuration is invalid.
pub fn render_corefile(config: &ForwarderConfig) -> Result<String> {
    config.validate()?;
    let listen = config.listen_addr()?;
    let mut out = String::new();
    let _ = writeln!(out, "{}:{} {{", config.zone_name(), listen.port());
    let _ = writeln!(out, "    bind {}", listen.ip());
    let _ = writeln!(out, "    forward . {}", config.resolv_conf_path().display());
    let _ = writeln!(out, "    log");
    let _ = writeln!(out, "    errors");
    out.push_str("}\n");
    Ok(out)
}

/// A running CoreDNS process and the Corefile it was started with.
#[derive(Debug)]
pub struct CoreDnsServer {
    process: ManagedProcess,
    corefile: NamedTempFile,
}

impl CoreDnsServer {
    /// Writes a Corefile for `config` and starts `coredns` on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the binary is not
    /// installed, or the process cannot be started.
    pub fn start(config: &ForwarderConfig) -> Result<Self> {
        let rendered = render_corefile(config)?;
        let binary = find_binary(COREDNS_BINARY)?;

        let mut corefile = tempfile::Builder::new()
            .prefix("guestnet-corefile-")
            .tempfile()
            .map_err(|e| NetError::io(std::env::temp_dir(), e))?;
        if let Err(e) = corefile.write_all(rendered.as_bytes()) {
            return Err(NetError::io(corefile.path(), e));
        }
        if let Err(e) = corefile.flush() {
            return Err(NetError::io(corefile.path(), e));
        }

        let conf = corefile.path().as_os_str().to_owned();
        let process = ManagedProcess::spawn(&binary, [OsStr::new("-conf"), conf.as_os_str()])?;
        tracing::info!(
            address = %config.listen_addr()?,
            corefile = %corefile.path().display(),
            "coredns started"
        );
        Ok(Self { process, corefile })
    }

    /// Path of the generated Corefile.
    pub fn corefile(&self) -> &std::path::Path {
        self.corefile.path()
    }

    /// Blocks until CoreDNS exits.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the process fails.
    pub fn wait(&self) -> Result<ExitStatus> {
        self.process.wait()
    }
}

impl DnsService for CoreDnsServer {
    fn stop(&self) {
        self.process.stop();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn renders_server_block() {
        let config = ForwarderConfig::new("10.0.0.1").resolv_conf("/etc/resolv.conf");
        assert_eq!(
            render_corefile(&config).unwrap(),
            ".:53 {\n    bind 10.0.0.1\n    forward . /etc/resolv.conf\n    log\n    errors\n}\n"
        );
    }

    #[test]
    fn renders_custom_zone_and_port() {
        let config = ForwarderConfig::new("192.168.7.1:5353")
            .resolv_conf("/run/systemd/resolve/resolv.conf")
            .zone("guest.internal");
        let rendered = render_corefile(&config).unwrap();
        assert!(rendered.starts_with("guest.internal:5353 {\n"));
        assert!(rendered.contains("    bind 192.168.7.1\n"));
        assert!(rendered.contains("    forward . /run/systemd/resolve/resolv.conf\n"));
    }

    #[test]
    fn rejects_missing_address() {
        assert!(render_corefile(&ForwarderConfig::default()).is_err());
    }
}
