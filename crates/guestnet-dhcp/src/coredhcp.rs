//! `coredhcp` as the lease engine.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::Write as _;
use std::path::PathBuf;

use guestnet_common::constants::DHCP_SERVER_PORT;
use guestnet_common::error::{NetError, Result};
use guestnet_common::process::{ManagedProcess, find_binary};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::config::DhcpConfig;
use crate::server::{LeaseEngine, LeaseServer};

/// Name of the coredhcp executable looked up on `PATH`.
pub const COREDHCP_BINARY: &str = "coredhcp";

#[derive(Debug, Serialize)]
struct CoreDhcpFile {
    server4: ServerSection,
}

#[derive(Debug, Serialize)]
struct ServerSection {
    listen: Vec<String>,
    plugins: Vec<BTreeMap<&'static str, String>>,
}

/// Renders the coredhcp YAML configuration for `config`: an IPv4 server
/// on all addresses, port 67, loading one plugin per configured value.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or cannot be encoded.
pub fn render_config(config: &DhcpConfig) -> Result<String> {
    let plugins = config
        .plugins()?
        .into_iter()
        .map(|p| BTreeMap::from([(p.name, p.args.join(" "))]))
        .collect();
    let file = CoreDhcpFile {
        server4: ServerSection {
            listen: vec![format!("0.0.0.0:{DHCP_SERVER_PORT}")],
            plugins,
        },
    };
    serde_yaml::to_string(&file).map_err(|e| NetError::config(format!("encode coredhcp config: {e}")))
}

/// Runs `coredhcp` as a child process.
#[derive(Debug, Clone, Default)]
pub struct CoreDhcpEngine {
    binary: Option<PathBuf>,
}

impl CoreDhcpEngine {
    /// Engine using `coredhcp` from `PATH`.
    pub const fn new() -> Self {
        Self { binary: None }
    }

    /// Engine using the given executable.
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }
}

impl LeaseEngine for CoreDhcpEngine {
    fn start(&self, config: &DhcpConfig) -> Result<Box<dyn LeaseServer>> {
        let rendered = render_config(config)?;
        let binary = match &self.binary {
            Some(path) => path.clone(),
            None => find_binary(COREDHCP_BINARY)?,
        };

        let mut file = tempfile::Builder::new()
            .prefix("guestnet-coredhcp-")
            .suffix(".yml")
            .tempfile()
            .map_err(|e| NetError::io(std::env::temp_dir(), e))?;
        if let Err(e) = file.write_all(rendered.as_bytes()) {
            return Err(NetError::io(file.path(), e));
        }
        if let Err(e) = file.flush() {
            return Err(NetError::io(file.path(), e));
        }

        let conf = file.path().as_os_str().to_owned();
        let process = ManagedProcess::spawn(&binary, [OsStr::new("-conf"), conf.as_os_str()])?;
        Ok(Box::new(CoreDhcpProcess {
            process,
            _config: file,
        }))
    }
}

/// A running coredhcp process and the configuration it reads.
#[derive(Debug)]
struct CoreDhcpProcess {
    process: ManagedProcess,
    _config: NamedTempFile,
}

impl LeaseServer for CoreDhcpProcess {
    fn close(&self) -> Result<()> {
        self.process.stop();
        Ok(())
    }

    fn wait(&self) -> Result<()> {
        let status = self.process.wait()?;
        if status.success() || self.process.is_stopped() {
            Ok(())
        } else {
            Err(NetError::kernel("coredhcp", format!("exited with {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn renders_plugin_list() {
        let config = DhcpConfig::new()
            .with_subnet(Ipv4Addr::new(192, 168, 50, 1), "192.168.50.0/24".parse().unwrap())
            .range("192.168.50.10".parse().unwrap(), "192.168.50.99".parse().unwrap())
            .dns([Ipv4Addr::new(192, 168, 50, 1), Ipv4Addr::new(1, 1, 1, 1)])
            .lease_file("/tmp/leases.txt");

        let yaml = render_config(&config).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let server = &parsed["server4"];
        assert_eq!(server["listen"][0].as_str(), Some("0.0.0.0:67"));
        let plugins = server["plugins"].as_sequence().unwrap();
        assert_eq!(plugins.len(), 4);
        assert_eq!(plugins[0]["server_id"].as_str(), Some("192.168.50.1"));
        assert_eq!(
            plugins[1]["range"].as_str(),
            Some("/tmp/leases.txt 192.168.50.10 192.168.50.99 43200s")
        );
        assert_eq!(plugins[2]["router"].as_str(), Some("192.168.50.1"));
        assert_eq!(plugins[3]["dns"].as_str(), Some("192.168.50.1 1.1.1.1"));
    }

    #[test]
    fn invalid_config_renders_nothing() {
        assert!(render_config(&DhcpConfig::new()).is_err());
    }

    #[test]
    fn missing_binary_fails_start() {
        let config = DhcpConfig::new()
            .with_subnet(Ipv4Addr::new(10, 0, 0, 1), "10.0.0.0/24".parse().unwrap())
            .range("10.0.0.10".parse().unwrap(), "10.0.0.20".parse().unwrap());
        let engine = CoreDhcpEngine::with_binary("/nonexistent/coredhcp");
        assert!(engine.start(&config).is_err());
    }
}
