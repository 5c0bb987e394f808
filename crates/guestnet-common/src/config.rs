//! Global configuration model for guestnet.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{NetError, Result};

/// Root configuration, loadable from a JSON file. Every field is optional in
/// the file and falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestnetConfig {
    /// Directory holding bind-mounted named network namespaces.
    pub netns_dir: PathBuf,
    /// Resolver configuration the DNS forwarder follows.
    pub resolv_conf: PathBuf,
    /// Per-upstream DNS query timeout, in seconds.
    pub dns_timeout_secs: u64,
    /// Prefix of the per-workload firewall chains.
    pub nft_prefix: String,
    /// DHCP lease database.
    pub lease_file: PathBuf,
    /// DHCP lease duration, in seconds.
    pub lease_time_secs: u64,
}

impl Default for GuestnetConfig {
    fn default() -> Self {
        Self {
            netns_dir: PathBuf::from(constants::DEFAULT_NETNS_DIR),
            resolv_conf: constants::default_resolv_conf(),
            dns_timeout_secs: constants::DEFAULT_DNS_TIMEOUT.as_secs(),
            nft_prefix: constants::DEFAULT_NFT_PREFIX.to_owned(),
            lease_file: PathBuf::from(constants::DEFAULT_LEASE_FILE),
            lease_time_secs: constants::DEFAULT_LEASE_TIME.as_secs(),
        }
    }
}

impl GuestnetConfig {
    /// Reads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| NetError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Per-upstream DNS query timeout.
    pub const fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    /// DHCP lease duration.
    pub const fn lease_time(&self) -> Duration {
        Duration::from_secs(self.lease_time_secs)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = GuestnetConfig::default();
        assert_eq!(config.netns_dir, PathBuf::from("/run/netns"));
        assert_eq!(config.nft_prefix, "QEMU-");
        assert_eq!(config.dns_timeout(), Duration::from_secs(120));
        assert_eq!(config.lease_time(), Duration::from_secs(43_200));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"nft_prefix": "VM-", "dns_timeout_secs": 5}}"#).unwrap();

        let config = GuestnetConfig::load(file.path()).unwrap();
        assert_eq!(config.nft_prefix, "VM-");
        assert_eq!(config.dns_timeout(), Duration::from_secs(5));
        assert_eq!(config.lease_file, PathBuf::from("/tmp/guestnet-dhcp-leases"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = GuestnetConfig::load(Path::new("/nonexistent/guestnet.json")).unwrap_err();
        assert!(matches!(err, NetError::Io { .. }));
    }

    #[test]
    fn malformed_file_is_serialization_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = GuestnetConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, NetError::Serialization { .. }));
    }
}
