//! System-wide constants and default paths.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding bind-mounted named network namespaces.
pub const DEFAULT_NETNS_DIR: &str = "/run/netns";

/// Resolver configuration maintained by systemd-resolved, listing the real
/// upstream servers rather than the local stub.
pub const SYSTEMD_RESOLV_CONF: &str = "/run/systemd/resolve/resolv.conf";

/// Classic resolver configuration path.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Port DNS servers listen on.
pub const DNS_PORT: u16 = 53;

/// DHCP server port.
pub const DHCP_SERVER_PORT: u16 = 67;

/// DHCP client port.
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Per-upstream query timeout of the failover forwarder.
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(120);

/// Prefix of the per-workload firewall chains (`QEMU-FORWARD`, `QEMU-INPUT`).
pub const DEFAULT_NFT_PREFIX: &str = "QEMU-";

/// Lease database used by the DHCP collaborator.
pub const DEFAULT_LEASE_FILE: &str = "/tmp/guestnet-dhcp-leases";

/// Lease duration handed out by the DHCP collaborator.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(12 * 60 * 60);

/// Maximum interface name length accepted by the kernel, excluding the
/// trailing NUL.
pub const MAX_IFNAME_LEN: usize = 15;

/// Suffix of the host-side veth end of a namespaced network.
pub const HOST_VETH_SUFFIX: &str = "-host";

/// Suffix of the namespace-side veth end of a namespaced network.
pub const NS_VETH_SUFFIX: &str = "-net";

/// Application name used in logs and CLI output.
pub const APP_NAME: &str = "guestnet";

/// Returns the resolver configuration to follow: the systemd-resolved file
/// when present, the classic one otherwise.
pub fn default_resolv_conf() -> PathBuf {
    if Path::new(SYSTEMD_RESOLV_CONF).exists() {
        PathBuf::from(SYSTEMD_RESOLV_CONF)
    } else {
        PathBuf::from(RESOLV_CONF)
    }
}
