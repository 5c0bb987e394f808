//! Lease-server configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use guestnet_common::constants;
use guestnet_common::error::{NetError, Result};
use guestnet_core::address::is_valid_range;
use ipnetwork::Ipv4Network;
use nix::ifaddrs::getifaddrs;

/// One plugin invocation handed to the lease engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginArgs {
    /// Plugin name.
    pub name: &'static str,
    /// Positional arguments.
    pub args: Vec<String>,
}

/// What the lease engine is started with: the server identity, the lease
/// range, the router and the DNS servers handed to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpConfig {
    range: Option<(IpAddr, IpAddr)>,
    lease_time: Duration,
    dns: Vec<Ipv4Addr>,
    router: Option<Ipv4Addr>,
    subnet: Option<Ipv4Network>,
    lease_file: PathBuf,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            range: None,
            lease_time: constants::DEFAULT_LEASE_TIME,
            dns: Vec::new(),
            router: None,
            subnet: None,
            lease_file: PathBuf::from(constants::DEFAULT_LEASE_FILE),
        }
    }
}

impl DhcpConfig {
    /// Creates a configuration with the default lease time and lease file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves the subnet `router` is assigned on `ifname`.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface addresses cannot be listed or
    /// `router` is not one of them.
    pub fn with_interface(self, ifname: &str, router: Ipv4Addr) -> Result<Self> {
        let subnet = interface_subnet(ifname, router)?;
        Ok(self.with_subnet(router, subnet))
    }

    /// Serves `subnet` with `router` as server identity and gateway.
    #[must_use]
    pub const fn with_subnet(mut self, router: Ipv4Addr, subnet: Ipv4Network) -> Self {
        self.router = Some(router);
        self.subnet = Some(subnet);
        self
    }

    /// Sets the lease range, both ends inclusive.
    #[must_use]
    pub const fn range(mut self, start: IpAddr, end: IpAddr) -> Self {
        self.range = Some((start, end));
        self
    }

    /// Sets the lease duration.
    #[must_use]
    pub const fn lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = lease_time;
        self
    }

    /// Sets the DNS servers handed to clients.
    #[must_use]
    pub fn dns(mut self, servers: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        self.dns = servers.into_iter().collect();
        self
    }

    /// Sets the lease database path.
    #[must_use]
    pub fn lease_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lease_file = path.into();
        self
    }

    /// Lease database path.
    pub fn lease_file_path(&self) -> &Path {
        &self.lease_file
    }

    /// Router address, once an interface or subnet is set.
    pub const fn router(&self) -> Option<Ipv4Addr> {
        self.router
    }

    /// Served subnet, once an interface or subnet is set.
    pub const fn subnet(&self) -> Option<Ipv4Network> {
        self.subnet
    }

    /// Checks that the range and router are set and the range lies in
    /// the served subnet.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let Some((start, end)) = self.range else {
            return Err(NetError::config("IP range must be specified"));
        };
        let (Some(_), Some(subnet)) = (self.router, self.subnet) else {
            return Err(NetError::config("router IP must be specified"));
        };
        if !is_valid_range(start, end, subnet) {
            return Err(NetError::config(format!("invalid IP range: {start} - {end}")));
        }
        if self.lease_time.is_zero() {
            return Err(NetError::config("lease time must be positive"));
        }
        Ok(())
    }

    /// Plugin invocations for the engine, in load order: `server_id`,
    /// `range`, `router`, then `dns` when servers are configured.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] if the configuration is invalid.
    pub fn plugins(&self) -> Result<Vec<PluginArgs>> {
        self.validate()?;
        let (Some((start, end)), Some(router)) = (self.range, self.router) else {
            return Err(NetError::config("router IP must be specified"));
        };

        let mut plugins = vec![
            PluginArgs {
                name: "server_id",
                args: vec![router.to_string()],
            },
            PluginArgs {
                name: "range",
                args: vec![
                    self.lease_file.display().to_string(),
                    start.to_string(),
                    end.to_string(),
                    format!("{}s", self.lease_time.as_secs()),
                ],
            },
            PluginArgs {
                name: "router",
                args: vec![router.to_string()],
            },
        ];
        if !self.dns.is_empty() {
            plugins.push(PluginArgs {
                name: "dns",
                args: self.dns.iter().map(ToString::to_string).collect(),
            });
        }
        Ok(plugins)
    }
}

/// Subnet of the non-loopback IPv4 address `router` on `ifname`.
///
/// # Errors
///
/// Returns an error if the interface addresses cannot be listed, or
/// [`NetError::NotFound`] when `router` is not assigned to `ifname`.
pub fn interface_subnet(ifname: &str, router: Ipv4Addr) -> Result<Ipv4Network> {
    let addrs = getifaddrs().map_err(|e| NetError::kernel("list interface addresses", e))?;
    for ifaddr in addrs.filter(|a| a.interface_name == ifname) {
        let Some(address) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let ip = address.ip();
        if ip.is_loopback() || ip != router {
            continue;
        }
        let Some(mask) = ifaddr.netmask.as_ref().and_then(|m| m.as_sockaddr_in()) else {
            continue;
        };
        let prefix = ipnetwork::ipv4_mask_to_prefix(mask.ip())
            .map_err(|e| NetError::kernel(format!("read netmask of {ifname}"), e))?;
        return Ipv4Network::new(ip, prefix)
            .map_err(|e| NetError::kernel(format!("read subnet of {ifname}"), e));
    }
    Err(NetError::NotFound {
        kind: "router address",
        name: format!("{router} on interface {ifname}"),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn configured() -> DhcpConfig {
        DhcpConfig::new()
            .with_subnet(Ipv4Addr::new(10, 10, 0, 1), "10.10.0.0/24".parse().unwrap())
            .range(v4("10.10.0.10"), v4("10.10.0.100"))
            .dns([Ipv4Addr::new(10, 10, 0, 1)])
            .lease_file("/tmp/leases")
    }

    #[test]
    fn validate_requires_range_then_router() {
        let err = DhcpConfig::new().validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: IP range must be specified");

        let err = DhcpConfig::new()
            .range(v4("10.0.0.10"), v4("10.0.0.20"))
            .validate()
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: router IP must be specified");
    }

    #[test]
    fn validate_checks_range_against_subnet() {
        assert!(configured().validate().is_ok());
        let outside = configured().range(v4("10.10.0.10"), v4("10.11.0.1"));
        assert!(outside.validate().is_err());
        let reversed = configured().range(v4("10.10.0.100"), v4("10.10.0.10"));
        assert!(reversed.validate().is_err());
        let v6 = configured().range(v4("10.10.0.10"), "::1".parse().unwrap());
        assert!(v6.validate().is_err());
    }

    #[test]
    fn plugins_carry_the_five_values() {
        let plugins = configured().plugins().unwrap();
        let names: Vec<_> = plugins.iter().map(|p| p.name).collect();
        assert_eq!(names, ["server_id", "range", "router", "dns"]);
        assert_eq!(plugins[0].args, ["10.10.0.1"]);
        assert_eq!(
            plugins[1].args,
            ["/tmp/leases", "10.10.0.10", "10.10.0.100", "43200s"]
        );
        assert_eq!(plugins[2].args, ["10.10.0.1"]);
        assert_eq!(plugins[3].args, ["10.10.0.1"]);
    }

    #[test]
    fn dns_plugin_is_omitted_without_servers() {
        let plugins = configured().dns(Vec::<Ipv4Addr>::new()).plugins().unwrap();
        assert!(plugins.iter().all(|p| p.name != "dns"));
    }

    #[test]
    fn loopback_router_is_not_accepted() {
        let err = DhcpConfig::new()
            .with_interface("lo", Ipv4Addr::LOCALHOST)
            .unwrap_err();
        assert!(err.is_not_found() || matches!(err, NetError::Kernel { .. }));
    }
}
