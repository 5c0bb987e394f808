//! Network handle lifecycle: build, execute, connect, disconnect, destroy.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use guestnet_common::constants::{HOST_VETH_SUFFIX, MAX_IFNAME_LEN};
use guestnet_common::error::{ErrorList, NetError, Result};
use guestnet_common::types::{LinkKind, NetworkState};
use ipnetwork::Ipv4Network;

use super::{KernelNamespaces, NamespaceBackend, host_link_name, ns_link_name};
use crate::firewall::rule::{FILTER_TABLE, FORWARD_CHAIN, NAT_TABLE, POSTROUTING_CHAIN};
use crate::firewall::{
    Firewall, RuleSet, forward_outbound_rule, forward_return_traffic_rule, masquerade_rule,
};
use crate::link::{LinkManager, create_bridge_with_address};

/// Collects the settings of a [`Network`]. Nothing is checked until
/// [`NetworkBuilder::build`] or [`NetworkBuilder::open`].
#[derive(Default)]
pub struct NetworkBuilder {
    name: String,
    subnet: Option<Ipv4Network>,
    gateway: Option<Ipv4Addr>,
    bridge: Option<Ipv4Addr>,
    links: Option<Arc<dyn LinkManager>>,
    namespaces: Option<Arc<dyn NamespaceBackend>>,
    firewall: Option<Firewall>,
}

impl fmt::Debug for NetworkBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkBuilder")
            .field("name", &self.name)
            .field("subnet", &self.subnet)
            .field("gateway", &self.gateway)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

/// Validated settings.
struct Settings {
    name: String,
    subnet: Ipv4Network,
    gateway: Ipv4Addr,
    bridge: Ipv4Addr,
}

impl NetworkBuilder {
    /// Starts an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Network name, used for the namespace and the bridge inside it.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Subnet shared by the gateway and the bridge.
    #[must_use]
    pub const fn subnet(mut self, subnet: Ipv4Network) -> Self {
        self.subnet = Some(subnet);
        self
    }

    /// Address of the host end of the veth pair, used as default gateway
    /// inside the namespace.
    #[must_use]
    pub const fn gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Address of the bridge inside the namespace.
    #[must_use]
    pub const fn bridge(mut self, bridge: Ipv4Addr) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Link manager used on both sides of the veth pair.
    #[must_use]
    pub fn link_manager(mut self, links: Arc<dyn LinkManager>) -> Self {
        self.links = Some(links);
        self
    }

    /// Namespace backend. Defaults to [`KernelNamespaces`].
    #[must_use]
    pub fn namespaces(mut self, namespaces: Arc<dyn NamespaceBackend>) -> Self {
        self.namespaces = Some(namespaces);
        self
    }

    /// Firewall engine. Defaults to [`Firewall::system`].
    #[must_use]
    pub fn firewall(mut self, firewall: Firewall) -> Self {
        self.firewall = Some(firewall);
        self
    }

    /// Checks every setting without touching the kernel.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] naming the first missing or
    /// inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        self.settings().map(|_| ())
    }

    fn settings(&self) -> Result<Settings> {
        if self.name.is_empty() {
            return Err(NetError::config("network name is required"));
        }
        let longest = self.name.len() + HOST_VETH_SUFFIX.len();
        if longest > MAX_IFNAME_LEN {
            return Err(NetError::config(format!(
                "network name {} is too long: {} is limited to {MAX_IFNAME_LEN} bytes",
                self.name,
                host_link_name(&self.name)
            )));
        }
        let subnet = self
            .subnet
            .ok_or_else(|| NetError::config("network subnet is required"))?;
        let gateway = self
            .gateway
            .ok_or_else(|| NetError::config("gateway IP is required"))?;
        let bridge = self
            .bridge
            .ok_or_else(|| NetError::config("bridge IP is required"))?;
        if !subnet.contains(gateway) {
            return Err(NetError::config(format!(
                "gateway IP {gateway} is not in network {subnet}"
            )));
        }
        if !subnet.contains(bridge) {
            return Err(NetError::config(format!(
                "bridge IP {bridge} is not in network {subnet}"
            )));
        }
        if gateway == bridge {
            return Err(NetError::config(format!(
                "gateway and bridge share the address {gateway}"
            )));
        }
        if self.links.is_none() {
            return Err(NetError::config("link manager is required"));
        }
        Ok(Settings {
            name: self.name.clone(),
            subnet,
            gateway,
            bridge,
        })
    }

    fn into_handle(self, name: String) -> Result<Network> {
        let links = self
            .links
            .ok_or_else(|| NetError::config("link manager is required"))?;
        Ok(Network {
            name,
            links,
            namespaces: self
                .namespaces
                .unwrap_or_else(|| Arc::new(KernelNamespaces::new())),
            firewall: self.firewall.unwrap_or_else(Firewall::system),
            state: NetworkState::Provisioning,
        })
    }

    /// Provisions the network.
    ///
    /// Steps run in order: namespace, veth pair with its peer moved into the
    /// namespace, gateway address on the host end, then inside the namespace
    /// the bridge, the veth end enslaved to it and the default route. A
    /// failure after the veth pair exists destroys everything again.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] before any change for invalid settings,
    /// otherwise the failing step, joined with any cleanup failure.
    pub fn build(self) -> Result<Network> {
        let settings = self.settings()?;
        let mut network = self.into_handle(settings.name.clone())?;

        let existed = network.namespaces.exists(&network.name)?;
        network
            .namespaces
            .create(&network.name)
            .map_err(|e| e.context(format!("failed to create namespace {}", network.name)))?;

        if let Err(e) = network.add_veth() {
            network.state = NetworkState::Destroyed;
            if existed {
                return Err(e);
            }
            return Err(match network.namespaces.delete(&network.name) {
                Ok(()) => e,
                Err(rollback) => {
                    e.with_rollback(rollback.context("failed to delete namespace"))
                }
            });
        }

        if let Err(e) = network.provision(&settings) {
            tracing::warn!(network = %network.name, error = %e, "provisioning failed, destroying");
            let e = match network.destroy() {
                Ok(()) => e,
                Err(rollback) => e.with_rollback(rollback),
            };
            return Err(e);
        }

        network.state = NetworkState::Ready;
        tracing::info!(
            network = %network.name,
            subnet = %settings.subnet,
            gateway = %settings.gateway,
            bridge = %settings.bridge,
            "network ready"
        );
        Ok(network)
    }

    /// Attaches to a network provisioned earlier, possibly by another
    /// process. Only the name and the link manager are required.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] for missing settings and
    /// [`NetError::NotFound`] when the namespace does not exist.
    pub fn open(self) -> Result<Network> {
        if self.name.is_empty() {
            return Err(NetError::config("network name is required"));
        }
        let name = self.name.clone();
        let mut network = self.into_handle(name)?;
        if !network.namespaces.exists(&network.name)? {
            return Err(NetError::NotFound {
                kind: "namespace",
                name: network.name,
            });
        }
        network.state = NetworkState::Ready;
        tracing::debug!(network = %network.name, "network opened");
        Ok(network)
    }
}

/// An isolated network and the sole owner of its kernel objects.
///
/// Dropping the handle leaves the network in place; only
/// [`Network::destroy`] removes it.
pub struct Network {
    name: String,
    links: Arc<dyn LinkManager>,
    namespaces: Arc<dyn NamespaceBackend>,
    firewall: Firewall,
    state: NetworkState,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Network {
    /// Network name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lifecycle state.
    pub const fn state(&self) -> NetworkState {
        self.state
    }

    /// Host end of the veth pair.
    pub fn host_link(&self) -> String {
        host_link_name(&self.name)
    }

    /// Runs `f` inside the namespace and returns its result. The caller's
    /// thread never changes namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the network was destroyed, the namespace cannot
    /// be entered, or `f` fails.
    pub fn execute<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce() -> Result<T> + Send,
    {
        self.ensure_alive()?;
        let mut f = Some(f);
        let mut output = None;
        self.namespaces.enter(&self.name, &mut || {
            let f = f
                .take()
                .ok_or_else(|| NetError::config("namespace callback ran twice"))?;
            output = Some(f()?);
            Ok(())
        })?;
        output.ok_or_else(|| NetError::config("namespace callback did not run"))
    }

    /// Gives the network internet access through `host_if`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::NotFound`] when the filter or nat table is
    /// missing, otherwise the first rule that could not be added. Rules
    /// added before it stay in place.
    pub fn connect(&self, host_if: &str) -> Result<()> {
        self.ensure_alive()?;
        self.firewall.add_rules(&self.uplink_rules(host_if)?)?;
        tracing::info!(network = %self.name, host_if = %host_if, "network connected");
        Ok(())
    }

    /// Removes exactly the rules [`Network::connect`] added for `host_if`.
    ///
    /// # Errors
    ///
    /// Returns the first rule that could not be removed.
    pub fn disconnect(&self, host_if: &str) -> Result<()> {
        self.ensure_alive()?;
        self.firewall.remove_rules(&self.uplink_rules(host_if)?)?;
        tracing::info!(network = %self.name, host_if = %host_if, "network disconnected");
        Ok(())
    }

    /// Deletes the host end of the veth pair and the namespace. Every step
    /// is attempted; all failures are returned together.
    ///
    /// # Errors
    ///
    /// Returns the failed step, or [`NetError::Multiple`] when several
    /// failed.
    pub fn destroy(&mut self) -> Result<()> {
        let host = self.host_link();
        let mut errors = ErrorList::new();
        errors.record(
            self.links
                .delete_link(&host)
                .map_err(|e| e.context(format!("failed to delete link {host}"))),
        );
        errors.record(
            self.namespaces
                .delete(&self.name)
                .map_err(|e| e.context(format!("failed to delete namespace {}", self.name))),
        );
        self.state = NetworkState::Destroyed;

        if errors.is_empty() {
            tracing::info!(network = %self.name, "network destroyed");
        } else {
            tracing::warn!(network = %self.name, failures = errors.len(), "network destroyed with errors");
        }
        errors.into_result()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.state == NetworkState::Destroyed {
            return Err(NetError::config(format!(
                "network {} is destroyed",
                self.name
            )));
        }
        Ok(())
    }

    fn add_veth(&self) -> Result<()> {
        let host = self.host_link();
        let kind = LinkKind::Veth {
            peer: ns_link_name(&self.name),
            peer_namespace: Some(self.name.clone()),
        };
        self.links
            .add_link(&host, &kind)
            .map_err(|e| e.context(format!("failed to create veth pair {host}")))
    }

    fn provision(&self, settings: &Settings) -> Result<()> {
        let host = self.host_link();
        let prefix = settings.subnet.prefix();
        let gateway = Ipv4Network::new(settings.gateway, prefix)
            .map_err(|e| NetError::config(format!("invalid gateway address: {e}")))?;
        let bridge = Ipv4Network::new(settings.bridge, prefix)
            .map_err(|e| NetError::config(format!("invalid bridge address: {e}")))?;

        self.links
            .set_ip(&host, gateway)
            .map_err(|e| e.context(format!("failed to set ip on {host}")))?;
        self.links
            .bring_up(&host)
            .map_err(|e| e.context(format!("failed to bring {host} up")))?;

        let links = self.links.as_ref();
        let name = self.name.as_str();
        let peer = ns_link_name(name);
        let via = settings.gateway;
        self.execute(|| {
            create_bridge_with_address(links, name, bridge, true)
                .map_err(|e| e.context("failed to create bridge"))?;
            links
                .bring_up(&peer)
                .map_err(|e| e.context(format!("failed to bring {peer} up")))?;
            links
                .set_master(&peer, name)
                .map_err(|e| e.context("failed to set bridge master"))?;
            links
                .add_default_route(name, via)
                .map_err(|e| e.context("failed to set default route"))
        })
    }

    fn uplink_rules(&self, host_if: &str) -> Result<RuleSet> {
        let host = self.host_link();
        RuleSet::new([
            forward_outbound_rule(FORWARD_CHAIN, FILTER_TABLE, host_if, &host),
            forward_return_traffic_rule(FORWARD_CHAIN, FILTER_TABLE, host_if, &host),
            masquerade_rule(POSTROUTING_CHAIN, NAT_TABLE, host_if),
        ])
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::sim::InMemoryKernel;

    fn builder(kernel: &Arc<InMemoryKernel>) -> NetworkBuilder {
        NetworkBuilder::new()
            .name("vm1")
            .subnet("10.10.0.0/24".parse().unwrap())
            .gateway(Ipv4Addr::new(10, 10, 0, 1))
            .bridge(Ipv4Addr::new(10, 10, 0, 2))
            .link_manager(kernel.clone())
            .namespaces(kernel.clone())
    }

    fn config_message(b: NetworkBuilder) -> String {
        match b.validate().unwrap_err() {
            NetError::Config { message } => message,
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn complete_settings_validate() {
        let kernel = Arc::new(InMemoryKernel::new());
        builder(&kernel).validate().unwrap();
    }

    #[test]
    fn each_missing_setting_is_named() {
        assert_eq!(config_message(NetworkBuilder::new()), "network name is required");
        assert_eq!(
            config_message(NetworkBuilder::new().name("vm1")),
            "network subnet is required"
        );
        let with_subnet = || NetworkBuilder::new().name("vm1").subnet("10.0.0.0/24".parse().unwrap());
        assert_eq!(config_message(with_subnet()), "gateway IP is required");
        assert_eq!(
            config_message(with_subnet().gateway(Ipv4Addr::new(10, 0, 0, 1))),
            "bridge IP is required"
        );
        assert_eq!(
            config_message(
                with_subnet()
                    .gateway(Ipv4Addr::new(10, 0, 0, 1))
                    .bridge(Ipv4Addr::new(10, 0, 0, 2))
            ),
            "link manager is required"
        );
    }

    #[test]
    fn addresses_must_be_inside_subnet() {
        let kernel = Arc::new(InMemoryKernel::new());
        let msg = config_message(builder(&kernel).gateway(Ipv4Addr::new(10, 20, 0, 1)));
        assert_eq!(msg, "gateway IP 10.20.0.1 is not in network 10.10.0.0/24");
        let msg = config_message(builder(&kernel).bridge(Ipv4Addr::new(192, 168, 0, 2)));
        assert_eq!(msg, "bridge IP 192.168.0.2 is not in network 10.10.0.0/24");
    }

    #[test]
    fn overlong_name_is_rejected() {
        let kernel = Arc::new(InMemoryKernel::new());
        let msg = config_message(builder(&kernel).name("workload-01"));
        assert!(msg.contains("too long"), "got: {msg}");
    }

    #[test]
    fn open_requires_existing_namespace() {
        let kernel = Arc::new(InMemoryKernel::new());
        let err = NetworkBuilder::new()
            .name("vm1")
            .link_manager(kernel.clone())
            .namespaces(kernel)
            .open()
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
