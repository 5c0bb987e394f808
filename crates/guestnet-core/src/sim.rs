//! In-memory stand-ins for the kernel.
//!
//! [`InMemoryKernel`] implements [`LinkManager`] and [`NamespaceBackend`]
//! over a map of namespaces and their links; [`InMemoryFirewall`] implements
//! [`FirewallBackend`] over a map of tables. Both accept one-shot failure
//! injection so rollback paths can be exercised without root.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use guestnet_common::error::{NetError, Result};
use guestnet_common::types::{LinkKind, LinkState};
use ipnetwork::Ipv4Network;

use crate::firewall::{ChainConfig, FirewallBackend, InstalledRule, Rule, TableSpec};
use crate::link::LinkManager;
use crate::namespace::NamespaceBackend;

/// Operation of [`InMemoryKernel`] that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// [`LinkManager::add_link`]
    AddLink,
    /// [`LinkManager::set_ip`]
    SetIp,
    /// [`LinkManager::exists`]
    Exists,
    /// [`LinkManager::set_master`]
    SetMaster,
    /// [`LinkManager::bring_up`]
    BringUp,
    /// [`LinkManager::has_ip`]
    HasIp,
    /// [`LinkManager::delete_link`]
    DeleteLink,
    /// [`LinkManager::disable_tx_offloading`]
    DisableTxOffload,
    /// [`LinkManager::add_default_route`]
    AddDefaultRoute,
    /// [`NamespaceBackend::create`]
    CreateNamespace,
    /// [`NamespaceBackend::delete`]
    DeleteNamespace,
    /// [`NamespaceBackend::enter`]
    EnterNamespace,
}

#[derive(Debug, Clone)]
struct SimLink {
    kind: LinkKind,
    addresses: Vec<Ipv4Network>,
    state: LinkState,
    master: Option<String>,
    tx_offload_disabled: bool,
    /// Namespace and name of the other end of a veth.
    peer: Option<(Option<String>, String)>,
}

impl SimLink {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            addresses: Vec::new(),
            state: LinkState::Down,
            master: None,
            tx_offload_disabled: false,
            peer: None,
        }
    }
}

#[derive(Debug, Default)]
struct SimNamespace {
    links: BTreeMap<String, SimLink>,
    default_route: Option<(String, Ipv4Addr)>,
}

#[derive(Debug)]
struct KernelState {
    /// `None` is the host namespace.
    namespaces: BTreeMap<Option<String>, SimNamespace>,
    current: Option<String>,
    failures: Vec<(Op, String)>,
}

impl KernelState {
    fn take_failure(&mut self, op: Op, name: &str) -> Result<()> {
        if let Some(pos) = self.failures.iter().position(|(o, n)| *o == op && n == name) {
            let _ = self.failures.remove(pos);
            return Err(NetError::kernel(format!("{op:?} {name}"), "injected failure"));
        }
        Ok(())
    }

    fn current_ns(&mut self) -> &mut SimNamespace {
        self.namespaces.entry(self.current.clone()).or_default()
    }

    fn link_mut(&mut self, name: &str) -> Result<&mut SimLink> {
        self.current_ns().links.get_mut(name).ok_or_else(|| NetError::NotFound {
            kind: "link",
            name: name.to_owned(),
        })
    }

    fn remove_link(&mut self, ns: &Option<String>, name: &str) {
        let removed = self
            .namespaces
            .get_mut(ns)
            .and_then(|space| space.links.remove(name));
        if let Some((peer_ns, peer)) = removed.and_then(|link| link.peer) {
            if let Some(space) = self.namespaces.get_mut(&peer_ns) {
                let _ = space.links.remove(&peer);
            }
        }
        if let Some(space) = self.namespaces.get_mut(ns) {
            if space.default_route.as_ref().is_some_and(|(dev, _)| dev == name) {
                space.default_route = None;
            }
        }
    }
}

/// Simulated kernel holding namespaces and their links.
#[derive(Debug)]
pub struct InMemoryKernel {
    state: Mutex<KernelState>,
}

impl Default for InMemoryKernel {
    fn default() -> Self {
        let mut namespaces = BTreeMap::new();
        let _ = namespaces.insert(None, SimNamespace::default());
        Self {
            state: Mutex::new(KernelState {
                namespaces,
                current: None,
                failures: Vec::new(),
            }),
        }
    }
}

impl InMemoryKernel {
    /// Creates a kernel with only the host namespace.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inspect<T>(&self, ns: Option<&str>, name: &str, f: impl FnOnce(&SimLink) -> T) -> Option<T> {
        let state = self.lock();
        state
            .namespaces
            .get(&ns.map(str::to_owned))
            .and_then(|space| space.links.get(name))
            .map(f)
    }

    /// Makes the next `op` on `name` fail.
    pub fn fail_once(&self, op: Op, name: &str) {
        self.lock().failures.push((op, name.to_owned()));
    }

    /// Addresses of a link; empty when the link is missing.
    pub fn addresses(&self, ns: Option<&str>, name: &str) -> Vec<Ipv4Network> {
        self.inspect(ns, name, |l| l.addresses.clone()).unwrap_or_default()
    }

    /// State of a link, `None` when missing.
    pub fn state(&self, ns: Option<&str>, name: &str) -> Option<LinkState> {
        self.inspect(ns, name, |l| l.state)
    }

    /// Kind of a link, `None` when missing.
    pub fn kind(&self, ns: Option<&str>, name: &str) -> Option<LinkKind> {
        self.inspect(ns, name, |l| l.kind.clone())
    }

    /// Master of a link.
    pub fn master(&self, ns: Option<&str>, name: &str) -> Option<String> {
        self.inspect(ns, name, |l| l.master.clone()).flatten()
    }

    /// Whether TX offload was disabled on a link.
    pub fn tx_offload_disabled(&self, ns: Option<&str>, name: &str) -> bool {
        self.inspect(ns, name, |l| l.tx_offload_disabled).unwrap_or(false)
    }

    /// Number of links in a namespace.
    pub fn link_count(&self, ns: Option<&str>) -> usize {
        self.lock()
            .namespaces
            .get(&ns.map(str::to_owned))
            .map_or(0, |space| space.links.len())
    }

    /// Whether a named namespace exists.
    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains_key(&Some(name.to_owned()))
    }

    /// Default route of a namespace as (device, gateway).
    pub fn default_route(&self, ns: Option<&str>) -> Option<(String, Ipv4Addr)> {
        self.lock()
            .namespaces
            .get(&ns.map(str::to_owned))
            .and_then(|space| space.default_route.clone())
    }

    /// Namespace link operations currently act on.
    pub fn current_namespace(&self) -> Option<String> {
        self.lock().current.clone()
    }
}

impl LinkManager for InMemoryKernel {
    fn add_link(&self, name: &str, kind: &LinkKind) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::AddLink, name)?;
        let here = state.current.clone();
        if state.current_ns().links.contains_key(name) {
            return Err(NetError::AlreadyExists {
                kind: "link",
                name: name.to_owned(),
            });
        }

        let mut link = SimLink::new(kind.clone());
        if let LinkKind::Veth {
            peer,
            peer_namespace,
        } = kind
        {
            let target = peer_namespace.clone().or_else(|| here.clone());
            let Some(space) = state.namespaces.get_mut(&target) else {
                return Err(NetError::NotFound {
                    kind: "namespace",
                    name: peer_namespace.clone().unwrap_or_default(),
                });
            };
            if space.links.contains_key(peer) {
                return Err(NetError::AlreadyExists {
                    kind: "link",
                    name: peer.clone(),
                });
            }
            let mut other = SimLink::new(LinkKind::Veth {
                peer: name.to_owned(),
                peer_namespace: here.clone(),
            });
            other.peer = Some((here, name.to_owned()));
            let _ = space.links.insert(peer.clone(), other);
            link.peer = Some((target, peer.clone()));
        }

        let _ = state.current_ns().links.insert(name.to_owned(), link);
        Ok(())
    }

    fn set_ip(&self, name: &str, address: Ipv4Network) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::SetIp, name)?;
        let link = state.link_mut(name)?;
        if !link.addresses.contains(&address) {
            link.addresses.push(address);
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let mut state = self.lock();
        state.take_failure(Op::Exists, name)?;
        Ok(state.current_ns().links.contains_key(name))
    }

    fn set_master(&self, name: &str, master: &str) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::SetMaster, name)?;
        match state.current_ns().links.get(master) {
            Some(link) if link.kind == LinkKind::Bridge => {}
            Some(_) => {
                return Err(NetError::kernel(
                    format!("set master of {name}"),
                    format!("{master} is not a bridge"),
                ));
            }
            None => {
                return Err(NetError::NotFound {
                    kind: "link",
                    name: master.to_owned(),
                });
            }
        }
        state.link_mut(name)?.master = Some(master.to_owned());
        Ok(())
    }

    fn bring_up(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::BringUp, name)?;
        state.link_mut(name)?.state = LinkState::Up;
        Ok(())
    }

    fn has_ip(&self, name: &str, address: Ipv4Network) -> Result<bool> {
        let mut state = self.lock();
        state.take_failure(Op::HasIp, name)?;
        Ok(state.link_mut(name)?.addresses.contains(&address))
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::DeleteLink, name)?;
        let here = state.current.clone();
        state.remove_link(&here, name);
        Ok(())
    }

    fn disable_tx_offloading(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::DisableTxOffload, name)?;
        state.link_mut(name)?.tx_offload_disabled = true;
        Ok(())
    }

    fn add_default_route(&self, name: &str, gateway: Ipv4Addr) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::AddDefaultRoute, name)?;
        let _ = state.link_mut(name)?;
        let space = state.current_ns();
        if space.default_route.is_some() {
            return Err(NetError::AlreadyExists {
                kind: "route",
                name: "default".to_owned(),
            });
        }
        space.default_route = Some((name.to_owned(), gateway));
        Ok(())
    }
}

/// Puts the previous namespace back when an [`InMemoryKernel::enter`]
/// callback returns or unwinds.
struct Switched<'a> {
    kernel: &'a InMemoryKernel,
    previous: Option<String>,
}

impl Drop for Switched<'_> {
    fn drop(&mut self) {
        self.kernel.lock().current = self.previous.take();
    }
}

impl NamespaceBackend for InMemoryKernel {
    fn create(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::CreateNamespace, name)?;
        let _ = state.namespaces.entry(Some(name.to_owned())).or_default();
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::DeleteNamespace, name)?;
        let key = Some(name.to_owned());
        let Some(space) = state.namespaces.remove(&key) else {
            return Ok(());
        };
        for link in space.links.into_values() {
            if let Some((peer_ns, peer)) = link.peer {
                state.remove_link(&peer_ns, &peer);
            }
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.has_namespace(name))
    }

    fn enter(&self, name: &str, f: &mut (dyn FnMut() -> Result<()> + Send)) -> Result<()> {
        let previous = {
            let mut state = self.lock();
            state.take_failure(Op::EnterNamespace, name)?;
            let key = Some(name.to_owned());
            if !state.namespaces.contains_key(&key) {
                return Err(NetError::NotFound {
                    kind: "namespace",
                    name: name.to_owned(),
                });
            }
            std::mem::replace(&mut state.current, key)
        };
        let _switched = Switched {
            kernel: self,
            previous,
        };
        f()
    }
}

/// Operation of [`InMemoryFirewall`] that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallOp {
    /// [`FirewallBackend::tables`]
    Tables,
    /// [`FirewallBackend::chains`]
    Chains,
    /// [`FirewallBackend::create_table`]
    CreateTable,
    /// [`FirewallBackend::create_chain`]
    CreateChain,
    /// [`FirewallBackend::append_rule`]
    AppendRule,
    /// [`FirewallBackend::rules`]
    Rules,
    /// [`FirewallBackend::delete_rule`]
    DeleteRule,
}

#[derive(Debug, Default)]
struct SimChain {
    name: String,
    base: bool,
    rules: Vec<(u64, String)>,
}

#[derive(Debug, Default)]
struct FirewallState {
    tables: BTreeMap<TableSpec, Vec<SimChain>>,
    next_handle: u64,
    failures: Vec<FirewallOp>,
    append_countdown: Option<usize>,
}

impl FirewallState {
    fn take_failure(&mut self, op: FirewallOp) -> Result<()> {
        if let Some(pos) = self.failures.iter().position(|o| *o == op) {
            let _ = self.failures.remove(pos);
            return Err(NetError::kernel(format!("{op:?}"), "injected failure"));
        }
        Ok(())
    }

    fn chain_mut(&mut self, table: &TableSpec, chain: &str) -> Result<&mut SimChain> {
        let chains = self.tables.get_mut(table).ok_or_else(|| NetError::NotFound {
            kind: "table",
            name: table.to_string(),
        })?;
        chains
            .iter_mut()
            .find(|c| c.name == chain)
            .ok_or_else(|| NetError::NotFound {
                kind: "chain",
                name: format!("{chain} in table {}", table.name),
            })
    }
}

/// Simulated nftables ruleset.
#[derive(Debug, Default)]
pub struct InMemoryFirewall {
    state: Mutex<FirewallState>,
}

impl InMemoryFirewall {
    /// Creates an empty ruleset.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FirewallState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call of `op` fail.
    pub fn fail_once(&self, op: FirewallOp) {
        self.lock().failures.push(op);
    }

    /// Makes the `nth` append from now fail, counting from one.
    pub fn fail_on_append(&self, nth: usize) {
        self.lock().append_countdown = Some(nth);
    }

    /// Whether any table called `table` holds `chain`.
    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.lock()
            .tables
            .iter()
            .filter(|(spec, _)| spec.name == table)
            .any(|(_, chains)| chains.iter().any(|c| c.name == chain))
    }

    /// Fingerprints of the rules in `chain` of any table called `table`,
    /// in order.
    pub fn rules_in(&self, table: &str, chain: &str) -> Vec<String> {
        self.lock()
            .tables
            .iter()
            .filter(|(spec, _)| spec.name == table)
            .flat_map(|(_, chains)| chains.iter().filter(|c| c.name == chain))
            .flat_map(|c| c.rules.iter().map(|(_, fp)| fp.clone()))
            .collect()
    }

    /// Whole ruleset as text, handles left out.
    pub fn snapshot(&self) -> Vec<String> {
        let state = self.lock();
        let mut lines = Vec::new();
        for (spec, chains) in &state.tables {
            lines.push(format!("table {spec}"));
            for chain in chains {
                let kind = if chain.base { "base" } else { "regular" };
                lines.push(format!("chain {spec} {} {kind}", chain.name));
                for (_, fp) in &chain.rules {
                    lines.push(format!("rule {spec} {} {fp}", chain.name));
                }
            }
        }
        lines
    }
}

impl FirewallBackend for InMemoryFirewall {
    fn tables(&self) -> Result<Vec<TableSpec>> {
        let mut state = self.lock();
        state.take_failure(FirewallOp::Tables)?;
        Ok(state.tables.keys().cloned().collect())
    }

    fn chains(&self, table: &TableSpec) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.take_failure(FirewallOp::Chains)?;
        Ok(state
            .tables
            .get(table)
            .map(|chains| chains.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default())
    }

    fn create_table(&self, table: &TableSpec) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(FirewallOp::CreateTable)?;
        let _ = state.tables.entry(table.clone()).or_default();
        Ok(())
    }

    fn create_chain(&self, table: &TableSpec, chain: &ChainConfig) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(FirewallOp::CreateChain)?;
        let chains = state.tables.get_mut(table).ok_or_else(|| NetError::NotFound {
            kind: "table",
            name: table.to_string(),
        })?;
        if !chains.iter().any(|c| c.name == chain.name) {
            chains.push(SimChain {
                name: chain.name.clone(),
                base: chain.base.is_some(),
                rules: Vec::new(),
            });
        }
        Ok(())
    }

    fn append_rule(&self, table: &TableSpec, rule: &Rule) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(FirewallOp::AppendRule)?;
        if let Some(n) = state.append_countdown {
            if n <= 1 {
                state.append_countdown = None;
                return Err(NetError::kernel("append rule", "injected failure"));
            }
            state.append_countdown = Some(n - 1);
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state
            .chain_mut(table, &rule.chain)?
            .rules
            .push((handle, rule.fingerprint()));
        Ok(())
    }

    fn rules(&self, table: &TableSpec, chain: &str) -> Result<Vec<InstalledRule>> {
        let mut state = self.lock();
        state.take_failure(FirewallOp::Rules)?;
        Ok(state
            .chain_mut(table, chain)?
            .rules
            .iter()
            .map(|(handle, fp)| InstalledRule {
                handle: *handle,
                comment: Some(fp.clone()),
            })
            .collect())
    }

    fn delete_rule(&self, table: &TableSpec, chain: &str, handle: u64) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(FirewallOp::DeleteRule)?;
        let rules = &mut state.chain_mut(table, chain)?.rules;
        let pos = rules
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or_else(|| NetError::NotFound {
                kind: "rule",
                name: format!("handle {handle} in {chain}"),
            })?;
        let _ = rules.remove(pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn veth_peer_lands_in_namespace_and_dies_with_it() {
        let kernel = InMemoryKernel::new();
        NamespaceBackend::create(&kernel, "ns1").unwrap();
        kernel
            .add_link(
                "a-host",
                &LinkKind::Veth {
                    peer: "a-net".into(),
                    peer_namespace: Some("ns1".into()),
                },
            )
            .unwrap();
        assert_eq!(kernel.link_count(Some("ns1")), 1);

        NamespaceBackend::delete(&kernel, "ns1").unwrap();
        assert_eq!(kernel.link_count(None), 0);
    }

    #[test]
    fn enter_switches_and_restores_on_error() {
        let kernel = InMemoryKernel::new();
        NamespaceBackend::create(&kernel, "ns1").unwrap();
        let err = kernel
            .enter("ns1", &mut || {
                kernel.add_link("br0", &LinkKind::Bridge)?;
                Err(NetError::config("boom"))
            })
            .unwrap_err();
        assert!(matches!(err, NetError::Config { .. }));
        assert_eq!(kernel.current_namespace(), None);
        assert_eq!(kernel.link_count(Some("ns1")), 1);
        assert_eq!(kernel.link_count(None), 0);
    }

    #[test]
    fn injected_failure_fires_once() {
        let kernel = InMemoryKernel::new();
        kernel.fail_once(Op::AddLink, "br0");
        assert!(kernel.add_link("br0", &LinkKind::Bridge).is_err());
        kernel.add_link("br0", &LinkKind::Bridge).unwrap();
    }
}
