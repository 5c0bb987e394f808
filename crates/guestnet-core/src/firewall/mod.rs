//! Firewall rule engine over nftables.
//!
//! Tables and chains are ensured idempotently: present objects are reused,
//! never replaced. Rules are not deduplicated. Callers add and remove them
//! in matching pairs, and removal deletes the first installed rule carrying
//! the same fingerprint.

mod nft;
pub mod rule;
pub mod table;

use std::fmt;
use std::sync::Arc;

use guestnet_common::error::{NetError, Result};
use guestnet_common::constants::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT, DNS_PORT};
use guestnet_common::types::Protocol;

pub use nft::NftBackend;
pub use rule::{
    ConnState, Match, Rule, RuleSet, Verdict, forward_outbound_rule, forward_return_traffic_rule,
    jump_rule, masquerade_rule, port_rule,
};
pub use table::{
    BaseChain, ChainConfig, ChainPolicy, ChainType, Hook, TableConfig, TableFamily, TableSpec,
    standard_filter_table, standard_nat_table,
};

use rule::{FILTER_TABLE, FORWARD_CHAIN, INPUT_CHAIN, NAT_TABLE, POSTROUTING_CHAIN};

/// A rule as currently installed in the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRule {
    /// Kernel handle, used for deletion.
    pub handle: u64,
    /// Rule comment, holding the fingerprint of rules installed by guestnet.
    pub comment: Option<String>,
}

/// Kernel packet-filter operations the engine needs.
pub trait FirewallBackend: Send + Sync {
    /// Lists every table.
    ///
    /// # Errors
    ///
    /// Returns an error if the ruleset cannot be read.
    fn tables(&self) -> Result<Vec<TableSpec>>;

    /// Lists the chain names of one table.
    ///
    /// # Errors
    ///
    /// Returns an error if the ruleset cannot be read.
    fn chains(&self, table: &TableSpec) -> Result<Vec<String>>;

    /// Creates a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the table.
    fn create_table(&self, table: &TableSpec) -> Result<()>;

    /// Creates a chain in `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the chain.
    fn create_chain(&self, table: &TableSpec, chain: &ChainConfig) -> Result<()>;

    /// Appends `rule` to its chain in `table`, with its fingerprint as
    /// comment.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the rule.
    fn append_rule(&self, table: &TableSpec, rule: &Rule) -> Result<()>;

    /// Lists the rules of one chain in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the ruleset cannot be read.
    fn rules(&self, table: &TableSpec, chain: &str) -> Result<Vec<InstalledRule>>;

    /// Deletes the rule with `handle` from a chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the deletion.
    fn delete_rule(&self, table: &TableSpec, chain: &str, handle: u64) -> Result<()>;
}

/// Entry point of the rule engine. Cheap to clone; holds no state besides
/// the backend.
#[derive(Clone)]
pub struct Firewall {
    backend: Arc<dyn FirewallBackend>,
}

impl fmt::Debug for Firewall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firewall").finish_non_exhaustive()
    }
}

impl Firewall {
    /// Creates an engine over `backend`.
    pub fn new(backend: Arc<dyn FirewallBackend>) -> Self {
        Self { backend }
    }

    /// Creates an engine over the system nftables.
    pub fn system() -> Self {
        Self::new(Arc::new(NftBackend::new()))
    }

    /// Ensures the standard filter and NAT tables with their base chains.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel cannot be queried or rejects a
    /// missing table or chain. Existing objects never cause an error.
    pub fn ensure_standard_tables(&self) -> Result<()> {
        self.ensure_table(&standard_filter_table())?;
        self.ensure_table(&standard_nat_table())
    }

    /// Ensures `config.spec` exists along with its chains.
    ///
    /// # Errors
    ///
    /// See [`Firewall::ensure_standard_tables`].
    pub fn ensure_table(&self, config: &TableConfig) -> Result<()> {
        let tables = self.backend.tables()?;
        if !tables.contains(&config.spec) {
            self.backend.create_table(&config.spec)?;
            tracing::info!(table = %config.spec, "table created");
        }
        for chain in &config.chains {
            let _ = self.new_chain(chain)?;
        }
        Ok(())
    }

    /// Returns the table holding the requested chain, creating the chain
    /// when it is missing and `config.create` is set.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] for an unnamed chain or table and
    /// [`NetError::NotFound`] when the table, or a chain that may not be
    /// created, is missing.
    pub fn new_chain(&self, config: &ChainConfig) -> Result<TableSpec> {
        if config.name.is_empty() || config.table.is_empty() {
            return Err(NetError::config("chain name and table must be specified"));
        }
        let table = self.find_table(&config.table)?;
        let chains = self.backend.chains(&table)?;
        if chains.iter().any(|c| *c == config.name) {
            return Ok(table);
        }
        if !config.create {
            return Err(NetError::NotFound {
                kind: "chain",
                name: format!("{} in table {}", config.name, config.table),
            });
        }
        self.backend.create_chain(&table, config)?;
        tracing::info!(table = %table, chain = %config.name, "chain created");
        Ok(table)
    }

    /// Makes `from` jump to `to`, creating `to` as a regular chain when
    /// missing. No second jump is added if one is already installed.
    ///
    /// # Errors
    ///
    /// Returns an error if `from` or the table is missing, or the kernel
    /// rejects a change.
    pub fn add_jump_rule(&self, from: &str, to: &str, table: &str) -> Result<()> {
        let spec = self.new_chain(&ChainConfig::existing(from, table))?;
        let _ = self.new_chain(&ChainConfig::regular(to, table))?;

        let rule = jump_rule(from, to, table);
        if self.find_installed(&spec, &rule)?.is_some() {
            tracing::debug!(from = %from, to = %to, "jump rule already installed");
            return Ok(());
        }
        self.backend.append_rule(&spec, &rule)?;
        tracing::info!(table = %spec, from = %from, to = %to, "jump rule added");
        Ok(())
    }

    /// Appends every rule in order.
    ///
    /// # Errors
    ///
    /// Returns the first failure. Rules added before it stay installed.
    pub fn add_rules(&self, rules: &RuleSet) -> Result<()> {
        for rule in rules {
            let table = self.find_table(&rule.table)?;
            self.backend
                .append_rule(&table, rule)
                .map_err(|e| e.context(format!("failed to add rule `{rule}` to {}", rule.chain)))?;
            tracing::debug!(table = %table, chain = %rule.chain, rule = %rule, "rule added");
        }
        tracing::info!(count = rules.len(), "rules added");
        Ok(())
    }

    /// Deletes the first installed match of every rule. Rules that are not
    /// installed are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first failure to read or delete.
    pub fn remove_rules(&self, rules: &RuleSet) -> Result<()> {
        for rule in rules {
            let table = match self.find_table(&rule.table) {
                Ok(table) => table,
                Err(e) if e.is_not_found() => {
                    tracing::debug!(table = %rule.table, rule = %rule, "table missing, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.find_installed(&table, rule)? {
                Some(handle) => {
                    self.backend
                        .delete_rule(&table, &rule.chain, handle)
                        .map_err(|e| e.context(format!("failed to remove rule `{rule}`")))?;
                    tracing::debug!(table = %table, chain = %rule.chain, rule = %rule, "rule removed");
                }
                None => {
                    tracing::debug!(chain = %rule.chain, rule = %rule, "rule not installed, skipping");
                }
            }
        }
        tracing::info!(count = rules.len(), "rules removed");
        Ok(())
    }

    /// Gives `bridge` outbound access through `host_if` and opens DNS and
    /// DHCP to it, using `<prefix>FORWARD` and `<prefix>INPUT` chains.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub fn configure_bridge(&self, bridge: &str, host_if: &str, prefix: &str) -> Result<()> {
        self.prepare_bridge_chains(prefix)?;
        self.add_rules(&bridge_rules(host_if, bridge, prefix)?)?;
        tracing::info!(bridge = %bridge, host_if = %host_if, "bridge firewall configured");
        Ok(())
    }

    /// Moves the rules of `bridge` from the `old` host interface to the
    /// `new` one. Either side may be absent.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub fn switch_host_interface(
        &self,
        old: Option<&str>,
        new: Option<&str>,
        bridge: &str,
        prefix: &str,
    ) -> Result<()> {
        self.prepare_bridge_chains(prefix)?;
        if let Some(old) = old.filter(|s| !s.is_empty()) {
            self.remove_rules(&bridge_rules(old, bridge, prefix)?)?;
        }
        if let Some(new) = new.filter(|s| !s.is_empty()) {
            self.add_rules(&bridge_rules(new, bridge, prefix)?)?;
        }
        tracing::info!(bridge = %bridge, old = ?old, new = ?new, "host interface switched");
        Ok(())
    }

    fn prepare_bridge_chains(&self, prefix: &str) -> Result<()> {
        self.ensure_standard_tables()?;
        self.add_jump_rule(FORWARD_CHAIN, &format!("{prefix}{FORWARD_CHAIN}"), FILTER_TABLE)?;
        self.add_jump_rule(INPUT_CHAIN, &format!("{prefix}{INPUT_CHAIN}"), FILTER_TABLE)
    }

    /// Resolves a table by name. When several families share the name the
    /// one used by the standard tables wins.
    fn find_table(&self, name: &str) -> Result<TableSpec> {
        let mut candidates: Vec<TableSpec> = self
            .backend
            .tables()?
            .into_iter()
            .filter(|t| t.name == name)
            .collect();
        let preferred = match name {
            FILTER_TABLE => Some(TableFamily::Inet),
            NAT_TABLE => Some(TableFamily::Ip),
            _ => None,
        };
        if let Some(pos) = candidates.iter().position(|t| Some(t.family) == preferred) {
            return Ok(candidates.swap_remove(pos));
        }
        candidates.into_iter().next().ok_or_else(|| NetError::NotFound {
            kind: "table",
            name: name.to_owned(),
        })
    }

    fn find_installed(&self, table: &TableSpec, rule: &Rule) -> Result<Option<u64>> {
        let fingerprint = rule.fingerprint();
        Ok(self
            .backend
            .rules(table, &rule.chain)?
            .into_iter()
            .find(|r| r.comment.as_deref() == Some(fingerprint.as_str()))
            .map(|r| r.handle))
    }
}

/// Rules wiring `bridge` to `host_if`: forwarding both ways, masquerade,
/// and DNS/DHCP access over UDP and TCP.
///
/// # Errors
///
/// Returns [`NetError::Config`] for invalid interface names.
pub fn bridge_rules(host_if: &str, bridge: &str, prefix: &str) -> Result<RuleSet> {
    let forward = format!("{prefix}{FORWARD_CHAIN}");
    let input = format!("{prefix}{INPUT_CHAIN}");

    let mut rules = vec![
        forward_outbound_rule(&forward, FILTER_TABLE, host_if, bridge),
        forward_return_traffic_rule(&forward, FILTER_TABLE, host_if, bridge),
        masquerade_rule(POSTROUTING_CHAIN, NAT_TABLE, host_if),
    ];
    for protocol in [Protocol::Udp, Protocol::Tcp] {
        for port in [DNS_PORT, DHCP_SERVER_PORT, DHCP_CLIENT_PORT] {
            rules.push(port_rule(port, protocol, &input, FILTER_TABLE));
        }
    }
    RuleSet::new(rules)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::sim::{FirewallOp, InMemoryFirewall};

    fn engine() -> (Arc<InMemoryFirewall>, Firewall) {
        let backend = Arc::new(InMemoryFirewall::new());
        (backend.clone(), Firewall::new(backend))
    }

    #[test]
    fn standard_tables_are_idempotent() {
        let (backend, fw) = engine();
        fw.ensure_standard_tables().unwrap();
        let first = backend.snapshot();
        fw.ensure_standard_tables().unwrap();
        assert_eq!(backend.snapshot(), first);
        assert!(backend.has_chain("filter", "FORWARD"));
        assert!(backend.has_chain("nat", "POSTROUTING"));
    }

    #[test]
    fn existing_chain_is_returned_untouched() {
        let (backend, fw) = engine();
        fw.ensure_standard_tables().unwrap();
        backend.fail_once(FirewallOp::CreateChain);
        let table = fw.new_chain(&ChainConfig::regular(FORWARD_CHAIN, FILTER_TABLE)).unwrap();
        assert_eq!(table.family, TableFamily::Inet);
    }

    #[test]
    fn missing_chain_without_create_fails() {
        let (_, fw) = engine();
        fw.ensure_standard_tables().unwrap();
        let err = fw
            .new_chain(&ChainConfig::existing("QEMU-FORWARD", FILTER_TABLE))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn missing_table_fails() {
        let (_, fw) = engine();
        let err = fw.new_chain(&ChainConfig::regular("X", "mangle")).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("table mangle"));
    }

    #[test]
    fn jump_rule_is_added_once() {
        let (backend, fw) = engine();
        fw.ensure_standard_tables().unwrap();
        fw.add_jump_rule(FORWARD_CHAIN, "QEMU-FORWARD", FILTER_TABLE).unwrap();
        fw.add_jump_rule(FORWARD_CHAIN, "QEMU-FORWARD", FILTER_TABLE).unwrap();

        assert!(backend.has_chain("filter", "QEMU-FORWARD"));
        assert_eq!(backend.rules_in("filter", FORWARD_CHAIN).len(), 1);
    }

    #[test]
    fn add_rules_stops_at_first_failure_without_rollback() {
        let (backend, fw) = engine();
        fw.ensure_standard_tables().unwrap();
        let rules = RuleSet::new([
            masquerade_rule(POSTROUTING_CHAIN, NAT_TABLE, "eth0"),
            masquerade_rule(POSTROUTING_CHAIN, NAT_TABLE, "eth1"),
            masquerade_rule(POSTROUTING_CHAIN, NAT_TABLE, "eth2"),
        ])
        .unwrap();
        backend.fail_on_append(2);

        assert!(fw.add_rules(&rules).is_err());
        assert_eq!(backend.rules_in("nat", POSTROUTING_CHAIN).len(), 1);
    }

    #[test]
    fn duplicate_rules_are_removed_one_at_a_time() {
        let (backend, fw) = engine();
        fw.ensure_standard_tables().unwrap();
        let rules = RuleSet::new([masquerade_rule(POSTROUTING_CHAIN, NAT_TABLE, "eth0")]).unwrap();
        fw.add_rules(&rules).unwrap();
        fw.add_rules(&rules).unwrap();
        assert_eq!(backend.rules_in("nat", POSTROUTING_CHAIN).len(), 2);

        fw.remove_rules(&rules).unwrap();
        assert_eq!(backend.rules_in("nat", POSTROUTING_CHAIN).len(), 1);
    }

    #[test]
    fn removing_absent_rule_is_a_no_op() {
        let (backend, fw) = engine();
        fw.ensure_standard_tables().unwrap();
        let before = backend.snapshot();
        let rules = RuleSet::new([masquerade_rule(POSTROUTING_CHAIN, NAT_TABLE, "eth0")]).unwrap();
        fw.remove_rules(&rules).unwrap();
        assert_eq!(backend.snapshot(), before);
    }

    #[test]
    fn bridge_rules_cover_dns_and_dhcp() {
        let rules = bridge_rules("eth0", "br0", "QEMU-").unwrap();
        assert_eq!(rules.len(), 9);
        let ports: Vec<String> = rules
            .iter()
            .filter(|r| r.chain == "QEMU-INPUT")
            .map(ToString::to_string)
            .collect();
        assert_eq!(ports.len(), 6);
        assert!(ports.contains(&"meta l4proto tcp th dport 67 accept".to_owned()));
    }

    #[test]
    fn configure_bridge_installs_jumps_and_rules() {
        let (backend, fw) = engine();
        fw.configure_bridge("br0", "eth0", "QEMU-").unwrap();

        assert_eq!(backend.rules_in("filter", "FORWARD").len(), 1);
        assert_eq!(backend.rules_in("filter", "INPUT").len(), 1);
        assert_eq!(backend.rules_in("filter", "QEMU-FORWARD").len(), 2);
        assert_eq!(backend.rules_in("filter", "QEMU-INPUT").len(), 6);
        assert_eq!(backend.rules_in("nat", "POSTROUTING").len(), 1);
    }

    #[test]
    fn switching_host_interface_moves_nat() {
        let (backend, fw) = engine();
        fw.configure_bridge("br0", "eth0", "QEMU-").unwrap();
        fw.switch_host_interface(Some("eth0"), Some("wlan0"), "br0", "QEMU-")
            .unwrap();

        let nat = backend.rules_in("nat", "POSTROUTING");
        assert_eq!(nat.len(), 1);
        assert!(nat[0].contains("oifname wlan0"), "got: {nat:?}");
        assert_eq!(backend.rules_in("filter", "QEMU-INPUT").len(), 6);
    }
}
