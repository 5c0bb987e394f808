//! Table and chain descriptions, and the two standard tables.

use std::fmt;

use super::rule::{
    FILTER_TABLE, FORWARD_CHAIN, INPUT_CHAIN, NAT_TABLE, OUTPUT_CHAIN, POSTROUTING_CHAIN,
    PREROUTING_CHAIN,
};

/// Standard priority of filter base chains.
pub const PRIORITY_FILTER: i32 = 0;
/// Standard priority of destination NAT base chains.
pub const PRIORITY_NAT_DEST: i32 = -100;
/// Standard priority of source NAT base chains.
pub const PRIORITY_NAT_SOURCE: i32 = 100;

/// Address family of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableFamily {
    /// IPv4 and IPv6.
    Inet,
    /// IPv4 only.
    Ip,
}

impl fmt::Display for TableFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inet => "inet",
            Self::Ip => "ip",
        })
    }
}

/// A table as the kernel identifies it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableSpec {
    /// Table name.
    pub name: String,
    /// Table family.
    pub family: TableFamily,
}

impl TableSpec {
    /// Describes a table.
    pub fn new(name: impl Into<String>, family: TableFamily) -> Self {
        Self {
            name: name.into(),
            family,
        }
    }
}

impl fmt::Display for TableSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.name)
    }
}

/// Type of a base chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainType {
    /// Packet filtering.
    Filter,
    /// Address translation.
    Nat,
}

/// Netfilter hook a base chain is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Before routing.
    Prerouting,
    /// Packets for the local host.
    Input,
    /// Routed packets.
    Forward,
    /// Packets from the local host.
    Output,
    /// After routing.
    Postrouting,
}

/// Default verdict of a base chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainPolicy {
    /// Accept packets no rule decided on.
    Accept,
    /// Drop packets no rule decided on.
    Drop,
}

/// Hook attachment of a base chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BaseChain {
    /// Chain type.
    pub chain_type: ChainType,
    /// Hook.
    pub hook: Hook,
    /// Priority at the hook.
    pub priority: i32,
    /// Default verdict.
    pub policy: ChainPolicy,
}

/// Request for a chain.
///
/// With `create` unset the chain must already exist. With `create` set a
/// missing chain is created, as a base chain when `base` is given and as a
/// regular chain (only reachable through jumps) otherwise. An existing
/// chain is never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    /// Chain name.
    pub name: String,
    /// Table name.
    pub table: String,
    /// Create the chain when missing.
    pub create: bool,
    /// Hook attachment for a new base chain.
    pub base: Option<BaseChain>,
}

impl ChainConfig {
    /// A chain that must already exist.
    pub fn existing(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            create: false,
            base: None,
        }
    }

    /// A regular chain, created when missing.
    pub fn regular(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            create: true,
            ..Self::existing(name, table)
        }
    }

    /// A base chain, created when missing.
    pub fn base(name: impl Into<String>, table: impl Into<String>, base: BaseChain) -> Self {
        Self {
            create: true,
            base: Some(base),
            ..Self::existing(name, table)
        }
    }
}

/// A table together with the chains it must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    /// Table identity.
    pub spec: TableSpec,
    /// Chains to ensure.
    pub chains: Vec<ChainConfig>,
}

fn accept(chain_type: ChainType, hook: Hook, priority: i32) -> BaseChain {
    BaseChain {
        chain_type,
        hook,
        priority,
        policy: ChainPolicy::Accept,
    }
}

/// `inet filter` with accepting `INPUT`, `FORWARD` and `OUTPUT` chains.
pub fn standard_filter_table() -> TableConfig {
    TableConfig {
        spec: TableSpec::new(FILTER_TABLE, TableFamily::Inet),
        chains: vec![
            ChainConfig::base(
                INPUT_CHAIN,
                FILTER_TABLE,
                accept(ChainType::Filter, Hook::Input, PRIORITY_FILTER),
            ),
            ChainConfig::base(
                FORWARD_CHAIN,
                FILTER_TABLE,
                accept(ChainType::Filter, Hook::Forward, PRIORITY_FILTER),
            ),
            ChainConfig::base(
                OUTPUT_CHAIN,
                FILTER_TABLE,
                accept(ChainType::Filter, Hook::Output, PRIORITY_FILTER),
            ),
        ],
    }
}

/// `ip nat` with accepting `PREROUTING` and `POSTROUTING` chains.
pub fn standard_nat_table() -> TableConfig {
    TableConfig {
        spec: TableSpec::new(NAT_TABLE, TableFamily::Ip),
        chains: vec![
            ChainConfig::base(
                PREROUTING_CHAIN,
                NAT_TABLE,
                accept(ChainType::Nat, Hook::Prerouting, PRIORITY_NAT_DEST),
            ),
            ChainConfig::base(
                POSTROUTING_CHAIN,
                NAT_TABLE,
                accept(ChainType::Nat, Hook::Postrouting, PRIORITY_NAT_SOURCE),
            ),
        ],
    }
}
