//! Rule model and the pure rule builders.
//!
//! Builders only describe rules; nothing touches the kernel until a
//! [`RuleSet`] is handed to [`super::Firewall::add_rules`]. Each rule has a
//! fingerprint, stored as the nftables comment, used to find it again for
//! removal.

use std::fmt;

use guestnet_common::constants::MAX_IFNAME_LEN;
use guestnet_common::error::{NetError, Result};
use guestnet_common::types::Protocol;

/// Name of the filter table.
pub const FILTER_TABLE: &str = "filter";
/// Name of the NAT table.
pub const NAT_TABLE: &str = "nat";
/// Input hook chain of the filter table.
pub const INPUT_CHAIN: &str = "INPUT";
/// Forward hook chain of the filter table.
pub const FORWARD_CHAIN: &str = "FORWARD";
/// Output hook chain of the filter table.
pub const OUTPUT_CHAIN: &str = "OUTPUT";
/// Prerouting hook chain of the NAT table.
pub const PREROUTING_CHAIN: &str = "PREROUTING";
/// Postrouting hook chain of the NAT table.
pub const POSTROUTING_CHAIN: &str = "POSTROUTING";

/// Prefix of every fingerprint, marking rules installed by guestnet.
const FINGERPRINT_PREFIX: &str = "guestnet:";

/// Connection-tracking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Packet belongs to a known connection.
    Established,
    /// Packet opens a connection related to a known one.
    Related,
}

impl ConnState {
    /// Lower-case nftables keyword.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Established => "established",
            Self::Related => "related",
        }
    }
}

/// Match criterion of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Match {
    /// `iifname <name>`
    InputInterface(String),
    /// `oifname <name>`
    OutputInterface(String),
    /// `ct state { .. }`
    ConnState(Vec<ConnState>),
    /// `meta l4proto <proto>`
    L4Proto(Protocol),
    /// `th dport <port>`
    DestPort(u16),
}

/// What happens to a matching packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Accept the packet.
    Accept,
    /// Continue evaluation in another chain.
    Jump(String),
    /// Rewrite the source address to the one of the egress interface.
    Masquerade,
}

/// A rule appended to one chain of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    /// Table name.
    pub table: String,
    /// Chain name.
    pub chain: String,
    /// Criteria, all of which must match.
    pub matches: Vec<Match>,
    /// Verdict applied on match.
    pub verdict: Verdict,
}

impl Rule {
    /// Stable identity of the rule within its chain.
    pub fn fingerprint(&self) -> String {
        format!("{FINGERPRINT_PREFIX} {self}")
    }

    fn validate(&self) -> Result<()> {
        if self.table.is_empty() || self.chain.is_empty() {
            return Err(NetError::config("chain name and table must be specified"));
        }
        for m in &self.matches {
            match m {
                Match::InputInterface(name) | Match::OutputInterface(name) => {
                    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
                        return Err(NetError::config(format!(
                            "invalid interface name {name:?} in rule for chain {}",
                            self.chain
                        )));
                    }
                }
                Match::DestPort(0) => {
                    return Err(NetError::config(format!(
                        "port 0 in rule for chain {}",
                        self.chain
                    )));
                }
                Match::ConnState(states) if states.is_empty() => {
                    return Err(NetError::config("empty connection state match"));
                }
                _ => {}
            }
        }
        if let Verdict::Jump(target) = &self.verdict {
            if target.is_empty() {
                return Err(NetError::config("jump target must be specified"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.matches {
            match m {
                Match::InputInterface(name) => write!(f, "iifname {name} ")?,
                Match::OutputInterface(name) => write!(f, "oifname {name} ")?,
                Match::ConnState(states) => {
                    let joined: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
                    write!(f, "ct state {} ", joined.join(","))?;
                }
                Match::L4Proto(proto) => write!(f, "meta l4proto {proto} ")?,
                Match::DestPort(port) => write!(f, "th dport {port} ")?,
            }
        }
        match &self.verdict {
            Verdict::Accept => f.write_str("accept"),
            Verdict::Jump(target) => write!(f, "jump {target}"),
            Verdict::Masquerade => f.write_str("masquerade"),
        }
    }
}

/// Validated batch of rules, applied and removed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet(Vec<Rule>);

impl RuleSet {
    /// Validates `rules` into a batch.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] if a rule lacks a table or chain, names an
    /// invalid interface, matches port 0 or jumps nowhere.
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Result<Self> {
        let rules: Vec<Rule> = rules.into_iter().collect();
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self(rules))
    }

    /// Iterates over the rules in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.0.iter()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Accepts traffic entering from `workload_if` and leaving through `host_if`.
pub fn forward_outbound_rule(chain: &str, table: &str, host_if: &str, workload_if: &str) -> Rule {
    Rule {
        table: table.to_owned(),
        chain: chain.to_owned(),
        matches: vec![
            Match::InputInterface(workload_if.to_owned()),
            Match::OutputInterface(host_if.to_owned()),
        ],
        verdict: Verdict::Accept,
    }
}

/// Accepts established and related traffic coming back from `host_if`
/// towards `workload_if`.
pub fn forward_return_traffic_rule(
    chain: &str,
    table: &str,
    host_if: &str,
    workload_if: &str,
) -> Rule {
    Rule {
        table: table.to_owned(),
        chain: chain.to_owned(),
        matches: vec![
            Match::InputInterface(host_if.to_owned()),
            Match::OutputInterface(workload_if.to_owned()),
            Match::ConnState(vec![ConnState::Established, ConnState::Related]),
        ],
        verdict: Verdict::Accept,
    }
}

/// Masquerades traffic leaving through `host_if`.
pub fn masquerade_rule(chain: &str, table: &str, host_if: &str) -> Rule {
    Rule {
        table: table.to_owned(),
        chain: chain.to_owned(),
        matches: vec![Match::OutputInterface(host_if.to_owned())],
        verdict: Verdict::Masquerade,
    }
}

/// Accepts traffic to `port` over `protocol`.
pub fn port_rule(port: u16, protocol: Protocol, chain: &str, table: &str) -> Rule {
    Rule {
        table: table.to_owned(),
        chain: chain.to_owned(),
        matches: vec![Match::L4Proto(protocol), Match::DestPort(port)],
        verdict: Verdict::Accept,
    }
}

/// Unconditional jump from `from` to `to`.
pub fn jump_rule(from: &str, to: &str, table: &str) -> Rule {
    Rule {
        table: table.to_owned(),
        chain: from.to_owned(),
        matches: Vec::new(),
        verdict: Verdict::Jump(to.to_owned()),
    }
}
