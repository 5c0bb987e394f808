//! nftables backend speaking the JSON API through `nft -j`.

use std::borrow::Cow;

use guestnet_common::error::{NetError, Result};
use guestnet_common::types::Protocol;
use nftables::batch::Batch;
use nftables::expr::{Expression, Meta, MetaKey, NamedExpression, Payload, PayloadField, CT};
use nftables::helper::{self, NftablesError};
use nftables::schema::{self, NfListObject, NfObject, Nftables};
use nftables::stmt::{JumpTarget, Match as NftMatch, Operator, Statement};
use nftables::types::{NfChainPolicy, NfChainType, NfFamily, NfHook};

use super::rule::{Match, Rule, Verdict};
use super::table::{ChainConfig, ChainPolicy, ChainType, Hook, TableFamily, TableSpec};
use super::{FirewallBackend, InstalledRule};

/// [`FirewallBackend`] over the system `nft` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct NftBackend;

impl NftBackend {
    /// Creates the backend.
    pub const fn new() -> Self {
        Self
    }

    fn ruleset() -> Result<Nftables<'static>> {
        helper::get_current_ruleset().map_err(nft_error("read nftables ruleset"))
    }

    fn apply(batch: Batch<'_>, operation: &str) -> Result<()> {
        helper::apply_ruleset(&batch.to_nftables()).map_err(nft_error(operation))
    }
}

impl FirewallBackend for NftBackend {
    fn tables(&self) -> Result<Vec<TableSpec>> {
        let ruleset = Self::ruleset()?;
        let mut tables = Vec::new();
        for object in ruleset.objects.iter() {
            let NfObject::ListObject(list) = object else {
                continue;
            };
            let list: &NfListObject<'_> = list;
            if let NfListObject::Table(table) = list {
                if let Some(family) = from_nf_family(table.family) {
                    tables.push(TableSpec::new(table.name.as_ref(), family));
                }
            }
        }
        Ok(tables)
    }

    fn chains(&self, table: &TableSpec) -> Result<Vec<String>> {
        let ruleset = Self::ruleset()?;
        let family = nf_family(table.family);
        let mut chains = Vec::new();
        for object in ruleset.objects.iter() {
            let NfObject::ListObject(list) = object else {
                continue;
            };
            let list: &NfListObject<'_> = list;
            if let NfListObject::Chain(chain) = list {
                if chain.family == family && chain.table == table.name.as_str() {
                    chains.push(chain.name.to_string());
                }
            }
        }
        Ok(chains)
    }

    fn create_table(&self, table: &TableSpec) -> Result<()> {
        let mut batch = Batch::new();
        batch.add(NfListObject::Table(
            schema::Table {
                family: nf_family(table.family),
                name: Cow::Owned(table.name.clone()),
                ..Default::default()
            }
            .into(),
        ));
        Self::apply(batch, &format!("create table {table}"))
    }

    fn create_chain(&self, table: &TableSpec, chain: &ChainConfig) -> Result<()> {
        let mut nft_chain = schema::Chain {
            family: nf_family(table.family),
            table: Cow::Owned(table.name.clone()),
            name: Cow::Owned(chain.name.clone()),
            ..Default::default()
        };
        if let Some(base) = chain.base {
            nft_chain._type = Some(match base.chain_type {
                ChainType::Filter => NfChainType::Filter,
                ChainType::Nat => NfChainType::NAT,
            });
            nft_chain.hook = Some(match base.hook {
                Hook::Prerouting => NfHook::Prerouting,
                Hook::Input => NfHook::Input,
                Hook::Forward => NfHook::Forward,
                Hook::Output => NfHook::Output,
                Hook::Postrouting => NfHook::Postrouting,
            });
            nft_chain.prio = Some(base.priority);
            nft_chain.policy = Some(match base.policy {
                ChainPolicy::Accept => NfChainPolicy::Accept,
                ChainPolicy::Drop => NfChainPolicy::Drop,
            });
        }

        let mut batch = Batch::new();
        batch.add(NfListObject::Chain(nft_chain.into()));
        Self::apply(batch, &format!("create chain {} in {table}", chain.name))
    }

    fn append_rule(&self, table: &TableSpec, rule: &Rule) -> Result<()> {
        let mut batch = Batch::new();
        batch.add(NfListObject::Rule(
            schema::Rule {
                family: nf_family(table.family),
                table: Cow::Owned(table.name.clone()),
                chain: Cow::Owned(rule.chain.clone()),
                expr: Cow::Owned(statements(rule)),
                comment: Some(Cow::Owned(rule.fingerprint())),
                ..Default::default()
            }
            .into(),
        ));
        Self::apply(batch, &format!("append rule to {}", rule.chain))
    }

    fn rules(&self, table: &TableSpec, chain: &str) -> Result<Vec<InstalledRule>> {
        let ruleset = Self::ruleset()?;
        let family = nf_family(table.family);
        let mut rules = Vec::new();
        for object in ruleset.objects.iter() {
            let NfObject::ListObject(list) = object else {
                continue;
            };
            let list: &NfListObject<'_> = list;
            let NfListObject::Rule(rule) = list else {
                continue;
            };
            if rule.family != family || rule.table != table.name.as_str() || rule.chain != chain {
                continue;
            }
            if let Some(handle) = rule.handle {
                rules.push(InstalledRule {
                    handle: u64::from(handle),
                    comment: rule.comment.as_ref().map(ToString::to_string),
                });
            }
        }
        Ok(rules)
    }

    fn delete_rule(&self, table: &TableSpec, chain: &str, handle: u64) -> Result<()> {
        let handle = u32::try_from(handle)
            .map_err(|_| NetError::config(format!("rule handle {handle} out of range")))?;
        let mut batch = Batch::new();
        batch.delete(NfListObject::Rule(
            schema::Rule {
                family: nf_family(table.family),
                table: Cow::Owned(table.name.clone()),
                chain: Cow::Owned(chain.to_owned()),
                handle: Some(handle),
                ..Default::default()
            }
            .into(),
        ));
        Self::apply(batch, &format!("delete rule {handle} from {chain}"))
    }
}

fn nft_error(operation: &str) -> impl FnOnce(NftablesError) -> NetError + '_ {
    move |e| NetError::kernel(operation, e)
}

const fn nf_family(family: TableFamily) -> NfFamily {
    match family {
        TableFamily::Inet => NfFamily::INet,
        TableFamily::Ip => NfFamily::IP,
    }
}

const fn from_nf_family(family: NfFamily) -> Option<TableFamily> {
    match family {
        NfFamily::INet => Some(TableFamily::Inet),
        NfFamily::IP => Some(TableFamily::Ip),
        _ => None,
    }
}

fn equals(left: Expression<'static>, right: Expression<'static>) -> Statement<'static> {
    Statement::Match(NftMatch {
        left,
        right,
        op: Operator::EQ,
    })
}

fn meta(key: MetaKey) -> Expression<'static> {
    Expression::Named(NamedExpression::Meta(Meta { key }))
}

fn text(value: &str) -> Expression<'static> {
    Expression::String(Cow::Owned(value.to_owned()))
}

/// Translates a rule into nftables statements, matches first.
fn statements(rule: &Rule) -> Vec<Statement<'static>> {
    let mut out: Vec<Statement<'static>> = rule
        .matches
        .iter()
        .map(|m| match m {
            Match::InputInterface(name) => equals(meta(MetaKey::Iifname), text(name)),
            Match::OutputInterface(name) => equals(meta(MetaKey::Oifname), text(name)),
            Match::ConnState(states) => Statement::Match(NftMatch {
                left: Expression::Named(NamedExpression::CT(CT {
                    key: Cow::Borrowed("state"),
                    family: None,
                    dir: None,
                })),
                right: Expression::List(states.iter().map(|s| text(s.as_str())).collect()),
                op: Operator::IN,
            }),
            Match::L4Proto(proto) => equals(
                meta(MetaKey::L4proto),
                text(match proto {
                    Protocol::Tcp => "tcp",
                    Protocol::Udp => "udp",
                }),
            ),
            Match::DestPort(port) => equals(
                Expression::Named(NamedExpression::Payload(Payload::PayloadField(
                    PayloadField {
                        protocol: Cow::Borrowed("th"),
                        field: Cow::Borrowed("dport"),
                    },
                ))),
                Expression::Number(u32::from(*port)),
            ),
        })
        .collect();

    out.push(match &rule.verdict {
        Verdict::Accept => Statement::Accept(None),
        Verdict::Jump(target) => Statement::Jump(JumpTarget {
            target: Cow::Owned(target.clone()),
        }),
        Verdict::Masquerade => Statement::Masquerade(None),
    });
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::firewall::rule::{
        FILTER_TABLE, NAT_TABLE, POSTROUTING_CHAIN, forward_return_traffic_rule, jump_rule,
        masquerade_rule, port_rule,
    };

    fn json(rule: &Rule) -> String {
        serde_json::to_string(&statements(rule)).unwrap()
    }

    #[test]
    fn verdict_comes_last() {
        let stmts = statements(&masquerade_rule(POSTROUTING_CHAIN, NAT_TABLE, "eth0"));
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts.last(), Some(Statement::Masquerade(None))));
    }

    #[test]
    fn interface_matches_use_meta_keys() {
        let out = json(&masquerade_rule(POSTROUTING_CHAIN, NAT_TABLE, "eth0"));
        assert!(out.contains("oifname"), "{out}");
        assert!(out.contains("\"eth0\""), "{out}");
    }

    #[test]
    fn conn_state_is_a_set_match() {
        let out = json(&forward_return_traffic_rule("FORWARD", FILTER_TABLE, "eth0", "br0"));
        assert!(out.contains("established"), "{out}");
        assert!(out.contains("related"), "{out}");
        assert!(out.contains("\"in\""), "{out}");
    }

    #[test]
    fn port_rule_matches_transport_header() {
        let out = json(&port_rule(67, Protocol::Udp, "QEMU-INPUT", FILTER_TABLE));
        assert!(out.contains("\"th\""), "{out}");
        assert!(out.contains("dport"), "{out}");
        assert!(out.contains("67"), "{out}");
    }

    #[test]
    fn jump_names_target() {
        let stmts = statements(&jump_rule("FORWARD", "QEMU-FORWARD", FILTER_TABLE));
        assert_eq!(stmts.len(), 1);
        match &stmts[0] {
            Statement::Jump(target) => assert_eq!(target.target, "QEMU-FORWARD"),
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn families_round_trip() {
        for family in [TableFamily::Inet, TableFamily::Ip] {
            assert_eq!(from_nf_family(nf_family(family)), Some(family));
        }
        assert_eq!(from_nf_family(NfFamily::IP6), None);
    }
}
