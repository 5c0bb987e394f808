//! Network lifecycle tests against the in-memory kernel and firewall.
//!
//! Covers:
//! 1. Provisioning order and the resulting topology
//! 2. Rollback when a step fails part way
//! 3. Execute isolation
//! 4. Connect/disconnect symmetry
//! 5. Destroy error aggregation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use guestnet_common::types::{LinkKind, LinkState, NetworkState};
use guestnet_core::NetError;
use guestnet_core::firewall::Firewall;
use guestnet_core::link::LinkManager;
use guestnet_core::namespace::{Network, NetworkBuilder};
use guestnet_core::sim::{InMemoryFirewall, InMemoryKernel, Op};
use ipnetwork::Ipv4Network;

fn net(s: &str) -> Ipv4Network {
    s.parse().unwrap()
}

struct Harness {
    kernel: Arc<InMemoryKernel>,
    firewall: Arc<InMemoryFirewall>,
}

impl Harness {
    fn new() -> Self {
        Self {
            kernel: Arc::new(InMemoryKernel::new()),
            firewall: Arc::new(InMemoryFirewall::new()),
        }
    }

    fn builder(&self) -> NetworkBuilder {
        NetworkBuilder::new()
            .name("vm1")
            .subnet(net("10.10.0.0/24"))
            .gateway(Ipv4Addr::new(10, 10, 0, 1))
            .bridge(Ipv4Addr::new(10, 10, 0, 2))
            .link_manager(self.kernel.clone())
            .namespaces(self.kernel.clone())
            .firewall(Firewall::new(self.firewall.clone()))
    }

    fn build(&self) -> Network {
        self.builder().build().expect("network should build")
    }

    fn assert_nothing_left(&self) {
        assert!(!self.kernel.has_namespace("vm1"));
        assert_eq!(self.kernel.link_count(None), 0);
        assert_eq!(self.kernel.current_namespace(), None);
    }
}

// ── Provisioning ─────────────────────────────────────────────────────

#[test]
fn build_wires_host_and_namespace() {
    let h = Harness::new();
    let network = h.build();
    assert_eq!(network.state(), NetworkState::Ready);

    assert_eq!(
        h.kernel.addresses(None, "vm1-host"),
        vec![net("10.10.0.1/24")]
    );
    assert_eq!(h.kernel.state(None, "vm1-host"), Some(LinkState::Up));

    let ns = Some("vm1");
    assert_eq!(h.kernel.kind(ns, "vm1"), Some(LinkKind::Bridge));
    assert_eq!(
        h.kernel.addresses(ns, "vm1"),
        vec![net("10.10.0.2/24")]
    );
    assert!(h.kernel.tx_offload_disabled(ns, "vm1"));
    assert_eq!(h.kernel.master(ns, "vm1-net").as_deref(), Some("vm1"));
    assert_eq!(h.kernel.state(ns, "vm1-net"), Some(LinkState::Up));
    assert_eq!(
        h.kernel.default_route(ns),
        Some(("vm1".to_owned(), Ipv4Addr::new(10, 10, 0, 1)))
    );
    assert_eq!(h.kernel.default_route(None), None);
    assert_eq!(h.kernel.current_namespace(), None);
}

#[test]
fn invalid_settings_touch_nothing() {
    let h = Harness::new();
    let err = h
        .builder()
        .bridge(Ipv4Addr::new(10, 99, 0, 2))
        .build()
        .unwrap_err();
    assert!(matches!(err, NetError::Config { .. }));
    h.assert_nothing_left();
}

// ── Rollback ─────────────────────────────────────────────────────────

#[test]
fn veth_failure_removes_new_namespace() {
    let h = Harness::new();
    h.kernel.fail_once(Op::AddLink, "vm1-host");
    let err = h.builder().build().unwrap_err();
    assert!(err.to_string().starts_with("failed to create veth pair vm1-host"));
    h.assert_nothing_left();
}

#[test]
fn veth_failure_keeps_preexisting_namespace() {
    let h = Harness::new();
    guestnet_core::namespace::NamespaceBackend::create(h.kernel.as_ref(), "vm1").unwrap();
    h.kernel.fail_once(Op::AddLink, "vm1-host");
    assert!(h.builder().build().is_err());
    assert!(h.kernel.has_namespace("vm1"));
}

#[test]
fn host_side_failure_destroys_everything() {
    for op in [Op::SetIp, Op::BringUp] {
        let h = Harness::new();
        h.kernel.fail_once(op, "vm1-host");
        assert!(h.builder().build().is_err(), "{op:?}");
        h.assert_nothing_left();
    }
}

#[test]
fn namespace_side_failures_destroy_everything() {
    let cases = [
        (Op::AddLink, "vm1", "failed to create bridge"),
        (Op::SetMaster, "vm1-net", "failed to set bridge master"),
        (Op::AddDefaultRoute, "vm1", "failed to set default route"),
        (Op::EnterNamespace, "vm1", "EnterNamespace"),
    ];
    for (op, name, expected) in cases {
        let h = Harness::new();
        h.kernel.fail_once(op, name);
        let msg = h.builder().build().unwrap_err().to_string();
        assert!(msg.contains(expected), "{op:?}: {msg}");
        h.assert_nothing_left();
    }
}

#[test]
fn failed_cleanup_is_reported_with_cause() {
    let h = Harness::new();
    h.kernel.fail_once(Op::AddDefaultRoute, "vm1");
    h.kernel.fail_once(Op::DeleteNamespace, "vm1");
    let err = h.builder().build().unwrap_err();
    assert!(matches!(err, NetError::Rollback { .. }));
    let msg = err.to_string();
    assert!(msg.contains("failed to set default route"), "{msg}");
    assert!(msg.contains("failed to delete namespace vm1"), "{msg}");
}

// ── Execute ──────────────────────────────────────────────────────────

#[test]
fn execute_runs_inside_and_returns_value() {
    let h = Harness::new();
    let network = h.build();
    let kernel = h.kernel.clone();

    let inside = network
        .execute(|| {
            kernel.add_link("tap0", &LinkKind::Tap)?;
            Ok(kernel.current_namespace())
        })
        .unwrap();

    assert_eq!(inside.as_deref(), Some("vm1"));
    assert_eq!(h.kernel.current_namespace(), None);
    assert_eq!(h.kernel.kind(Some("vm1"), "tap0"), Some(LinkKind::Tap));
    assert_eq!(h.kernel.kind(None, "tap0"), None);
}

#[test]
fn execute_restores_after_error_and_panic() {
    let h = Harness::new();
    let network = h.build();

    let err = network
        .execute(|| -> guestnet_core::Result<()> { Err(NetError::config("inner")) })
        .unwrap_err();
    assert!(err.to_string().contains("inner"));
    assert_eq!(h.kernel.current_namespace(), None);

    let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        network.execute(|| -> guestnet_core::Result<()> { panic!("boom") })
    }));
    assert!(panicked.is_err());
    assert_eq!(h.kernel.current_namespace(), None);
}

// ── Connect / disconnect ─────────────────────────────────────────────

#[test]
fn connect_then_disconnect_restores_ruleset() {
    let h = Harness::new();
    let network = h.build();
    Firewall::new(h.firewall.clone())
        .ensure_standard_tables()
        .unwrap();
    let before = h.firewall.snapshot();
    assert!(!before.is_empty());

    network.connect("eth0").unwrap();
    assert_eq!(h.firewall.rules_in("filter", "FORWARD").len(), 2);
    assert_eq!(h.firewall.rules_in("nat", "POSTROUTING").len(), 1);

    network.disconnect("eth0").unwrap();
    assert_eq!(h.firewall.snapshot(), before);
}

#[test]
fn connect_and_disconnect_leave_empty_firewall_empty() {
    let h = Harness::new();
    let network = h.build();

    let err = network.connect("eth0").unwrap_err();
    assert!(err.is_not_found(), "{err}");
    network.disconnect("eth0").unwrap();
    assert!(h.firewall.snapshot().is_empty());
}

#[test]
fn networks_do_not_disturb_each_other() {
    let h = Harness::new();
    Firewall::new(h.firewall.clone())
        .ensure_standard_tables()
        .unwrap();
    let first = h.build();
    let second = h
        .builder()
        .name("vm2")
        .subnet(net("10.20.0.0/24"))
        .gateway(Ipv4Addr::new(10, 20, 0, 1))
        .bridge(Ipv4Addr::new(10, 20, 0, 2))
        .build()
        .unwrap();

    first.connect("eth0").unwrap();
    second.connect("eth0").unwrap();
    first.disconnect("eth0").unwrap();

    let forward = h.firewall.rules_in("filter", "FORWARD");
    assert_eq!(forward.len(), 2);
    assert!(forward.iter().all(|r| r.contains("vm2-host")), "{forward:?}");
}

#[test]
fn disconnect_without_connect_is_harmless() {
    let h = Harness::new();
    let network = h.build();
    network.disconnect("eth0").unwrap();
    assert!(h.firewall.snapshot().is_empty());
}

// ── Destroy ──────────────────────────────────────────────────────────

#[test]
fn destroy_removes_everything_and_is_repeatable() {
    let h = Harness::new();
    let mut network = h.build();
    network.destroy().unwrap();
    assert_eq!(network.state(), NetworkState::Destroyed);
    h.assert_nothing_left();

    network.destroy().unwrap();
    assert!(network.connect("eth0").is_err());
}

#[test]
fn destroy_attempts_every_step() {
    let h = Harness::new();
    let mut network = h.build();
    h.kernel.fail_once(Op::DeleteLink, "vm1-host");
    h.kernel.fail_once(Op::DeleteNamespace, "vm1");

    match network.destroy().unwrap_err() {
        NetError::Multiple(errors) => {
            assert_eq!(errors.len(), 2);
            assert!(errors.iter().any(|e| e.to_string().contains("vm1-host")));
            assert!(errors.iter().any(|e| e.to_string().contains("namespace vm1")));
        }
        other => panic!("expected aggregate, got {other}"),
    }
}

#[test]
fn reopened_network_can_be_destroyed() {
    let h = Harness::new();
    let _ = h.build();

    let mut reopened = NetworkBuilder::new()
        .name("vm1")
        .link_manager(h.kernel.clone())
        .namespaces(h.kernel.clone())
        .firewall(Firewall::new(h.firewall.clone()))
        .open()
        .unwrap();
    assert_eq!(reopened.name(), "vm1");
    reopened.destroy().unwrap();
    h.assert_nothing_left();
}
