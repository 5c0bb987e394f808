//! Kernel link management.
//!
//! [`LinkManager`] is the narrow capability the rest of the crate uses to
//! touch network links. [`NetlinkLinkManager`] drives the kernel; the
//! in-memory [`crate::sim::InMemoryKernel`] stands in for it in tests.
//!
//! The builders in this module create a link and configure it in several
//! steps. A failure after the link exists deletes it again before the error
//! is returned, so no half-configured link is left behind.

mod netlink;
mod tap;

use std::net::Ipv4Addr;

use guestnet_common::error::{NetError, Result};
use guestnet_common::types::LinkKind;
use ipnetwork::Ipv4Network;

use crate::address::first_usable_address;

pub use netlink::NetlinkLinkManager;
pub(crate) use netlink::{link_name, run_netlink};

/// Capability surface over kernel link operations.
///
/// Implementations hold no state of their own beyond configuration; every
/// call re-reads the kernel, so one manager may be shared across threads
/// and namespaces.
pub trait LinkManager: Send + Sync {
    /// Creates a link.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::AlreadyExists`] when a link with this name is
    /// present, or another error if the kernel rejects the request.
    fn add_link(&self, name: &str, kind: &LinkKind) -> Result<()>;

    /// Assigns `address` (host address and prefix) to the link.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is missing or the kernel call fails.
    fn set_ip(&self, name: &str, address: Ipv4Network) -> Result<()>;

    /// Whether a link with this name exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel cannot be queried.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Enslaves the link to the bridge `master`.
    ///
    /// # Errors
    ///
    /// Returns an error if either link is missing or the kernel call fails.
    fn set_master(&self, name: &str, master: &str) -> Result<()>;

    /// Sets the link administratively up.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is missing or the kernel call fails.
    fn bring_up(&self, name: &str) -> Result<()>;

    /// Whether the link carries exactly this address and prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is missing or the kernel call fails.
    fn has_ip(&self, name: &str, address: Ipv4Network) -> Result<bool>;

    /// Deletes the link. Deleting a missing link succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the deletion.
    fn delete_link(&self, name: &str) -> Result<()>;

    /// Turns transmit checksum offloading off for the link.
    ///
    /// # Errors
    ///
    /// Returns an error if the offload setting cannot be changed.
    fn disable_tx_offloading(&self, name: &str) -> Result<()>;

    /// Installs an IPv4 default route via `gateway` through the link.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is missing or the route is rejected.
    fn add_default_route(&self, name: &str, gateway: Ipv4Addr) -> Result<()>;
}

/// Creates and configures a bridge carrying the first usable address of
/// `cidr`, e.g. `192.168.100.0/24` gives the bridge `192.168.100.1/24`.
///
/// An existing bridge that already carries the address is left untouched.
/// Only a bridge created by this call is deleted again on failure.
///
/// # Errors
///
/// Returns [`NetError::Config`] when `cidr` does not parse or holds no usable
/// address, and the failing step otherwise. When cleanup also fails the
/// error is a [`NetError::Rollback`] naming both causes.
pub fn create_bridge(
    links: &dyn LinkManager,
    name: &str,
    cidr: &str,
    disable_tx_offload: bool,
) -> Result<()> {
    let network: Ipv4Network = cidr
        .parse()
        .map_err(|e| NetError::config(format!("failed to parse subnet {cidr}: {e}")))?;
    let ip = first_usable_address(network)
        .ok_or_else(|| NetError::config(format!("subnet {cidr} has no usable address")))?;
    let address = Ipv4Network::new(ip, network.prefix())
        .map_err(|e| NetError::config(format!("invalid bridge address {ip}: {e}")))?;

    create_bridge_with_address(links, name, address, disable_tx_offload)
}

/// Creates and configures a bridge carrying exactly `address`.
///
/// # Errors
///
/// See [`create_bridge`].
pub fn create_bridge_with_address(
    links: &dyn LinkManager,
    name: &str,
    address: Ipv4Network,
    disable_tx_offload: bool,
) -> Result<()> {
    let created = match links.add_link(name, &LinkKind::Bridge) {
        Ok(()) => true,
        Err(e) if e.is_already_exists() => {
            tracing::debug!(bridge = %name, "bridge already exists");
            let present = links
                .has_ip(name, address)
                .map_err(|e| e.context("failed to list interface addresses"))?;
            if present {
                return Ok(());
            }
            false
        }
        Err(e) => return Err(e.context(format!("failed to add bridge {name}"))),
    };
    let fail = |e: NetError| {
        if created {
            undo(links, name, e, "failed to delete link")
        } else {
            e
        }
    };

    if let Err(e) = links.set_ip(name, address) {
        return Err(fail(e.context("failed to set ip")));
    }
    if let Err(e) = links.bring_up(name) {
        return Err(fail(e.context(format!("failed to bring bridge {name} up"))));
    }
    if disable_tx_offload {
        if let Err(e) = links.disable_tx_offloading(name) {
            return Err(fail(e.context("failed to disable tx offloading")));
        }
    }

    tracing::info!(bridge = %name, address = %address, "bridge created");
    Ok(())
}

/// Creates a tap device enslaved to `bridge` and brings it up. An existing
/// tap is only brought up, and is never deleted on failure.
///
/// # Errors
///
/// Returns the failing step. A newly created tap is deleted again on
/// failure; when that also fails the error is a [`NetError::Rollback`].
pub fn create_tap(links: &dyn LinkManager, name: &str, bridge: &str) -> Result<()> {
    let exists = links
        .exists(name)
        .map_err(|e| e.context("unexpected error checking link"))?;

    if !exists {
        links
            .add_link(name, &LinkKind::Tap)
            .map_err(|e| e.context(format!("failed to add tap device {name}")))?;

        if let Err(e) = links.set_master(name, bridge) {
            return Err(undo(
                links,
                name,
                e.context(format!("failed to set master for tap {name}")),
                "failed to delete tap",
            ));
        }
    }

    if let Err(e) = links.bring_up(name) {
        let e = e.context(format!("failed to bring tap {name} up"));
        if exists {
            return Err(e);
        }
        return Err(undo(links, name, e, "failed to delete tap"));
    }

    tracing::info!(tap = %name, bridge = %bridge, "tap added");
    Ok(())
}

/// Deletes `name` after `primary` occurred, joining any deletion failure.
fn undo(links: &dyn LinkManager, name: &str, primary: NetError, what: &str) -> NetError {
    match links.delete_link(name) {
        Ok(()) => primary,
        Err(rollback) => {
            tracing::warn!(link = %name, error = %rollback, "rollback failed");
            primary.with_rollback(rollback.context(what))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use guestnet_common::types::LinkState;

    use super::*;
    use crate::sim::{InMemoryKernel, Op};

    fn addr(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn bridge_gets_first_usable_address() {
        let kernel = InMemoryKernel::new();
        create_bridge(&kernel, "br0", "192.168.100.0/24", true).unwrap();

        assert_eq!(kernel.addresses(None, "br0"), vec![addr("192.168.100.1/24")]);
        assert_eq!(kernel.state(None, "br0"), Some(LinkState::Up));
        assert!(kernel.tx_offload_disabled(None, "br0"));
    }

    #[test]
    fn bridge_creation_is_idempotent() {
        let kernel = InMemoryKernel::new();
        create_bridge(&kernel, "br0", "10.0.0.0/24", false).unwrap();
        create_bridge(&kernel, "br0", "10.0.0.0/24", false).unwrap();

        assert_eq!(kernel.link_count(None), 1);
        assert_eq!(kernel.addresses(None, "br0"), vec![addr("10.0.0.1/24")]);
    }

    #[test]
    fn existing_bridge_without_address_is_configured() {
        let kernel = InMemoryKernel::new();
        kernel.add_link("br0", &LinkKind::Bridge).unwrap();
        create_bridge(&kernel, "br0", "10.0.0.0/24", false).unwrap();
        assert_eq!(kernel.addresses(None, "br0"), vec![addr("10.0.0.1/24")]);
    }

    #[test]
    fn invalid_cidr_touches_nothing() {
        let kernel = InMemoryKernel::new();
        let err = create_bridge(&kernel, "br0", "not-a-cidr", false).unwrap_err();
        assert!(matches!(err, NetError::Config { .. }));
        assert_eq!(kernel.link_count(None), 0);
    }

    #[test]
    fn add_link_failure_is_annotated() {
        let kernel = InMemoryKernel::new();
        kernel.fail_once(Op::AddLink, "br0");
        let msg = create_bridge(&kernel, "br0", "10.0.0.0/24", false)
            .unwrap_err()
            .to_string();
        assert!(msg.starts_with("failed to add bridge br0: "), "got: {msg}");
    }

    #[test]
    fn failed_bring_up_deletes_bridge() {
        let kernel = InMemoryKernel::new();
        kernel.fail_once(Op::BringUp, "br0");

        let err = create_bridge(&kernel, "br0", "10.0.0.0/24", false).unwrap_err();
        assert!(err.to_string().starts_with("failed to bring bridge br0 up: "));
        assert!(!kernel.exists("br0").unwrap());
    }

    #[test]
    fn failed_rollback_reports_both_errors() {
        let kernel = InMemoryKernel::new();
        kernel.fail_once(Op::BringUp, "br0");
        kernel.fail_once(Op::DeleteLink, "br0");

        let err = create_bridge(&kernel, "br0", "10.0.0.0/24", false).unwrap_err();
        assert!(matches!(err, NetError::Rollback { .. }));
        let msg = err.to_string();
        assert!(msg.contains("failed to bring bridge br0 up"), "got: {msg}");
        assert!(msg.contains("failed to delete link"), "got: {msg}");
    }

    #[test]
    fn failed_set_ip_deletes_bridge() {
        let kernel = InMemoryKernel::new();
        kernel.fail_once(Op::SetIp, "br0");

        let msg = create_bridge(&kernel, "br0", "10.0.0.0/24", false)
            .unwrap_err()
            .to_string();
        assert!(msg.starts_with("failed to set ip: "), "got: {msg}");
        assert!(!kernel.exists("br0").unwrap());
    }

    #[test]
    fn failed_tx_offload_deletes_bridge() {
        let kernel = InMemoryKernel::new();
        kernel.fail_once(Op::DisableTxOffload, "br0");

        let msg = create_bridge(&kernel, "br0", "10.0.0.0/24", true)
            .unwrap_err()
            .to_string();
        assert!(msg.starts_with("failed to disable tx offloading: "), "got: {msg}");
        assert!(!kernel.exists("br0").unwrap());
    }

    #[test]
    fn failure_keeps_preexisting_bridge() {
        let kernel = InMemoryKernel::new();
        kernel.add_link("br0", &LinkKind::Bridge).unwrap();
        kernel.fail_once(Op::SetIp, "br0");

        assert!(create_bridge(&kernel, "br0", "10.0.0.0/24", false).is_err());
        assert!(kernel.exists("br0").unwrap());
    }

    #[test]
    fn failure_keeps_preexisting_tap() {
        let kernel = InMemoryKernel::new();
        create_bridge(&kernel, "br0", "10.0.0.0/24", false).unwrap();
        create_tap(&kernel, "tap0", "br0").unwrap();
        kernel.fail_once(Op::BringUp, "tap0");

        let msg = create_tap(&kernel, "tap0", "br0").unwrap_err().to_string();
        assert!(msg.starts_with("failed to bring tap tap0 up: "), "got: {msg}");
        assert!(kernel.exists("tap0").unwrap());
    }

    #[test]
    fn tap_is_enslaved_and_up() {
        let kernel = InMemoryKernel::new();
        create_bridge(&kernel, "br0", "10.0.0.0/24", false).unwrap();
        create_tap(&kernel, "tap0", "br0").unwrap();

        assert_eq!(kernel.master(None, "tap0").as_deref(), Some("br0"));
        assert_eq!(kernel.state(None, "tap0"), Some(LinkState::Up));
    }

    #[test]
    fn tap_creation_is_idempotent() {
        let kernel = InMemoryKernel::new();
        create_bridge(&kernel, "br0", "10.0.0.0/24", false).unwrap();
        create_tap(&kernel, "tap0", "br0").unwrap();
        create_tap(&kernel, "tap0", "br0").unwrap();
        assert_eq!(kernel.link_count(None), 2);
    }

    #[test]
    fn tap_without_bridge_is_removed() {
        let kernel = InMemoryKernel::new();
        let msg = create_tap(&kernel, "tap0", "missing").unwrap_err().to_string();
        assert!(msg.starts_with("failed to set master for tap tap0: "), "got: {msg}");
        assert!(!kernel.exists("tap0").unwrap());
    }

    #[test]
    fn tap_rollback_failure_names_the_tap() {
        let kernel = InMemoryKernel::new();
        create_bridge(&kernel, "br0", "10.0.0.0/24", false).unwrap();
        kernel.fail_once(Op::BringUp, "tap0");
        kernel.fail_once(Op::DeleteLink, "tap0");

        let msg = create_tap(&kernel, "tap0", "br0").unwrap_err().to_string();
        assert!(msg.contains("failed to bring tap tap0 up"), "got: {msg}");
        assert!(msg.contains("failed to delete tap"), "got: {msg}");
    }

    #[test]
    fn tap_exists_check_failure_is_reported() {
        let kernel = InMemoryKernel::new();
        kernel.fail_once(Op::Exists, "tap0");
        let msg = create_tap(&kernel, "tap0", "br0").unwrap_err().to_string();
        assert!(msg.starts_with("unexpected error checking link: "), "got: {msg}");
    }
}
