//! Isolated per-workload networks.
//!
//! A [`Network`] is a named network namespace joined to the host by a veth
//! pair. Inside the namespace a bridge of the same name carries the
//! namespace end of the veth and whatever taps the workload adds later.
//!
//! ```text
//!   host                         namespace <name>
//!   <name>-host (gateway ip) ==== <name>-net -- <name> (bridge ip)
//! ```

mod kernel;
mod network;

use guestnet_common::constants::{HOST_VETH_SUFFIX, NS_VETH_SUFFIX};
use guestnet_common::error::Result;

pub use kernel::KernelNamespaces;
pub use network::{Network, NetworkBuilder};

/// Named network namespace handling.
pub trait NamespaceBackend: Send + Sync {
    /// Creates the namespace. Creating an existing namespace succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the namespace.
    fn create(&self, name: &str) -> Result<()>;

    /// Deletes the namespace and every link inside it. Deleting a missing
    /// namespace succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be released.
    fn delete(&self, name: &str) -> Result<()>;

    /// Whether the namespace exists.
    ///
    /// # Errors
    ///
    /// Returns an error if existence cannot be determined.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Runs `f` inside the namespace. The caller's own namespace is the same
    /// before and after the call, whatever `f` does.
    ///
    /// # Errors
    ///
    /// Returns [`guestnet_common::error::NetError::NotFound`] for a missing
    /// namespace, an error if switching fails, and otherwise the result of
    /// `f`.
    fn enter(&self, name: &str, f: &mut (dyn FnMut() -> Result<()> + Send)) -> Result<()>;
}

/// Host end of the veth pair of network `name`.
pub fn host_link_name(name: &str) -> String {
    format!("{name}{HOST_VETH_SUFFIX}")
}

/// Namespace end of the veth pair of network `name`.
pub fn ns_link_name(name: &str) -> String {
    format!("{name}{NS_VETH_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_ends_are_suffixed() {
        assert_eq!(host_link_name("vm1"), "vm1-host");
        assert_eq!(ns_link_name("vm1"), "vm1-net");
    }
}
