//! # guestnet-dns
//!
//! DNS for guest networks. The failover forwarder answers queries from
//! the upstreams listed in the host resolver configuration, trying them in
//! order and following the file as it changes. CoreDNS can be run instead,
//! driven by a generated Corefile.

pub mod client;
pub mod corefile;
pub mod forwarder;
pub mod handler;
pub mod resolv;

pub use corefile::CoreDnsServer;
pub use forwarder::{DnsFailoverForwarder, ForwarderConfig};

/// A running DNS backend.
pub trait DnsService: Send + Sync {
    /// Shuts the service down. Only the first call has an effect.
    fn stop(&self);
}
