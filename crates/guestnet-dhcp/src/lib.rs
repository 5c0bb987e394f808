//! # guestnet-dhcp
//!
//! Configures and supervises the DHCP lease server of a guest network.
//! The lease engine itself is external; this crate hands it the server
//! identity, lease range, router and DNS servers and owns its lifetime.

pub mod config;
pub mod coredhcp;
pub mod server;

pub use config::DhcpConfig;
pub use coredhcp::CoreDhcpEngine;
pub use server::{DhcpServer, LeaseEngine, LeaseServer};
