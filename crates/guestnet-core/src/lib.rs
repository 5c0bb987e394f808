//! # guestnet-core
//!
//! Kernel networking primitives for isolating a single workload.
//!
//! This crate provides:
//! - **Addressing**: first usable host address and range validation.
//! - **Links**: the [`link::LinkManager`] capability over bridges, taps and
//!   veth pairs, with rollback-safe bridge and tap builders.
//! - **Routes**: default interface lookup and a change watcher.
//! - **Firewall**: idempotent nftables tables/chains and composable
//!   forward/NAT/port rules.
//! - **Namespaces**: the [`namespace::Network`] lifecycle tying all of the
//!   above into one handle.
//!
//! Every kernel-facing capability sits behind a trait. The [`sim`] module
//! holds in-memory implementations used by the tests.

pub mod address;
pub mod firewall;
pub mod link;
pub mod namespace;
pub mod route;
pub mod sim;

pub use guestnet_common::error::{ErrorList, NetError, Result};
