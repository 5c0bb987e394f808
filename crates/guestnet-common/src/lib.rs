//! # guestnet-common
//!
//! Shared error definitions, configuration model, constants and domain
//! types used across the guestnet workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and carries no kernel-facing code.

pub mod config;
pub mod constants;
pub mod error;
pub mod process;
pub mod types;
