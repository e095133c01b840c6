//! Zone firewall engine
//!
//! This module contains everything between a desired zone state and the
//! kernel ruleset:
//!
//! - [`expr`]: rule expressions
//! - [`rule`]: tagged rules and their classification by signature
//! - [`templates`]: the catalogue of rule shapes the engine installs
//! - [`topology`]: the fixed chain graph and its jump wiring
//! - [`policy`]: zone policy to rule sequence mapping
//! - [`backend`], [`netlink`], [`netns`], [`memory`]: ruleset access, live
//!   and in-memory
//! - [`reader`], [`sync`]: read-back and convergence
//! - [`engine`]: namespace-bound entry points
//! - [`model`], [`store`], [`reconcile`]: declarative documents and the
//!   reconcile pass
//! - [`error`]: error types for firewall operations

pub mod backend;
pub mod engine;
pub mod error;
pub mod expr;
pub mod memory;
pub mod model;
pub mod netlink;
pub mod netns;
pub mod policy;
pub mod reader;
pub mod reconcile;
pub mod rule;
pub mod store;
pub mod sync;
pub mod templates;
pub mod topology;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
