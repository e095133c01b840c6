//! zonewall - zone firewall control plane
//!
//! Programs a two-zone nftables firewall over netlink and converges it on a
//! declarative spec, one network namespace ("region") at a time.
//!
//! # Architecture
//!
//! - [`core`] - Rule codec, chain topology, kernel access and the sync engine
//! - [`agent`] - Per-region reconcile loops
//! - [`audit`] - Audit logging for every kernel mutation
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Agent configuration
//! - [`utils`] - Utility functions (XDG directories, checksums)
//!
//! # Safety Features
//!
//! - Every sync step re-reads the kernel before changing it
//! - Each mutation commits in its own batch, so an interrupted pass resumes
//!   where it stopped
//! - Pair chains belong to the engine outright: a policy change clears the
//!   whole chain, foreign rules included. In Forward and the zone chains only
//!   interface jump rules of the engine's shape and jump target are deleted
//! - SHA-256 status checksums
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod audit;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::engine::Firewall;
pub use core::error::{Error, Result};
pub use core::model::{FirewallSpec, FirewallStatus, ZoneName, ZonePolicy};
