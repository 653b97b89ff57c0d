//! hostwall - host firewall policy compiler
//!
//! Compiles a declarative host policy (trusted admin sources, an overlay
//! tunnel, public services, NAT on the WAN) into nftables tables, chains,
//! sets and rules, and applies them atomically.
//!
//! # Architecture
//!
//! - [`core`] - Register-machine expressions, sets, rules, the policy
//!   compiler, the controller and the sinks it commits through
//! - [`config`] - Policy configuration file
//! - [`validators`] - Input validation and sanitization
//! - [`elevation`] - Resolving how `nft` gets run with privileges
//! - [`audit`] - Audit log of mutating operations
//! - [`utils`] - XDG directories
//!
//! # Safety Features
//!
//! - One kernel transaction per operation; a failed flush changes nothing
//! - Updates before the first apply are no-ops
//! - Cleanup keeps loopback and trusted admin access in place
//! - Namespace switches are scoped and restored on every exit path

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

pub use core::controller::{AddressSet, Firewall};
pub use core::error::{Error, Result};
