//! Core policy compilation and nftables interaction
//!
//! - [`expr`], [`primitives`], [`family`], [`conntrack`]: the register
//!   machine and family-correct match builders
//! - [`sets`], [`rule`], [`ruleset`]: tables, chains, sets and rules
//! - [`transaction`], [`netns`]: buffered declarations, one flush per
//!   operation, scoped namespace binding
//! - [`memory`], [`nft_json`]: the in-memory kernel model and the `nft` sink
//! - [`policy`], [`controller`]: the baseline policy and its lifecycle
//! - [`interp`]: replays installed rules against a synthetic packet
//! - [`discovery`]: default route and interface addresses

pub mod conntrack;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod expr;
pub mod family;
pub mod interp;
pub mod memory;
pub mod netns;
pub mod nft_json;
pub mod policy;
pub mod primitives;
pub mod rule;
pub mod ruleset;
pub mod sets;
pub mod transaction;

#[cfg(test)]
pub mod test_helpers;
