//! Connection-tracking state bits
//!
//! The kernel exposes ct state as a 4-byte host-endian bitmask. Rules match
//! it by masking against a combination of the bits below and checking the
//! result is non-zero.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

use super::error::{Error, Result};

pub const CT_STATE_LEN: u32 = 4;

pub const CT_INVALID: u32 = 1;
pub const CT_ESTABLISHED: u32 = 2;
pub const CT_RELATED: u32 = 4;
pub const CT_NEW: u32 = 8;
pub const CT_UNTRACKED: u32 = 64;

const ALL_BITS: u32 = CT_INVALID | CT_ESTABLISHED | CT_RELATED | CT_NEW | CT_UNTRACKED;

const NAMES: [(u32, &str); 5] = [
    (CT_INVALID, "invalid"),
    (CT_ESTABLISHED, "established"),
    (CT_RELATED, "related"),
    (CT_NEW, "new"),
    (CT_UNTRACKED, "untracked"),
];

/// Validated, non-empty combination of ct state bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct CtState(u32);

pub const STATE_NEW: CtState = CtState(CT_NEW);
pub const STATE_ESTABLISHED: CtState = CtState(CT_ESTABLISHED);
pub const STATE_NEW_ESTABLISHED: CtState = CtState(CT_NEW | CT_ESTABLISHED);
pub const STATE_ESTABLISHED_RELATED: CtState = CtState(CT_ESTABLISHED | CT_RELATED);

impl CtState {
    pub fn new(mask: u32) -> Result<Self> {
        if mask == 0 {
            return Err(Error::validation("ct_state", "mask must not be empty"));
        }
        if mask & !ALL_BITS != 0 {
            return Err(Error::validation(
                "ct_state",
                format!("mask {mask:#x} contains undefined bits {:#x}", mask & !ALL_BITS),
            ));
        }
        Ok(Self(mask))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: CtState) -> bool {
        self.0 & other.0 == other.0
    }

    /// Register form of the mask (host byte order, as conntrack stores it)
    pub fn to_register_bytes(self) -> [u8; 4] {
        self.0.to_ne_bytes()
    }

    pub fn names(self) -> Vec<&'static str> {
        NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn from_name(name: &str) -> Result<Self> {
        NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(bit, _)| Self(*bit))
            .ok_or_else(|| Error::Parse(format!("unknown ct state '{name}'")))
    }
}

impl BitOr for CtState {
    type Output = CtState;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl TryFrom<u32> for CtState {
    type Error = Error;

    fn try_from(mask: u32) -> Result<Self> {
        Self::new(mask)
    }
}

impl From<CtState> for u32 {
    fn from(state: CtState) -> Self {
        state.0
    }
}

impl fmt::Display for CtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(","))
    }
}
