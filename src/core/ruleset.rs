//! Tables and chains
//!
//! A [`Table`] is family-scoped and its family never changes. Base chains
//! attach to a netfilter hook with a type, a priority and exactly one
//! default policy; regular chains are jump targets and carry none of that.

use serde::{Deserialize, Serialize};

use super::family::AddressFamily;

/// Priority of the filter base chains
pub const PRIORITY_FILTER: i32 = 0;
/// Priority of source NAT in postrouting
pub const PRIORITY_NAT_SOURCE: i32 = 100;
/// Priority of destination NAT in prerouting
pub const PRIORITY_NAT_DEST: i32 = -100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Table {
    pub family: AddressFamily,
    pub name: String,
}

impl Table {
    pub fn new(family: AddressFamily, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Hook {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChainType {
    Filter,
    Nat,
    Route,
}

/// Default verdict of a base chain
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Policy {
    Accept,
    #[default]
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseChain {
    pub hook: Hook,
    pub chain_type: ChainType,
    pub priority: i32,
    pub policy: Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chain {
    pub table: Table,
    pub name: String,
    pub base: Option<BaseChain>,
}

impl Chain {
    /// Filter base chain named after its hook
    pub fn filter(table: &Table, hook: Hook, policy: Policy) -> Self {
        Self {
            table: table.clone(),
            name: hook.to_string(),
            base: Some(BaseChain {
                hook,
                chain_type: ChainType::Filter,
                priority: PRIORITY_FILTER,
                policy,
            }),
        }
    }

    /// NAT base chain; NAT chains never drop by default
    pub fn nat(table: &Table, hook: Hook) -> Self {
        let priority = match hook {
            Hook::Prerouting | Hook::Output => PRIORITY_NAT_DEST,
            _ => PRIORITY_NAT_SOURCE,
        };
        Self {
            table: table.clone(),
            name: hook.to_string(),
            base: Some(BaseChain {
                hook,
                chain_type: ChainType::Nat,
                priority,
                policy: Policy::Accept,
            }),
        }
    }

    /// Regular chain (jump/goto target)
    pub fn regular(table: &Table, name: impl Into<String>) -> Self {
        Self {
            table: table.clone(),
            name: name.into(),
            base: None,
        }
    }

    pub fn policy(&self) -> Option<Policy> {
        self.base.as_ref().map(|b| b.policy)
    }

    pub fn family(&self) -> AddressFamily {
        self.table.family
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_chain() {
        let table = Table::new(AddressFamily::Ipv4, "filter");
        let chain = Chain::filter(&table, Hook::Input, Policy::Drop);
        assert_eq!(chain.name, "input");
        assert_eq!(chain.policy(), Some(Policy::Drop));
        assert_eq!(chain.base.unwrap().priority, PRIORITY_FILTER);
    }

    #[test]
    fn test_nat_priorities() {
        let table = Table::new(AddressFamily::Ipv6, "nat");
        let post = Chain::nat(&table, Hook::Postrouting);
        assert_eq!(post.base.as_ref().unwrap().priority, PRIORITY_NAT_SOURCE);
        assert_eq!(post.policy(), Some(Policy::Accept));
        let pre = Chain::nat(&table, Hook::Prerouting);
        assert_eq!(pre.base.unwrap().priority, PRIORITY_NAT_DEST);
    }

    #[test]
    fn test_regular_chain_has_no_policy() {
        let table = Table::new(AddressFamily::Ipv4, "filter");
        assert_eq!(Chain::regular(&table, "log_drop").policy(), None);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("accept".parse::<Policy>().unwrap(), Policy::Accept);
        assert!("reject".parse::<Policy>().is_err());
    }
}
