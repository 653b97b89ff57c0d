//! Rule assembly
//!
//! [`RuleAssembler`] binds an [`Exprs`] program to a table and chain and
//! queues it on a [`Transaction`]. Operation order is kept exactly as the
//! caller built it. Programs are checked before they are queued:
//!
//! - exactly one terminal statement, in last position
//! - every register read was written earlier in the rule
//! - no loaded value is left unconsumed
//! - network-header loads use the layout of the table's family

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{Error, Result};
use super::expr::{Exprs, FieldRef, MatchOp, PayloadBase, Register};
use super::family::{AddressFamily, FamilyProfile, PROTO_LEN};
use super::ruleset::{Chain, Table};
use super::transaction::{Sink, Transaction};

/// A rule program plus its bookkeeping.
///
/// `id` is carried as the rule comment so installed rules can be correlated
/// with the code that created them. `handle` and `position` are filled in
/// when rules are read back from the sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleData {
    pub id: Option<String>,
    pub exprs: Exprs,
    pub handle: Option<u64>,
    pub position: Option<usize>,
}

impl RuleData {
    pub fn new(id: impl Into<String>, exprs: Exprs) -> Self {
        Self {
            id: Some(id.into()),
            exprs,
            handle: None,
            position: None,
        }
    }

    pub fn unnamed(exprs: Exprs) -> Self {
        Self {
            exprs,
            ..Self::default()
        }
    }
}

/// A rule bound to its table and chain, as queued in a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    pub data: RuleData,
}

fn addr_layouts(profile: &FamilyProfile) -> [(u32, u32); 3] {
    [
        (profile.src_offset, profile.addr_len),
        (profile.dst_offset, profile.addr_len),
        (profile.l4proto_offset, PROTO_LEN),
    ]
}

fn check_network_load(family: AddressFamily, offset: u32, len: u32) -> Result<()> {
    let own = addr_layouts(family.profile());
    let other = match family {
        AddressFamily::Ipv4 => AddressFamily::Ipv6,
        AddressFamily::Ipv6 => AddressFamily::Ipv4,
    };
    if !own.contains(&(offset, len)) && addr_layouts(other.profile()).contains(&(offset, len)) {
        return Err(Error::validation(
            "exprs",
            format!("network load at offset {offset} len {len} uses the {other} layout in a {family} table"),
        ));
    }
    Ok(())
}

/// Register bookkeeping while walking a program
#[derive(Default)]
struct Registers {
    len: [Option<u32>; Register::MAX as usize + 1],
    pending: [bool; Register::MAX as usize + 1],
}

impl Registers {
    fn write(&mut self, reg: Register, len: u32, at: usize) -> Result<()> {
        let i = reg.index() as usize;
        if self.pending[i] {
            return Err(Error::validation(
                "exprs",
                format!("op {at} overwrites register {} before it was used", reg.index()),
            ));
        }
        if len > Register::WIDTH {
            return Err(Error::validation(
                "exprs",
                format!("op {at} stores {len} bytes in a {} byte register", Register::WIDTH),
            ));
        }
        self.len[i] = Some(len);
        self.pending[i] = true;
        Ok(())
    }

    fn read(&mut self, reg: Register, at: usize) -> Result<u32> {
        let i = reg.index() as usize;
        let len = self.len[i].ok_or_else(|| {
            Error::validation(
                "exprs",
                format!("op {at} reads register {} before any load", reg.index()),
            )
        })?;
        self.pending[i] = false;
        Ok(len)
    }

    fn dangling(&self) -> Option<usize> {
        self.pending.iter().position(|p| *p)
    }
}

/// Checks a program against the invariants listed in the module docs.
pub fn validate_exprs(family: AddressFamily, exprs: &Exprs) -> Result<()> {
    let ops = exprs.ops();
    let Some(last) = ops.last() else {
        return Err(Error::validation("exprs", "rule has no operations"));
    };
    if !last.is_terminal() {
        return Err(Error::validation(
            "exprs",
            "rule does not end with a verdict or NAT statement",
        ));
    }
    if let Some(at) = ops[..ops.len() - 1].iter().position(MatchOp::is_terminal) {
        return Err(Error::validation(
            "exprs",
            format!("terminal statement at op {at} is followed by more operations"),
        ));
    }

    let mut regs = Registers::default();
    for (at, op) in ops.iter().enumerate() {
        match op {
            MatchOp::Load { field, reg } => {
                if let FieldRef::Payload {
                    base: PayloadBase::Network,
                    offset,
                    len,
                } = field
                {
                    check_network_load(family, *offset, *len)?;
                }
                regs.write(*reg, field.len(), at)?;
            }
            MatchOp::Bitwise {
                src,
                dst,
                len,
                mask,
                xor,
            } => {
                let have = regs.read(*src, at)?;
                if *len != have || mask.len() != *len as usize || xor.len() != *len as usize {
                    return Err(Error::validation(
                        "exprs",
                        format!("bitwise at op {at} does not match the {have} byte operand"),
                    ));
                }
                regs.write(*dst, *len, at)?;
            }
            MatchOp::Cmp { reg, data, .. } => {
                let have = regs.read(*reg, at)?;
                if data.len() != have as usize {
                    return Err(Error::validation(
                        "exprs",
                        format!(
                            "compare at op {at} has {} bytes for a {have} byte field",
                            data.len()
                        ),
                    ));
                }
            }
            MatchOp::Lookup { reg, .. } => {
                regs.read(*reg, at)?;
            }
            MatchOp::Immediate { reg, data } => {
                regs.write(*reg, data.len() as u32, at)?;
            }
            MatchOp::Nat {
                family: nat_family,
                addr_reg,
                port_reg,
                ..
            } => {
                if *nat_family != family {
                    return Err(Error::validation(
                        "exprs",
                        format!("{nat_family} NAT statement in a {family} table"),
                    ));
                }
                for reg in addr_reg.iter().chain(port_reg.iter()) {
                    regs.read(*reg, at)?;
                }
            }
            MatchOp::Limit(_) | MatchOp::Counter | MatchOp::Verdict(_) => {}
        }
    }

    if let Some(reg) = regs.dangling() {
        return Err(Error::validation(
            "exprs",
            format!("register {reg} is loaded but never compared"),
        ));
    }
    Ok(())
}

/// Builds and queues rules for one chain.
#[derive(Debug, Clone)]
pub struct RuleAssembler {
    table: Table,
    chain: String,
}

impl RuleAssembler {
    pub fn new(chain: &Chain) -> Self {
        Self {
            table: chain.table.clone(),
            chain: chain.name.clone(),
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    fn bind(&self, data: RuleData) -> Result<Rule> {
        validate_exprs(self.table.family, &data.exprs)?;
        Ok(Rule {
            table: self.table.clone(),
            chain: self.chain.clone(),
            data,
        })
    }

    /// Appends a rule to the end of the chain.
    pub fn add<S: Sink>(&self, tx: &mut Transaction<'_, S>, data: RuleData) -> Result<()> {
        let rule = self.bind(data)?;
        debug!(
            "Queue rule {:?} on {}/{}",
            rule.data.id, self.table.name, self.chain
        );
        tx.add_rule(rule)
    }

    /// Inserts a rule at the top of the chain, or before the rule with `before` handle.
    pub fn insert<S: Sink>(
        &self,
        tx: &mut Transaction<'_, S>,
        data: RuleData,
        before: Option<u64>,
    ) -> Result<()> {
        let rule = self.bind(data)?;
        tx.insert_rule(rule, before)
    }

    pub fn delete<S: Sink>(&self, tx: &mut Transaction<'_, S>, handle: u64) -> Result<()> {
        tx.delete_rule(&self.table, &self.chain, handle);
        Ok(())
    }

    /// Installed rules with id, position and handle, in chain order.
    pub fn list<S: Sink>(&self, tx: &Transaction<'_, S>) -> Result<Vec<RuleData>> {
        tx.list_rules(&self.table, &self.chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::{CmpOp, Verdict};
    use crate::core::primitives as p;

    fn v4() -> &'static FamilyProfile {
        AddressFamily::Ipv4.profile()
    }

    #[test]
    fn test_valid_program() {
        let exprs = Exprs::join([p::iif("eth0").unwrap(), p::tcp(v4()), p::dport(22), p::accept()]);
        assert!(validate_exprs(AddressFamily::Ipv4, &exprs).is_ok());
    }

    #[test]
    fn test_missing_terminal() {
        let exprs = Exprs::join([p::tcp(v4()), p::dport(22)]);
        assert!(validate_exprs(AddressFamily::Ipv4, &exprs).is_err());
        assert!(validate_exprs(AddressFamily::Ipv4, &Exprs::new()).is_err());
    }

    #[test]
    fn test_ops_after_terminal() {
        let exprs = Exprs::join([p::accept(), p::tcp(v4()), p::drop()]);
        assert!(validate_exprs(AddressFamily::Ipv4, &exprs).is_err());
    }

    #[test]
    fn test_dangling_load() {
        let exprs = Exprs::from(vec![
            MatchOp::Load {
                field: FieldRef::transport(2, 2),
                reg: Register::DEFAULT,
            },
            MatchOp::Verdict(Verdict::Accept),
        ]);
        let err = validate_exprs(AddressFamily::Ipv4, &exprs).unwrap_err();
        assert!(err.to_string().contains("never compared"));
    }

    #[test]
    fn test_read_before_load() {
        let exprs = Exprs::from(vec![
            MatchOp::Cmp {
                op: CmpOp::Eq,
                reg: Register::DEFAULT,
                data: vec![6],
            },
            MatchOp::Verdict(Verdict::Accept),
        ]);
        assert!(validate_exprs(AddressFamily::Ipv4, &exprs).is_err());
    }

    #[test]
    fn test_compare_width_mismatch() {
        let exprs = Exprs::from(vec![
            MatchOp::Load {
                field: FieldRef::transport(2, 2),
                reg: Register::DEFAULT,
            },
            MatchOp::Cmp {
                op: CmpOp::Eq,
                reg: Register::DEFAULT,
                data: vec![0, 0, 0, 22],
            },
            MatchOp::Verdict(Verdict::Accept),
        ]);
        assert!(validate_exprs(AddressFamily::Ipv4, &exprs).is_err());
    }

    #[test]
    fn test_family_mismatched_offsets() {
        // IPv4 source address program inside an IPv6 table
        let exprs = Exprs::join([
            p::saddr(v4(), "10.0.0.1".parse().unwrap()).unwrap(),
            p::accept(),
        ]);
        assert!(validate_exprs(AddressFamily::Ipv4, &exprs).is_ok());
        assert!(matches!(
            validate_exprs(AddressFamily::Ipv6, &exprs),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_nat_family_must_match() {
        let exprs = Exprs::join([
            p::oif("eth0").unwrap(),
            p::snat(v4(), "192.0.2.1".parse().unwrap()).unwrap(),
        ]);
        assert!(validate_exprs(AddressFamily::Ipv4, &exprs).is_ok());
        assert!(validate_exprs(AddressFamily::Ipv6, &exprs).is_err());
    }
}
