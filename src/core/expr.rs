//! Register-machine match operations
//!
//! A rule is an ordered list of [`MatchOp`]s. Loads stage a packet field in a
//! register, bitwise ops mask it, comparisons and lookups break the rule when
//! they fail, and the last op is a terminal statement (a [`Verdict`] or NAT).
//! Evaluation order is list order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::{Error, Result};
use super::family::AddressFamily;

/// Scratch register slot, 1..=4, 16 bytes each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Register(u8);

impl Register {
    pub const DEFAULT: Register = Register(1);
    pub const MAX: u8 = 4;
    pub const WIDTH: u32 = 16;

    pub fn new(index: u8) -> Result<Self> {
        if (1..=Self::MAX).contains(&index) {
            Ok(Self(index))
        } else {
            Err(Error::validation(
                "register",
                format!("register {index} out of range 1..={}", Self::MAX),
            ))
        }
    }

    pub const fn index(self) -> u8 {
        self.0
    }
}

impl Default for Register {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PayloadBase {
    Network,
    Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MetaKey {
    IifName,
    OifName,
    L4Proto,
    NfProto,
}

impl MetaKey {
    pub const fn len(self) -> u32 {
        match self {
            MetaKey::IifName | MetaKey::OifName => super::family::IFNAME_LEN,
            MetaKey::L4Proto | MetaKey::NfProto => 1,
        }
    }
}

/// A packet-derived value that can be loaded into a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldRef {
    Meta(MetaKey),
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
    },
    CtState,
}

impl FieldRef {
    pub const fn len(&self) -> u32 {
        match self {
            FieldRef::Meta(key) => key.len(),
            FieldRef::Payload { len, .. } => *len,
            FieldRef::CtState => super::conntrack::CT_STATE_LEN,
        }
    }

    pub const fn network(offset: u32, len: u32) -> Self {
        FieldRef::Payload {
            base: PayloadBase::Network,
            offset,
            len,
        }
    }

    pub const fn transport(offset: u32, len: u32) -> Self {
        FieldRef::Payload {
            base: PayloadBase::Transport,
            offset,
            len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum CmpOp {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Neq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Lte,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Gte,
}

impl CmpOp {
    /// Compares big-endian byte strings the way the kernel does
    pub fn holds(self, lhs: &[u8], rhs: &[u8]) -> bool {
        let ord = lhs.cmp(rhs);
        match self {
            CmpOp::Eq => ord.is_eq(),
            CmpOp::Neq => ord.is_ne(),
            CmpOp::Lt => ord.is_lt(),
            CmpOp::Lte => ord.is_le(),
            CmpOp::Gt => ord.is_gt(),
            CmpOp::Gte => ord.is_ge(),
        }
    }
}

/// Reference from a lookup to a table-scoped set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetRef {
    pub name: String,
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum NatKind {
    Snat,
    Dnat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum RejectKind {
    #[strum(serialize = "icmp")]
    IcmpUnreachable,
    #[strum(serialize = "icmpx")]
    IcmpxUnreachable,
    #[strum(serialize = "tcp reset")]
    TcpReset,
}

/// icmpx code for "port unreachable"
pub const REJECT_PORT_UNREACHABLE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accept,
    Drop,
    Reject { kind: RejectKind, code: u8 },
    Jump(String),
    Goto(String),
    Return,
    Continue,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "accept"),
            Verdict::Drop => write!(f, "drop"),
            Verdict::Reject { kind, code } => write!(f, "reject with {kind} {code}"),
            Verdict::Jump(chain) => write!(f, "jump {chain}"),
            Verdict::Goto(chain) => write!(f, "goto {chain}"),
            Verdict::Return => write!(f, "return"),
            Verdict::Continue => write!(f, "continue"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LimitUnit {
    Packets,
    Bytes,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum TimeUnit {
    #[strum(to_string = "second", serialize = "s")]
    Second,
    #[strum(to_string = "minute", serialize = "m")]
    Minute,
    #[strum(to_string = "hour", serialize = "h")]
    Hour,
    #[strum(to_string = "day", serialize = "d")]
    Day,
    #[strum(to_string = "week", serialize = "w")]
    Week,
}

/// Rate limit statement.
///
/// Textual form is `RATE[+][/UNIT]/PER` where `+` selects "over" matching
/// (the statement matches once the rate is exceeded), `UNIT` is `p` (packets,
/// default) or `b` (bytes) and `PER` one of `s m h d w`:
///
/// - `"10/s"`: at most 10 packets per second
/// - `"10+/p/s"`: over 10 packets per second
/// - `"200+/b/s"`: over 200 bytes per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimit {
    pub rate: u64,
    pub unit: LimitUnit,
    pub per: TimeUnit,
    pub burst: u32,
    pub over: bool,
}

impl RateLimit {
    pub fn parse(spec: &str, burst: u32) -> Result<Self> {
        let mut limit: RateLimit = spec.parse()?;
        limit.burst = burst;
        Ok(limit)
    }
}

impl FromStr for RateLimit {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self> {
        let bad = || Error::Parse(format!("invalid rate limit '{spec}'"));
        let parts: Vec<&str> = spec.trim().split('/').collect();
        let (head, unit, per) = match parts.as_slice() {
            [head, per] => (*head, LimitUnit::Packets, *per),
            [head, unit, per] => {
                let unit = match *unit {
                    "p" => LimitUnit::Packets,
                    "b" => LimitUnit::Bytes,
                    _ => return Err(bad()),
                };
                (*head, unit, *per)
            }
            _ => return Err(bad()),
        };

        let (digits, over) = match head.strip_suffix('+') {
            Some(digits) => (digits, true),
            None => (head, false),
        };
        let rate: u64 = digits.parse().map_err(|_| bad())?;
        if rate == 0 {
            return Err(bad());
        }
        let per: TimeUnit = per.parse().map_err(|_| bad())?;

        Ok(Self {
            rate,
            unit,
            per,
            burst: 0,
            over,
        })
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            LimitUnit::Packets => "p",
            LimitUnit::Bytes => "b",
        };
        let per = match self.per {
            TimeUnit::Second => "s",
            TimeUnit::Minute => "m",
            TimeUnit::Hour => "h",
            TimeUnit::Day => "d",
            TimeUnit::Week => "w",
        };
        let plus = if self.over { "+" } else { "" };
        write!(f, "{}{plus}/{unit}/{per}", self.rate)
    }
}

/// One instruction of the register machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOp {
    Load {
        field: FieldRef,
        reg: Register,
    },
    Bitwise {
        src: Register,
        dst: Register,
        len: u32,
        mask: Vec<u8>,
        xor: Vec<u8>,
    },
    Cmp {
        op: CmpOp,
        reg: Register,
        data: Vec<u8>,
    },
    Lookup {
        reg: Register,
        set: SetRef,
        invert: bool,
    },
    Immediate {
        reg: Register,
        data: Vec<u8>,
    },
    Limit(RateLimit),
    Counter,
    Nat {
        kind: NatKind,
        family: AddressFamily,
        addr_reg: Option<Register>,
        port_reg: Option<Register>,
    },
    Verdict(Verdict),
}

impl MatchOp {
    /// Terminal statements end a rule; nothing may follow them.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, MatchOp::Verdict(_) | MatchOp::Nat { .. })
    }
}

/// Ordered sequence of match operations.
///
/// Builders return `Exprs` fragments that compose by concatenation; left to
/// right is evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Exprs(Vec<MatchOp>);

impl Exprs {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Concatenates fragments in order.
    pub fn join(parts: impl IntoIterator<Item = Exprs>) -> Self {
        Self(parts.into_iter().flat_map(|e| e.0).collect())
    }

    /// Appends the operations of `other`.
    pub fn add(mut self, other: Exprs) -> Self {
        self.0.extend(other.0);
        self
    }

    pub fn push(mut self, op: MatchOp) -> Self {
        self.0.push(op);
        self
    }

    pub fn ops(&self) -> &[MatchOp] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_ops(self) -> Vec<MatchOp> {
        self.0
    }

    /// Sets referenced by lookups, in order of appearance
    pub fn referenced_sets(&self) -> impl Iterator<Item = &SetRef> {
        self.0.iter().filter_map(|op| match op {
            MatchOp::Lookup { set, .. } => Some(set),
            _ => None,
        })
    }
}

impl From<Vec<MatchOp>> for Exprs {
    fn from(ops: Vec<MatchOp>) -> Self {
        Self(ops)
    }
}

impl From<MatchOp> for Exprs {
    fn from(op: MatchOp) -> Self {
        Self(vec![op])
    }
}

impl<'a> IntoIterator for &'a Exprs {
    type Item = &'a MatchOp;
    type IntoIter = std::slice::Iter<'a, MatchOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_bounds() {
        assert!(Register::new(0).is_err());
        assert!(Register::new(5).is_err());
        assert_eq!(Register::new(4).unwrap().index(), 4);
        assert_eq!(Register::default(), Register::DEFAULT);
    }

    #[test]
    fn test_cmp_is_big_endian() {
        // 256 > 255 when compared as network-order bytes
        assert!(CmpOp::Gt.holds(&256u16.to_be_bytes(), &255u16.to_be_bytes()));
        assert!(CmpOp::Lte.holds(&[0, 80], &[0, 80]));
        assert!(!CmpOp::Neq.holds(&[1], &[1]));
    }

    #[test]
    fn test_rate_limit_forms() {
        let simple: RateLimit = "10/s".parse().unwrap();
        assert_eq!(simple.rate, 10);
        assert_eq!(simple.unit, LimitUnit::Packets);
        assert!(!simple.over);

        let over = RateLimit::parse("10+/p/s", 100).unwrap();
        assert!(over.over);
        assert_eq!(over.burst, 100);

        let bytes: RateLimit = "200+/b/s".parse().unwrap();
        assert_eq!(bytes.unit, LimitUnit::Bytes);
        assert_eq!(bytes.per, TimeUnit::Second);
        assert_eq!(bytes.to_string(), "200+/b/s");
    }

    #[test]
    fn test_rate_limit_rejects_garbage() {
        for bad in ["", "10", "x/s", "0/s", "10/q/s", "10/p/fortnight", "10/p/s/x"] {
            assert!(bad.parse::<RateLimit>().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn test_exprs_join_preserves_order() {
        let a = Exprs::from(MatchOp::Counter);
        let b = Exprs::from(MatchOp::Verdict(Verdict::Accept));
        let joined = Exprs::join([a, b]);
        assert_eq!(joined.len(), 2);
        assert!(matches!(joined.ops()[0], MatchOp::Counter));
        assert!(joined.ops()[1].is_terminal());
    }

    #[test]
    fn test_verdict_display() {
        let reject = Verdict::Reject {
            kind: RejectKind::IcmpxUnreachable,
            code: REJECT_PORT_UNREACHABLE,
        };
        assert_eq!(reject.to_string(), "reject with icmpx 1");
        assert_eq!(Verdict::Jump("log".into()).to_string(), "jump log");
    }
}
