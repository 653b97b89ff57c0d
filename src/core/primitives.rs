//! Match-predicate builders
//!
//! Each builder returns the exact [`Exprs`] fragment for one logical
//! predicate. Offsets come from the [`FamilyProfile`] passed in, never from
//! literals at the call site. Fragments compose with [`Exprs::join`]:
//!
//! ```
//! use hostwall::core::family::AddressFamily;
//! use hostwall::core::expr::Exprs;
//! use hostwall::core::primitives as p;
//!
//! let v4 = AddressFamily::Ipv4.profile();
//! let exprs = Exprs::join([
//!     p::iif("eth0").unwrap(),
//!     p::tcp(v4),
//!     p::dport(22),
//!     p::accept(),
//! ]);
//! assert_eq!(exprs.len(), 7);
//! ```
//!
//! Builders use [`Register::DEFAULT`] unless a `_with_register` variant is
//! called. A protocol match must precede a port match in the same rule,
//! otherwise the port load reads whatever transport header is present.

use ipnetwork::IpNetwork;
use std::net::IpAddr;

use super::conntrack::CtState;
use super::error::{Error, Result};
use super::expr::{
    CmpOp, Exprs, FieldRef, MatchOp, MetaKey, NatKind, REJECT_PORT_UNREACHABLE, RateLimit,
    Register, RejectKind, Verdict,
};
use super::family::{
    AddressFamily, DST_PORT_OFFSET, Direction, FamilyProfile, ICMP_TYPE_LEN, ICMP_TYPE_OFFSET, IFNAME_LEN,
    PORT_LEN, PROTO_LEN, PROTO_TCP, PROTO_UDP, SRC_PORT_OFFSET, addr_bytes, unmap,
};
use super::sets::{Set, SetKeyType};

// ─── Interfaces ────────────────────────────────────────────────────────────

/// Interface name as the 16-byte NUL-padded register value
pub fn ifname_bytes(name: &str) -> Result<Vec<u8>> {
    if name.is_empty() || name.len() >= IFNAME_LEN as usize {
        return Err(Error::validation(
            "interface",
            format!("'{name}' must be 1-{} bytes", IFNAME_LEN - 1),
        ));
    }
    let mut bytes = name.as_bytes().to_vec();
    bytes.resize(IFNAME_LEN as usize, 0);
    Ok(bytes)
}

fn ifname_match(key: MetaKey, name: &str, op: CmpOp) -> Result<Exprs> {
    let data = ifname_bytes(name)?;
    Ok(Exprs::from(vec![
        MatchOp::Load {
            field: FieldRef::Meta(key),
            reg: Register::DEFAULT,
        },
        MatchOp::Cmp {
            op,
            reg: Register::DEFAULT,
            data,
        },
    ]))
}

/// `iifname == name`
pub fn iif(name: &str) -> Result<Exprs> {
    ifname_match(MetaKey::IifName, name, CmpOp::Eq)
}

/// `oifname == name`
pub fn oif(name: &str) -> Result<Exprs> {
    ifname_match(MetaKey::OifName, name, CmpOp::Eq)
}

/// `iifname != name`
pub fn not_iif(name: &str) -> Result<Exprs> {
    ifname_match(MetaKey::IifName, name, CmpOp::Neq)
}

/// `oifname != name`
pub fn not_oif(name: &str) -> Result<Exprs> {
    ifname_match(MetaKey::OifName, name, CmpOp::Neq)
}

// ─── Protocols ─────────────────────────────────────────────────────────────

/// Matches the protocol / next-header byte of the network header.
pub fn proto(profile: &FamilyProfile, number: u8) -> Exprs {
    Exprs::from(vec![
        MatchOp::Load {
            field: FieldRef::network(profile.l4proto_offset, PROTO_LEN),
            reg: Register::DEFAULT,
        },
        MatchOp::Cmp {
            op: CmpOp::Eq,
            reg: Register::DEFAULT,
            data: vec![number],
        },
    ])
}

pub fn tcp(profile: &FamilyProfile) -> Exprs {
    proto(profile, PROTO_TCP)
}

pub fn udp(profile: &FamilyProfile) -> Exprs {
    proto(profile, PROTO_UDP)
}

/// ICMP for IPv4 tables, ICMPv6 for IPv6 tables
pub fn icmp(profile: &FamilyProfile) -> Exprs {
    proto(profile, profile.icmp_proto)
}

/// ICMP echo-request of the table's family, protocol match included
pub fn icmp_echo_request(profile: &FamilyProfile) -> Exprs {
    icmp(profile).add(Exprs::from(vec![
        MatchOp::Load {
            field: FieldRef::transport(ICMP_TYPE_OFFSET, ICMP_TYPE_LEN),
            reg: Register::DEFAULT,
        },
        MatchOp::Cmp {
            op: CmpOp::Eq,
            reg: Register::DEFAULT,
            data: vec![profile.echo_request_type],
        },
    ]))
}

/// `meta nfproto` of the table's family
pub fn nfproto(profile: &FamilyProfile) -> Exprs {
    Exprs::from(vec![
        MatchOp::Load {
            field: FieldRef::Meta(MetaKey::NfProto),
            reg: Register::DEFAULT,
        },
        MatchOp::Cmp {
            op: CmpOp::Eq,
            reg: Register::DEFAULT,
            data: vec![profile.nfproto],
        },
    ])
}

// ─── Ports ─────────────────────────────────────────────────────────────────

const fn port_offset(direction: Direction) -> u32 {
    match direction {
        Direction::Source => SRC_PORT_OFFSET,
        Direction::Destination => DST_PORT_OFFSET,
    }
}

fn load_port(direction: Direction, reg: Register) -> MatchOp {
    MatchOp::Load {
        field: FieldRef::transport(port_offset(direction), PORT_LEN),
        reg,
    }
}

pub fn port_with_register(direction: Direction, port: u16, invert: bool, reg: Register) -> Exprs {
    Exprs::from(vec![
        load_port(direction, reg),
        MatchOp::Cmp {
            op: if invert { CmpOp::Neq } else { CmpOp::Eq },
            reg,
            data: port.to_be_bytes().to_vec(),
        },
    ])
}

pub fn port(direction: Direction, port: u16, invert: bool) -> Exprs {
    port_with_register(direction, port, invert, Register::DEFAULT)
}

pub fn sport(p: u16) -> Exprs {
    port(Direction::Source, p, false)
}

pub fn dport(p: u16) -> Exprs {
    port(Direction::Destination, p, false)
}

/// Closed port range as `>= lo` followed by `<= hi`.
pub fn port_range_with_register(
    direction: Direction,
    lo: u16,
    hi: u16,
    reg: Register,
) -> Result<Exprs> {
    if lo > hi {
        return Err(Error::validation(
            "port",
            format!("range {lo}-{hi} has start above end"),
        ));
    }
    Ok(Exprs::from(vec![
        load_port(direction, reg),
        MatchOp::Cmp {
            op: CmpOp::Gte,
            reg,
            data: lo.to_be_bytes().to_vec(),
        },
        MatchOp::Cmp {
            op: CmpOp::Lte,
            reg,
            data: hi.to_be_bytes().to_vec(),
        },
    ]))
}

pub fn port_range(direction: Direction, lo: u16, hi: u16) -> Result<Exprs> {
    port_range_with_register(direction, lo, hi, Register::DEFAULT)
}

pub fn dport_range(lo: u16, hi: u16) -> Result<Exprs> {
    port_range(Direction::Destination, lo, hi)
}

fn expect_key(set: &Set, expected: SetKeyType) -> Result<()> {
    if set.key_type == expected {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "set '{}' holds {} elements, predicate needs {expected}",
            set.name, set.key_type
        )))
    }
}

fn lookup(reg: Register, set: &Set, invert: bool) -> MatchOp {
    MatchOp::Lookup {
        reg,
        set: set.set_ref(),
        invert,
    }
}

pub fn port_set_with_register(
    direction: Direction,
    set: &Set,
    invert: bool,
    reg: Register,
) -> Result<Exprs> {
    expect_key(set, SetKeyType::InetService)?;
    Ok(Exprs::from(vec![
        load_port(direction, reg),
        lookup(reg, set, invert),
    ]))
}

pub fn port_set(direction: Direction, set: &Set, invert: bool) -> Result<Exprs> {
    port_set_with_register(direction, set, invert, Register::DEFAULT)
}

pub fn sport_set(set: &Set) -> Result<Exprs> {
    port_set(Direction::Source, set, false)
}

pub fn dport_set(set: &Set) -> Result<Exprs> {
    port_set(Direction::Destination, set, false)
}

// ─── Addresses ─────────────────────────────────────────────────────────────

fn family_addr(profile: &FamilyProfile, addr: IpAddr) -> Result<IpAddr> {
    let addr = unmap(addr);
    if profile.family.contains(&addr) {
        Ok(addr)
    } else {
        Err(Error::validation(
            "address",
            format!("{addr} cannot be matched in a {} table", profile.family),
        ))
    }
}

fn load_addr(profile: &FamilyProfile, direction: Direction, reg: Register) -> MatchOp {
    MatchOp::Load {
        field: FieldRef::network(profile.addr_offset(direction), profile.addr_len),
        reg,
    }
}

pub fn addr_with_register(
    profile: &FamilyProfile,
    direction: Direction,
    addr: IpAddr,
    invert: bool,
    reg: Register,
) -> Result<Exprs> {
    let addr = family_addr(profile, addr)?;
    Ok(Exprs::from(vec![
        load_addr(profile, direction, reg),
        MatchOp::Cmp {
            op: if invert { CmpOp::Neq } else { CmpOp::Eq },
            reg,
            data: addr_bytes(&addr),
        },
    ]))
}

pub fn addr(
    profile: &FamilyProfile,
    direction: Direction,
    addr: IpAddr,
    invert: bool,
) -> Result<Exprs> {
    addr_with_register(profile, direction, addr, invert, Register::DEFAULT)
}

pub fn saddr(profile: &FamilyProfile, a: IpAddr) -> Result<Exprs> {
    addr(profile, Direction::Source, a, false)
}

pub fn daddr(profile: &FamilyProfile, a: IpAddr) -> Result<Exprs> {
    addr(profile, Direction::Destination, a, false)
}

/// Prefix match: load, mask with the netmask, compare with the network address.
pub fn network_with_register(
    profile: &FamilyProfile,
    direction: Direction,
    net: IpNetwork,
    invert: bool,
    reg: Register,
) -> Result<Exprs> {
    if AddressFamily::of(&net.ip()) != profile.family {
        return Err(Error::validation(
            "address",
            format!("{net} cannot be matched in a {} table", profile.family),
        ));
    }
    let network = net.network();
    Ok(Exprs::from(vec![
        load_addr(profile, direction, reg),
        MatchOp::Bitwise {
            src: reg,
            dst: reg,
            len: profile.addr_len,
            mask: addr_bytes(&net.mask()),
            xor: profile.zero_xor.to_vec(),
        },
        MatchOp::Cmp {
            op: if invert { CmpOp::Neq } else { CmpOp::Eq },
            reg,
            data: addr_bytes(&network),
        },
    ]))
}

pub fn network(
    profile: &FamilyProfile,
    direction: Direction,
    net: IpNetwork,
    invert: bool,
) -> Result<Exprs> {
    network_with_register(profile, direction, net, invert, Register::DEFAULT)
}

pub fn snet(profile: &FamilyProfile, net: IpNetwork) -> Result<Exprs> {
    network(profile, Direction::Source, net, false)
}

pub fn addr_set_with_register(
    profile: &FamilyProfile,
    direction: Direction,
    set: &Set,
    invert: bool,
    reg: Register,
) -> Result<Exprs> {
    expect_key(set, profile.family.addr_key_type())?;
    Ok(Exprs::from(vec![
        load_addr(profile, direction, reg),
        lookup(reg, set, invert),
    ]))
}

pub fn addr_set(
    profile: &FamilyProfile,
    direction: Direction,
    set: &Set,
    invert: bool,
) -> Result<Exprs> {
    addr_set_with_register(profile, direction, set, invert, Register::DEFAULT)
}

pub fn saddr_set(profile: &FamilyProfile, set: &Set) -> Result<Exprs> {
    addr_set(profile, Direction::Source, set, false)
}

pub fn daddr_set(profile: &FamilyProfile, set: &Set) -> Result<Exprs> {
    addr_set(profile, Direction::Destination, set, false)
}

// ─── Connection tracking ───────────────────────────────────────────────────

/// Matches when any bit of `state` is set: `(ct state & mask) != 0`.
pub fn ct_state_with_register(state: CtState, reg: Register) -> Exprs {
    Exprs::from(vec![
        MatchOp::Load {
            field: FieldRef::CtState,
            reg,
        },
        MatchOp::Bitwise {
            src: reg,
            dst: reg,
            len: super::conntrack::CT_STATE_LEN,
            mask: state.to_register_bytes().to_vec(),
            xor: vec![0; 4],
        },
        MatchOp::Cmp {
            op: CmpOp::Neq,
            reg,
            data: vec![0; 4],
        },
    ])
}

pub fn ct_state(state: CtState) -> Exprs {
    ct_state_with_register(state, Register::DEFAULT)
}

/// Same as [`ct_state`] from a raw mask, validated.
pub fn ct_state_mask(mask: u32) -> Result<Exprs> {
    Ok(ct_state(CtState::new(mask)?))
}

pub fn ct_state_set(set: &Set, invert: bool) -> Result<Exprs> {
    expect_key(set, SetKeyType::CtState)?;
    Ok(Exprs::from(vec![
        MatchOp::Load {
            field: FieldRef::CtState,
            reg: Register::DEFAULT,
        },
        lookup(Register::DEFAULT, set, invert),
    ]))
}

// ─── Statements ────────────────────────────────────────────────────────────

pub fn limit(rate: RateLimit) -> Exprs {
    Exprs::from(MatchOp::Limit(rate))
}

pub fn counter() -> Exprs {
    Exprs::from(MatchOp::Counter)
}

/// Source NAT to `to`; the address is staged in register 1.
pub fn snat(profile: &FamilyProfile, to: IpAddr) -> Result<Exprs> {
    let to = family_addr(profile, to)?;
    Ok(Exprs::from(vec![
        MatchOp::Immediate {
            reg: Register::DEFAULT,
            data: addr_bytes(&to),
        },
        MatchOp::Nat {
            kind: NatKind::Snat,
            family: profile.family,
            addr_reg: Some(Register::DEFAULT),
            port_reg: None,
        },
    ]))
}

/// Destination NAT to `to` and optionally a new port (staged in register 2).
pub fn dnat(profile: &FamilyProfile, to: IpAddr, to_port: Option<u16>) -> Result<Exprs> {
    let to = family_addr(profile, to)?;
    let port_reg = Register::new(2)?;
    let mut ops = vec![MatchOp::Immediate {
        reg: Register::DEFAULT,
        data: addr_bytes(&to),
    }];
    if let Some(p) = to_port {
        ops.push(MatchOp::Immediate {
            reg: port_reg,
            data: p.to_be_bytes().to_vec(),
        });
    }
    ops.push(MatchOp::Nat {
        kind: NatKind::Dnat,
        family: profile.family,
        addr_reg: Some(Register::DEFAULT),
        port_reg: to_port.map(|_| port_reg),
    });
    Ok(Exprs::from(ops))
}

// ─── Verdicts ──────────────────────────────────────────────────────────────

pub fn verdict(v: Verdict) -> Exprs {
    Exprs::from(MatchOp::Verdict(v))
}

pub fn accept() -> Exprs {
    verdict(Verdict::Accept)
}

pub fn drop() -> Exprs {
    verdict(Verdict::Drop)
}

/// Reject with icmpx "port unreachable"
pub fn reject() -> Exprs {
    reject_with(RejectKind::IcmpxUnreachable, REJECT_PORT_UNREACHABLE)
}

pub fn reject_with(kind: RejectKind, code: u8) -> Exprs {
    verdict(Verdict::Reject { kind, code })
}

pub fn jump(chain: impl Into<String>) -> Exprs {
    verdict(Verdict::Jump(chain.into()))
}

pub fn goto(chain: impl Into<String>) -> Exprs {
    verdict(Verdict::Goto(chain.into()))
}

pub fn ret() -> Exprs {
    verdict(Verdict::Return)
}
