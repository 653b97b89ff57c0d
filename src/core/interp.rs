//! Rule interpreter
//!
//! Replays rule programs against a synthetic [`Packet`] so policies can be
//! checked without a kernel. The packet is rendered into minimal network
//! and transport headers and the register machine runs over those bytes
//! exactly as the loads describe them, so a wrong offset shows up as a
//! wrong verdict.

use std::net::IpAddr;

use super::conntrack::CT_NEW;
use super::error::{Error, Result};
use super::expr::{Exprs, FieldRef, MatchOp, MetaKey, PayloadBase, Register, Verdict};
use super::family::{
    AddressFamily, ICMP_TYPE_OFFSET, IFNAME_LEN, PROTO_TCP, PROTO_UDP, addr_bytes,
};
use super::memory::MemorySink;
use super::ruleset::{Policy, Table};
use super::transaction::Sink;

/// Set membership as seen by lookups
pub trait SetLookup {
    fn contains(&self, table: &Table, set: &str, key: &[u8]) -> bool;
}

/// Synthetic packet description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub iif: Option<String>,
    pub oif: Option<String>,
    pub protocol: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// Single ct state bit
    pub ct_state: u32,
}

impl Packet {
    fn new(protocol: u8, src: IpAddr, dst: IpAddr) -> Self {
        Self {
            iif: None,
            oif: None,
            protocol,
            src,
            dst,
            sport: 0,
            dport: 0,
            icmp_type: 0,
            icmp_code: 0,
            ct_state: CT_NEW,
        }
    }

    pub fn tcp(src: IpAddr, dst: IpAddr, sport: u16, dport: u16) -> Self {
        Self {
            sport,
            dport,
            ..Self::new(PROTO_TCP, src, dst)
        }
    }

    pub fn udp(src: IpAddr, dst: IpAddr, sport: u16, dport: u16) -> Self {
        Self {
            sport,
            dport,
            ..Self::new(PROTO_UDP, src, dst)
        }
    }

    /// ICMP (v4) or ICMPv6 message, chosen by the address family
    pub fn icmp(src: IpAddr, dst: IpAddr, icmp_type: u8) -> Self {
        let profile = AddressFamily::of(&src).profile();
        Self {
            icmp_type,
            ..Self::new(profile.icmp_proto, src, dst)
        }
    }

    pub fn inbound(mut self, iif: &str) -> Self {
        self.iif = Some(iif.to_string());
        self
    }

    pub fn outbound(mut self, oif: &str) -> Self {
        self.oif = Some(oif.to_string());
        self
    }

    pub fn state(mut self, ct_state: u32) -> Self {
        self.ct_state = ct_state;
        self
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.src)
    }

    /// Source and destination belong to the same family
    pub fn is_well_formed(&self) -> bool {
        AddressFamily::of(&self.dst) == self.family()
    }

    /// `None` for a packet that mixes address families
    fn network_header(&self) -> Option<Vec<u8>> {
        if !self.is_well_formed() {
            return None;
        }
        let profile = self.family().profile();
        let header_len = match self.family() {
            AddressFamily::Ipv4 => 20,
            AddressFamily::Ipv6 => 40,
        };
        let mut header = vec![0u8; header_len];
        header[profile.l4proto_offset as usize] = self.protocol;
        let src = profile.src_offset as usize;
        let dst = profile.dst_offset as usize;
        let len = profile.addr_len as usize;
        header[src..src + len].copy_from_slice(&addr_bytes(&self.src));
        header[dst..dst + len].copy_from_slice(&addr_bytes(&self.dst));
        Some(header)
    }

    fn transport_header(&self) -> Vec<u8> {
        let profile = self.family().profile();
        let mut header = vec![0u8; 20];
        if self.protocol == profile.icmp_proto {
            header[ICMP_TYPE_OFFSET as usize] = self.icmp_type;
            header[ICMP_TYPE_OFFSET as usize + 1] = self.icmp_code;
        } else {
            header[0..2].copy_from_slice(&self.sport.to_be_bytes());
            header[2..4].copy_from_slice(&self.dport.to_be_bytes());
        }
        header
    }

    fn meta(&self, key: MetaKey) -> Vec<u8> {
        let ifname = |name: &Option<String>| {
            let mut bytes = name.as_deref().unwrap_or_default().as_bytes().to_vec();
            bytes.resize(IFNAME_LEN as usize, 0);
            bytes
        };
        match key {
            MetaKey::IifName => ifname(&self.iif),
            MetaKey::OifName => ifname(&self.oif),
            MetaKey::L4Proto => vec![self.protocol],
            MetaKey::NfProto => vec![self.family().profile().nfproto],
        }
    }
}

/// Result of running one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A predicate failed; evaluation continues with the next rule
    NoMatch,
    Verdict(Verdict),
    /// A NAT statement fired (the packet is accepted by the NAT chain)
    Nat,
}

/// Runs one rule program against `packet`.
pub fn evaluate_rule(
    table: &Table,
    exprs: &Exprs,
    packet: &Packet,
    sets: &dyn SetLookup,
) -> Outcome {
    let Some(network) = packet.network_header() else {
        return Outcome::NoMatch;
    };
    let transport = packet.transport_header();
    let mut regs: [Vec<u8>; Register::MAX as usize + 1] = Default::default();

    for op in exprs {
        match op {
            MatchOp::Load { field, reg } => {
                let value = match field {
                    FieldRef::Meta(key) => packet.meta(*key),
                    FieldRef::CtState => packet.ct_state.to_ne_bytes().to_vec(),
                    FieldRef::Payload { base, offset, len } => {
                        let header = match base {
                            PayloadBase::Network => &network,
                            PayloadBase::Transport => &transport,
                        };
                        let (start, end) = (*offset as usize, (*offset + *len) as usize);
                        // the kernel breaks out of the rule on short packets
                        let Some(bytes) = header.get(start..end) else {
                            return Outcome::NoMatch;
                        };
                        bytes.to_vec()
                    }
                };
                regs[reg.index() as usize] = value;
            }
            MatchOp::Bitwise {
                src,
                dst,
                mask,
                xor,
                ..
            } => {
                let value = regs[src.index() as usize]
                    .iter()
                    .zip(mask.iter().zip(xor))
                    .map(|(v, (m, x))| (v & m) ^ x)
                    .collect();
                regs[dst.index() as usize] = value;
            }
            MatchOp::Cmp { op, reg, data } => {
                if !op.holds(&regs[reg.index() as usize], data) {
                    return Outcome::NoMatch;
                }
            }
            MatchOp::Lookup { reg, set, invert } => {
                let found = sets.contains(table, &set.name, &regs[reg.index() as usize]);
                if found == *invert {
                    return Outcome::NoMatch;
                }
            }
            MatchOp::Immediate { reg, data } => {
                regs[reg.index() as usize].clone_from(data);
            }
            // replayed packets never exceed a rate
            MatchOp::Limit(limit) => {
                if limit.over {
                    return Outcome::NoMatch;
                }
            }
            MatchOp::Counter => {}
            MatchOp::Nat { .. } => return Outcome::Nat,
            MatchOp::Verdict(v) => return Outcome::Verdict(v.clone()),
        }
    }
    Outcome::NoMatch
}

/// Final decision for a packet traversing a base chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// Handle of the deciding rule, `None` when the chain policy decided
    pub handle: Option<u64>,
    pub id: Option<String>,
}

impl Decision {
    fn policy(policy: Policy) -> Self {
        Self {
            verdict: match policy {
                Policy::Accept => Verdict::Accept,
                Policy::Drop => Verdict::Drop,
            },
            handle: None,
            id: None,
        }
    }

    pub fn accepted(&self) -> bool {
        self.verdict == Verdict::Accept
    }
}

const MAX_JUMP_DEPTH: usize = 16;

enum Walk {
    Decided(Decision),
    /// Fell off the end or hit `return`
    Returned,
}

fn walk(
    sink: &MemorySink,
    table: &Table,
    chain: &str,
    packet: &Packet,
    depth: usize,
) -> Result<Walk> {
    if depth > MAX_JUMP_DEPTH {
        return Err(Error::Configuration(format!(
            "jump depth exceeded at chain {chain}"
        )));
    }
    for rule in sink.list_rules(table, chain)? {
        let decided = |verdict: Verdict| {
            Walk::Decided(Decision {
                verdict,
                handle: rule.handle,
                id: rule.id.clone(),
            })
        };
        match evaluate_rule(table, &rule.exprs, packet, sink) {
            Outcome::NoMatch | Outcome::Verdict(Verdict::Continue) => {}
            Outcome::Nat => return Ok(decided(Verdict::Accept)),
            Outcome::Verdict(Verdict::Return) => return Ok(Walk::Returned),
            Outcome::Verdict(Verdict::Jump(target)) => {
                if let Walk::Decided(d) = walk(sink, table, &target, packet, depth + 1)? {
                    return Ok(Walk::Decided(d));
                }
            }
            Outcome::Verdict(Verdict::Goto(target)) => {
                return walk(sink, table, &target, packet, depth + 1);
            }
            Outcome::Verdict(v) => return Ok(decided(v)),
        }
    }
    Ok(Walk::Returned)
}

/// Runs `packet` through a base chain: first terminal verdict wins,
/// otherwise the chain policy applies.
pub fn evaluate_chain(
    sink: &MemorySink,
    table: &Table,
    chain: &str,
    packet: &Packet,
) -> Result<Decision> {
    if !packet.is_well_formed() {
        return Err(Error::validation(
            "packet",
            format!("source {} and destination {} differ in family", packet.src, packet.dst),
        ));
    }
    let policy = sink
        .chain(table, chain)
        .ok_or_else(|| Error::transaction(format!("chain {chain} does not exist")))?
        .policy()
        .unwrap_or(Policy::Accept);
    match walk(sink, table, chain, packet, 0)? {
        Walk::Decided(decision) => Ok(decision),
        Walk::Returned => Ok(Decision::policy(policy)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conntrack::{CT_ESTABLISHED, STATE_ESTABLISHED_RELATED};
    use crate::core::expr::RateLimit;
    use crate::core::primitives as p;
    use crate::core::rule::{RuleAssembler, RuleData};
    use crate::core::ruleset::{Chain, Hook};
    use crate::core::sets::Set;
    use crate::core::transaction::Transaction;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    struct NoSets;

    impl SetLookup for NoSets {
        fn contains(&self, _: &Table, _: &str, _: &[u8]) -> bool {
            false
        }
    }

    fn filter() -> Table {
        Table::new(AddressFamily::Ipv4, "filter")
    }

    #[test]
    fn test_tcp_dport_match() {
        let profile = AddressFamily::Ipv4.profile();
        let exprs = Exprs::join([p::tcp(profile), p::dport(22), p::accept()]);
        let hit = Packet::tcp(v4("1.1.1.1"), v4("2.2.2.2"), 40000, 22);
        let miss = Packet::tcp(v4("1.1.1.1"), v4("2.2.2.2"), 40000, 23);
        let udp = Packet::udp(v4("1.1.1.1"), v4("2.2.2.2"), 40000, 22);
        assert_eq!(
            evaluate_rule(&filter(), &exprs, &hit, &NoSets),
            Outcome::Verdict(Verdict::Accept)
        );
        assert_eq!(evaluate_rule(&filter(), &exprs, &miss, &NoSets), Outcome::NoMatch);
        assert_eq!(evaluate_rule(&filter(), &exprs, &udp, &NoSets), Outcome::NoMatch);
    }

    #[test]
    fn test_mixed_family_packet_is_rejected() {
        let exprs = Exprs::join([p::accept()]);
        let mixed = Packet::tcp(v4("10.0.0.1"), v4("2001:db8::1"), 1234, 22);
        assert!(!mixed.is_well_formed());
        assert_eq!(evaluate_rule(&filter(), &exprs, &mixed, &NoSets), Outcome::NoMatch);

        let mut sink = MemorySink::new();
        {
            let mut tx = Transaction::new(&mut sink);
            tx.add_table(&filter());
            tx.add_chain(&Chain::filter(&filter(), Hook::Input, Policy::Accept));
            tx.flush().unwrap();
        }
        let err = evaluate_chain(&sink, &filter(), "input", &mixed).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_ct_state_and_interfaces() {
        let exprs = Exprs::join([
            p::iif("eth0").unwrap(),
            p::ct_state(STATE_ESTABLISHED_RELATED),
            p::accept(),
        ]);
        let new = Packet::tcp(v4("1.1.1.1"), v4("2.2.2.2"), 1, 2).inbound("eth0");
        let est = new.clone().state(CT_ESTABLISHED);
        let other = est.clone().inbound("eth1");
        assert_eq!(evaluate_rule(&filter(), &exprs, &new, &NoSets), Outcome::NoMatch);
        assert!(matches!(evaluate_rule(&filter(), &exprs, &est, &NoSets), Outcome::Verdict(_)));
        assert_eq!(evaluate_rule(&filter(), &exprs, &other, &NoSets), Outcome::NoMatch);
    }

    #[test]
    fn test_network_prefix() {
        let profile = AddressFamily::Ipv4.profile();
        let exprs = Exprs::join([
            p::not_iif("lo").unwrap(),
            p::snet(profile, "127.0.0.0/8".parse().unwrap()).unwrap(),
            p::reject(),
        ]);
        let spoofed = Packet::tcp(v4("127.3.2.1"), v4("10.0.0.1"), 1, 2).inbound("eth0");
        let local = spoofed.clone().inbound("lo");
        assert!(matches!(
            evaluate_rule(&filter(), &exprs, &spoofed, &NoSets),
            Outcome::Verdict(Verdict::Reject { .. })
        ));
        assert_eq!(evaluate_rule(&filter(), &exprs, &local, &NoSets), Outcome::NoMatch);
    }

    #[test]
    fn test_over_limit_never_matches() {
        let exprs = Exprs::join([p::limit(RateLimit::parse("10+/p/s", 5).unwrap()), p::drop()]);
        let packet = Packet::udp(v4("1.1.1.1"), v4("2.2.2.2"), 1, 2);
        assert_eq!(evaluate_rule(&filter(), &exprs, &packet, &NoSets), Outcome::NoMatch);
    }

    #[test]
    fn test_chain_policy_and_jump() {
        let profile = AddressFamily::Ipv4.profile();
        let mut sink = MemorySink::new();
        let input = Chain::filter(&filter(), Hook::Input, Policy::Drop);
        let web = Chain::regular(&filter(), "web");
        {
            let mut tx = Transaction::new(&mut sink);
            tx.add_table(&filter());
            tx.add_chain(&input);
            tx.add_chain(&web);
            let web_rules = RuleAssembler::new(&web);
            web_rules
                .add(&mut tx, RuleData::new("web-80", Exprs::join([p::dport(80), p::accept()])))
                .unwrap();
            let input_rules = RuleAssembler::new(&input);
            input_rules
                .add(&mut tx, RuleData::new("to-web", Exprs::join([p::tcp(profile), p::jump("web")])))
                .unwrap();
            tx.flush().unwrap();
        }

        let http = Packet::tcp(v4("1.1.1.1"), v4("2.2.2.2"), 5000, 80);
        let decision = evaluate_chain(&sink, &filter(), "input", &http).unwrap();
        assert!(decision.accepted());
        assert_eq!(decision.id.as_deref(), Some("web-80"));

        let ssh = Packet::tcp(v4("1.1.1.1"), v4("2.2.2.2"), 5000, 22);
        let decision = evaluate_chain(&sink, &filter(), "input", &ssh).unwrap();
        assert_eq!(decision.verdict, Verdict::Drop);
        assert_eq!(decision.handle, None);
    }

    #[test]
    fn test_set_lookup_through_sink() {
        let profile = AddressFamily::Ipv4.profile();
        let mut sink = MemorySink::new();
        let input = Chain::filter(&filter(), Hook::Input, Policy::Drop);
        {
            let mut tx = Transaction::new(&mut sink);
            tx.add_table(&filter());
            tx.add_chain(&input);
            let trust = Set::addresses(&filter(), "trust").interval();
            let elements = trust.elements_from_specs(&["192.168.1.0/24"]).unwrap();
            let trust = tx.add_set(trust, elements).unwrap();
            RuleAssembler::new(&input)
                .add(
                    &mut tx,
                    RuleData::unnamed(Exprs::join([p::saddr_set(profile, &trust).unwrap(), p::accept()])),
                )
                .unwrap();
            tx.flush().unwrap();
        }
        let inside = Packet::udp(v4("192.168.1.77"), v4("10.0.0.1"), 1, 2);
        let outside = Packet::udp(v4("192.168.2.77"), v4("10.0.0.1"), 1, 2);
        assert!(evaluate_chain(&sink, &filter(), "input", &inside).unwrap().accepted());
        assert!(!evaluate_chain(&sink, &filter(), "input", &outside).unwrap().accepted());
    }
}
