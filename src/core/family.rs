//! Address-family profiles
//!
//! Every offset a rule uses depends on the family of the table it lives in.
//! Instead of branching on IPv4/IPv6 in each builder, a [`FamilyProfile`] is
//! selected once per table (see [`AddressFamily::profile`]) and threaded
//! through the primitives.
//!
//! Offsets are in bytes, relative to the network or transport header.

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::sets::SetKeyType;

pub const IPV4_SRC_OFFSET: u32 = 12;
pub const IPV4_DST_OFFSET: u32 = 16;
pub const IPV4_ADDR_LEN: u32 = 4;
pub const IPV4_PROTO_OFFSET: u32 = 9;

pub const IPV6_SRC_OFFSET: u32 = 8;
pub const IPV6_DST_OFFSET: u32 = 24;
pub const IPV6_ADDR_LEN: u32 = 16;
pub const IPV6_NEXTHDR_OFFSET: u32 = 6;

pub const PROTO_LEN: u32 = 1;

pub const SRC_PORT_OFFSET: u32 = 0;
pub const DST_PORT_OFFSET: u32 = 2;
pub const PORT_LEN: u32 = 2;

pub const ICMP_TYPE_OFFSET: u32 = 0;
pub const ICMP_TYPE_LEN: u32 = 1;

/// Interface names are compared as 16 NUL-padded bytes
pub const IFNAME_LEN: u32 = 16;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;

pub const NFPROTO_IPV4: u8 = 2;
pub const NFPROTO_IPV6: u8 = 10;

const LOOPBACK_V4: Ipv4Network = match Ipv4Network::new_checked(Ipv4Addr::new(127, 0, 0, 0), 8) {
    Some(net) => net,
    None => panic!("127.0.0.0/8 is a valid network"),
};

static ZERO_XOR4: [u8; 4] = [0; 4];
static ZERO_XOR16: [u8; 16] = [0; 16];

/// Address family of a table. Immutable once the table is declared.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    #[strum(to_string = "ipv4", serialize = "ip")]
    Ipv4,
    #[strum(to_string = "ipv6", serialize = "ip6")]
    Ipv6,
}

/// Byte layout of one address family.
#[derive(Debug, PartialEq, Eq)]
pub struct FamilyProfile {
    pub family: AddressFamily,
    pub src_offset: u32,
    pub dst_offset: u32,
    pub addr_len: u32,
    pub zero_xor: &'static [u8],
    /// Offset of the protocol / next-header byte in the network header
    pub l4proto_offset: u32,
    pub icmp_proto: u8,
    pub echo_request_type: u8,
    pub nfproto: u8,
}

static IPV4_PROFILE: FamilyProfile = FamilyProfile {
    family: AddressFamily::Ipv4,
    src_offset: IPV4_SRC_OFFSET,
    dst_offset: IPV4_DST_OFFSET,
    addr_len: IPV4_ADDR_LEN,
    zero_xor: &ZERO_XOR4,
    l4proto_offset: IPV4_PROTO_OFFSET,
    icmp_proto: PROTO_ICMP,
    echo_request_type: ICMP_ECHO_REQUEST,
    nfproto: NFPROTO_IPV4,
};

static IPV6_PROFILE: FamilyProfile = FamilyProfile {
    family: AddressFamily::Ipv6,
    src_offset: IPV6_SRC_OFFSET,
    dst_offset: IPV6_DST_OFFSET,
    addr_len: IPV6_ADDR_LEN,
    zero_xor: &ZERO_XOR16,
    l4proto_offset: IPV6_NEXTHDR_OFFSET,
    icmp_proto: PROTO_ICMPV6,
    echo_request_type: ICMPV6_ECHO_REQUEST,
    nfproto: NFPROTO_IPV6,
};

/// Which end of the flow a predicate looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Source,
    Destination,
}

impl AddressFamily {
    pub const fn profile(self) -> &'static FamilyProfile {
        match self {
            AddressFamily::Ipv4 => &IPV4_PROFILE,
            AddressFamily::Ipv6 => &IPV6_PROFILE,
        }
    }

    /// Family name as nftables spells it
    pub const fn nft_name(self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "ip",
            AddressFamily::Ipv6 => "ip6",
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Returns true if `addr` belongs to this family (IPv4-mapped IPv6 counts as IPv4).
    pub fn contains(self, addr: &IpAddr) -> bool {
        Self::of(&unmap(*addr)) == self
    }

    pub const fn addr_key_type(self) -> SetKeyType {
        match self {
            AddressFamily::Ipv4 => SetKeyType::Ipv4Addr,
            AddressFamily::Ipv6 => SetKeyType::Ipv6Addr,
        }
    }

    /// Loopback range that must never arrive on a non-loopback interface
    pub fn loopback_net(self) -> IpNetwork {
        match self {
            AddressFamily::Ipv4 => IpNetwork::V4(LOOPBACK_V4),
            AddressFamily::Ipv6 => IpNetwork::V6(Ipv6Network::from(Ipv6Addr::LOCALHOST)),
        }
    }
}

impl FamilyProfile {
    pub const fn addr_offset(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Source => self.src_offset,
            Direction::Destination => self.dst_offset,
        }
    }
}

/// Collapses IPv4-mapped IPv6 addresses to plain IPv4
pub fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 @ IpAddr::V4(_) => v4,
    }
}

/// Network-order bytes of an address
pub fn addr_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}
