//! Table-scoped match sets and element parsing
//!
//! Sets hold fixed-width byte keys. Interval-capable sets additionally hold
//! closed `[key, key_end]` ranges. Human specs (`"80"`, `"60001-60005"`,
//! `"10.0.0.0/8"`, `"192.168.0.1-192.168.0.9"`) are converted by the
//! `elements_from_*` functions.
//!
//! A range or CIDR spec is only accepted for a set carrying the interval
//! flag; anything else is a configuration error rather than a silently
//! expanded element list.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use super::conntrack::CtState;
use super::error::{Error, Result};
use super::expr::SetRef;
use super::family::{AddressFamily, addr_bytes, unmap};
use super::ruleset::Table;

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
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SetKeyType {
    Ipv4Addr,
    Ipv6Addr,
    InetService,
    CtState,
}

impl SetKeyType {
    pub const fn len(self) -> u32 {
        match self {
            SetKeyType::Ipv4Addr | SetKeyType::CtState => 4,
            SetKeyType::Ipv6Addr => 16,
            SetKeyType::InetService => 2,
        }
    }

    pub const fn family(self) -> Option<AddressFamily> {
        match self {
            SetKeyType::Ipv4Addr => Some(AddressFamily::Ipv4),
            SetKeyType::Ipv6Addr => Some(AddressFamily::Ipv6),
            SetKeyType::InetService | SetKeyType::CtState => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetFlags {
    pub anonymous: bool,
    pub constant: bool,
    pub dynamic: bool,
    pub timeout: bool,
    pub interval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Set {
    pub table: String,
    pub family: AddressFamily,
    /// Empty for anonymous sets until the transaction names them
    pub name: String,
    pub id: u32,
    pub key_type: SetKeyType,
    pub flags: SetFlags,
    /// Default element timeout
    pub timeout: Option<Duration>,
}

impl Set {
    pub fn new(table: &Table, name: impl Into<String>, key_type: SetKeyType) -> Self {
        Self {
            table: table.name.clone(),
            family: table.family,
            name: name.into(),
            id: 0,
            key_type,
            flags: SetFlags::default(),
            timeout: None,
        }
    }

    /// Anonymous, constant set; named when declared in a transaction
    pub fn anonymous(table: &Table, key_type: SetKeyType) -> Self {
        let mut set = Self::new(table, String::new(), key_type);
        set.flags.anonymous = true;
        set.flags.constant = true;
        set
    }

    /// Address set keyed by the table's family
    pub fn addresses(table: &Table, name: impl Into<String>) -> Self {
        Self::new(table, name, table.family.addr_key_type())
    }

    pub fn interval(mut self) -> Self {
        self.flags.interval = true;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.flags.dynamic = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.flags.timeout = true;
        self.timeout = Some(timeout);
        self
    }

    /// Allows per-element timeouts without a set-wide default
    pub fn element_timeouts(mut self) -> Self {
        self.flags.timeout = true;
        self
    }

    pub fn set_ref(&self) -> SetRef {
        SetRef {
            name: self.name.clone(),
            id: self.id,
        }
    }

    /// Parses specs according to this set's key type and flags.
    pub fn elements_from_specs<S: AsRef<str>>(&self, specs: &[S]) -> Result<Vec<SetElement>> {
        match self.key_type {
            SetKeyType::InetService => elements_from_ports(specs, self.flags.interval),
            SetKeyType::Ipv4Addr => {
                elements_from_addresses(AddressFamily::Ipv4, specs, self.flags.interval)
            }
            SetKeyType::Ipv6Addr => {
                elements_from_addresses(AddressFamily::Ipv6, specs, self.flags.interval)
            }
            SetKeyType::CtState => elements_from_ct_states(specs),
        }
    }

    /// Checks an element batch fits this set's key width and flags.
    pub fn check_elements(&self, elements: &[SetElement]) -> Result<()> {
        let width = self.key_type.len() as usize;
        for element in elements {
            if element.key.len() != width
                || element.key_end.as_ref().is_some_and(|end| end.len() != width)
            {
                return Err(Error::Configuration(format!(
                    "element width does not match {} set '{}'",
                    self.key_type, self.name
                )));
            }
            if element.key_end.is_some() && !self.flags.interval {
                return Err(Error::Configuration(format!(
                    "set '{}' is not interval-capable; ranges are not allowed",
                    self.name
                )));
            }
            if element.timeout.is_some() && !self.flags.timeout {
                return Err(Error::Configuration(format!(
                    "set '{}' has no timeout flag; per-element timeouts are not allowed",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// One set member: a discrete key or a closed interval
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetElement {
    pub key: Vec<u8>,
    /// Inclusive upper bound for interval elements
    pub key_end: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl SetElement {
    pub fn single(key: Vec<u8>) -> Self {
        Self {
            key,
            key_end: None,
            timeout: None,
        }
    }

    pub fn range(start: Vec<u8>, end: Vec<u8>) -> Self {
        if start == end {
            return Self::single(start);
        }
        Self {
            key: start,
            key_end: Some(end),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Identity ignoring timeouts (used for add/remove idempotence)
    pub fn same_key(&self, other: &SetElement) -> bool {
        self.key == other.key && self.key_end == other.key_end
    }

    pub fn contains(&self, value: &[u8]) -> bool {
        match &self.key_end {
            Some(end) => self.key.as_slice() <= value && value <= end.as_slice(),
            None => self.key == value,
        }
    }

    /// Renders the element back to the spec form it was parsed from.
    pub fn to_spec(&self, key_type: SetKeyType) -> String {
        let render = |bytes: &[u8]| render_key(key_type, bytes);
        match &self.key_end {
            None => render(&self.key),
            Some(end) => {
                if let Some(prefix) = cidr_prefix(key_type, &self.key, end) {
                    format!("{}/{prefix}", render(&self.key))
                } else {
                    format!("{}-{}", render(&self.key), render(end))
                }
            }
        }
    }

    /// Decodes the bounds of a port element
    pub fn port_bounds(&self) -> Option<(u16, u16)> {
        let start = u16::from_be_bytes(self.key.as_slice().try_into().ok()?);
        let end = match &self.key_end {
            Some(end) => u16::from_be_bytes(end.as_slice().try_into().ok()?),
            None => start,
        };
        Some((start, end))
    }
}

fn render_key(key_type: SetKeyType, bytes: &[u8]) -> String {
    match key_type {
        SetKeyType::InetService => bytes
            .try_into()
            .map(|b: [u8; 2]| u16::from_be_bytes(b).to_string())
            .unwrap_or_default(),
        SetKeyType::Ipv4Addr => bytes
            .try_into()
            .map(|b: [u8; 4]| Ipv4Addr::from(b).to_string())
            .unwrap_or_default(),
        SetKeyType::Ipv6Addr => bytes
            .try_into()
            .map(|b: [u8; 16]| Ipv6Addr::from(b).to_string())
            .unwrap_or_default(),
        SetKeyType::CtState => bytes
            .try_into()
            .ok()
            .and_then(|b: [u8; 4]| CtState::new(u32::from_ne_bytes(b)).ok())
            .map(|s| s.to_string())
            .unwrap_or_default(),
    }
}

fn as_u128(bytes: &[u8]) -> u128 {
    bytes.iter().fold(0u128, |acc, b| (acc << 8) | u128::from(*b))
}

/// Prefix length if `[start, end]` is exactly one CIDR block
fn cidr_prefix(key_type: SetKeyType, start: &[u8], end: &[u8]) -> Option<u32> {
    if key_type.family().is_none() {
        return None;
    }
    let bits = key_type.len() * 8;
    let host = as_u128(start) ^ as_u128(end);
    // host part must be all ones, start must be aligned to it
    if host.count_ones() + host.leading_zeros() != 128 || as_u128(start) & host != 0 {
        return None;
    }
    Some(bits - host.count_ones())
}

fn parse_port(raw: &str, spec: &str) -> Result<u16> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("invalid port '{raw}' in '{spec}'")))
}

/// Converts port specs (`"80"`, `"60001-60005"`) into set elements.
pub fn elements_from_ports<S: AsRef<str>>(specs: &[S], interval: bool) -> Result<Vec<SetElement>> {
    specs
        .iter()
        .map(|spec| {
            let spec = spec.as_ref().trim();
            if let Some((lo, hi)) = spec.split_once('-') {
                let lo = parse_port(lo, spec)?;
                let hi = parse_port(hi, spec)?;
                if lo > hi {
                    return Err(Error::Parse(format!("port range '{spec}' is reversed")));
                }
                if !interval && lo != hi {
                    return Err(Error::Configuration(format!(
                        "port range '{spec}' requires an interval set"
                    )));
                }
                Ok(SetElement::range(
                    lo.to_be_bytes().to_vec(),
                    hi.to_be_bytes().to_vec(),
                ))
            } else {
                Ok(SetElement::single(
                    parse_port(spec, spec)?.to_be_bytes().to_vec(),
                ))
            }
        })
        .collect()
}

fn parse_addr(raw: &str, family: AddressFamily, spec: &str) -> Result<IpAddr> {
    let addr: IpAddr = raw
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("invalid address '{raw}' in '{spec}'")))?;
    let addr = unmap(addr);
    if AddressFamily::of(&addr) != family {
        return Err(Error::Configuration(format!(
            "address '{raw}' does not belong to the {family} set family"
        )));
    }
    Ok(addr)
}

fn network_bounds(net: &IpNetwork) -> (Vec<u8>, Vec<u8>) {
    match net {
        IpNetwork::V4(v4) => {
            let bits = u32::from(v4.network());
            let host = u32::MAX.checked_shr(u32::from(v4.prefix())).unwrap_or(0);
            (
                bits.to_be_bytes().to_vec(),
                (bits | host).to_be_bytes().to_vec(),
            )
        }
        IpNetwork::V6(v6) => {
            let bits = u128::from(v6.network());
            let host = u128::MAX.checked_shr(u32::from(v6.prefix())).unwrap_or(0);
            (
                bits.to_be_bytes().to_vec(),
                (bits | host).to_be_bytes().to_vec(),
            )
        }
    }
}

/// Converts address specs (single, `"A-B"`, CIDR) of one family into set elements.
pub fn elements_from_addresses<S: AsRef<str>>(
    family: AddressFamily,
    specs: &[S],
    interval: bool,
) -> Result<Vec<SetElement>> {
    specs
        .iter()
        .map(|spec| {
            let spec = spec.as_ref().trim();
            if spec.contains('/') {
                let net: IpNetwork = spec
                    .parse()
                    .map_err(|_| Error::Parse(format!("invalid CIDR '{spec}'")))?;
                if AddressFamily::of(&net.ip()) != family {
                    return Err(Error::Configuration(format!(
                        "CIDR '{spec}' does not belong to the {family} set family"
                    )));
                }
                let (start, end) = network_bounds(&net);
                if !interval && start != end {
                    return Err(Error::Configuration(format!(
                        "CIDR '{spec}' requires an interval set"
                    )));
                }
                Ok(SetElement::range(start, end))
            } else if let Some((lo, hi)) = spec.split_once('-') {
                let lo = addr_bytes(&parse_addr(lo, family, spec)?);
                let hi = addr_bytes(&parse_addr(hi, family, spec)?);
                if lo > hi {
                    return Err(Error::Parse(format!("address range '{spec}' is reversed")));
                }
                if !interval && lo != hi {
                    return Err(Error::Configuration(format!(
                        "address range '{spec}' requires an interval set"
                    )));
                }
                Ok(SetElement::range(lo, hi))
            } else {
                Ok(SetElement::single(addr_bytes(&parse_addr(
                    spec, family, spec,
                )?)))
            }
        })
        .collect()
}

/// Converts ct state specs (`"new"`, `"established,related"`) into set elements.
pub fn elements_from_ct_states<S: AsRef<str>>(specs: &[S]) -> Result<Vec<SetElement>> {
    specs
        .iter()
        .map(|spec| {
            let state = spec
                .as_ref()
                .split(',')
                .map(|name| CtState::from_name(name.trim()))
                .try_fold(None::<CtState>, |acc, s| {
                    let s = s?;
                    Ok::<_, Error>(Some(acc.map_or(s, |a| a | s)))
                })?
                .ok_or_else(|| Error::Parse("empty ct state spec".to_string()))?;
            Ok(SetElement::single(state.to_register_bytes().to_vec()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(family: AddressFamily) -> Table {
        Table::new(family, "filter")
    }

    #[test]
    fn test_port_range_round_trip() {
        let elements = elements_from_ports(&["60001-60005"], true).unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].port_bounds(), Some((60001, 60005)));
        assert_eq!(elements[0].to_spec(SetKeyType::InetService), "60001-60005");
    }

    #[test]
    fn test_port_range_needs_interval() {
        let err = elements_from_ports(&["80", "60001-60005"], false).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        // degenerate range is just a single port
        assert!(elements_from_ports(&["80-80"], false).is_ok());
    }

    #[test]
    fn test_malformed_port_specs() {
        for bad in ["http", "70000", "5-", "9-1", ""] {
            let err = elements_from_ports(&[bad], true).unwrap_err();
            assert!(matches!(err, Error::Parse(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn test_ipv4_cidr_and_range() {
        let elements = elements_from_addresses(
            AddressFamily::Ipv4,
            &["10.0.0.0/8", "129.168.0.1-129.168.0.255", "1.2.3.4"],
            true,
        )
        .unwrap();
        assert_eq!(elements[0].key, vec![10, 0, 0, 0]);
        assert_eq!(elements[0].key_end, Some(vec![10, 255, 255, 255]));
        assert_eq!(elements[0].to_spec(SetKeyType::Ipv4Addr), "10.0.0.0/8");
        assert_eq!(
            elements[1].to_spec(SetKeyType::Ipv4Addr),
            "129.168.0.1-129.168.0.255"
        );
        assert_eq!(elements[2].to_spec(SetKeyType::Ipv4Addr), "1.2.3.4");
        assert!(elements[0].contains(&[10, 1, 2, 3]));
        assert!(!elements[0].contains(&[11, 0, 0, 0]));
    }

    #[test]
    fn test_ipv6_cidr() {
        let elements =
            elements_from_addresses(AddressFamily::Ipv6, &["2001:db8::/32"], true).unwrap();
        assert_eq!(elements[0].key.len(), 16);
        assert_eq!(elements[0].to_spec(SetKeyType::Ipv6Addr), "2001:db8::/32");
    }

    #[test]
    fn test_family_mismatch_is_configuration_error() {
        let err = elements_from_addresses(AddressFamily::Ipv6, &["10.0.0.1"], false).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_cidr_requires_interval() {
        let err = elements_from_addresses(AddressFamily::Ipv4, &["10.0.0.0/24"], false).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        // host route collapses to one key
        let host = elements_from_addresses(AddressFamily::Ipv4, &["10.0.0.1/32"], false).unwrap();
        assert_eq!(host[0].key_end, None);
    }

    #[test]
    fn test_set_dispatches_by_key_type() {
        let set = Set::addresses(&table(AddressFamily::Ipv4), "trust").interval();
        let elements = set.elements_from_specs(&["192.168.1.0/24"]).unwrap();
        assert!(set.check_elements(&elements).is_ok());

        let discrete = Set::addresses(&table(AddressFamily::Ipv4), "plain");
        assert!(discrete.check_elements(&elements).is_err());
    }

    #[test]
    fn test_timeout_requires_flag() {
        let set = Set::addresses(&table(AddressFamily::Ipv4), "ban").interval();
        let element = SetElement::single(vec![1, 2, 3, 4]).with_timeout(Duration::from_secs(60));
        assert!(set.check_elements(std::slice::from_ref(&element)).is_err());
        let set = set.with_timeout(Duration::from_secs(3600));
        assert!(set.check_elements(&[element]).is_ok());
    }

    #[test]
    fn test_ct_state_elements() {
        let elements = elements_from_ct_states(&["established,related", "new"]).unwrap();
        assert_eq!(elements[0].key, 6u32.to_ne_bytes().to_vec());
        assert_eq!(elements[1].to_spec(SetKeyType::CtState), "new");
        assert!(elements_from_ct_states(&["bogus"]).is_err());
    }

    #[test]
    fn test_anonymous_flags() {
        let set = Set::anonymous(&table(AddressFamily::Ipv4), SetKeyType::InetService);
        assert!(set.flags.anonymous && set.flags.constant);
        assert!(set.name.is_empty());
    }
}
