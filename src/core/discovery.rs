//! WAN interface and address discovery
//!
//! The WAN interface is the one carrying the default route of the table
//! family. Routes come from procfs; addresses from `network-interface`.

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::debug;

use super::error::{Error, Result};
use super::family::AddressFamily;

/// Host network facts the controller needs
pub trait Discovery {
    /// Interface holding the default route and its primary address
    fn default_route(&self, family: AddressFamily) -> Result<(String, IpAddr)>;

    fn interface_addrs(&self, name: &str) -> Result<Vec<IpAddr>>;
}

const RTF_UP: u32 = 0x1;

/// Default route interface from `/proc/net/route`, lowest metric first
pub fn parse_ipv4_default_route(content: &str) -> Option<String> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 || fields[1] != "00000000" || fields[7] != "00000000" {
                return None;
            }
            let flags = u32::from_str_radix(fields[3], 16).ok()?;
            let metric: u32 = fields[6].parse().ok()?;
            (flags & RTF_UP != 0).then(|| (metric, fields[0].to_string()))
        })
        .min()
        .map(|(_, iface)| iface)
}

/// Default route interface from `/proc/net/ipv6_route`, lowest metric first
pub fn parse_ipv6_default_route(content: &str) -> Option<String> {
    const ANY: &str = "00000000000000000000000000000000";
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[0] != ANY || fields[1] != "00" {
                return None;
            }
            let iface = fields[9];
            // unreachable defaults hang off lo
            if iface == "lo" {
                return None;
            }
            let metric = u32::from_str_radix(fields[5], 16).ok()?;
            Some((metric, iface.to_string()))
        })
        .min()
        .map(|(_, iface)| iface)
}

fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// First usable address of `family`, preferring non link-local ones
pub fn primary_addr(family: AddressFamily, addrs: &[IpAddr]) -> Option<IpAddr> {
    let matching: Vec<IpAddr> = addrs
        .iter()
        .copied()
        .filter(|a| AddressFamily::of(a) == family)
        .collect();
    matching
        .iter()
        .find(|a| !is_link_local(a))
        .or(matching.first())
        .copied()
}

/// Procfs routes plus `getifaddrs`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiscovery;

impl Discovery for SystemDiscovery {
    fn default_route(&self, family: AddressFamily) -> Result<(String, IpAddr)> {
        let (path, parse): (&str, fn(&str) -> Option<String>) = match family {
            AddressFamily::Ipv4 => ("/proc/net/route", parse_ipv4_default_route),
            AddressFamily::Ipv6 => ("/proc/net/ipv6_route", parse_ipv6_default_route),
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Discovery(format!("cannot read {path}: {e}")))?;
        let iface = parse(&content)
            .ok_or_else(|| Error::Discovery(format!("no {family} default route")))?;
        let addrs = self.interface_addrs(&iface)?;
        let addr = primary_addr(family, &addrs).ok_or_else(|| {
            Error::Discovery(format!("default route interface {iface} has no {family} address"))
        })?;
        debug!("Default {family} route via {iface} ({addr})");
        Ok((iface, addr))
    }

    fn interface_addrs(&self, name: &str) -> Result<Vec<IpAddr>> {
        let interfaces = NetworkInterface::show()
            .map_err(|e| Error::Discovery(format!("cannot list interfaces: {e}")))?;
        let iface = interfaces
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| Error::Discovery(format!("interface {name} not found")))?;
        Ok(iface
            .addr
            .iter()
            .map(|addr| match addr {
                Addr::V4(v4) => IpAddr::V4(v4.ip),
                Addr::V6(v6) => IpAddr::V6(v6.ip),
            })
            .collect())
    }
}

/// Fixed answers, for dry runs and tests
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    wan: String,
    addrs: BTreeMap<String, Vec<IpAddr>>,
}

impl StaticDiscovery {
    pub fn new(wan: impl Into<String>, wan_addr: IpAddr) -> Self {
        let wan = wan.into();
        let mut addrs = BTreeMap::new();
        addrs.insert(wan.clone(), vec![wan_addr]);
        Self { wan, addrs }
    }

    pub fn with_interface(mut self, name: impl Into<String>, addrs: Vec<IpAddr>) -> Self {
        self.addrs.entry(name.into()).or_default().extend(addrs);
        self
    }
}

impl Discovery for StaticDiscovery {
    fn default_route(&self, family: AddressFamily) -> Result<(String, IpAddr)> {
        let addrs = self.interface_addrs(&self.wan)?;
        let addr = primary_addr(family, &addrs)
            .ok_or_else(|| Error::Discovery(format!("no {family} default route")))?;
        Ok((self.wan.clone(), addr))
    }

    fn interface_addrs(&self, name: &str) -> Result<Vec<IpAddr>> {
        self.addrs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Discovery(format!("interface {name} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
wlan0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0
eth0\t00000000\t0100000A\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0000000A\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";

    #[test]
    fn test_ipv4_default_route_lowest_metric() {
        assert_eq!(parse_ipv4_default_route(ROUTE).as_deref(), Some("eth0"));
        assert_eq!(parse_ipv4_default_route("Iface\tDestination\n"), None);
    }

    #[test]
    fn test_ipv6_default_route_skips_lo() {
        let content = "\
00000000000000000000000000000000 00 00000000000000000000000000000000 00 00000000000000000000000000000000 ffffffff 00000001 00000000 00200200 lo
00000000000000000000000000000000 00 00000000000000000000000000000000 00 fe800000000000000000000000000001 00000400 00000001 00000000 00450003 eth1
20010db8000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000001 00000000 00000001 eth1
";
        assert_eq!(parse_ipv6_default_route(content).as_deref(), Some("eth1"));
    }

    #[test]
    fn test_primary_addr_prefers_global() {
        let addrs: Vec<IpAddr> = vec![
            "fe80::1".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
            "2001:db8::5".parse().unwrap(),
        ];
        assert_eq!(
            primary_addr(AddressFamily::Ipv6, &addrs),
            Some("2001:db8::5".parse().unwrap())
        );
        assert_eq!(
            primary_addr(AddressFamily::Ipv4, &addrs),
            Some("10.0.0.5".parse().unwrap())
        );
        assert_eq!(primary_addr(AddressFamily::Ipv4, &addrs[..1]), None);
    }

    #[test]
    fn test_static_discovery() {
        let d = StaticDiscovery::new("eth0", "203.0.113.7".parse().unwrap())
            .with_interface("eth1", vec!["192.168.1.1".parse().unwrap()]);
        let (iface, addr) = d.default_route(AddressFamily::Ipv4).unwrap();
        assert_eq!(iface, "eth0");
        assert_eq!(addr, "203.0.113.7".parse::<IpAddr>().unwrap());
        assert!(d.default_route(AddressFamily::Ipv6).is_err());
        assert!(d.interface_addrs("eth9").is_err());
    }
}
