//! Baseline policy compiler
//!
//! Turns a [`PolicyConfig`] plus the discovered WAN interface into the
//! objects and rules of the host firewall. Rule groups are plain functions
//! returning `(chain, rule)` pairs in installation order; nothing touches a
//! transaction until [`queue`] runs.
//!
//! Installation order of a full apply:
//!
//! 1. loopback accept, loopback-range spoof reject, blacklist drop
//! 2. per interface (WAN first, then each extra interface): ICMP, services,
//!    trusted sources, overlay UDP port
//! 3. overlay interface: ICMP and manager access
//! 4. forward chain: SMTP relay drop, overlay <-> WAN and overlay <-> overlay
//! 5. source NAT to the WAN address

use std::net::IpAddr;
use tracing::debug;

use super::conntrack::{STATE_ESTABLISHED, STATE_ESTABLISHED_RELATED, STATE_NEW, STATE_NEW_ESTABLISHED};
use super::error::Result;
use super::expr::{Exprs, RejectKind};
use super::family::{AddressFamily, FamilyProfile};
use super::primitives as p;
use super::rule::{RuleAssembler, RuleData};
use super::ruleset::{Chain, Hook, Table};
use super::sets::{Set, SetElement, SetKeyType};
use super::transaction::{Sink, Transaction};
use crate::config::PolicyConfig;

pub const LOOPBACK_IFACE: &str = "lo";

pub const TRUSTED_SET: &str = "trust_ipset";
pub const MANAGER_SET: &str = "manager_ipset";
pub const FORWARD_SET: &str = "forward_ipset";
pub const BLACKLIST_SET: &str = "blacklist_ipset";
pub const TRUSTED_PORTS_SET: &str = "trust_ports";
pub const MANAGER_PORTS_SET: &str = "manager_ports";

pub const DNS_PORT: u16 = 53;
pub const HTTP_PORTS: [&str; 2] = ["80", "443"];
pub const SMTP_PORTS: [&str; 3] = ["25", "465", "587"];
/// Relay port dropped on forwarded traffic
pub const SMTP_RELAY_PORT: u16 = 25;

const ICMP_PORT_UNREACHABLE: u8 = 3;
const ICMPV6_PORT_UNREACHABLE: u8 = 4;

/// Tables, chains and sets of the baseline policy.
///
/// Built from config with unassigned set ids; [`declare_apply`] and
/// [`declare_cleanup`] return the declared copy rules must reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub filter: Table,
    pub nat: Table,
    pub input: Chain,
    pub forward: Chain,
    pub output: Chain,
    pub postrouting: Chain,
    pub trusted: Set,
    pub manager: Set,
    pub forward_ips: Set,
    pub blacklist: Set,
    pub trusted_ports: Set,
    pub manager_ports: Set,
    pub http_ports: Set,
    pub smtp_ports: Set,
}

impl Layout {
    pub fn new(config: &PolicyConfig) -> Self {
        let filter = Table::new(config.family, config.filter_table_name());
        let nat = Table::new(config.family, config.nat_table_name());
        let policy = config.default_policy;
        Self {
            input: Chain::filter(&filter, Hook::Input, policy),
            forward: Chain::filter(&filter, Hook::Forward, policy),
            output: Chain::filter(&filter, Hook::Output, policy),
            postrouting: Chain::nat(&nat, Hook::Postrouting),
            trusted: Set::addresses(&filter, TRUSTED_SET).interval(),
            manager: Set::addresses(&filter, MANAGER_SET).interval(),
            forward_ips: Set::addresses(&filter, FORWARD_SET).interval(),
            blacklist: Set::addresses(&filter, BLACKLIST_SET)
                .interval()
                .element_timeouts(),
            trusted_ports: Set::new(&filter, TRUSTED_PORTS_SET, SetKeyType::InetService).interval(),
            manager_ports: Set::new(&filter, MANAGER_PORTS_SET, SetKeyType::InetService).interval(),
            http_ports: Set::anonymous(&filter, SetKeyType::InetService),
            smtp_ports: Set::anonymous(&filter, SetKeyType::InetService),
            filter,
            nat,
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.filter.family
    }

    pub fn profile(&self) -> &'static FamilyProfile {
        self.filter.family.profile()
    }
}

fn declare_filter_objects<S: Sink>(
    tx: &mut Transaction<'_, S>,
    layout: &Layout,
    config: &PolicyConfig,
    trusted: Vec<SetElement>,
) -> Result<Layout> {
    let mut declared = layout.clone();
    tx.add_table(&layout.filter);
    tx.add_chain(&layout.input);
    tx.add_chain(&layout.forward);
    tx.add_chain(&layout.output);

    declared.trusted = tx.add_set(layout.trusted.clone(), trusted)?;
    let ports = layout.trusted_ports.elements_from_specs(&config.trusted_ports)?;
    declared.trusted_ports = tx.add_set(layout.trusted_ports.clone(), ports)?;
    if config.services.http {
        let ports = layout.http_ports.elements_from_specs(&HTTP_PORTS)?;
        declared.http_ports = tx.add_set(layout.http_ports.clone(), ports)?;
    }
    if config.services.smtp {
        let ports = layout.smtp_ports.elements_from_specs(&SMTP_PORTS)?;
        declared.smtp_ports = tx.add_set(layout.smtp_ports.clone(), ports)?;
    }
    Ok(declared)
}

/// Resets the ruleset and declares every table, chain and set of a full
/// apply. Address sets start empty.
pub fn declare_apply<S: Sink>(
    tx: &mut Transaction<'_, S>,
    layout: &Layout,
    config: &PolicyConfig,
) -> Result<Layout> {
    tx.flush_ruleset();
    let mut declared = declare_filter_objects(tx, layout, config, Vec::new())?;
    declared.manager = tx.add_set(layout.manager.clone(), Vec::new())?;
    declared.forward_ips = tx.add_set(layout.forward_ips.clone(), Vec::new())?;
    declared.blacklist = tx.add_set(layout.blacklist.clone(), Vec::new())?;
    let ports = layout.manager_ports.elements_from_specs(&config.manager_ports)?;
    declared.manager_ports = tx.add_set(layout.manager_ports.clone(), ports)?;

    tx.add_table(&layout.nat);
    tx.add_chain(&layout.postrouting);
    Ok(declared)
}

/// Resets the ruleset and declares the reduced object set of a cleanup:
/// the filter table with its base chains and the trusted set, refilled
/// with `trusted`.
pub fn declare_cleanup<S: Sink>(
    tx: &mut Transaction<'_, S>,
    layout: &Layout,
    config: &PolicyConfig,
    trusted: Vec<SetElement>,
) -> Result<Layout> {
    tx.flush_ruleset();
    declare_filter_objects(tx, layout, config, trusted)
}

/// Planned rules in installation order
pub type Planned<'a> = Vec<(&'a Chain, RuleData)>;

fn rule(id: impl Into<String>, parts: impl IntoIterator<Item = Exprs>) -> RuleData {
    RuleData::new(id, Exprs::join(parts))
}

fn reject_port_unreachable(profile: &FamilyProfile) -> Exprs {
    let code = match profile.family {
        AddressFamily::Ipv4 => ICMP_PORT_UNREACHABLE,
        AddressFamily::Ipv6 => ICMPV6_PORT_UNREACHABLE,
    };
    p::reject_with(RejectKind::IcmpUnreachable, code)
}

/// Builds rule groups against a declared [`Layout`].
#[derive(Debug, Clone, Copy)]
pub struct PolicyCompiler<'a> {
    config: &'a PolicyConfig,
    layout: &'a Layout,
    wan_iface: &'a str,
    wan_addr: IpAddr,
}

impl<'a> PolicyCompiler<'a> {
    pub fn new(config: &'a PolicyConfig, layout: &'a Layout, wan_iface: &'a str, wan_addr: IpAddr) -> Self {
        Self {
            config,
            layout,
            wan_iface,
            wan_addr,
        }
    }

    fn profile(&self) -> &'static FamilyProfile {
        self.layout.profile()
    }

    /// WAN first, then configured extras, without duplicates
    pub fn interfaces(&self) -> Vec<&'a str> {
        let mut ifaces = vec![self.wan_iface];
        for iface in &self.config.ifaces {
            if !ifaces.contains(&iface.as_str()) {
                ifaces.push(iface.as_str());
            }
        }
        ifaces
    }

    pub fn loopback(&self) -> Result<Planned<'a>> {
        let l = self.layout;
        let v = self.profile();
        Ok(vec![
            (&l.input, rule("loopback-in", [p::iif(LOOPBACK_IFACE)?, p::accept()])),
            (
                &l.input,
                rule(
                    "loopback-spoof",
                    [
                        p::not_iif(LOOPBACK_IFACE)?,
                        p::snet(v, v.family.loopback_net())?,
                        reject_port_unreachable(v),
                    ],
                ),
            ),
            (&l.output, rule("loopback-out", [p::oif(LOOPBACK_IFACE)?, p::accept()])),
        ])
    }

    pub fn blacklist(&self) -> Result<Planned<'a>> {
        let l = self.layout;
        Ok(vec![(
            &l.input,
            rule("blacklist", [p::saddr_set(self.profile(), &l.blacklist)?, p::drop()]),
        )])
    }

    fn host_base(&self, iface: &str) -> Result<Planned<'a>> {
        let l = self.layout;
        let v = self.profile();
        Ok(vec![
            (
                &l.input,
                rule(
                    format!("icmp-in:{iface}"),
                    [p::iif(iface)?, p::icmp(v), p::ct_state(STATE_ESTABLISHED_RELATED), p::accept()],
                ),
            ),
            (
                &l.output,
                rule(
                    format!("icmp-out:{iface}"),
                    [p::oif(iface)?, p::icmp(v), p::ct_state(STATE_NEW_ESTABLISHED), p::accept()],
                ),
            ),
        ])
    }

    fn services(&self, iface: &str) -> Result<Planned<'a>> {
        let l = self.layout;
        let v = self.profile();
        let services = &self.config.services;
        let mut planned = Vec::new();

        if services.dns {
            for (name, proto) in [("udp", p::udp(v)), ("tcp", p::tcp(v))] {
                planned.push((
                    &l.output,
                    rule(
                        format!("dns-{name}-out:{iface}"),
                        [p::oif(iface)?, proto.clone(), p::dport(DNS_PORT), p::ct_state(STATE_NEW_ESTABLISHED), p::accept()],
                    ),
                ));
                planned.push((
                    &l.input,
                    rule(
                        format!("dns-{name}-in:{iface}"),
                        [p::iif(iface)?, proto, p::sport(DNS_PORT), p::ct_state(STATE_ESTABLISHED_RELATED), p::accept()],
                    ),
                ));
            }
        }

        if services.http {
            planned.push((
                &l.input,
                rule(
                    format!("http-in:{iface}"),
                    [p::iif(iface)?, p::tcp(v), p::dport_set(&l.http_ports)?, p::ct_state(STATE_NEW_ESTABLISHED), p::accept()],
                ),
            ));
            planned.push((
                &l.output,
                rule(
                    format!("http-out:{iface}"),
                    [p::oif(iface)?, p::tcp(v), p::sport_set(&l.http_ports)?, p::ct_state(STATE_ESTABLISHED), p::accept()],
                ),
            ));
        }

        if services.smtp {
            planned.push((
                &l.output,
                rule(
                    format!("smtp-out:{iface}"),
                    [p::oif(iface)?, p::tcp(v), p::dport_set(&l.smtp_ports)?, p::ct_state(STATE_NEW_ESTABLISHED), p::accept()],
                ),
            ));
            planned.push((
                &l.input,
                rule(
                    format!("smtp-in:{iface}"),
                    [p::iif(iface)?, p::tcp(v), p::sport_set(&l.smtp_ports)?, p::ct_state(STATE_ESTABLISHED), p::accept()],
                ),
            ));
        }
        Ok(planned)
    }

    fn trusted(&self, iface: &str) -> Result<Planned<'a>> {
        let l = self.layout;
        let v = self.profile();
        Ok(vec![
            (
                &l.input,
                rule(
                    format!("trust-ping:{iface}"),
                    [p::iif(iface)?, p::icmp_echo_request(v), p::saddr_set(v, &l.trusted)?, p::ct_state(STATE_NEW), p::accept()],
                ),
            ),
            (
                &l.input,
                rule(
                    format!("trust-in:{iface}"),
                    [
                        p::iif(iface)?,
                        p::tcp(v),
                        p::dport_set(&l.trusted_ports)?,
                        p::saddr_set(v, &l.trusted)?,
                        p::ct_state(STATE_NEW_ESTABLISHED),
                        p::accept(),
                    ],
                ),
            ),
            (
                &l.output,
                rule(
                    format!("trust-out:{iface}"),
                    [
                        p::oif(iface)?,
                        p::tcp(v),
                        p::sport_set(&l.trusted_ports)?,
                        p::daddr_set(v, &l.trusted)?,
                        p::ct_state(STATE_ESTABLISHED),
                        p::accept(),
                    ],
                ),
            ),
        ])
    }

    /// Overlay UDP port reachable on `iface`; empty when the port is 0.
    fn public(&self, iface: &str) -> Result<Planned<'a>> {
        let port = self.config.overlay_port;
        if port == 0 {
            return Ok(Vec::new());
        }
        let l = self.layout;
        let v = self.profile();
        Ok(vec![
            (&l.input, rule(format!("overlay-port-in:{iface}"), [p::iif(iface)?, p::udp(v), p::dport(port), p::accept()])),
            (&l.output, rule(format!("overlay-port-out:{iface}"), [p::oif(iface)?, p::udp(v), p::sport(port), p::accept()])),
        ])
    }

    /// Rules every managed interface keeps, including after cleanup
    pub fn common(&self, iface: &str) -> Result<Planned<'a>> {
        let mut planned = self.host_base(iface)?;
        planned.extend(self.services(iface)?);
        planned.extend(self.trusted(iface)?);
        Ok(planned)
    }

    pub fn interface(&self, iface: &str) -> Result<Planned<'a>> {
        let mut planned = self.common(iface)?;
        planned.extend(self.public(iface)?);
        Ok(planned)
    }

    /// Overlay interface rules; empty without an overlay.
    pub fn overlay(&self) -> Result<Planned<'a>> {
        if !self.config.has_overlay() {
            return Ok(Vec::new());
        }
        let l = self.layout;
        let v = self.profile();
        let my = self.config.overlay_iface.as_str();
        Ok(vec![
            (&l.input, rule("overlay-ping", [p::iif(my)?, p::icmp_echo_request(v), p::ct_state(STATE_NEW), p::accept()])),
            (
                &l.input,
                rule("overlay-icmp-in", [p::iif(my)?, p::icmp(v), p::ct_state(STATE_ESTABLISHED_RELATED), p::accept()]),
            ),
            (
                &l.input,
                rule(
                    "manager-in",
                    [
                        p::iif(my)?,
                        p::tcp(v),
                        p::dport_set(&l.manager_ports)?,
                        p::saddr_set(v, &l.manager)?,
                        p::ct_state(STATE_NEW_ESTABLISHED),
                        p::accept(),
                    ],
                ),
            ),
            (
                &l.output,
                rule("overlay-icmp-out", [p::oif(my)?, p::icmp(v), p::ct_state(STATE_NEW_ESTABLISHED), p::accept()]),
            ),
            (
                &l.output,
                rule(
                    "manager-out",
                    [
                        p::oif(my)?,
                        p::tcp(v),
                        p::sport_set(&l.manager_ports)?,
                        p::daddr_set(v, &l.manager)?,
                        p::ct_state(STATE_ESTABLISHED),
                        p::accept(),
                    ],
                ),
            ),
        ])
    }

    /// Forward chain. The relay drop is unconditional; the routing rules
    /// need an overlay interface.
    pub fn forward(&self) -> Result<Planned<'a>> {
        let l = self.layout;
        let v = self.profile();
        let mut planned = vec![(
            &l.forward,
            rule("smtp-relay-drop", [p::tcp(v), p::dport(SMTP_RELAY_PORT), p::drop()]),
        )];
        if !self.config.has_overlay() {
            return Ok(planned);
        }
        let my = self.config.overlay_iface.as_str();
        let wan = self.wan_iface;
        planned.extend([
            (
                &l.forward,
                rule(
                    "forward-out",
                    [p::iif(my)?, p::saddr_set(v, &l.forward_ips)?, p::oif(wan)?, p::accept()],
                ),
            ),
            (
                &l.forward,
                rule(
                    "forward-in",
                    [
                        p::iif(wan)?,
                        p::daddr_set(v, &l.forward_ips)?,
                        p::oif(my)?,
                        p::ct_state(STATE_ESTABLISHED_RELATED),
                        p::accept(),
                    ],
                ),
            ),
            (&l.forward, rule("forward-overlay", [p::iif(my)?, p::oif(my)?, p::accept()])),
        ]);
        Ok(planned)
    }

    pub fn nat(&self) -> Result<Planned<'a>> {
        let l = self.layout;
        Ok(vec![(
            &l.postrouting,
            rule("wan-snat", [p::oif(self.wan_iface)?, p::snat(self.profile(), self.wan_addr)?]),
        )])
    }

    /// Every rule of a full apply, in installation order
    pub fn baseline(&self) -> Result<Planned<'a>> {
        let mut planned = self.loopback()?;
        planned.extend(self.blacklist()?);
        for iface in self.interfaces() {
            planned.extend(self.interface(iface)?);
        }
        planned.extend(self.overlay()?);
        planned.extend(self.forward()?);
        planned.extend(self.nat()?);
        Ok(planned)
    }

    /// Loopback plus per-interface common rules
    pub fn cleanup(&self) -> Result<Planned<'a>> {
        let mut planned = self.loopback()?;
        for iface in self.interfaces() {
            planned.extend(self.common(iface)?);
        }
        Ok(planned)
    }
}

/// Queues planned rules in order.
pub fn queue<S: Sink>(tx: &mut Transaction<'_, S>, planned: Planned<'_>) -> Result<()> {
    let count = planned.len();
    for (chain, data) in planned {
        RuleAssembler::new(chain).add(tx, data)?;
    }
    debug!("Queued {count} policy rules");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Services;
    use crate::core::memory::MemorySink;

    fn config() -> PolicyConfig {
        PolicyConfig {
            overlay_iface: "wg0".to_string(),
            overlay_port: 51820,
            ifaces: vec!["eth1".to_string(), "eth0".to_string()],
            manager_ports: vec!["8443".to_string()],
            ..PolicyConfig::default()
        }
    }

    fn ids(planned: &Planned<'_>) -> Vec<String> {
        planned.iter().filter_map(|(_, r)| r.id.clone()).collect()
    }

    #[test]
    fn test_interfaces_dedupe_wan() {
        let config = config();
        let layout = Layout::new(&config);
        let c = PolicyCompiler::new(&config, &layout, "eth0", "203.0.113.7".parse().unwrap());
        assert_eq!(c.interfaces(), vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_baseline_order() {
        let config = config();
        let layout = Layout::new(&config);
        let c = PolicyCompiler::new(&config, &layout, "eth0", "203.0.113.7".parse().unwrap());
        let ids = ids(&c.baseline().unwrap());
        let pos = |id: &str| ids.iter().position(|i| i == id).unwrap();

        assert_eq!(&ids[..4], ["loopback-in", "loopback-spoof", "loopback-out", "blacklist"]);
        assert!(pos("icmp-in:eth0") < pos("icmp-in:eth1"));
        assert!(pos("overlay-port-out:eth1") < pos("overlay-ping"));
        assert!(pos("manager-out") < pos("smtp-relay-drop"));
        assert_eq!(ids.last().map(String::as_str), Some("wan-snat"));
    }

    #[test]
    fn test_no_overlay_skips_overlay_and_routing() {
        let config = PolicyConfig::default();
        let layout = Layout::new(&config);
        let c = PolicyCompiler::new(&config, &layout, "eth0", "203.0.113.7".parse().unwrap());
        assert!(c.overlay().unwrap().is_empty());
        assert_eq!(ids(&c.forward().unwrap()), vec!["smtp-relay-drop"]);
        assert!(c.interface("eth0").unwrap().iter().all(|(_, r)| {
            !r.id.as_deref().unwrap_or_default().starts_with("overlay-port")
        }));
    }

    #[test]
    fn test_services_are_distinct() {
        let config = PolicyConfig {
            services: Services {
                dns: true,
                http: false,
                smtp: true,
            },
            ..PolicyConfig::default()
        };
        let layout = Layout::new(&config);
        let c = PolicyCompiler::new(&config, &layout, "eth0", "203.0.113.7".parse().unwrap());
        let ids = ids(&c.services("eth0").unwrap());
        assert!(ids.contains(&"dns-udp-out:eth0".to_string()));
        assert!(ids.contains(&"smtp-out:eth0".to_string()));
        assert!(!ids.iter().any(|i| i.starts_with("http")));
    }

    #[test]
    fn test_cleanup_has_no_overlay_port() {
        let config = config();
        let layout = Layout::new(&config);
        let c = PolicyCompiler::new(&config, &layout, "eth0", "203.0.113.7".parse().unwrap());
        let ids = ids(&c.cleanup().unwrap());
        assert!(ids.contains(&"trust-in:eth1".to_string()));
        assert!(!ids.iter().any(|i| i.starts_with("overlay") || i.starts_with("forward")));
        assert!(!ids.contains(&"blacklist".to_string()));
    }

    #[test]
    fn test_declared_baseline_commits() {
        let mut config = config();
        config.services.http = true;
        config.services.smtp = true;
        let template = Layout::new(&config);
        let mut sink = MemorySink::new();
        let mut tx = Transaction::new(&mut sink);
        let layout = declare_apply(&mut tx, &template, &config).unwrap();
        assert!(layout.http_ports.name.starts_with("__set"));
        assert_ne!(layout.http_ports.name, layout.smtp_ports.name);
        let c = PolicyCompiler::new(&config, &layout, "eth0", "203.0.113.7".parse().unwrap());
        queue(&mut tx, c.baseline().unwrap()).unwrap();
        tx.flush().unwrap();
        drop(tx);
        assert!(sink.set(&layout.filter, TRUSTED_SET).is_some());
        assert!(sink.chain(&layout.nat, "postrouting").is_some());
    }

    #[test]
    fn test_ipv6_layout() {
        let config = PolicyConfig {
            family: AddressFamily::Ipv6,
            ..PolicyConfig::default()
        };
        let layout = Layout::new(&config);
        assert_eq!(layout.trusted.key_type, SetKeyType::Ipv6Addr);
        let c = PolicyCompiler::new(&config, &layout, "eth0", "2001:db8::7".parse().unwrap());
        assert!(c.baseline().is_ok());
        // v4 WAN address cannot be NATed in an ip6 table
        let c = PolicyCompiler::new(&config, &layout, "eth0", "203.0.113.7".parse().unwrap());
        assert!(c.nat().is_err());
    }
}
