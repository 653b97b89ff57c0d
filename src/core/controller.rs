//! Firewall controller
//!
//! [`Firewall`] owns the sink, the discovered WAN facts and the declared
//! policy layout. Each operation binds the configured network namespace,
//! builds one transaction, flushes it once and releases the namespace on
//! every exit path.
//!
//! Set updates, bans and unbans before the first successful apply are
//! no-ops. A failed apply leaves the controller in its previous state; the
//! sink never sees a partial batch.

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::discovery::Discovery;
use super::error::{Error, Result};
use super::family::AddressFamily;
use super::netns::NamespaceGuard;
use super::policy::{self, Layout, PolicyCompiler};
use super::rule::RuleData;
use super::ruleset::{Chain, Table};
use super::sets::Set;
use super::transaction::{Sink, Transaction};
use crate::config::PolicyConfig;
use crate::validators;

/// Which address set an update targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum AddressSet {
    Trusted,
    Manager,
    Forward,
    Blacklist,
}

/// Checks address specs against the table family, warning about sources
/// that never arrive on a WAN link.
fn check_specs<T: AsRef<str>>(which: AddressSet, family: AddressFamily, specs: &[T]) -> Result<()> {
    for spec in specs {
        let spec = validators::validate_address_spec(spec.as_ref(), family)
            .map_err(|message| Error::validation(which.to_string(), message))?;
        if let Ok(net) = spec.parse::<IpNetwork>()
            && let Some(note) = validators::check_reserved_source(net)
        {
            warn!("{which} set entry {spec}: {note}");
        }
    }
    Ok(())
}

impl AddressSet {
    fn of(self, layout: &Layout) -> &Set {
        match self {
            AddressSet::Trusted => &layout.trusted,
            AddressSet::Manager => &layout.manager,
            AddressSet::Forward => &layout.forward_ips,
            AddressSet::Blacklist => &layout.blacklist,
        }
    }
}

pub struct Firewall<S: Sink, D: Discovery> {
    config: PolicyConfig,
    sink: S,
    discovery: D,
    wan_iface: String,
    wan_addr: IpAddr,
    template: Layout,
    layout: Layout,
    applied: bool,
}

impl<S: Sink, D: Discovery> Firewall<S, D> {
    /// Validates the config and discovers the WAN interface. Nothing is
    /// committed until [`apply`](Self::apply).
    pub fn new(config: PolicyConfig, sink: S, discovery: D) -> Result<Self> {
        config.validate()?;
        let (wan_iface, wan_addr) = discovery.default_route(config.family)?;
        info!("WAN interface {wan_iface} ({wan_addr})");
        let template = Layout::new(&config);
        Ok(Self {
            layout: template.clone(),
            template,
            config,
            sink,
            discovery,
            wan_iface,
            wan_addr,
            applied: false,
        })
    }

    /// Runs `op` with the configured namespace entered.
    fn in_namespace<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let guard = NamespaceGuard::bind(&self.config.network_namespace)?;
        let result = op(self);
        let released = guard.release();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Installs the full baseline policy, replacing the whole ruleset.
    pub fn apply(&mut self) -> Result<()> {
        if !self.config.enabled {
            info!("Firewall disabled in config, skipping apply");
            return Ok(());
        }
        self.in_namespace(|fw| {
            let mut tx = Transaction::new(&mut fw.sink);
            let layout = policy::declare_apply(&mut tx, &fw.template, &fw.config)?;
            let compiler = PolicyCompiler::new(&fw.config, &layout, &fw.wan_iface, fw.wan_addr);
            policy::queue(&mut tx, compiler.baseline()?)?;
            tx.flush()?;
            drop(tx);

            fw.layout = layout;
            fw.applied = true;
            info!("Baseline policy applied to {}", fw.layout.filter.name);
            Ok(())
        })
    }

    /// Removes then adds elements of one address set in a single batch.
    pub fn update_set<R: AsRef<str>, A: AsRef<str>>(
        &mut self,
        which: AddressSet,
        remove: &[R],
        add: &[A],
    ) -> Result<()> {
        if !self.applied {
            debug!("Ignoring {which} set update before first apply");
            return Ok(());
        }
        check_specs(which, self.config.family, add)?;
        self.in_namespace(|fw| {
            let set = which.of(&fw.layout).clone();
            let remove = set.elements_from_specs(remove)?;
            let add = set.elements_from_specs(add)?;
            let mut tx = Transaction::new(&mut fw.sink);
            tx.set_delete_elements(&set, remove)?;
            tx.set_add_elements(&set, add)?;
            tx.flush()
        })
    }

    pub fn update_trusted_ips<R: AsRef<str>, A: AsRef<str>>(&mut self, remove: &[R], add: &[A]) -> Result<()> {
        self.update_set(AddressSet::Trusted, remove, add)
    }

    pub fn update_manager_ips<R: AsRef<str>, A: AsRef<str>>(&mut self, remove: &[R], add: &[A]) -> Result<()> {
        self.update_set(AddressSet::Manager, remove, add)
    }

    pub fn update_forward_ips<R: AsRef<str>, A: AsRef<str>>(&mut self, remove: &[R], add: &[A]) -> Result<()> {
        self.update_set(AddressSet::Forward, remove, add)
    }

    /// Drops all input from `specs`, for `timeout` or until unbanned.
    pub fn ban<T: AsRef<str>>(&mut self, specs: &[T], timeout: Option<Duration>) -> Result<()> {
        if !self.applied {
            debug!("Ignoring ban before first apply");
            return Ok(());
        }
        check_specs(AddressSet::Blacklist, self.config.family, specs)?;
        self.in_namespace(|fw| {
            let set = fw.layout.blacklist.clone();
            let mut elements = set.elements_from_specs(specs)?;
            if let Some(timeout) = timeout {
                elements = elements.into_iter().map(|e| e.with_timeout(timeout)).collect();
            }
            let mut tx = Transaction::new(&mut fw.sink);
            tx.set_add_elements(&set, elements)?;
            tx.flush()
        })
    }

    pub fn unban<T: AsRef<str>>(&mut self, specs: &[T]) -> Result<()> {
        self.update_set(AddressSet::Blacklist, specs, &[] as &[&str])
    }

    /// Rebuilds a reduced safe ruleset: loopback plus per-interface common
    /// rules, keeping the trusted set's elements. Overlay, forward, NAT and
    /// the blacklist are gone afterwards and the controller is un-applied.
    pub fn cleanup(&mut self) -> Result<()> {
        if !self.config.enabled {
            info!("Firewall disabled in config, skipping cleanup");
            return Ok(());
        }
        self.in_namespace(|fw| {
            let trusted = fw
                .sink
                .list_set_elements(&fw.layout.trusted)
                .unwrap_or_else(|e| {
                    warn!("Trusted set not readable, cleanup starts empty: {e}");
                    Vec::new()
                });
            let preserved = trusted.len();

            let mut tx = Transaction::new(&mut fw.sink);
            let layout = policy::declare_cleanup(&mut tx, &fw.template, &fw.config, trusted)?;
            let compiler = PolicyCompiler::new(&fw.config, &layout, &fw.wan_iface, fw.wan_addr);
            policy::queue(&mut tx, compiler.cleanup()?)?;
            tx.flush()?;
            drop(tx);

            fw.layout = layout;
            fw.applied = false;
            info!("Cleanup installed, {preserved} trusted entries preserved");
            Ok(())
        })
    }

    /// Hands a namespace-bound transaction to `op` for rules outside the
    /// baseline. `op` must flush.
    pub fn run<T>(&mut self, op: impl FnOnce(&mut Transaction<'_, S>, &Layout) -> Result<T>) -> Result<T> {
        self.in_namespace(|fw| {
            let mut tx = Transaction::new(&mut fw.sink);
            op(&mut tx, &fw.layout)
        })
    }

    /// Adopts a ruleset installed by an earlier process.
    ///
    /// Marks the controller applied when the sink holds the sets only a full
    /// apply declares. Returns whether it did.
    pub fn attach(&mut self) -> Result<bool> {
        if self.applied {
            return Ok(true);
        }
        self.in_namespace(|fw| {
            let filter = &fw.template.filter;
            let present = fw.sink.set_exists(filter, policy::TRUSTED_SET)
                && fw.sink.set_exists(filter, policy::MANAGER_SET);
            if present {
                fw.layout = fw.template.clone();
                fw.applied = true;
                info!("Attached to installed policy in {}", filter.name);
            }
            Ok(present)
        })
    }

    /// Installed rules of one of the policy chains
    pub fn rules(&mut self, chain: &str) -> Result<Vec<RuleData>> {
        self.in_namespace(|fw| fw.sink.list_rules(&fw.layout.filter, chain))
    }

    /// Installed elements of an address set, as specs
    pub fn set_members(&mut self, which: AddressSet) -> Result<Vec<String>> {
        self.in_namespace(|fw| {
            let set = which.of(&fw.layout);
            Ok(fw
                .sink
                .list_set_elements(set)?
                .iter()
                .map(|e| e.to_spec(set.key_type))
                .collect())
        })
    }

    /// Addresses of the configured interfaces other than WAN and overlay,
    /// restricted to the table family.
    pub fn iface_addrs(&self) -> Result<Vec<IpAddr>> {
        let family = self.config.family;
        let mut addrs = Vec::new();
        for iface in &self.config.ifaces {
            if *iface == self.wan_iface || *iface == self.config.overlay_iface {
                continue;
            }
            addrs.extend(
                self.discovery
                    .interface_addrs(iface)?
                    .into_iter()
                    .filter(|a| AddressFamily::of(a) == family),
            );
        }
        Ok(addrs)
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Gives the sink back, e.g. to hand an installed ruleset to a new
    /// controller that then [`attach`](Self::attach)es.
    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn wan_iface(&self) -> &str {
        &self.wan_iface
    }

    pub fn wan_addr(&self) -> IpAddr {
        self.wan_addr
    }

    pub fn filter_table(&self) -> &Table {
        &self.layout.filter
    }

    pub fn nat_table(&self) -> &Table {
        &self.layout.nat
    }

    pub fn input_chain(&self) -> &Chain {
        &self.layout.input
    }

    pub fn forward_chain(&self) -> &Chain {
        &self.layout.forward
    }

    pub fn output_chain(&self) -> &Chain {
        &self.layout.output
    }

    pub fn postrouting_chain(&self) -> &Chain {
        &self.layout.postrouting
    }

    pub fn trusted_set(&self) -> &Set {
        &self.layout.trusted
    }

    pub fn manager_set(&self) -> &Set {
        &self.layout.manager
    }

    pub fn forward_set(&self) -> &Set {
        &self.layout.forward_ips
    }

    pub fn blacklist_set(&self) -> &Set {
        &self.layout.blacklist
    }
}
