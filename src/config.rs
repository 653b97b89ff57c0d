//! Policy configuration file
//!
//! A single JSON document, `/etc/hostwall/config.json` unless overridden.
//! Every field has a default so a minimal file is just `{}`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::error::{Error, Result};
use crate::core::family::AddressFamily;
use crate::core::netns;
use crate::core::ruleset::Policy;
use crate::validators;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostwall/config.json";

/// Public-facing services the host runs or uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Services {
    /// Resolver client traffic (udp/tcp 53 out)
    pub dns: bool,
    /// Web server (tcp 80/443 in)
    pub http: bool,
    /// Mail submission client (tcp 25/465/587 out)
    pub smtp: bool,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            dns: true,
            http: false,
            smtp: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// When false, apply is a successful no-op
    pub enabled: bool,
    /// Named network namespace to manage; empty means the current one
    pub network_namespace: String,
    pub default_policy: Policy,
    /// Prepended to the `filter` and `nat` table names
    pub table_prefix: String,
    pub family: AddressFamily,
    /// Overlay/tunnel interface; empty disables the overlay and forward rules
    pub overlay_iface: String,
    /// UDP port the overlay listens on, accepted on every interface; 0 disables
    pub overlay_port: u16,
    /// Interfaces handled like the WAN besides the WAN itself
    pub ifaces: Vec<String>,
    /// Admin ports reachable from the trusted set (`"22"`, `"60001-60005"`)
    pub trusted_ports: Vec<String>,
    /// Ports reachable over the overlay from the manager set
    pub manager_ports: Vec<String>,
    pub services: Services,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            network_namespace: String::new(),
            default_policy: Policy::Drop,
            table_prefix: String::new(),
            family: AddressFamily::Ipv4,
            overlay_iface: String::new(),
            overlay_port: 0,
            ifaces: Vec::new(),
            trusted_ports: vec!["22".to_string()],
            manager_ports: Vec::new(),
            services: Services::default(),
        }
    }
}

fn invalid(field: &str) -> impl Fn(String) -> Error + '_ {
    move |message| Error::Validation {
        field: field.to_string(),
        message,
    }
}

impl PolicyConfig {
    pub fn filter_table_name(&self) -> String {
        format!("{}filter", self.table_prefix)
    }

    pub fn nat_table_name(&self) -> String {
        format!("{}nat", self.table_prefix)
    }

    pub fn has_overlay(&self) -> bool {
        !self.overlay_iface.is_empty()
    }

    /// Checks every field; the first problem wins.
    pub fn validate(&self) -> Result<()> {
        netns::validate_name(&self.network_namespace)?;
        validators::validate_table_prefix(&self.table_prefix).map_err(invalid("table_prefix"))?;
        validators::validate_interface(&self.overlay_iface).map_err(invalid("overlay_iface"))?;
        for iface in &self.ifaces {
            if iface.is_empty() {
                return Err(invalid("ifaces")("empty interface name".to_string()));
            }
            validators::validate_interface(iface).map_err(invalid("ifaces"))?;
        }
        for spec in &self.trusted_ports {
            let (lo, hi) = validators::validate_port_spec(spec).map_err(invalid("trusted_ports"))?;
            if lo == hi
                && let Some(note) = validators::check_well_known_port(lo)
            {
                debug!("trusted_ports: {note}");
            }
        }
        for spec in &self.manager_ports {
            validators::validate_port_spec(spec).map_err(invalid("manager_ports"))?;
        }
        if !self.has_overlay() && !self.manager_ports.is_empty() {
            warn!("manager_ports are ignored without an overlay_iface");
        }
        Ok(())
    }
}

/// Loads and validates a config file.
pub fn load_config(path: &Path) -> Result<PolicyConfig> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    let config: PolicyConfig = serde_json::from_str(&json)?;
    config.validate()?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Writes the config with an atomic temp-then-rename, mode 0o600.
pub fn save_config(config: &PolicyConfig, path: &Path) -> Result<()> {
    use std::io::Write;

    let json = serde_json::to_string_pretty(config)?;
    let mut temp_path = PathBuf::from(path);
    temp_path.set_extension("json.tmp");

    #[cfg(unix)]
    let mut file = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)?
    };
    #[cfg(not(unix))]
    let mut file = std::fs::File::create(&temp_path)?;

    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Writes a default config to `path`, creating its directory. An existing
/// file is only replaced with `force`.
pub fn init_config(path: &Path, force: bool) -> Result<PolicyConfig> {
    if path.exists() && !force {
        return Err(Error::Configuration(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let config = PolicyConfig::default();
    save_config(&config, path)?;
    info!("Wrote default config to {}", path.display());
    Ok(config)
}
