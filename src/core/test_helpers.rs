//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::PolicyConfig;
use crate::core::controller::Firewall;
use crate::core::discovery::StaticDiscovery;
use crate::core::interp::{Decision, Packet, evaluate_chain};
use crate::core::memory::MemorySink;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Hold the guard for as long as the changed variables must stay visible:
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("HOSTWALL_ELEVATION_METHOD", "sudo");
/// }
/// // ... test ...
/// unsafe {
///     std::env::remove_var("HOSTWALL_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

pub const WAN: &str = "eth0";
pub const WAN_ADDR: &str = "203.0.113.7";
pub const LAN: &str = "eth1";
pub const OVERLAY: &str = "wg0";
pub const OVERLAY_PORT: u16 = 51820;

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// WAN plus one extra interface, an overlay and one manager port.
pub fn test_config() -> PolicyConfig {
    PolicyConfig {
        overlay_iface: OVERLAY.to_string(),
        overlay_port: OVERLAY_PORT,
        ifaces: vec![LAN.to_string()],
        trusted_ports: vec!["22".to_string(), "60001-60005".to_string()],
        manager_ports: vec!["8443".to_string()],
        ..PolicyConfig::default()
    }
}

pub fn test_discovery() -> StaticDiscovery {
    StaticDiscovery::new(WAN, ip(WAN_ADDR))
        .with_interface(LAN, vec![ip("192.168.10.1"), ip("fe80::1")])
        .with_interface(OVERLAY, vec![ip("10.99.0.1")])
}

pub fn test_firewall(config: PolicyConfig) -> Firewall<MemorySink, StaticDiscovery> {
    Firewall::new(config, MemorySink::new(), test_discovery()).unwrap()
}

/// Controller over [`test_config`] with the baseline applied
pub fn applied_firewall() -> Firewall<MemorySink, StaticDiscovery> {
    let mut fw = test_firewall(test_config());
    fw.apply().unwrap();
    fw
}

/// Runs `packet` through one of the controller's filter chains.
pub fn decide(fw: &Firewall<MemorySink, StaticDiscovery>, chain: &str, packet: &Packet) -> Decision {
    evaluate_chain(fw.sink(), fw.filter_table(), chain, packet).unwrap()
}

/// Points the nft sink at `tests/mock_nft.sh` while held.
///
/// Batches the mock receives are appended to [`MockNft::log`].
pub struct MockNft {
    log: PathBuf,
    _dir: tempfile::TempDir,
    _guard: MutexGuard<'static, ()>,
}

impl MockNft {
    pub fn install() -> Self {
        let guard = ENV_VAR_MUTEX.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("batches.log");
        let mock_path = format!("{}/tests/mock_nft.sh", env!("CARGO_MANIFEST_DIR"));
        // SAFETY: environment changes are serialized by ENV_VAR_MUTEX
        unsafe {
            std::env::set_var("HOSTWALL_NFT_COMMAND", &mock_path);
            std::env::set_var("HOSTWALL_MOCK_NFT_LOG", &log);
        }
        Self {
            log,
            _dir: dir,
            _guard: guard,
        }
    }

    pub fn log(&self) -> &Path {
        &self.log
    }

    /// Batches received so far, one JSON document each
    pub fn batches(&self) -> Vec<serde_json::Value> {
        std::fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Drop for MockNft {
    fn drop(&mut self) {
        // SAFETY: still holding ENV_VAR_MUTEX
        unsafe {
            std::env::remove_var("HOSTWALL_NFT_COMMAND");
            std::env::remove_var("HOSTWALL_MOCK_NFT_LOG");
        }
    }
}
