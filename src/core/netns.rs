//! Scoped network namespace binding
//!
//! `setns(2)` switches the namespace of the calling thread only. A
//! [`NamespaceGuard`] therefore pins the switch to the thread that created
//! it: the guard is `!Send`, and dropping it switches back to the origin
//! namespace. Errors on drop are logged; call [`NamespaceGuard::release`] to
//! see them.
//!
//! An empty namespace name binds nothing and every operation on the guard
//! is a no-op.

use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use super::error::{Error, Result};

/// Where `ip netns add` puts named namespaces
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Checks a namespace name the way `ip netns` would accept it.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Ok(());
    }
    if name.len() > 255
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.chars().any(char::is_control)
    {
        return Err(Error::Namespace(format!("invalid namespace name '{name}'")));
    }
    Ok(())
}

pub fn namespace_path(name: &str) -> PathBuf {
    Path::new(NETNS_RUN_DIR).join(name)
}

fn enter(file: &File, what: &str) -> Result<()> {
    setns(file, CloneFlags::CLONE_NEWNET)
        .map_err(|e| Error::Namespace(format!("setns into {what} failed: {e}")))
}

/// Thread-pinned namespace switch, restored on drop
#[derive(Debug)]
pub struct NamespaceGuard {
    name: String,
    origin: Option<File>,
    // setns affects only the current thread
    _not_send: PhantomData<*const ()>,
}

impl NamespaceGuard {
    /// Enters namespace `name`; an empty name stays in the current one.
    ///
    /// On failure the thread is left in its origin namespace.
    pub fn bind(name: &str) -> Result<Self> {
        let unbound = Self {
            name: name.to_string(),
            origin: None,
            _not_send: PhantomData,
        };
        if name.is_empty() {
            return Ok(unbound);
        }
        validate_name(name)?;

        let origin = File::open(THREAD_NETNS)
            .map_err(|e| Error::Namespace(format!("cannot open {THREAD_NETNS}: {e}")))?;
        let path = namespace_path(name);
        let target = File::open(&path)
            .map_err(|e| Error::Namespace(format!("cannot open {}: {e}", path.display())))?;
        enter(&target, name)?;
        debug!("Entered network namespace {name}");
        let mut guard = unbound;
        guard.origin = Some(origin);
        Ok(guard)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while the thread is switched away from its origin namespace
    pub fn is_bound(&self) -> bool {
        self.origin.is_some()
    }

    /// Returns whether this call switched the thread back. The origin
    /// handle is consumed either way, so a failed restore is not retried.
    fn restore(&mut self) -> Result<bool> {
        let Some(origin) = self.origin.take() else {
            return Ok(false);
        };
        enter(&origin, "origin namespace")?;
        debug!("Left network namespace {}", self.name);
        Ok(true)
    }

    /// Switches back to the origin namespace, reporting failures.
    pub fn release(mut self) -> Result<()> {
        self.restore().map(|_| ())
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        match self.restore() {
            Ok(true) => info!("Namespace binding for {} released", self.name),
            Ok(false) => {}
            Err(e) => error!("Failed to restore network namespace after {}: {e}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_is_noop() {
        let guard = NamespaceGuard::bind("").unwrap();
        assert!(!guard.is_bound());
        assert_eq!(guard.name(), "");
        assert!(guard.release().is_ok());
    }

    #[test]
    fn test_rejects_path_like_names() {
        assert!(validate_name("blue").is_ok());
        assert!(validate_name("").is_ok());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(matches!(
            NamespaceGuard::bind("x/y"),
            Err(Error::Namespace(_))
        ));
    }

    #[test]
    fn test_missing_namespace_fails_without_switch() {
        let err = NamespaceGuard::bind("hostwall-test-does-not-exist").unwrap_err();
        assert!(err.to_string().contains("hostwall-test-does-not-exist"));
    }

    #[test]
    fn test_unbound_guard_restores_nothing() {
        let mut guard = NamespaceGuard::bind("").unwrap();
        assert!(!guard.restore().unwrap());
        // a second restore, as Drop performs after release, is also a no-op
        assert!(!guard.restore().unwrap());
    }

    #[test]
    fn test_bind_builds_guard_in_place() {
        // binding a missing namespace drops the unbound guard without a switch
        assert!(NamespaceGuard::bind("hostwall-test-absent").is_err());
        let guard = NamespaceGuard::bind("").unwrap();
        assert_eq!(guard.name(), "");
        assert!(!guard.is_bound());
    }

    #[test]
    fn test_namespace_path() {
        assert_eq!(namespace_path("blue"), PathBuf::from("/var/run/netns/blue"));
    }
}
