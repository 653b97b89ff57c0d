//! Privilege elevation for `nft`
//!
//! hostwall talks to the kernel by piping JSON batches into `nft`. When the
//! process is not root the command is wrapped in an elevation helper:
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Fallback**: `sudo`
//!
//! # Environment Variables
//!
//! - `HOSTWALL_NFT_COMMAND`: Program to run instead of `nft`. Runs without
//!   elevation; meant for wrappers and test doubles.
//! - `HOSTWALL_ELEVATION_METHOD`: Force `sudo` or `run0`, e.g. for sudoers
//!   NOPASSWD setups where polkit prompts are unwanted.
//!
//! Arguments are passed without shell interpretation.

use std::io;
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    #[error("Invalid HOSTWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0")]
    InvalidMethod(String),

    #[error("No elevation helper found; run hostwall as root or install sudo")]
    NoHelper,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                full_path.is_file().then_some(full_path)
            })
        })
        .is_some()
}

fn wrapped(helper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.arg(program).args(args);
    cmd
}

/// Builds the command that runs `nft` with `args` as root.
pub fn nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    if let Ok(program) = std::env::var("HOSTWALL_NFT_COMMAND")
        && !program.is_empty()
    {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new("nft");
        cmd.args(args);
        return Ok(cmd);
    }

    if let Ok(method) = std::env::var("HOSTWALL_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, "nft", args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    if binary_exists("run0") {
        return Ok(wrapped("run0", "nft", args));
    }
    if binary_exists("sudo") {
        return Ok(wrapped("sudo", "nft", args));
    }
    Err(ElevationError::NoHelper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists("sh"));
        assert!(!binary_exists("hostwall_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_nft_command_override() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("HOSTWALL_NFT_COMMAND", "/bin/cat");
        }
        let cmd = nft_command(&["--json", "-f", "-"]).unwrap();
        unsafe {
            std::env::remove_var("HOSTWALL_NFT_COMMAND");
        }
        assert_eq!(cmd.get_program(), "/bin/cat");
        assert_eq!(cmd.get_args().count(), 3);
    }

    #[test]
    fn test_invalid_elevation_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        if nix::unistd::getuid().is_root() {
            // root never consults the elevation method
            return;
        }
        unsafe {
            std::env::remove_var("HOSTWALL_NFT_COMMAND");
            std::env::set_var("HOSTWALL_ELEVATION_METHOD", "pkexec");
        }
        let result = nft_command(&["list", "ruleset"]);
        unsafe {
            std::env::remove_var("HOSTWALL_ELEVATION_METHOD");
        }
        assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
    }
}
