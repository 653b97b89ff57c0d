//! XDG directories
//!
//! - State: `~/.local/state/hostwall/` (root: `/root/.local/state/hostwall/`),
//!   holds the audit log

use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "hostwall", "hostwall")
        .and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

/// Creates the state directory with mode 0o700.
pub fn ensure_state_dir() -> std::io::Result<PathBuf> {
    let dir = get_state_dir().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
    })?;

    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(&dir)?;
    }

    #[cfg(not(unix))]
    std::fs::create_dir_all(&dir)?;

    Ok(dir)
}
