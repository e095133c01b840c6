//! Directory management
//!
//! Follows the XDG Base Directory layout:
//!
//! - Data: `~/.local/share/zonewall/` - agent configuration
//! - State: `~/.local/state/zonewall/` - region specs and status, prefix
//!   lists, audit log, agent log
//!
//! When running as root the same layout lives under root's home unless the
//! configuration names a `state_dir`.
//!
//! # Example
//!
//! ```
//! use zonewall::utils::{get_data_dir, get_state_dir};
//!
//! if let Some(state) = get_state_dir() {
//!     let regions = state.join("regions");
//!     # let _ = regions;
//! }
//! # let _ = get_data_dir();
//! ```

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "zonewall", "zonewall")
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// Creates `dir` and its parents with mode 0700.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Creates the data and state directories.
///
/// # Errors
///
/// Returns the first directory creation error.
pub fn ensure_dirs() -> std::io::Result<()> {
    if let Some(dir) = get_data_dir() {
        ensure_dir(&dir)?;
    }
    if let Some(dir) = get_state_dir() {
        ensure_dir(&dir)?;
    }
    Ok(())
}

/// Lower-case hex SHA-256 of `data`, as written to `.sha256` sidecars.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
