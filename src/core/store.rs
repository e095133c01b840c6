//! File-backed desired and observed state
//!
//! ```text
//! <root>/prefixes.json
//! <root>/regions/<region>/spec.json
//! <root>/regions/<region>/status.json
//! <root>/regions/<region>/status.json.sha256
//! ```
//!
//! Specs and prefix lists are written by the operator; status is written by
//! the agent after every pass that changed it.

use crate::core::model::{FirewallSpec, FirewallStatus, PrefixCatalog};
use crate::utils::{ensure_dir, sha256_hex};
use crate::validators::validate_name;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid region name: {0}")]
    InvalidName(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State directory not available")]
    StateDirUnavailable,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at the XDG state directory.
    ///
    /// # Errors
    ///
    /// `StateDirUnavailable` when no home directory can be determined.
    pub fn open_default() -> Result<Self, StoreError> {
        crate::utils::get_state_dir()
            .map(Self::new)
            .ok_or(StoreError::StateDirUnavailable)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn region_dir(&self, region: &str) -> Result<PathBuf, StoreError> {
        validate_name(region).map_err(StoreError::InvalidName)?;
        Ok(self.root.join("regions").join(region))
    }

    pub fn prefixes_path(&self) -> PathBuf {
        self.root.join("prefixes.json")
    }

    /// Regions that have a directory in the store, sorted.
    ///
    /// # Errors
    ///
    /// I/O errors other than a missing `regions/` directory.
    pub async fn list_regions(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join("regions");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };
        let mut regions = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            if let Ok(name) = entry.file_name().into_string()
                && validate_name(&name).is_ok()
            {
                regions.push(name);
            }
        }
        regions.sort();
        Ok(regions)
    }

    /// # Errors
    ///
    /// I/O and parse errors; a missing file yields an empty spec.
    pub async fn load_spec(&self, region: &str) -> Result<FirewallSpec, StoreError> {
        let path = self.region_dir(region)?.join("spec.json");
        Ok(read_json(&path, false).await?.unwrap_or_default())
    }

    /// # Errors
    ///
    /// I/O and serialization errors.
    pub async fn save_spec(&self, region: &str, spec: &FirewallSpec) -> Result<(), StoreError> {
        let path = self.region_dir(region)?.join("spec.json");
        write_json(&path, spec, false).await
    }

    /// Loads the last written status. A checksum mismatch (hand-edited file)
    /// is logged, not rejected.
    ///
    /// # Errors
    ///
    /// I/O and parse errors; a missing file yields an empty status.
    pub async fn load_status(&self, region: &str) -> Result<FirewallStatus, StoreError> {
        let path = self.region_dir(region)?.join("status.json");
        Ok(read_json(&path, true).await?.unwrap_or_default())
    }

    /// Writes status atomically, followed by its checksum sidecar.
    ///
    /// # Errors
    ///
    /// I/O and serialization errors.
    pub async fn save_status(
        &self,
        region: &str,
        status: &FirewallStatus,
    ) -> Result<(), StoreError> {
        let path = self.region_dir(region)?.join("status.json");
        write_json(&path, status, true).await
    }

    /// # Errors
    ///
    /// I/O and parse errors; a missing file yields an empty catalog.
    pub async fn load_prefixes(&self) -> Result<PrefixCatalog, StoreError> {
        let path = self.prefixes_path();
        let catalog: PrefixCatalog = read_json(&path, false).await?.unwrap_or_default();
        // Keys are matched case-insensitively; store them folded.
        let mut folded = PrefixCatalog::default();
        for (name, prefixes) in catalog.lists {
            folded.insert(&name, prefixes);
        }
        Ok(folded)
    }

    /// # Errors
    ///
    /// I/O and serialization errors.
    pub async fn save_prefixes(&self, catalog: &PrefixCatalog) -> Result<(), StoreError> {
        write_json(&self.prefixes_path(), catalog, false).await
    }
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha256");
    PathBuf::from(sidecar)
}

async fn read_json<T: DeserializeOwned>(path: &Path, verify: bool) -> Result<Option<T>, StoreError> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };

    if verify && let Ok(expected) = tokio::fs::read_to_string(checksum_path(path)).await {
        let actual = sha256_hex(json.as_bytes());
        if expected.trim() != actual {
            warn!(
                "{} checksum mismatch (expected: {}, got: {})",
                path.display(),
                expected.trim(),
                actual
            );
        }
    }

    serde_json::from_str(&json)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

async fn write_json<T: Serialize>(path: &Path, value: &T, checksum: bool) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).map_err(io_err(parent))?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(io_err(&temp_path))?;
        file.sync_all().await.map_err(io_err(&temp_path))?;
    }
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(io_err(path))?;

    if checksum {
        let sidecar = checksum_path(path);
        tokio::fs::write(&sidecar, sha256_hex(json.as_bytes()))
            .await
            .map_err(io_err(&sidecar))?;
    }
    Ok(())
}
