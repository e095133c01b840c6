use crate::core::error::{Error, Result};
use crate::core::templates::{IpFamily, RateLimit};
use crate::utils::get_data_dir;
use crate::validators::{validate_name, validate_rate_limit};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment override for a single-region setup
pub const ENV_REGION: &str = "ZONEWALL_REGION";
/// Namespace of the `ZONEWALL_REGION` region
pub const ENV_NSNAME: &str = "ZONEWALL_NSNAME";

/// One firewall instance managed by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    /// Named network namespace; the agent's own namespace when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns: Option<String>,
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
    /// Overrides the XDG state directory for specs, status and logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Delay between passes once a region has converged
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
    /// Delay before retrying a failed or unconverged pass
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,
    /// Reset each region's table when the agent starts
    #[serde(default = "default_true")]
    pub bootstrap_on_start: bool,
    /// Family matched by the established-only protocol rule
    #[serde(default = "default_family")]
    pub ip_family: IpFamily,
    /// ICMP/ICMPv6 rate limit installed into Input
    #[serde(default)]
    pub icmp_limit: RateLimit,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            state_dir: None,
            resync_interval_secs: default_resync_interval(),
            retry_after_secs: default_retry_after(),
            bootstrap_on_start: true,
            ip_family: default_family(),
            icmp_limit: RateLimit::default(),
        }
    }
}

fn default_resync_interval() -> u64 {
    30
}

fn default_retry_after() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_family() -> IpFamily {
    IpFamily::Ipv6
}

impl AgentConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs.max(1))
    }

    /// State directory in effect
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_dir.clone().or_else(crate::utils::get_state_dir)
    }

    pub fn region(&self, name: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Adds a region from `ZONEWALL_REGION` / `ZONEWALL_NSNAME` when the file
    /// names none.
    pub fn apply_env(&mut self, region: Option<String>, netns: Option<String>) {
        if self.regions.is_empty()
            && let Some(name) = region
        {
            self.regions.push(RegionConfig {
                name,
                netns: netns.filter(|n| !n.is_empty()),
            });
        }
    }

    /// Checks names, region uniqueness and the ICMP limit.
    ///
    /// Returns warnings for acceptable but unusual values.
    ///
    /// # Errors
    ///
    /// `Validation` naming the first bad field.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for region in &self.regions {
            validate_name(&region.name).map_err(|e| Error::validation("regions.name", e))?;
            if !seen.insert(region.name.as_str()) {
                return Err(Error::validation(
                    "regions.name",
                    format!("duplicate region '{}'", region.name),
                ));
            }
            if let Some(netns) = &region.netns {
                validate_name(netns).map_err(|e| Error::validation("regions.netns", e))?;
            }
        }
        if let Some(warning) = validate_rate_limit(
            self.icmp_limit.rate,
            self.icmp_limit.unit,
            self.icmp_limit.burst,
        )
        .map_err(|e| Error::validation("icmp_limit", e))?
        {
            warnings.push(warning);
        }
        if self.regions.is_empty() {
            warnings.push(format!(
                "No regions configured (set regions in config.json or {ENV_REGION})"
            ));
        }
        Ok(warnings)
    }
}

/// Default config file location
pub fn default_config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file created with mode 0o600.
/// 2. Atomically renames to the target path.
///
/// # Errors
///
/// Returns the underlying I/O error; a full disk gets a readable message.
pub async fn save_config(path: &Path, config: &AgentConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        crate::utils::ensure_dir(parent)?;
    }
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
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from `path` (or the default location), falling back to
/// defaults when the file is missing, then applies environment overrides.
///
/// # Errors
///
/// A file that exists but does not parse is an error rather than silently
/// replaced by defaults.
pub async fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let path = path.map(Path::to_path_buf).or_else(default_config_path);
    let mut config = match path {
        Some(path) => match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str::<AgentConfig>(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentConfig::default(),
            Err(e) => return Err(e.into()),
        },
        None => AgentConfig::default(),
    };
    config.apply_env(std::env::var(ENV_REGION).ok(), std::env::var(ENV_NSNAME).ok());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: AgentConfig = serde_json::from_str(r#"{"regions":[{"name":"r1"}]}"#).unwrap();
        assert_eq!(config.resync_interval_secs, 30);
        assert_eq!(config.retry_after(), Duration::from_secs(5));
        assert!(config.bootstrap_on_start);
        assert_eq!(config.ip_family, IpFamily::Ipv6);
        assert_eq!(config.icmp_limit, RateLimit::default());
        assert_eq!(config.regions[0].netns, None);
    }

    #[test]
    fn test_env_region_only_when_file_has_none() {
        let mut config = AgentConfig::default();
        config.apply_env(Some("edge".into()), Some("ns-edge".into()));
        assert_eq!(config.regions.len(), 1);
        assert_eq!(config.regions[0].netns.as_deref(), Some("ns-edge"));

        config.apply_env(Some("other".into()), None);
        assert_eq!(config.regions.len(), 1);

        let mut config = AgentConfig::default();
        config.apply_env(Some("edge".into()), Some(String::new()));
        assert_eq!(config.regions[0].netns, None);
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_names() {
        let mut config = AgentConfig::default();
        config.regions = vec![
            RegionConfig {
                name: "r1".into(),
                netns: None,
            },
            RegionConfig {
                name: "r1".into(),
                netns: None,
            },
        ];
        assert!(matches!(config.validate(), Err(Error::Validation { .. })));

        config.regions.truncate(1);
        config.regions[0].netns = Some("../x".into());
        assert!(config.validate().is_err());

        config.regions[0].netns = Some("ns1".into());
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn test_validate_warns_without_regions() {
        assert_eq!(AgentConfig::default().validate().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let mut config = AgentConfig::default();
        config.regions.push(RegionConfig {
            name: "r1".into(),
            netns: Some("ns1".into()),
        });
        config.ip_family = IpFamily::Ipv4;
        save_config(&path, &config).await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = load_config(Some(&path)).await.unwrap();
        assert_eq!(loaded.regions, config.regions);
        assert_eq!(loaded.ip_family, IpFamily::Ipv4);
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_config(Some(&path)).await,
            Err(Error::Serialization(_))
        ));
    }
}
