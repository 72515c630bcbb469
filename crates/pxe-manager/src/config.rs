//! Manager configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or no
//! file at all) yields a configuration pointing at local services.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Resource datastore.
    pub store: StoreConfig,
    /// Network-boot controller.
    pub cobbler: CobblerConfig,
    /// SSH credentials for the readiness probe.
    pub ssh: SshConfig,
    /// Probe budgets and the settle interval.
    pub readiness: ReadinessConfig,
    /// Replacement and concurrency limits.
    pub reservation: ReservationConfig,
    /// Distro alias to boot profile map.
    pub distros: DistroMap,
}

impl ManagerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use defaults.
    ///
    /// # Errors
    /// Returns an error if a given file cannot be loaded.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Check values the types cannot express.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.readiness.attempts == 0 {
            return Err(ConfigError::Invalid("readiness.attempts must be at least 1".into()));
        }
        if self.readiness.preflight_attempts == 0 {
            return Err(ConfigError::Invalid(
                "readiness.preflight_attempts must be at least 1".into(),
            ));
        }
        if self.reservation.max_parallel_probes == 0 {
            return Err(ConfigError::Invalid(
                "reservation.max_parallel_probes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Resource datastore connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the REST API.
    pub endpoint: String,
    /// Username for writes.
    pub username: String,
    /// Password for writes.
    pub password: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5000".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Cobbler XML-RPC connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CobblerConfig {
    /// XML-RPC endpoint.
    pub url: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for CobblerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1/cobbler_api".to_string(),
            username: "cobbler".to_string(),
            password: "cobbler".to_string(),
            timeout_secs: 30,
        }
    }
}

/// SSH credentials used by the readiness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Remote user.
    pub user: String,
    /// Password auth, tried when no key is configured.
    pub password: Option<String>,
    /// Private key file.
    pub key_path: Option<PathBuf>,
    /// SSH port.
    pub port: u16,
    /// TCP connect and handshake timeout.
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: None,
            key_path: None,
            port: 22,
            connect_timeout_secs: 10,
        }
    }
}

/// Readiness polling budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Connection attempts before a host is declared unreachable.
    pub attempts: u32,
    /// Spacing between attempts.
    pub interval_secs: u64,
    /// Attempts to place the marker before kickstart.
    pub preflight_attempts: u32,
    /// Spacing between pre-flight attempts.
    pub preflight_interval_secs: u64,
    /// Wait after triggering boot before verification starts.
    pub settle_secs: u64,
}

impl ReadinessConfig {
    /// Spacing between attempts.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Spacing between pre-flight attempts.
    #[must_use]
    pub fn preflight_interval(&self) -> Duration {
        Duration::from_secs(self.preflight_interval_secs)
    }

    /// Settle interval.
    #[must_use]
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        // 45 attempts, 20s apart: about 15 minutes for a host to come back.
        Self {
            attempts: 45,
            interval_secs: 20,
            preflight_attempts: 3,
            preflight_interval_secs: 10,
            settle_secs: 300,
        }
    }
}

/// Replacement and concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Replacement requests one reservation may issue before giving up.
    pub max_replacements: u32,
    /// Hosts verified concurrently.
    pub max_parallel_probes: usize,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            max_replacements: 8,
            max_parallel_probes: 16,
        }
    }
}

/// Distro alias to boot profile map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistroMap(pub BTreeMap<String, String>);

impl DistroMap {
    /// Resolve an alias to a profile, passing unknown names through.
    #[must_use]
    pub fn resolve<'a>(&'a self, distro: &'a str) -> &'a str {
        self.0.get(distro).map_or(distro, String::as_str)
    }
}

impl Default for DistroMap {
    fn default() -> Self {
        Self(
            [
                ("centos", "centos6-x86_64-raid0"),
                ("rhel", "rhel6u6-x86_64-raid0"),
                ("centos7", "centos7-x86_64-raid0"),
                ("centos70", "centos7u0-x86_64-raid0"),
                ("rhel7", "rhel7-x86_64-raid0"),
            ]
            .into_iter()
            .map(|(alias, profile)| (alias.to_string(), profile.to_string()))
            .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.readiness.attempts, 45);
        assert_eq!(config.readiness.interval(), Duration::from_secs(20));
        assert_eq!(config.store.endpoint, "http://127.0.0.1:5000");
        assert_eq!(config.distros.resolve("rhel7"), "rhel7-x86_64-raid0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_distro_passes_through() {
        let distros = DistroMap::default();
        assert_eq!(distros.resolve("qa-ubuntu1404-x86_64"), "qa-ubuntu1404-x86_64");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[store]
endpoint = "http://10.111.4.100:5000"

[readiness]
settle_secs = 60

[distros]
esxi51 = "qa-vmwareesxi51u0-x86_64"
"#
        )
        .unwrap();

        let config = ManagerConfig::load(file.path()).unwrap();
        assert_eq!(config.store.endpoint, "http://10.111.4.100:5000");
        assert_eq!(config.store.username, "admin");
        assert_eq!(config.readiness.settle_secs, 60);
        assert_eq!(config.readiness.attempts, 45);
        assert_eq!(config.distros.resolve("esxi51"), "qa-vmwareesxi51u0-x86_64");
        // A configured map replaces the defaults.
        assert_eq!(config.distros.resolve("centos"), "centos");
    }

    #[test]
    fn test_rejects_zero_budget() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[readiness]\nattempts = 0").unwrap();
        assert!(matches!(
            ManagerConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = ManagerConfig::load(Path::new("/nonexistent/pxe-manager.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
