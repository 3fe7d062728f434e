//! Daemon configuration.
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! or missing file yields a working daemon.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_auth::AuthorityConfig;
use serde::{Deserialize, Serialize};

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Top-level daemon settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen_addr: SocketAddr,
    /// Holds `fleet.db`, the CA and the serving certificate.
    pub data_dir: PathBuf,
    pub tls_enabled: bool,
    /// SANs of the serving certificate.
    pub server_names: Vec<String>,
    pub check_interval_secs: u32,
    /// Agents silent for longer than this are marked disconnected.
    pub agent_timeout_secs: u64,
    pub token_default_expiry_secs: u64,
    pub enroll_rate_per_second: u32,
    pub enroll_burst: u32,
    pub ca: CaSettings,
}

/// Certificate authority settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaSettings {
    pub organization: String,
    /// Default validity of agent certificates.
    pub validity_days: u64,
    /// NotBefore backdating applied to every issued certificate.
    pub clock_skew_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            data_dir: default_data_dir(),
            tls_enabled: true,
            server_names: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            check_interval_secs: 30,
            agent_timeout_secs: 300,
            token_default_expiry_secs: 24 * 60 * 60,
            enroll_rate_per_second: 2,
            enroll_burst: 10,
            ca: CaSettings::default(),
        }
    }
}

impl Default for CaSettings {
    fn default() -> Self {
        let authority = AuthorityConfig::default();
        Self {
            organization: authority.organization,
            validity_days: authority.default_validity.as_secs() / DAY_SECS,
            clock_skew_secs: authority.clock_skew.as_secs(),
        }
    }
}

const DAY_SECS: u64 = 24 * 60 * 60;

impl DaemonConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fleet.db")
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.data_dir.join("ca.crt")
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.data_dir.join("ca.key")
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.data_dir.join("server.crt")
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.data_dir.join("server.key")
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn token_default_expiry(&self) -> Duration {
        Duration::from_secs(self.token_default_expiry_secs)
    }

    pub fn authority_config(&self) -> AuthorityConfig {
        AuthorityConfig {
            organization: self.ca.organization.clone(),
            default_validity: Duration::from_secs(self.ca.validity_days.saturating_mul(DAY_SECS)),
            clock_skew: Duration::from_secs(self.ca.clock_skew_secs),
            ..AuthorityConfig::default()
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleet")
}
