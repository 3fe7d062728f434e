//! Agent configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Agent settings, loaded from TOML. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Daemon address; `http://` is upgraded to `https://` for TLS transports.
    pub server_addr: String,
    /// Pre-assigned identity. Takes precedence over the persisted state file.
    pub agent_id: String,
    pub check_interval_secs: u64,
    pub profile_interval_secs: u64,
    /// Bootstrap secret, only needed until the agent has an identity.
    pub enroll_token: Option<String>,
    /// Holds `agent.key`, `agent.crt`, `ca.crt` and `agent-state.json`.
    pub cert_dir: PathBuf,
    /// Skip TLS entirely. Certificates are neither requested nor used.
    pub insecure: bool,
    pub renewal_threshold_days: u64,
    pub rpc_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: "http://localhost:9090".to_string(),
            agent_id: String::new(),
            check_interval_secs: 30,
            profile_interval_secs: 6 * 60 * 60,
            enroll_token: None,
            cert_dir: default_cert_dir(),
            insecure: false,
            renewal_threshold_days: 30,
            rpc_timeout_secs: 15,
        }
    }
}

fn default_cert_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "fleet", "fleet-agent")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("fleet-agent"))
}

impl AgentConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn profile_interval(&self) -> Duration {
        Duration::from_secs(self.profile_interval_secs.max(1))
    }

    pub fn renewal_threshold(&self) -> Duration {
        Duration::from_secs(self.renewal_threshold_days.saturating_mul(24 * 60 * 60))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs.max(1))
    }

    pub fn state_path(&self) -> PathBuf {
        self.cert_dir.join("agent-state.json")
    }
}
