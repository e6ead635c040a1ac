//! Configuration management for edgewall.
//!
//! The YAML file is optional: a missing file means defaults, a present but
//! invalid one is fatal.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;
use crate::scheduler::DailyTime;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/edgewall/config.yaml";

/// Longest accepted base chain name. netfilter allows 28 characters and the
/// per-port suffix takes up to six (`-65535`).
const MAX_CHAIN_NAME_LEN: usize = 20;

/// Upper bound on fetch attempts; backoff doubles per attempt.
pub const MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Address-list endpoint (HTTPS).
    pub endpoint: String,

    /// Base name of the dedicated per-port chains.
    pub chain_name: String,

    /// Top-level inbound chain the dedicated chains hang off.
    pub parent_chain: String,

    /// Transport protocol the port rules match.
    pub protocol: String,

    pub connect_timeout_secs: u64,

    /// Total request timeout, including the body.
    pub timeout_secs: u64,

    pub max_retries: u32,

    /// Interval written into a freshly created sync record.
    pub default_update_interval_days: u32,

    /// Daily time (HH:MM) the recurring trigger fires.
    pub sync_time: String,

    /// Sync record, payload cache and local rule dumps.
    pub state_dir: PathBuf,

    /// Installed binary, referenced by the recurring trigger.
    pub binary_path: PathBuf,

    /// Operator-supplied prefixes used when the endpoint is unreachable and
    /// no cached payload exists.
    pub fallback_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "https://api.edgeone.ai/ips".to_string(),
            chain_name: "EDGEWALL".to_string(),
            parent_chain: "INPUT".to_string(),
            protocol: "tcp".to_string(),
            connect_timeout_secs: 10,
            timeout_secs: 30,
            max_retries: 3,
            default_update_interval_days: 7,
            sync_time: "04:00".to_string(),
            state_dir: PathBuf::from("/var/lib/edgewall"),
            binary_path: PathBuf::from("/usr/local/bin/edgewall"),
            fallback_prefixes: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("{:?}: {}", path.as_ref(), e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load the file if it exists, defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {:?}, using defaults", path.as_ref());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(SyncError::Config(msg).into()) };

        if !self.endpoint.starts_with("https://") {
            return invalid(format!("endpoint must use HTTPS: {}", self.endpoint));
        }

        if self.chain_name.is_empty()
            || self.chain_name.len() > MAX_CHAIN_NAME_LEN
            || !self
                .chain_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return invalid(format!(
                "invalid chain_name '{}': use up to {} characters of A-Z, a-z, 0-9, '_' or '-'",
                self.chain_name, MAX_CHAIN_NAME_LEN
            ));
        }

        if self.parent_chain.is_empty() || self.parent_chain.contains(char::is_whitespace) {
            return invalid(format!("invalid parent_chain '{}'", self.parent_chain));
        }

        if !matches!(self.protocol.as_str(), "tcp" | "udp" | "sctp") {
            return invalid(format!(
                "invalid protocol '{}'. Valid values: tcp, udp, sctp",
                self.protocol
            ));
        }

        if self.connect_timeout_secs == 0 || self.timeout_secs == 0 {
            return invalid("timeouts must be greater than zero".to_string());
        }

        if self.max_retries == 0 || self.max_retries > MAX_RETRIES {
            return invalid(format!("max_retries must be between 1 and {}", MAX_RETRIES));
        }

        if self.default_update_interval_days == 0 {
            return invalid("default_update_interval_days must be greater than zero".to_string());
        }

        if let Err(e) = self.sync_time.parse::<DailyTime>() {
            return invalid(e.to_string());
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn daily_time(&self) -> Result<DailyTime> {
        self.sync_time.parse()
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }
}
