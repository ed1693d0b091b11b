// Copyright 2026 Branch Mesh Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Boot configuration: loadable from a TOML file, overridable by CLI flags,
//! with sane defaults for every periodic timer a node needs at startup.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_LOW_STOCK_SCAN_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;
pub const DEFAULT_REPLICATION_SYNC_SECS: u64 = 10;
pub const DEFAULT_MUTEX_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// One entry in the configured peer set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl PeerConfig {
    /// Parses the CLI shorthand `id@host:port`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let (id, rest) = spec
            .split_once('@')
            .ok_or_else(|| ConfigError::MalformedPeerAddr(spec.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::MalformedPeerAddr(spec.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::MalformedPeerAddr(spec.to_string()))?;
        if id.is_empty() || host.is_empty() {
            return Err(ConfigError::MalformedPeerAddr(spec.to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

fn default_low_stock_scan_secs() -> u64 {
    DEFAULT_LOW_STOCK_SCAN_SECS
}
fn default_heartbeat_secs() -> u64 {
    DEFAULT_HEARTBEAT_SECS
}
fn default_replication_sync_secs() -> u64 {
    DEFAULT_REPLICATION_SYNC_SECS
}
fn default_mutex_acquire_timeout_secs() -> u64 {
    DEFAULT_MUTEX_ACQUIRE_TIMEOUT_SECS
}

/// The node's boot configuration, as supplied by the (out-of-scope)
/// launcher: `branch_id`, `peer_port`, and the initial peer list, plus
/// defaults for every periodic timer the node runs.
#[derive(Debug, Clone, Deserialize)]
pub struct BootConfig {
    pub branch_id: String,
    pub peer_port: u16,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default = "default_low_stock_scan_secs")]
    pub low_stock_scan_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_replication_sync_secs")]
    pub replication_sync_secs: u64,
    #[serde(default = "default_mutex_acquire_timeout_secs")]
    pub mutex_acquire_timeout_secs: u64,
}

impl BootConfig {
    /// A config with every timer at its default, for a node with no
    /// initial peers configured yet.
    pub fn new(branch_id: impl Into<String>, peer_port: u16) -> Self {
        Self {
            branch_id: branch_id.into(),
            peer_port,
            peers: Vec::new(),
            low_stock_scan_secs: DEFAULT_LOW_STOCK_SCAN_SECS,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            replication_sync_secs: DEFAULT_REPLICATION_SYNC_SECS,
            mutex_acquire_timeout_secs: DEFAULT_MUTEX_ACQUIRE_TIMEOUT_SECS,
        }
    }

    /// Loads and validates a config from a TOML file. Loading is infallible
    /// for any syntactically valid file; semantic validation runs once
    /// here, before the node starts.
    pub fn from_toml_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.branch_id.trim().is_empty() {
            return Err(ConfigError::EmptyBranchId);
        }
        if self.peer_port < 1 {
            return Err(ConfigError::InvalidPeerPort);
        }
        Ok(())
    }

    pub fn low_stock_scan_interval(&self) -> Duration {
        Duration::from_secs(self.low_stock_scan_secs)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
    pub fn replication_sync_interval(&self) -> Duration {
        Duration::from_secs(self.replication_sync_secs)
    }
    pub fn mutex_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.mutex_acquire_timeout_secs)
    }

    /// The gateway port convention used by the wider repo: `peer_port +
    /// 100`. Informational only — the gateway itself is out of scope.
    pub fn gateway_port(&self) -> u16 {
        self.peer_port.saturating_add(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_branch_id() {
        let mut config = BootConfig::new("", 9000);
        assert!(matches!(config.validate(), Err(ConfigError::EmptyBranchId)));
        config.branch_id = "branch-a".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn peer_config_parses_shorthand() {
        let parsed = PeerConfig::parse("B@10.0.0.2:9001").unwrap();
        assert_eq!(parsed, PeerConfig { id: "B".to_string(), host: "10.0.0.2".to_string(), port: 9001 });
    }

    #[test]
    fn peer_config_rejects_malformed_shorthand() {
        assert!(PeerConfig::parse("missing-port").is_err());
        assert!(PeerConfig::parse("@host:1").is_err());
        assert!(PeerConfig::parse("id@host:notaport").is_err());
    }

    #[test]
    fn defaults_match_spec_timers() {
        let config = BootConfig::new("branch-a", 9000);
        assert_eq!(config.low_stock_scan_interval(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.replication_sync_interval(), Duration::from_secs(10));
    }
}
