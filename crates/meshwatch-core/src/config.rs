//! Configuration system for meshwatch.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHWATCH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshwatch/config.toml
//!   3. ~/.config/meshwatch/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{EndpointAddress, NodeId};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeConfig,
    pub discovery: DiscoveryConfig,
    /// Peers fed to discovery as new endpoints right after start.
    pub seeds: Vec<SeedPeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity. Empty = fingerprint of `listen`.
    pub identity: String,
    /// UDP address the daemon binds for discovery traffic.
    pub listen: String,
    /// Local HTTP status port. 0 = disabled.
    pub status_port: u16,
}

/// Discovery policy. Every timing here is a knob, not protocol law.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Outbound session attempts abandoned after this long.
    pub handshake_timeout_ms: u64,
    /// Get-peers round-trips abandoned after this long.
    pub request_timeout_ms: u64,
    /// No successful interaction for this long → Stale.
    pub stale_timeout_secs: u64,
    /// Stale for this long → left out of peer lists we hand out.
    pub stale_grace_secs: u64,
    /// Stale for this long → removed from the registry.
    pub remove_after_secs: u64,
    /// Synced peers are asked for their peers again at this interval.
    pub exchange_interval_secs: u64,
    /// Maintenance tick.
    pub sweep_interval_ms: u64,
    /// Registry capacity. 0 = unbounded.
    pub max_entries: usize,
    /// Peer list responses are truncated to this many rows, stale rows first.
    pub max_peers_per_response: usize,
    /// Dial peers that arrive flagged unreachable in someone else's list.
    pub reconnect_unreachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPeer {
    pub identity: String,
    pub address: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            listen: "0.0.0.0:7400".to_string(),
            status_port: 7401,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            request_timeout_ms: 5_000,
            stale_timeout_secs: 30,
            stale_grace_secs: 60,
            remove_after_secs: 300,
            exchange_interval_secs: 15,
            sweep_interval_ms: 1_000,
            max_entries: 1024,
            max_peers_per_response: 256,
            reconnect_unreachable: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }

    pub fn remove_after(&self) -> Duration {
        Duration::from_secs(self.remove_after_secs)
    }

    pub fn exchange_interval(&self) -> Duration {
        Duration::from_secs(self.exchange_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        // A zero period would make tokio's interval panic.
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl NodeConfig {
    /// Configured identity, or a fingerprint of the listen address.
    pub fn node_id(&self) -> NodeId {
        if self.identity.is_empty() {
            NodeId::fingerprint(self.listen.as_bytes())
        } else {
            NodeId::new(self.identity.clone())
        }
    }
}

impl SeedPeer {
    /// Parse `identity@address`.
    pub fn parse(s: &str) -> Option<Self> {
        let (identity, address) = s.trim().split_once('@')?;
        if identity.is_empty() || address.is_empty() {
            return None;
        }
        Some(Self {
            identity: identity.to_string(),
            address: address.to_string(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.identity.clone())
    }

    pub fn endpoint_address(&self) -> EndpointAddress {
        EndpointAddress::new(self.address.clone())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("meshwatch")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            MeshConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config file without applying env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHWATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MESHWATCH_* overrides. `lookup` is `std::env::var` in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MESHWATCH_NODE__IDENTITY") {
            self.node.identity = v;
        }
        if let Some(v) = lookup("MESHWATCH_NODE__LISTEN") {
            self.node.listen = v;
        }
        if let Some(p) = lookup("MESHWATCH_NODE__STATUS_PORT").and_then(|v| v.parse().ok()) {
            self.node.status_port = p;
        }
        if let Some(s) = lookup("MESHWATCH_DISCOVERY__STALE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.discovery.stale_timeout_secs = s;
        }
        if let Some(n) = lookup("MESHWATCH_DISCOVERY__MAX_ENTRIES").and_then(|v| v.parse().ok()) {
            self.discovery.max_entries = n;
        }
        if let Some(v) = lookup("MESHWATCH_SEEDS") {
            self.seeds = v.split(',').filter_map(SeedPeer::parse).collect();
        }
    }
}
