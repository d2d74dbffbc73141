//! Configuration module for Karst.

use crate::error::{KarstError, Result};
use crate::types::ReplicaId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Karst node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KarstConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Replication configuration.
    pub replication: ReplicationConfig,
    /// Election configuration.
    pub election: ElectionConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl KarstConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KarstError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| KarstError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(KarstError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Replica ID must be non-zero".to_string(),
            });
        }

        if self.replication.peers.iter().any(|p| p.id == self.node.id) {
            return Err(KarstError::InvalidConfig {
                field: "replication.peers".to_string(),
                reason: "Peer list must not contain this node's own ID".to_string(),
            });
        }

        if self.replication.peers.is_empty()
            && matches!(self.election.mode, ElectionMode::Manual | ElectionMode::Voter)
        {
            return Err(KarstError::InvalidConfig {
                field: "election.mode".to_string(),
                reason: "manual and voter modes require at least one peer".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                name: "dev-node".to_string(),
            },
            replication: ReplicationConfig::default(),
            election: ElectionConfig {
                mode: ElectionMode::Candidate,
                fencing_enabled: true,
            },
            storage: StorageConfig {
                wal_dir: PathBuf::from("/tmp/karst/wal"),
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique replica identifier.
    pub id: ReplicaId,
    /// Human-readable node name.
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: "karst-node".to_string(),
        }
    }
}

/// Replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Registered peers.
    pub peers: Vec<PeerConfig>,
    /// Connection timeout for peer transports.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// A single peer entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer replica identifier.
    pub id: ReplicaId,
    /// Peer address.
    pub addr: String,
}

/// Election configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Election participation mode.
    pub mode: ElectionMode,
    /// Whether a leader resigns when it loses the quorum of healthy peers.
    #[serde(default = "default_fencing_enabled")]
    pub fencing_enabled: bool,
}

fn default_fencing_enabled() -> bool {
    true
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            mode: ElectionMode::Off,
            fencing_enabled: true,
        }
    }
}

/// How this node participates in leader elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionMode {
    /// Elections disabled entirely.
    Off,
    /// Votes in elections but never campaigns.
    Voter,
    /// Campaigns only when promoted explicitly.
    Manual,
    /// Campaigns whenever it has a quorum of healthy peers.
    Candidate,
}

impl fmt::Display for ElectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionMode::Off => write!(f, "off"),
            ElectionMode::Voter => write!(f, "voter"),
            ElectionMode::Manual => write!(f, "manual"),
            ElectionMode::Candidate => write!(f, "candidate"),
        }
    }
}

impl std::str::FromStr for ElectionMode {
    type Err = KarstError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(ElectionMode::Off),
            "voter" => Ok(ElectionMode::Voter),
            "manual" => Ok(ElectionMode::Manual),
            "candidate" => Ok(ElectionMode::Candidate),
            other => Err(KarstError::InvalidConfig {
                field: "election.mode".to_string(),
                reason: format!("unknown mode {:?}", other),
            }),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the write-ahead journal.
    pub wal_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("/var/lib/karst/wal"),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: "0.0.0.0:9090".parse().expect("valid socket address"),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
