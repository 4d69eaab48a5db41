//! KvStore configuration.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    backoff::BackoffConfig,
    error::{KvStoreError, Result},
    peers::PeerSpec,
};

pub const DEFAULT_GLOBAL_PUB_PORT: u16 = 60001;
pub const DEFAULT_GLOBAL_CMD_PORT: u16 = 60002;
pub const DEFAULT_LOCAL_PUB_PORT: u16 = 60011;
pub const DEFAULT_LOCAL_CMD_PORT: u16 = 60012;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KvStoreConfig {
    /// Identity of this node; used as the originator of local writes and in
    /// full-sync requests.
    pub node_id: String,

    #[serde(default = "default_local_cmd_addr")]
    pub local_cmd_addr: SocketAddr,
    #[serde(default = "default_global_cmd_addr")]
    pub global_cmd_addr: SocketAddr,
    #[serde(default = "default_local_pub_addr")]
    pub local_pub_addr: SocketAddr,
    #[serde(default = "default_global_pub_addr")]
    pub global_pub_addr: SocketAddr,

    /// Base period of the full-sync driver, jittered on every tick.
    #[serde(default = "default_db_sync_interval", with = "duration_ms")]
    pub db_sync_interval: Duration,
    #[serde(default = "default_sync_timeout", with = "duration_ms")]
    pub sync_timeout: Duration,
    #[serde(default = "default_sync_backoff_floor", with = "duration_ms")]
    pub sync_backoff_floor: Duration,
    #[serde(default = "default_sync_backoff_ceiling", with = "duration_ms")]
    pub sync_backoff_ceiling: Duration,
    #[serde(default = "default_sync_backoff_growth")]
    pub sync_backoff_growth: f64,
    /// Percentage (0..=100) by which each sync interval is spread.
    #[serde(default = "default_sync_jitter_pct")]
    pub sync_jitter_pct: u8,

    #[serde(default = "default_monitor_submit_interval", with = "duration_ms")]
    pub monitor_submit_interval: Duration,
    #[serde(default = "default_heartbeat_interval", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    #[serde(default = "default_command_queue_size")]
    pub command_queue_size: usize,
    #[serde(default = "default_publication_queue_size")]
    pub publication_queue_size: usize,

    /// Key prefixes whose key counts are reported with the counters.
    #[serde(default = "default_counter_key_markers")]
    pub counter_key_markers: Vec<String>,

    /// Peers to add at startup.
    #[serde(default)]
    pub peers: BTreeMap<String, PeerSpec>,
}

fn default_local_cmd_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_LOCAL_CMD_PORT)
}

fn default_global_cmd_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_GLOBAL_CMD_PORT)
}

fn default_local_pub_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_LOCAL_PUB_PORT)
}

fn default_global_pub_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_GLOBAL_PUB_PORT)
}

fn default_db_sync_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_sync_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_sync_backoff_floor() -> Duration {
    Duration::from_secs(4)
}

fn default_sync_backoff_ceiling() -> Duration {
    Duration::from_secs(256)
}

fn default_sync_backoff_growth() -> f64 {
    2.0
}

fn default_sync_jitter_pct() -> u8 {
    20
}

fn default_monitor_submit_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_command_queue_size() -> usize {
    1024
}

fn default_publication_queue_size() -> usize {
    1024
}

fn default_counter_key_markers() -> Vec<String> {
    vec!["adj:".to_string(), "prefix:".to_string()]
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            local_cmd_addr: default_local_cmd_addr(),
            global_cmd_addr: default_global_cmd_addr(),
            local_pub_addr: default_local_pub_addr(),
            global_pub_addr: default_global_pub_addr(),
            db_sync_interval: default_db_sync_interval(),
            sync_timeout: default_sync_timeout(),
            sync_backoff_floor: default_sync_backoff_floor(),
            sync_backoff_ceiling: default_sync_backoff_ceiling(),
            sync_backoff_growth: default_sync_backoff_growth(),
            sync_jitter_pct: default_sync_jitter_pct(),
            monitor_submit_interval: default_monitor_submit_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            command_queue_size: default_command_queue_size(),
            publication_queue_size: default_publication_queue_size(),
            counter_key_markers: default_counter_key_markers(),
            peers: BTreeMap::new(),
        }
    }
}

impl KvStoreConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// All four endpoints on `ip` with OS-assigned ports.
    pub fn with_ephemeral_ports(mut self, ip: IpAddr) -> Self {
        self.local_cmd_addr = SocketAddr::new(ip, 0);
        self.global_cmd_addr = SocketAddr::new(ip, 0);
        self.local_pub_addr = SocketAddr::new(ip, 0);
        self.global_pub_addr = SocketAddr::new(ip, 0);
        self
    }

    pub fn with_db_sync_interval(mut self, interval: Duration) -> Self {
        self.db_sync_interval = interval;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_sync_backoff(mut self, floor: Duration, ceiling: Duration, growth: f64) -> Self {
        self.sync_backoff_floor = floor;
        self.sync_backoff_ceiling = ceiling;
        self.sync_backoff_growth = growth;
        self
    }

    pub fn with_sync_jitter_pct(mut self, pct: u8) -> Self {
        self.sync_jitter_pct = pct;
        self
    }

    pub fn with_monitor_submit_interval(mut self, interval: Duration) -> Self {
        self.monitor_submit_interval = interval;
        self
    }

    pub fn with_peer(mut self, name: impl Into<String>, spec: PeerSpec) -> Self {
        self.peers.insert(name.into(), spec);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| KvStoreError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            floor: self.sync_backoff_floor,
            ceiling: self.sync_backoff_ceiling,
            growth_factor: self.sync_backoff_growth,
        }
    }

    /// Checked once before the store binds; nothing is re-validated later.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(KvStoreError::Config("node_id must not be empty".to_string()));
        }
        if self.sync_jitter_pct > 100 {
            return Err(KvStoreError::Config(format!(
                "sync_jitter_pct must be within 0..=100, got {}",
                self.sync_jitter_pct
            )));
        }
        if !self.sync_backoff_growth.is_finite() || self.sync_backoff_growth < 1.0 {
            return Err(KvStoreError::Config(format!(
                "sync_backoff_growth must be >= 1.0, got {}",
                self.sync_backoff_growth
            )));
        }
        if self.sync_backoff_floor.is_zero() {
            return Err(KvStoreError::Config(
                "sync_backoff_floor must be positive".to_string(),
            ));
        }
        if self.sync_backoff_ceiling < self.sync_backoff_floor {
            return Err(KvStoreError::Config(format!(
                "sync_backoff_ceiling ({:?}) is below sync_backoff_floor ({:?})",
                self.sync_backoff_ceiling, self.sync_backoff_floor
            )));
        }
        for (name, interval) in [
            ("db_sync_interval", self.db_sync_interval),
            ("sync_timeout", self.sync_timeout),
            ("monitor_submit_interval", self.monitor_submit_interval),
            ("heartbeat_interval", self.heartbeat_interval),
        ] {
            if interval.is_zero() {
                return Err(KvStoreError::Config(format!("{} must be positive", name)));
            }
        }
        if self.command_queue_size == 0 || self.publication_queue_size == 0 {
            return Err(KvStoreError::Config(
                "queue sizes must be greater than 0".to_string(),
            ));
        }
        if let Some(name) = self.peers.keys().find(|name| **name == self.node_id) {
            return Err(KvStoreError::Config(format!(
                "peer {} has the same name as this node",
                name
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
