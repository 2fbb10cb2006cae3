use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;

use crate::engine::MAX_ITERATION_TIME;
use crate::BalancerError;

/// Runtime configuration. Every knob carries a default so a file only
/// needs to name the services and whatever deviates from stock.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name services to balance, swept in random order each round.
    pub services: Vec<ServiceEndpoint>,
    /// Worker threads running one selection loop per source.
    pub dispatcher_threads: usize,
    /// Worker threads executing individual block moves.
    pub mover_threads: usize,
    /// Concurrent moves one node may be party to, as target or proxy.
    pub max_concurrent_moves: usize,
    /// Advisory copy bandwidth per transfer peer in bytes/s; enforcement
    /// happens on the peers.
    pub bandwidth_per_move: u64,
    /// How long a moved block stays barred from another attempt.
    #[serde(deserialize_with = "deserialize_duration")]
    pub moved_window: Duration,
    /// Cluster heartbeat; rounds sleep twice this between sweeps.
    #[serde(deserialize_with = "deserialize_duration")]
    pub heartbeat_interval: Duration,
    /// Poll period while draining in-flight moves at the end of an
    /// iteration. Tests shorten this.
    #[serde(deserialize_with = "deserialize_duration")]
    pub block_move_wait: Duration,
    /// Balance within node groups before racks when the cluster topology
    /// has a node-group layer.
    pub node_group_aware: bool,
    /// Directory for the per-iteration CSV report; stdout only when unset.
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            dispatcher_threads: 200,
            mover_threads: 1000,
            max_concurrent_moves: 5,
            bandwidth_per_move: 1024 * 1024,
            moved_window: 2 * MAX_ITERATION_TIME,
            heartbeat_interval: Duration::from_secs(3),
            block_move_wait: Duration::from_secs(30),
            node_group_aware: false,
            report_path: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, BalancerError> {
        let mut file = std::fs::OpenOptions::new().read(true).open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Ok(toml::from_str(&content)?)
    }
}
