/// This crate contains a coordinator that rebalances byte occupancy across
/// the storage nodes of a replicated block-storage cluster.
///
/// The coordinator is run out-of-band by an operator. It reads per-node
/// utilization reports from the cluster's metadata authority, classifies
/// storage groups against the cluster mean, pairs over-utilized groups with
/// under-utilized ones, and asks peers to copy replicas until the cluster
/// sits inside the configured band. The coordinator never holds
/// authoritative state: the metadata authority discovers new placements
/// through its normal reporting channels.
///
/// Data flow: name service reports -> classifier buckets -> pairer tasks ->
/// dispatcher -> per-block move via a transfer peer -> bytes-moved counter
/// -> next iteration.
use thiserror::Error;

pub mod cluster;
pub mod config;
pub mod engine;
pub mod policy;
pub mod report;
pub mod runner;
pub mod service;
pub mod signal;
pub mod topology;

pub use config::Config;
pub use engine::ExitStatus;

use service::ServiceError;

#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("Could not open or read configuration file: {source}")]
    ConfigIo {
        #[from]
        source: std::io::Error,
    },
    #[error("Error in configuration: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Name service failure: {source}")]
    Service {
        #[from]
        source: ServiceError,
    },
}
