use std::io;
use std::net::TcpStream;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::block::BlockDescriptor;
use crate::cluster::{NodeInfo, StorageType};

pub mod connector;
pub mod protocol;
pub mod remote;

/// Well-known path of the exclusive only-one-balancer lock.
pub const BALANCER_LOCK_PATH: &str = "/system/balancer.id";

/// Usage and capacity of one storage of one type on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageReport {
    pub kind: StorageType,
    pub capacity: u64,
    pub dfs_used: u64,
    pub remaining: u64,
}

/// Per-node report the name service delivers for live nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatanodeStorageReport {
    pub node: NodeInfo,
    pub storages: Vec<StorageReport>,
}

/// Where one replica of a block lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaLocation {
    pub node_uuid: String,
    pub kind: StorageType,
}

/// A block plus the storage groups its replicas live on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockWithLocations {
    pub block: BlockDescriptor,
    pub locations: Vec<ReplicaLocation>,
}

/// Short-lived token authorizing one block operation on a transfer peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub identifier: Vec<u8>,
    pub password: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("name service i/o failure: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("malformed reply from name service: {0}")]
    Protocol(String),
    #[error("another balancer holds the lock at {path}")]
    LockContention { path: String },
    #[error("name service rejected the request: {0}")]
    Rejected(String),
}

/// Issues access tokens for block operations.
pub trait KeyManager: Send + Sync {
    fn block_token(&self, block: &BlockDescriptor) -> Result<AccessToken, ServiceError>;
}

/// Key manager for clusters that do not require block tokens.
pub struct InsecureKeys;

impl KeyManager for InsecureKeys {
    fn block_token(&self, _block: &BlockDescriptor) -> Result<AccessToken, ServiceError> {
        Ok(AccessToken::default())
    }
}

/// Wraps a freshly-connected transfer socket in whatever negotiated stream
/// security the cluster mandates.
pub trait StreamAuthenticator: Send + Sync {
    fn secure(&self, stream: TcpStream, token: &AccessToken) -> io::Result<TcpStream>;
}

/// Pass-through authenticator for unsecured clusters.
pub struct NoAuth;

impl StreamAuthenticator for NoAuth {
    fn secure(&self, stream: TcpStream, _token: &AccessToken) -> io::Result<TcpStream> {
        Ok(stream)
    }
}

/// The metadata authority, as seen from the balancer. Implementations are
/// expected to be cheap to call repeatedly; every iteration re-reads the
/// full report list.
pub trait NameService: Send + Sync {
    fn pool_id(&self) -> Result<String, ServiceError>;

    /// Reports for all live nodes.
    fn storage_reports(&self) -> Result<Vec<DatanodeStorageReport>, ServiceError>;

    /// Up to `max_bytes` worth of blocks residing on the given node.
    fn blocks_on(&self, node_uuid: &str, max_bytes: u64)
        -> Result<Vec<BlockWithLocations>, ServiceError>;

    fn key_manager(&self) -> Arc<dyn KeyManager>;

    fn authenticator(&self) -> Arc<dyn StreamAuthenticator>;

    /// Take the exclusive lock at [`BALANCER_LOCK_PATH`].
    fn acquire_lease(&self, holder: &str) -> Result<(), ServiceError>;

    fn release_lease(&self, holder: &str);
}
