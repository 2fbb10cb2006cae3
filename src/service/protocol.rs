use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cluster::block::BlockDescriptor;
use crate::cluster::StorageType;

use super::{AccessToken, BlockWithLocations, DatanodeStorageReport};

/// This module contains the framed binary protocol spoken with transfer
/// peers and with the name service adapter: a big-endian u32 length prefix
/// followed by a bincode body.

/// Upper bound on a single frame; anything larger is treated as garbage.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub fn write_frame<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: Write,
    T: Serialize,
{
    let body = bincode::serialize(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_u32::<BigEndian>(body.len() as u32)?;
    writer.write_all(&body)?;
    writer.flush()
}

pub fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: Read,
    T: DeserializeOwned,
{
    let len = reader.read_u32::<BigEndian>()?;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    bincode::deserialize(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Coordinates a target peer needs to pull a replica from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub node_uuid: String,
    pub transfer_addr: String,
}

/// Ask a target peer to copy a replica from the proxy and report it as its
/// own. The peer answers once the copy finished (or failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceBlockRequest {
    pub block: BlockDescriptor,
    pub storage_type: StorageType,
    pub token: AccessToken,
    pub source_uuid: String,
    pub proxy: ProxyDescriptor,
}

/// Operations a transfer peer accepts. The balancer only ever issues
/// `ReplaceBlock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    ReplaceBlock(ReplaceBlockRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Error,
    ErrorAccessToken,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockOpResponse {
    pub status: Status,
    pub message: Option<String>,
}

/// RPC surface of the remote name service adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NameRpcRequest {
    PoolId,
    StorageReports,
    BlocksOn { node_uuid: String, max_bytes: u64 },
    BlockToken { block: BlockDescriptor },
    AcquireLease { holder: String },
    ReleaseLease { holder: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NameRpcResponse {
    PoolId(String),
    Reports(Vec<DatanodeStorageReport>),
    Blocks(Vec<BlockWithLocations>),
    Token(AccessToken),
    LeaseGranted(bool),
    Done,
    Failed(String),
}
