use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;

use crate::cluster::block::BlockDescriptor;

use super::protocol::{read_frame, write_frame, NameRpcRequest, NameRpcResponse};
use super::{
    AccessToken, BlockWithLocations, DatanodeStorageReport, KeyManager, NameService, NoAuth,
    ServiceError, StreamAuthenticator, BALANCER_LOCK_PATH,
};

/// An idle name service call is abandoned after this long.
const RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Framed-RPC client shared by the name service adapter and its key
/// manager. The connection is opened lazily and replaced after any
/// transport error.
struct RpcClient {
    endpoint: String,
    conn: Mutex<Option<TcpStream>>,
}

impl RpcClient {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            conn: Mutex::new(None),
        }
    }

    fn call(&self, request: &NameRpcRequest) -> Result<NameRpcResponse, ServiceError> {
        let mut conn = self.conn.lock();
        // A stale connection gets one reconnect before the error surfaces.
        let mut attempts_left = 2;
        loop {
            attempts_left -= 1;
            let stream = match conn.as_mut() {
                Some(stream) => stream,
                None => {
                    let stream = TcpStream::connect(&self.endpoint)?;
                    stream.set_read_timeout(Some(RPC_TIMEOUT))?;
                    stream.set_write_timeout(Some(RPC_TIMEOUT))?;
                    debug!("connected to name service at {}", self.endpoint);
                    conn.insert(stream)
                }
            };
            match Self::exchange(stream, request) {
                Ok(response) => return Self::check(response),
                Err(e) => {
                    *conn = None;
                    if attempts_left == 0 {
                        return Err(e.into());
                    }
                    debug!("rpc to {} failed, reconnecting: {e}", self.endpoint);
                }
            }
        }
    }

    fn exchange(stream: &mut TcpStream, request: &NameRpcRequest) -> io::Result<NameRpcResponse> {
        write_frame(stream, request)?;
        read_frame(stream)
    }

    fn check(response: NameRpcResponse) -> Result<NameRpcResponse, ServiceError> {
        match response {
            NameRpcResponse::Failed(message) => Err(ServiceError::Rejected(message)),
            other => Ok(other),
        }
    }
}

/// Name service adapter over the framed RPC protocol.
pub struct RemoteNameService {
    client: Arc<RpcClient>,
}

impl RemoteNameService {
    pub fn open(endpoint: String) -> Self {
        Self {
            client: Arc::new(RpcClient::new(endpoint)),
        }
    }
}

impl NameService for RemoteNameService {
    fn pool_id(&self) -> Result<String, ServiceError> {
        match self.client.call(&NameRpcRequest::PoolId)? {
            NameRpcResponse::PoolId(id) => Ok(id),
            other => Err(ServiceError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    fn storage_reports(&self) -> Result<Vec<DatanodeStorageReport>, ServiceError> {
        match self.client.call(&NameRpcRequest::StorageReports)? {
            NameRpcResponse::Reports(reports) => Ok(reports),
            other => Err(ServiceError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    fn blocks_on(
        &self,
        node_uuid: &str,
        max_bytes: u64,
    ) -> Result<Vec<BlockWithLocations>, ServiceError> {
        let request = NameRpcRequest::BlocksOn {
            node_uuid: node_uuid.to_string(),
            max_bytes,
        };
        match self.client.call(&request)? {
            NameRpcResponse::Blocks(blocks) => Ok(blocks),
            other => Err(ServiceError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    fn key_manager(&self) -> Arc<dyn KeyManager> {
        Arc::new(RemoteKeys {
            client: self.client.clone(),
        })
    }

    fn authenticator(&self) -> Arc<dyn StreamAuthenticator> {
        // Negotiated stream security is the cluster's concern; the adapter
        // hands out sockets as-is.
        Arc::new(NoAuth)
    }

    fn acquire_lease(&self, holder: &str) -> Result<(), ServiceError> {
        let request = NameRpcRequest::AcquireLease {
            holder: holder.to_string(),
        };
        match self.client.call(&request)? {
            NameRpcResponse::LeaseGranted(true) => Ok(()),
            NameRpcResponse::LeaseGranted(false) => Err(ServiceError::LockContention {
                path: BALANCER_LOCK_PATH.to_string(),
            }),
            other => Err(ServiceError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    fn release_lease(&self, holder: &str) {
        let request = NameRpcRequest::ReleaseLease {
            holder: holder.to_string(),
        };
        if let Err(e) = self.client.call(&request) {
            debug!("lease release failed (ignored): {e}");
        }
    }
}

/// Key manager asking the name service for per-block tokens.
struct RemoteKeys {
    client: Arc<RpcClient>,
}

impl KeyManager for RemoteKeys {
    fn block_token(&self, block: &BlockDescriptor) -> Result<AccessToken, ServiceError> {
        let request = NameRpcRequest::BlockToken {
            block: block.clone(),
        };
        match self.client.call(&request)? {
            NameRpcResponse::Token(token) => Ok(token),
            other => Err(ServiceError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }
}
