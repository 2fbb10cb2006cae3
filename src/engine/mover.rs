use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use indicatif::HumanBytes;
use log::{debug, warn};
use thiserror::Error;

use crate::cluster::block::BlockRef;
use crate::cluster::node::StorageGroup;
use crate::service::protocol::{
    read_frame, write_frame, BlockOpResponse, PeerRequest, ProxyDescriptor, ReplaceBlockRequest,
    Status,
};
use crate::service::ServiceError;

use super::EngineShared;

/// Back-off armed on both ends of a failed transfer.
const DELAY_AFTER_ERROR: Duration = Duration::from_secs(10);
/// A stalled peer copy is abandoned after this long.
const BLOCK_MOVE_READ_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// A staged transfer. Holds one pending slot on the proxy node and one on
/// the target node from creation until drop; dropping also wakes the
/// selectors waiting for slots.
pub(crate) struct PendingMove {
    shared: Arc<EngineShared>,
    pub block: Arc<BlockRef>,
    pub source: Arc<StorageGroup>,
    pub target: Arc<StorageGroup>,
    pub proxy: Arc<StorageGroup>,
}

impl PendingMove {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        block: Arc<BlockRef>,
        source: Arc<StorageGroup>,
        target: Arc<StorageGroup>,
        proxy: Arc<StorageGroup>,
    ) -> Self {
        Self {
            shared,
            block,
            source,
            target,
            proxy,
        }
    }
}

impl Drop for PendingMove {
    fn drop(&mut self) {
        self.proxy.node().release_pending();
        self.target.node().release_pending();
        self.shared.notify_progress();
    }
}

#[derive(Error, Debug)]
pub(crate) enum TransferError {
    #[error("i/o failure: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("no access token: {source}")]
    Token {
        #[from]
        source: ServiceError,
    },
    #[error("peer answered {status:?}: {message}")]
    Rejected { status: Status, message: String },
}

/// Hand the move to the mover pool. A refused submission (pool shutting
/// down) drops the move, which releases its slots.
pub(crate) fn execute_async(shared: &Arc<EngineShared>, pending: PendingMove) {
    let movers = shared.movers.clone();
    let shared = shared.clone();
    movers.submit(move || execute(&shared, pending));
}

/// Run one move to completion. Failures stay local to the block: log,
/// arm back-off on both peers, and let the iteration continue.
pub(crate) fn execute(shared: &Arc<EngineShared>, pending: PendingMove) {
    match transfer(shared, &pending) {
        Ok(()) => {
            let length = pending.block.length();
            shared.connector.add_bytes_moved(length);
            debug!(
                "moved {} ({}) from {} to {} via proxy {}",
                pending.block.key(),
                HumanBytes(length),
                pending.source.id(),
                pending.target.id(),
                pending.proxy.id(),
            );
        }
        Err(e) => {
            warn!(
                "failed to move {} from {} to {}: {e}",
                pending.block.key(),
                pending.source.id(),
                pending.target.id(),
            );
            pending.proxy.node().delay(DELAY_AFTER_ERROR);
            pending.target.node().delay(DELAY_AFTER_ERROR);
        }
    }
    // `pending` drops here: slots come back, selectors wake up.
}

fn transfer(shared: &Arc<EngineShared>, pending: &PendingMove) -> Result<(), TransferError> {
    let service = shared.connector.service();
    let token = service.key_manager().block_token(pending.block.descriptor())?;

    let stream = TcpStream::connect(&pending.target.node().info().transfer_addr)?;
    stream.set_read_timeout(Some(BLOCK_MOVE_READ_TIMEOUT))?;
    let mut stream = service.authenticator().secure(stream, &token)?;

    let request = PeerRequest::ReplaceBlock(ReplaceBlockRequest {
        block: pending.block.descriptor().clone(),
        storage_type: pending.target.kind(),
        token,
        source_uuid: pending.source.node().uuid().to_string(),
        proxy: ProxyDescriptor {
            node_uuid: pending.proxy.node().uuid().to_string(),
            transfer_addr: pending.proxy.node().info().transfer_addr.clone(),
        },
    });
    write_frame(&mut stream, &request)?;
    let response: BlockOpResponse = read_frame(&mut stream)?;
    match response.status {
        Status::Success => Ok(()),
        status => Err(TransferError::Rejected {
            status,
            message: response.message.unwrap_or_default(),
        }),
    }
}
