use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use block_balancer::cluster::block::BlockDescriptor;
use block_balancer::cluster::{HostSet, NodeInfo, StorageType};
use block_balancer::engine::{Engine, WorkerPool};
use block_balancer::policy::PolicyKind;
use block_balancer::service::connector::Connector;
use block_balancer::service::protocol::{
    read_frame, write_frame, BlockOpResponse, PeerRequest, ReplaceBlockRequest, Status,
};
use block_balancer::service::{
    BlockWithLocations, DatanodeStorageReport, InsecureKeys, KeyManager, NameService, NoAuth,
    ReplicaLocation, ServiceError, StorageReport, StreamAuthenticator, BALANCER_LOCK_PATH,
};
use block_balancer::Config;

/// In-memory name service. Block listings are drained on read, so a node
/// that handed out its blocks reports nothing on the next listing.
#[derive(Default)]
pub struct MockNameService {
    pub reports: Mutex<Vec<DatanodeStorageReport>>,
    pub blocks: Mutex<HashMap<String, Vec<BlockWithLocations>>>,
    pub lease: Mutex<Option<String>>,
}

impl MockNameService {
    pub fn new(reports: Vec<DatanodeStorageReport>) -> Arc<Self> {
        Arc::new(Self {
            reports: Mutex::new(reports),
            ..Self::default()
        })
    }

    pub fn put_blocks(&self, node_uuid: &str, blocks: Vec<BlockWithLocations>) {
        self.blocks.lock().insert(node_uuid.to_string(), blocks);
    }
}

impl NameService for MockNameService {
    fn pool_id(&self) -> Result<String, ServiceError> {
        Ok("bp-mock".to_string())
    }

    fn storage_reports(&self) -> Result<Vec<DatanodeStorageReport>, ServiceError> {
        Ok(self.reports.lock().clone())
    }

    fn blocks_on(
        &self,
        node_uuid: &str,
        max_bytes: u64,
    ) -> Result<Vec<BlockWithLocations>, ServiceError> {
        let mut all = self.blocks.lock();
        let Some(list) = all.get_mut(node_uuid) else {
            return Ok(Vec::new());
        };
        let mut handed_out = Vec::new();
        let mut total = 0u64;
        while let Some(next) = list.first() {
            if !handed_out.is_empty() && total + next.block.length > max_bytes {
                break;
            }
            total += next.block.length;
            handed_out.push(list.remove(0));
        }
        Ok(handed_out)
    }

    fn key_manager(&self) -> Arc<dyn KeyManager> {
        Arc::new(InsecureKeys)
    }

    fn authenticator(&self) -> Arc<dyn StreamAuthenticator> {
        Arc::new(NoAuth)
    }

    fn acquire_lease(&self, holder: &str) -> Result<(), ServiceError> {
        let mut lease = self.lease.lock();
        if lease.is_some() {
            return Err(ServiceError::LockContention {
                path: BALANCER_LOCK_PATH.to_string(),
            });
        }
        *lease = Some(holder.to_string());
        Ok(())
    }

    fn release_lease(&self, holder: &str) {
        let mut lease = self.lease.lock();
        if lease.as_deref() == Some(holder) {
            *lease = None;
        }
    }
}

/// A transfer peer answering every `REPLACE_BLOCK` with a fixed status.
pub struct MockPeer {
    pub addr: String,
    requests: Arc<Mutex<Vec<ReplaceBlockRequest>>>,
}

impl MockPeer {
    pub fn start(status: Status) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock peer");
        let addr = listener.local_addr().expect("local addr").to_string();
        let requests: Arc<Mutex<Vec<ReplaceBlockRequest>>> = Arc::default();
        let seen = requests.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let Ok(PeerRequest::ReplaceBlock(request)) = read_frame(&mut stream) else {
                    continue;
                };
                seen.lock().push(request);
                let _ = write_frame(
                    &mut stream,
                    &BlockOpResponse {
                        status,
                        message: (status != Status::Success).then(|| "refused".to_string()),
                    },
                );
            }
        });
        Self { addr, requests }
    }

    pub fn requests(&self) -> Vec<ReplaceBlockRequest> {
        self.requests.lock().clone()
    }
}

pub fn node_info(uuid: &str, rack: &str, transfer_addr: &str) -> NodeInfo {
    NodeInfo {
        uuid: uuid.to_string(),
        hostname: format!("{uuid}.example"),
        ip: "10.0.0.1".to_string(),
        transfer_addr: transfer_addr.to_string(),
        rack: rack.to_string(),
        node_group: None,
        decommissioning: false,
    }
}

pub fn report(
    uuid: &str,
    rack: &str,
    transfer_addr: &str,
    capacity: u64,
    used: u64,
) -> DatanodeStorageReport {
    DatanodeStorageReport {
        node: node_info(uuid, rack, transfer_addr),
        storages: vec![StorageReport {
            kind: StorageType::Disk,
            capacity,
            dfs_used: used,
            remaining: capacity.saturating_sub(used),
        }],
    }
}

pub fn block(id: u64, length: u64, replicas: &[&str]) -> BlockWithLocations {
    BlockWithLocations {
        block: BlockDescriptor {
            pool: "bp-mock".to_string(),
            id,
            generation: 1,
            length,
        },
        locations: replicas
            .iter()
            .map(|uuid| ReplicaLocation {
                node_uuid: uuid.to_string(),
                kind: StorageType::Disk,
            })
            .collect(),
    }
}

pub fn test_config() -> Config {
    Config {
        dispatcher_threads: 4,
        mover_threads: 4,
        max_concurrent_moves: 5,
        block_move_wait: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(10),
        ..Config::default()
    }
}

/// Engine with short test timings around the given service. The backing
/// pools are dropped right away; the handles keep their workers alive.
pub fn engine_for(service: Arc<MockNameService>, threshold_pct: f64) -> Engine {
    let connector =
        Connector::connect("mock-ns".to_string(), service as Arc<dyn NameService>)
            .expect("lease is free");
    let dispatcher = WorkerPool::new("dispatcher-test", 4);
    let movers = WorkerPool::new("mover-test", 4);
    let engine = Engine::new(
        connector,
        PolicyKind::Node,
        threshold_pct,
        HostSet::default(),
        HostSet::default(),
        &test_config(),
        dispatcher.handle(),
        movers.handle(),
        Arc::new(AtomicBool::new(false)),
    );
    drop(dispatcher);
    drop(movers);
    engine
}
