use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cluster::{HostSet, NodeInfo, StorageType};
use crate::config::Config;
use crate::policy::PolicyKind;
use crate::service::connector::Connector;
use crate::service::{
    BlockWithLocations, DatanodeStorageReport, InsecureKeys, KeyManager, NameService, NoAuth,
    ServiceError, StorageReport, StreamAuthenticator, BALANCER_LOCK_PATH,
};

use super::{Engine, EngineShared, WorkerPool};

/// In-memory name service for unit tests. Block listings are drained on
/// read so a second fetch comes back empty, like a node that already
/// handed out everything it has.
#[derive(Default)]
pub(crate) struct StaticService {
    pub reports: Mutex<Vec<DatanodeStorageReport>>,
    pub blocks: Mutex<HashMap<String, Vec<BlockWithLocations>>>,
    pub lease: Mutex<Option<String>>,
}

impl NameService for StaticService {
    fn pool_id(&self) -> Result<String, ServiceError> {
        Ok("bp-test".to_string())
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

pub(crate) fn node_info(uuid: &str, rack: &str, transfer_addr: &str) -> NodeInfo {
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

pub(crate) fn report(uuid: &str, rack: &str, capacity: u64, used: u64) -> DatanodeStorageReport {
    report_at(uuid, rack, "127.0.0.1:0", capacity, used)
}

pub(crate) fn report_at(
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

/// Build an engine around the given service with short test timings. The
/// backing pools are dropped right away; their handles keep the feeds
/// open and the worker threads alive.
pub(crate) fn test_engine<S>(service: S, threshold_pct: f64, max_concurrent_moves: usize) -> Engine
where
    S: NameService + 'static,
{
    let connector =
        Connector::connect("test-ns".to_string(), Arc::new(service)).expect("lease is free");
    let config = Config {
        max_concurrent_moves,
        block_move_wait: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(10),
        ..Config::default()
    };
    let dispatcher = WorkerPool::new("dispatcher-test", 4);
    let movers = WorkerPool::new("mover-test", 4);
    let engine = Engine::new(
        connector,
        PolicyKind::Node,
        threshold_pct,
        HostSet::default(),
        HostSet::default(),
        &config,
        dispatcher.handle(),
        movers.handle(),
        Arc::new(AtomicBool::new(false)),
    );
    drop(dispatcher);
    drop(movers);
    engine
}

pub(crate) fn shared_with_service<S>(
    service: S,
    threshold_pct: f64,
    max_concurrent_moves: usize,
) -> Arc<EngineShared>
where
    S: NameService + 'static,
{
    let engine = test_engine(service, threshold_pct, max_concurrent_moves);
    engine.shared().clone()
}
