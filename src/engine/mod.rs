use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::cluster::node::{DNode, Source, StorageGroup};
use crate::cluster::{block::BlockIndex, GroupId, HostSet};
use crate::config::Config;
use crate::policy::{PolicyKind, UtilizationPolicy};
use crate::service::connector::Connector;
use crate::topology::Topology;

pub mod classifier;
pub mod dispatcher;
pub mod mover;
pub mod pairer;
pub mod selector;
#[cfg(test)]
pub(crate) mod testutil;

pub use dispatcher::{PoolHandle, WorkerPool};

/// Hard cap on one iteration's dispatch phase.
pub const MAX_ITERATION_TIME: Duration = Duration::from_secs(20 * 60);

/// Outcome of an iteration or of the whole run. Negative codes surface as
/// the process exit code; `InProgress` only drives the outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    InProgress,
    AlreadyRunning,
    NoMoveBlock,
    NoMoveProgress,
    IoException,
    IllegalArgs,
    Interrupted,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::InProgress => 1,
            ExitStatus::AlreadyRunning => -1,
            ExitStatus::NoMoveBlock => -2,
            ExitStatus::NoMoveProgress => -3,
            ExitStatus::IoException => -4,
            ExitStatus::IllegalArgs => -5,
            ExitStatus::Interrupted => -6,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ExitStatus::Success => "the cluster is balanced",
            ExitStatus::InProgress => "still moving bytes",
            ExitStatus::AlreadyRunning => "another balancer is running",
            ExitStatus::NoMoveBlock => "no block can be moved",
            ExitStatus::NoMoveProgress => "no progress over five iterations",
            ExitStatus::IoException => "name service failure",
            ExitStatus::IllegalArgs => "invalid arguments",
            ExitStatus::Interrupted => "interrupted",
        }
    }
}

/// What one call to [`Engine::run_once`] produced.
#[derive(Debug, Clone, Copy)]
pub struct IterationResult {
    pub status: ExitStatus,
    /// Remaining imbalance measured by the classifier.
    pub bytes_left: u64,
    /// Bytes moved during this iteration alone.
    pub bytes_moved_iteration: u64,
}

/// State shared between the iteration driver, the selector jobs on the
/// dispatcher pool, and the movers. Everything here is iteration-scoped
/// and torn down by [`EngineShared::reset_data`], except the block index
/// (trimmed, not emptied) and the cumulative counters on the connector.
pub struct EngineShared {
    pub(crate) connector: Arc<Connector>,
    pub(crate) topology: Topology,
    pub(crate) config: Config,
    /// Allowed deviation from the mean, as a fraction.
    pub(crate) threshold: f64,
    pub(crate) excluded: HostSet,
    pub(crate) included: HostSet,
    pub(crate) blocks: BlockIndex,
    pub(crate) dispatcher: PoolHandle,
    pub(crate) movers: PoolHandle,
    pub(crate) interrupted: Arc<AtomicBool>,
    progress_lock: Mutex<()>,
    progress: Condvar,
    deadline: Mutex<Instant>,
    pub(crate) cluster: Mutex<HashMap<String, Arc<DNode>>>,
    pub(crate) storage_groups: Mutex<HashMap<GroupId, Arc<StorageGroup>>>,
    pub(crate) sources: Mutex<Vec<Arc<Source>>>,
    pub(crate) targets: Mutex<Vec<Arc<StorageGroup>>>,
}

impl EngineShared {
    pub(crate) fn group(&self, id: &GroupId) -> Option<Arc<StorageGroup>> {
        self.storage_groups.lock().get(id).cloned()
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn iteration_over(&self) -> bool {
        Instant::now() >= *self.deadline.lock()
    }

    fn arm_deadline(&self) {
        *self.deadline.lock() = Instant::now() + MAX_ITERATION_TIME;
    }

    /// Wake every selector stalled on the progress condition. Called by
    /// anything that frees a slot or advances the moved-bytes counter.
    pub(crate) fn notify_progress(&self) {
        let _guard = self.progress_lock.lock();
        self.progress.notify_all();
    }

    pub(crate) fn wait_progress(&self, timeout: Duration) {
        let mut guard = self.progress_lock.lock();
        self.progress.wait_for(&mut guard, timeout);
    }

    /// Clear the per-iteration state. The block index survives trimmed to
    /// the ids still inside the moved window so block identity stays
    /// stable for the dedup test.
    pub(crate) fn reset_data(&self) {
        self.cluster.lock().clear();
        self.storage_groups.lock().clear();
        self.sources.lock().clear();
        self.targets.lock().clear();
        self.blocks.prune(Instant::now());
    }
}

/// Runs balancing iterations against one name service.
pub struct Engine {
    shared: Arc<EngineShared>,
    policy: UtilizationPolicy,
    rng: StdRng,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<Connector>,
        policy: PolicyKind,
        threshold_pct: f64,
        excluded: HostSet,
        included: HostSet,
        config: &Config,
        dispatcher: PoolHandle,
        movers: PoolHandle,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        let shared = Arc::new(EngineShared {
            connector,
            topology: Topology::new(config.node_group_aware),
            config: config.clone(),
            threshold: threshold_pct / 100.0,
            excluded,
            included,
            blocks: BlockIndex::new(config.moved_window),
            dispatcher,
            movers,
            interrupted,
            progress_lock: Mutex::new(()),
            progress: Condvar::new(),
            deadline: Mutex::new(Instant::now()),
            cluster: Mutex::new(HashMap::new()),
            storage_groups: Mutex::new(HashMap::new()),
            sources: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
        });
        Self {
            shared,
            policy: UtilizationPolicy::new(policy),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.shared.connector
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// One balancing pass: init, choose, dispatch, wait, report. The
    /// per-iteration state is cleared on every exit path.
    pub fn run_once(&mut self) -> IterationResult {
        let result = self.run_inner();
        self.shared.reset_data();
        result
    }

    fn run_inner(&mut self) -> IterationResult {
        let name = self.shared.connector.name().to_string();
        if self.shared.interrupted() {
            return Self::result(ExitStatus::Interrupted, 0, 0);
        }

        let reports = match self.shared.connector.service().storage_reports() {
            Ok(reports) => reports,
            Err(e) => {
                error!("{name}: failed to read storage reports: {e}");
                return Self::result(ExitStatus::IoException, 0, 0);
            }
        };

        let mut classification =
            classifier::classify(&mut self.policy, &self.shared, &mut self.rng, reports);
        let bytes_left = classification.bytes_left;
        if bytes_left == 0 {
            return Self::result(ExitStatus::Success, 0, 0);
        }

        let bytes_to_move = pairer::pair(&self.shared, &mut classification);
        if bytes_to_move == 0 {
            info!("{name}: no block can be moved between the chosen groups");
            return Self::result(ExitStatus::NoMoveBlock, bytes_left, 0);
        }
        info!(
            "{name}: moving up to {} this iteration",
            indicatif::HumanBytes(bytes_to_move)
        );

        self.shared.arm_deadline();
        let moved = self.shared.dispatch_block_moves();

        if self.shared.interrupted() {
            return Self::result(ExitStatus::Interrupted, bytes_left, moved);
        }
        if !self.shared.connector.should_continue(moved) {
            return Self::result(ExitStatus::NoMoveProgress, bytes_left, moved);
        }
        Self::result(ExitStatus::InProgress, bytes_left, moved)
    }

    fn result(status: ExitStatus, bytes_left: u64, moved: u64) -> IterationResult {
        IterationResult {
            status,
            bytes_left,
            bytes_moved_iteration: moved,
        }
    }
}
