use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{GroupId, NodeInfo, StorageType};

/// A storage host taking part in balancing. Tracks how many moves the node
/// is currently party to (as target or proxy) and a back-off deadline that
/// is armed after transfer errors.
pub struct DNode {
    info: NodeInfo,
    max_pending: usize,
    state: Mutex<NodeState>,
}

struct NodeState {
    pending: usize,
    delay_until: Option<Instant>,
}

impl DNode {
    pub fn new(info: NodeInfo, max_pending: usize) -> Self {
        Self {
            info,
            max_pending,
            state: Mutex::new(NodeState {
                pending: 0,
                delay_until: None,
            }),
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn uuid(&self) -> &str {
        &self.info.uuid
    }

    /// Reserve a pending-move slot. Fails while the node is in error
    /// back-off or already at its concurrency cap.
    pub fn add_pending(&self) -> bool {
        let mut state = self.state.lock();
        if let Some(until) = state.delay_until {
            if Instant::now() < until {
                return false;
            }
            state.delay_until = None;
        }
        if state.pending >= self.max_pending {
            return false;
        }
        state.pending += 1;
        true
    }

    pub fn release_pending(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Reject new pending moves for the given duration.
    pub fn delay(&self, duration: Duration) {
        self.state.lock().delay_until = Some(Instant::now() + duration);
    }

    pub fn is_delayed(&self) -> bool {
        match self.state.lock().delay_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }
}

/// The balancing unit: all storage of one type on one node, together with
/// this iteration's move budget.
pub struct StorageGroup {
    node: Arc<DNode>,
    kind: StorageType,
    utilization: f64,
    max_movable: u64,
    scheduled: Mutex<u64>,
}

impl StorageGroup {
    pub fn new(node: Arc<DNode>, kind: StorageType, utilization: f64, max_movable: u64) -> Self {
        Self {
            node,
            kind,
            utilization,
            max_movable,
            scheduled: Mutex::new(0),
        }
    }

    pub fn id(&self) -> GroupId {
        GroupId {
            node: self.node.uuid().to_string(),
            kind: self.kind,
        }
    }

    pub fn node(&self) -> &Arc<DNode> {
        &self.node
    }

    pub fn kind(&self) -> StorageType {
        self.kind
    }

    pub fn utilization(&self) -> f64 {
        self.utilization
    }

    pub fn max_movable(&self) -> u64 {
        self.max_movable
    }

    pub fn scheduled(&self) -> u64 {
        *self.scheduled.lock()
    }

    pub fn available_to_move(&self) -> u64 {
        let scheduled = *self.scheduled.lock();
        self.max_movable.saturating_sub(scheduled)
    }

    pub fn has_space(&self) -> bool {
        self.available_to_move() > 0
    }

    /// Reserve bytes against the move budget. Only the pairing phase adds;
    /// the budget never exceeds `max_movable`.
    pub fn inc_scheduled(&self, bytes: u64) {
        let mut scheduled = self.scheduled.lock();
        *scheduled = (*scheduled + bytes).min(self.max_movable);
    }

    pub fn dec_scheduled(&self, bytes: u64) {
        let mut scheduled = self.scheduled.lock();
        *scheduled = scheduled.saturating_sub(bytes);
    }

    pub fn reset_scheduled(&self) {
        *self.scheduled.lock() = 0;
    }
}

/// A planned transfer quota towards one target. `size` shrinks as blocks
/// are dispatched; the task disappears once it reaches zero.
pub struct Task {
    pub target: Arc<StorageGroup>,
    pub size: u64,
}

/// A storage group with outbound work: the dispatcher runs one selection
/// loop per source and feeds the mover pool from it.
pub struct Source {
    group: Arc<StorageGroup>,
    pub(crate) tasks: Mutex<Vec<Task>>,
}

impl Source {
    pub fn new(group: Arc<StorageGroup>) -> Self {
        Self {
            group,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn group(&self) -> &Arc<StorageGroup> {
        &self.group
    }

    pub fn add_task(&self, target: Arc<StorageGroup>, size: u64) {
        self.tasks.lock().push(Task { target, size });
    }

    pub fn task_targets(&self) -> Vec<Arc<StorageGroup>> {
        self.tasks.lock().iter().map(|t| t.target.clone()).collect()
    }

    /// Sum of the remaining task quotas. Equals the group's scheduled
    /// bytes whenever no selection is mid-flight.
    pub fn task_total(&self) -> u64 {
        self.tasks.lock().iter().map(|t| t.size).sum()
    }
}
