use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::cluster::block::BlockRef;
use crate::cluster::node::{Source, StorageGroup};
use crate::cluster::GroupId;
use crate::service::ServiceError;

use super::mover::{self, PendingMove};
use super::EngineShared;

/// Working-set size below which another block listing is requested.
const MIN_SOURCE_BLOCKS: usize = 5;
/// Consecutive rounds without a schedulable block before a source gives
/// up on the iteration.
const MAX_NO_PENDING_MOVE_ITERATIONS: u32 = 5;
/// Byte budget for a single block-listing call.
pub(crate) const MAX_BLOCKS_TO_FETCH: u64 = 2 * 1024 * 1024 * 1024;

/// Per-source selection state for one iteration, driven by a dispatcher
/// worker. Picks a block and a proxy for every pending task and feeds the
/// mover pool until the source's quota is spent.
pub(crate) struct SourceRun {
    shared: Arc<EngineShared>,
    source: Arc<Source>,
    src_blocks: Vec<Arc<BlockRef>>,
    /// Remaining block-metadata budget for listings, initialized to twice
    /// the scheduled bytes.
    blocks_to_receive: u64,
    no_pending_rounds: u32,
}

impl SourceRun {
    pub(crate) fn new(shared: Arc<EngineShared>, source: Arc<Source>) -> Self {
        let blocks_to_receive = 2 * source.group().scheduled();
        Self {
            shared,
            source,
            src_blocks: Vec::new(),
            blocks_to_receive,
            no_pending_rounds: 0,
        }
    }

    /// The dispatch loop: runs until time is up, the quota is spent, or
    /// both the working set and the listing budget are exhausted.
    pub(crate) fn dispatch_blocks(&mut self) {
        while self.source.group().scheduled() > 0
            && !self.shared.iteration_over()
            && !self.shared.interrupted()
            && (!self.src_blocks.is_empty() || self.blocks_to_receive > 0)
        {
            if let Some(pending) = self.choose_next_move() {
                self.no_pending_rounds = 0;
                mover::execute_async(&self.shared, pending);
                continue;
            }
            // Nothing schedulable right now. Blocks may have been taken by
            // other sources in the meantime; drop those first.
            self.filter_moved_blocks();
            if self.src_blocks.len() < MIN_SOURCE_BLOCKS && self.blocks_to_receive > 0 {
                match self.fetch_blocks() {
                    Ok(0) => self.blocks_to_receive = 0,
                    Ok(received) => {
                        self.blocks_to_receive = self.blocks_to_receive.saturating_sub(received)
                    }
                    Err(e) => {
                        warn!(
                            "{}: block listing failed: {e}",
                            self.source.group().id()
                        );
                        self.blocks_to_receive = 0;
                    }
                }
                continue;
            }
            self.no_pending_rounds += 1;
            if self.no_pending_rounds >= MAX_NO_PENDING_MOVE_ITERATIONS {
                debug!(
                    "{}: no movable block in {MAX_NO_PENDING_MOVE_ITERATIONS} rounds, giving up",
                    self.source.group().id()
                );
                self.source.group().reset_scheduled();
                break;
            }
            self.shared.wait_progress(Duration::from_secs(1));
        }
    }

    /// Try every pending task in order: reserve a slot on the target
    /// node, then look for a block and a proxy. The slot goes back when
    /// nothing fits this task.
    fn choose_next_move(&mut self) -> Option<PendingMove> {
        let source = self.source.clone();
        let mut tasks = source.tasks.lock();
        let mut index = 0;
        while index < tasks.len() {
            let target = tasks[index].target.clone();
            if target.node().add_pending() {
                if let Some(pending) = self.choose_block_and_proxy(&target) {
                    let length = pending.block.length();
                    tasks[index].size = tasks[index].size.saturating_sub(length);
                    if tasks[index].size == 0 {
                        tasks.remove(index);
                    }
                    self.source.group().dec_scheduled(length);
                    return Some(pending);
                }
                target.node().release_pending();
            }
            index += 1;
        }
        None
    }

    /// First block that is a good candidate for the target and for which
    /// a proxy accepts a slot wins. The winner is marked moved before it
    /// leaves this function, so no other selector can pick it again.
    fn choose_block_and_proxy(&mut self, target: &Arc<StorageGroup>) -> Option<PendingMove> {
        let mut index = 0;
        while index < self.src_blocks.len() {
            let block = self.src_blocks[index].clone();
            if !is_good_candidate(&self.shared, self.source.group(), target, &block) {
                index += 1;
                continue;
            }
            if let Some(proxy) = choose_proxy(&self.shared, target, &block) {
                if self.shared.blocks.try_mark_moved(block.key()) {
                    self.src_blocks.swap_remove(index);
                    return Some(PendingMove::new(
                        self.shared.clone(),
                        block,
                        self.source.group().clone(),
                        target.clone(),
                        proxy,
                    ));
                }
                // Another selector won the race for this block.
                proxy.node().release_pending();
            }
            index += 1;
        }
        None
    }

    fn filter_moved_blocks(&mut self) {
        let shared = self.shared.clone();
        self.src_blocks
            .retain(|block| !shared.blocks.was_moved(&block.key()));
    }

    /// One listing round: intern the blocks through the global index,
    /// refresh their locations, and admit the ones that fit any task.
    /// Returns the metadata bytes received.
    fn fetch_blocks(&mut self) -> Result<u64, ServiceError> {
        let ask = MAX_BLOCKS_TO_FETCH.min(self.blocks_to_receive);
        let listing = self
            .shared
            .connector
            .service()
            .blocks_on(self.source.group().node().uuid(), ask)?;
        let mut received = 0u64;
        for item in listing {
            received += item.block.length;
            let block = self.shared.blocks.intern(item.block);
            let locations = item
                .locations
                .into_iter()
                .filter_map(|loc| {
                    self.shared.group(&GroupId {
                        node: loc.node_uuid,
                        kind: loc.kind,
                    })
                })
                .collect();
            block.set_locations(locations);

            if self.src_blocks.iter().any(|b| Arc::ptr_eq(b, &block)) {
                continue;
            }
            if self.is_good_for_any_task(&block) {
                self.src_blocks.push(block);
            }
        }
        debug!(
            "{}: fetched {} of block metadata",
            self.source.group().id(),
            indicatif::HumanBytes(received)
        );
        Ok(received)
    }

    fn is_good_for_any_task(&self, block: &Arc<BlockRef>) -> bool {
        self.source
            .task_targets()
            .iter()
            .any(|target| is_good_candidate(&self.shared, self.source.group(), target, block))
    }
}

/// The good-candidate predicate: type match, not recently moved, not
/// already at the target, node-group uniqueness, and rack safety.
pub(crate) fn is_good_candidate(
    shared: &EngineShared,
    source: &Arc<StorageGroup>,
    target: &Arc<StorageGroup>,
    block: &BlockRef,
) -> bool {
    if source.kind() != target.kind() {
        return false;
    }
    if shared.blocks.was_moved(&block.key()) {
        return false;
    }
    let locations = block.locations();
    if locations.iter().any(|g| g.id() == target.id()) {
        return false;
    }
    if shared.topology.node_group_aware()
        && on_same_node_group_with_replica(shared, source, target, &locations)
    {
        return false;
    }
    !reduces_rack_count(shared, source, target, &locations)
}

fn on_same_node_group_with_replica(
    shared: &EngineShared,
    source: &Arc<StorageGroup>,
    target: &Arc<StorageGroup>,
    locations: &[Arc<StorageGroup>],
) -> bool {
    locations.iter().any(|g| {
        g.id() != source.id()
            && shared
                .topology
                .same_node_group(g.node().info(), target.node().info())
    })
}

/// Would moving the replica off `source` shrink the set of racks holding
/// the block?
fn reduces_rack_count(
    shared: &EngineShared,
    source: &Arc<StorageGroup>,
    target: &Arc<StorageGroup>,
    locations: &[Arc<StorageGroup>],
) -> bool {
    let topology = &shared.topology;
    if topology.same_rack(source.node().info(), target.node().info()) {
        return false;
    }
    let target_rack_occupied = locations
        .iter()
        .any(|g| topology.same_rack(g.node().info(), target.node().info()));
    if !target_rack_occupied {
        // The target brings a brand-new rack into the set.
        return false;
    }
    // The target's rack is already covered, so the move only preserves the
    // count if the source's rack keeps a replica too.
    !locations.iter().any(|g| {
        g.id() != source.id() && topology.same_rack(g.node().info(), source.node().info())
    })
}

/// Proxy preference: a replica in the target's node group, then one in
/// the target's rack, then any. Whichever is picked must take a pending
/// slot on its node.
pub(crate) fn choose_proxy(
    shared: &EngineShared,
    target: &Arc<StorageGroup>,
    block: &BlockRef,
) -> Option<Arc<StorageGroup>> {
    let locations = block.locations();
    let target_info = target.node().info();
    if shared.topology.node_group_aware() {
        for replica in &locations {
            if shared
                .topology
                .same_node_group(replica.node().info(), target_info)
                && replica.node().add_pending()
            {
                return Some(replica.clone());
            }
        }
    }
    for replica in &locations {
        if shared.topology.same_rack(replica.node().info(), target_info)
            && replica.node().add_pending()
        {
            return Some(replica.clone());
        }
    }
    for replica in &locations {
        if replica.node().add_pending() {
            return Some(replica.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::block::{BlockDescriptor, BlockIndex};
    use crate::cluster::node::DNode;
    use crate::cluster::StorageType;
    use crate::engine::testutil::{node_info, shared_with_service, StaticService};
    use crate::engine::EngineShared;
    use std::time::Duration;

    fn group(uuid: &str, rack: &str, kind: StorageType) -> Arc<StorageGroup> {
        let node = Arc::new(DNode::new(node_info(uuid, rack, "127.0.0.1:0"), 5));
        Arc::new(StorageGroup::new(node, kind, 0.5, 1024))
    }

    fn block_on(index: &BlockIndex, id: u64, replicas: &[&Arc<StorageGroup>]) -> Arc<BlockRef> {
        let block = index.intern(BlockDescriptor {
            pool: "bp-test".to_string(),
            id,
            generation: 1,
            length: 128,
        });
        block.set_locations(replicas.iter().map(|g| Arc::clone(g)).collect());
        block
    }

    fn shared() -> Arc<EngineShared> {
        shared_with_service(StaticService::default(), 10.0, 5)
    }

    #[test]
    fn storage_types_must_match() {
        let shared = shared();
        let source = group("src", "/r1", StorageType::Disk);
        let target = group("dst", "/r1", StorageType::Ssd);
        let block = block_on(&shared.blocks, 1, &[&source]);
        assert!(!is_good_candidate(&shared, &source, &target, &block));
    }

    #[test]
    fn moved_blocks_are_not_candidates() {
        let shared = shared();
        let source = group("src", "/r1", StorageType::Disk);
        let target = group("dst", "/r1", StorageType::Disk);
        let block = block_on(&shared.blocks, 2, &[&source]);
        assert!(shared.blocks.try_mark_moved(block.key()));
        assert!(!is_good_candidate(&shared, &source, &target, &block));
    }

    #[test]
    fn target_must_not_already_hold_a_replica() {
        let shared = shared();
        let source = group("src", "/r1", StorageType::Disk);
        let target = group("dst", "/r1", StorageType::Disk);
        let block = block_on(&shared.blocks, 3, &[&source, &target]);
        assert!(!is_good_candidate(&shared, &source, &target, &block));
    }

    #[test]
    fn move_that_would_drop_a_rack_is_rejected() {
        // Replicas on r1, r2, r3; target on r2. Moving the r1 replica
        // there would shrink the rack set to {r2, r3}.
        let shared = shared();
        let source = group("a", "/r1", StorageType::Disk);
        let peer_r2 = group("b", "/r2", StorageType::Disk);
        let peer_r3 = group("c", "/r3", StorageType::Disk);
        let target = group("t", "/r2", StorageType::Disk);
        let block = block_on(&shared.blocks, 4, &[&source, &peer_r2, &peer_r3]);

        assert!(!is_good_candidate(&shared, &source, &target, &block));
        assert!(!shared.blocks.was_moved(&block.key()));

        // With a second replica on the source's rack the move is safe.
        let mate_r1 = group("d", "/r1", StorageType::Disk);
        block.set_locations(vec![
            source.clone(),
            peer_r2.clone(),
            peer_r3.clone(),
            mate_r1,
        ]);
        assert!(is_good_candidate(&shared, &source, &target, &block));
    }

    #[test]
    fn same_rack_move_is_always_rack_safe() {
        let shared = shared();
        let source = group("a", "/r1", StorageType::Disk);
        let target = group("t", "/r1", StorageType::Disk);
        let block = block_on(&shared.blocks, 5, &[&source]);
        assert!(is_good_candidate(&shared, &source, &target, &block));
    }

    #[test]
    fn move_to_a_fresh_rack_is_rack_safe() {
        let shared = shared();
        let source = group("a", "/r1", StorageType::Disk);
        let peer = group("b", "/r2", StorageType::Disk);
        let target = group("t", "/r3", StorageType::Disk);
        let block = block_on(&shared.blocks, 6, &[&source, &peer]);
        assert!(is_good_candidate(&shared, &source, &target, &block));
    }

    #[test]
    fn proxy_prefers_the_target_rack() {
        let shared = shared();
        let source = group("a", "/r1", StorageType::Disk);
        let near = group("b", "/r3", StorageType::Disk);
        let target = group("t", "/r3", StorageType::Disk);
        let block = block_on(&shared.blocks, 7, &[&source, &near]);

        let proxy = choose_proxy(&shared, &target, &block).expect("a proxy is available");
        assert_eq!(proxy.node().uuid(), "b");
        assert_eq!(proxy.node().pending(), 1);
        assert_eq!(source.node().pending(), 0);
    }

    #[test]
    fn proxy_falls_back_when_preferred_nodes_are_busy() {
        let shared = shared();
        let source = group("a", "/r1", StorageType::Disk);
        let near = group("b", "/r3", StorageType::Disk);
        let target = group("t", "/r3", StorageType::Disk);
        let block = block_on(&shared.blocks, 8, &[&source, &near]);

        near.node().delay(Duration::from_secs(30));
        let proxy = choose_proxy(&shared, &target, &block).expect("the source still qualifies");
        assert_eq!(proxy.node().uuid(), "a");
    }

    #[test]
    fn no_proxy_without_a_slot() {
        let shared = shared();
        let source = group("a", "/r1", StorageType::Disk);
        let target = group("t", "/r2", StorageType::Disk);
        let block = block_on(&shared.blocks, 9, &[&source]);
        source.node().delay(Duration::from_secs(30));
        assert!(choose_proxy(&shared, &target, &block).is_none());
    }
}
