use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::moved::MovedWindow;
use super::node::StorageGroup;

/// Map key for a block: pool-qualified numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub pool: String,
    pub id: u64,
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:blk_{}", self.pool, self.id)
    }
}

/// Immutable identity of a replicated block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub pool: String,
    pub id: u64,
    pub generation: u64,
    pub length: u64,
}

impl BlockDescriptor {
    pub fn key(&self) -> BlockKey {
        BlockKey {
            pool: self.pool.clone(),
            id: self.id,
        }
    }
}

/// Shared descriptor of a block. The identity is stable for as long as the
/// block stays interesting; the locations drift from listing to listing.
pub struct BlockRef {
    descriptor: BlockDescriptor,
    locations: Mutex<Vec<Arc<StorageGroup>>>,
}

impl BlockRef {
    fn new(descriptor: BlockDescriptor) -> Self {
        Self {
            descriptor,
            locations: Mutex::new(Vec::new()),
        }
    }

    pub fn descriptor(&self) -> &BlockDescriptor {
        &self.descriptor
    }

    pub fn key(&self) -> BlockKey {
        self.descriptor.key()
    }

    pub fn length(&self) -> u64 {
        self.descriptor.length
    }

    /// Replace the location set with a fresh listing in one step.
    pub fn set_locations(&self, locations: Vec<Arc<StorageGroup>>) {
        *self.locations.lock() = locations;
    }

    pub fn locations(&self) -> Vec<Arc<StorageGroup>> {
        self.locations.lock().clone()
    }
}

struct Inner {
    blocks: HashMap<BlockKey, Arc<BlockRef>>,
    moved: MovedWindow,
}

/// Single owner of every `BlockRef` plus the moved-blocks window. One lock
/// covers both so selection can test and mark in a single critical section.
pub struct BlockIndex {
    inner: Mutex<Inner>,
}

impl BlockIndex {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                blocks: HashMap::new(),
                moved: MovedWindow::new(window),
            }),
        }
    }

    /// Return the canonical `BlockRef` for the descriptor, keeping block
    /// identity stable across iterations.
    pub fn intern(&self, descriptor: BlockDescriptor) -> Arc<BlockRef> {
        let mut inner = self.inner.lock();
        match inner.blocks.entry(descriptor.key()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(Arc::new(BlockRef::new(descriptor))).clone(),
        }
    }

    pub fn was_moved(&self, key: &BlockKey) -> bool {
        self.inner.lock().moved.contains(key)
    }

    /// Record the block as moved unless another selector beat us to it.
    /// The test-and-set is what keeps a block in at most one pending move.
    pub fn try_mark_moved(&self, key: BlockKey) -> bool {
        let mut inner = self.inner.lock();
        if inner.moved.contains(&key) {
            return false;
        }
        inner.moved.put(key, Instant::now());
        true
    }

    /// Age the window, then drop every block whose id fell out of it.
    pub fn prune(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let Inner { blocks, moved } = &mut *inner;
        moved.prune(now);
        blocks.retain(|key, _| moved.contains(key));
    }

    pub fn tracked_blocks(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn contains_block(&self, key: &BlockKey) -> bool {
        self.inner.lock().blocks.contains_key(key)
    }
}
