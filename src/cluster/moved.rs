use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::block::BlockKey;

/// Rolling record of blocks that were moved (or scheduled for a move) in
/// recent iterations. Membership gates the selector so every block is
/// attempted at most once per window.
#[derive(Debug)]
pub struct MovedWindow {
    width: Duration,
    entries: HashMap<BlockKey, Instant>,
}

impl MovedWindow {
    pub fn new(width: Duration) -> Self {
        Self {
            width,
            entries: HashMap::new(),
        }
    }

    pub fn put(&mut self, key: BlockKey, now: Instant) {
        self.entries.insert(key, now);
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop entries older than the window width.
    pub fn prune(&mut self, now: Instant) {
        let width = self.width;
        self.entries
            .retain(|_, moved_at| now.duration_since(*moved_at) <= width);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u64) -> BlockKey {
        BlockKey {
            pool: "bp-1".to_string(),
            id,
        }
    }

    #[test]
    fn prune_drops_only_aged_entries() {
        let mut window = MovedWindow::new(Duration::from_secs(60));
        let start = Instant::now();
        window.put(key(1), start);
        window.put(key(2), start + Duration::from_secs(50));
        window.prune(start + Duration::from_secs(70));
        assert!(!window.contains(&key(1)));
        assert!(window.contains(&key(2)));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn reinsert_refreshes_timestamp() {
        let mut window = MovedWindow::new(Duration::from_secs(10));
        let start = Instant::now();
        window.put(key(7), start);
        window.put(key(7), start + Duration::from_secs(9));
        window.prune(start + Duration::from_secs(15));
        assert!(window.contains(&key(7)));
    }
}
