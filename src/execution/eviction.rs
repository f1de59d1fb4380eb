//! Tile eviction policies.
//!
//! A policy only ranks tiles; the cache decides what may actually be dropped.
//! Tiles with a fetch in flight and tiles whose buffer is still shared with a
//! reader are skipped no matter how the policy ranks them.

use lru::LruCache;

/// Ranks cached tiles for eviction.
pub trait EvictionPolicy: Send {
    /// A tile was filled or served.
    fn touch(&mut self, block: &[usize], nbytes: usize);

    /// A tile was dropped.
    fn forget(&mut self, block: &[usize]);

    /// Tracked tiles, most evictable first.
    fn victims(&self) -> Vec<Vec<usize>>;

    /// Forget every tile.
    fn clear(&mut self);
}

/// Least-recently-used first.
pub struct LruEviction {
    order: LruCache<Vec<usize>, usize>,
}

impl LruEviction {
    pub fn new() -> Self {
        Self {
            order: LruCache::unbounded(),
        }
    }

    /// Number of tracked tiles.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for LruEviction {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LruEviction {
    fn touch(&mut self, block: &[usize], nbytes: usize) {
        self.order.put(block.to_vec(), nbytes);
    }

    fn forget(&mut self, block: &[usize]) {
        self.order.pop(&block.to_vec());
    }

    fn victims(&self) -> Vec<Vec<usize>> {
        // iter() runs most recent first
        self.order.iter().rev().map(|(block, _)| block.clone()).collect()
    }

    fn clear(&mut self) {
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_orders_oldest_first() {
        let mut policy = LruEviction::new();
        policy.touch(&[0, 0], 10);
        policy.touch(&[0, 1], 10);
        policy.touch(&[1, 0], 10);
        policy.touch(&[0, 0], 10);
        assert_eq!(policy.victims(), vec![vec![0, 1], vec![1, 0], vec![0, 0]]);

        policy.forget(&[1, 0]);
        assert_eq!(policy.victims(), vec![vec![0, 1], vec![0, 0]]);
        assert_eq!(policy.len(), 2);

        policy.clear();
        assert!(policy.is_empty());
    }
}
