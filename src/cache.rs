//! Bounded LRU cache of decoded blocks, shared by all readers of a
//! container.
//!
//! Recency is a monotonically increasing tick per access; `order` maps
//! tick → block id so the least recently used block is the first key.
//! Decoded payloads are `Arc<[u8]>`, so a hit is a reference-count bump.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;

use crate::block::Block;
use crate::config::CachePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits:    u64,
    pub misses:  u64,
    pub entries: usize,
    pub bytes:   usize,
}

#[derive(Default)]
struct Lru {
    map:   HashMap<u64, (Block, u64)>,
    order: BTreeMap<u64, u64>,
    tick:  u64,
    bytes: usize,
}

impl Lru {
    fn touch(&mut self, id: u64) -> Option<Block> {
        self.tick += 1;
        let tick = self.tick;
        let (block, last) = self.map.get_mut(&id)?;
        self.order.remove(last);
        *last = tick;
        self.order.insert(tick, id);
        Some(block.clone())
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, id)) = self.order.pop_first() else {
            return false;
        };
        if let Some((block, _)) = self.map.remove(&id) {
            self.bytes -= block.len();
            trace!(id, "evicted block");
        }
        true
    }
}

pub struct BlockCache {
    policy: CachePolicy,
    inner:  Mutex<Lru>,
    hits:   AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            inner:  Mutex::new(Lru::default()),
            hits:   AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn get(&self, id: u64) -> Option<Block> {
        if self.policy == CachePolicy::Disabled {
            return None;
        }
        let found = self.inner.lock().ok().and_then(|mut lru| lru.touch(id));
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn insert(&self, block: Block) {
        let (max_entries, max_bytes) = match self.policy {
            CachePolicy::Disabled      => return,
            CachePolicy::MaxEntries(n) => (n, usize::MAX),
            CachePolicy::MaxBytes(n)   => (usize::MAX, n),
        };
        if max_entries == 0 || block.len() > max_bytes {
            return;
        }
        let Ok(mut lru) = self.inner.lock() else {
            return;
        };
        if lru.touch(block.id).is_some() {
            return;
        }
        while lru.map.len() + 1 > max_entries || lru.bytes + block.len() > max_bytes {
            if !lru.evict_oldest() {
                break;
            }
        }
        lru.tick += 1;
        let tick = lru.tick;
        lru.bytes += block.len();
        lru.order.insert(tick, block.id);
        lru.map.insert(block.id, (block, tick));
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = self
            .inner
            .lock()
            .map(|lru| (lru.map.len(), lru.bytes))
            .unwrap_or_default();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: u64, len: usize) -> Block {
        Block { id, data: vec![id as u8; len].into() }
    }

    #[test]
    fn disabled_never_stores() {
        let cache = BlockCache::new(CachePolicy::Disabled);
        cache.insert(block(4, 10));
        assert!(cache.get(4).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn max_entries_evicts_least_recent() {
        let cache = BlockCache::new(CachePolicy::MaxEntries(2));
        cache.insert(block(4, 10));
        cache.insert(block(8, 10));
        assert!(cache.get(4).is_some());
        cache.insert(block(12, 10));
        assert!(cache.get(8).is_none());
        assert!(cache.get(4).is_some());
        assert!(cache.get(12).is_some());
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn max_bytes_bound() {
        let cache = BlockCache::new(CachePolicy::MaxBytes(100));
        cache.insert(block(4, 60));
        cache.insert(block(8, 30));
        cache.insert(block(12, 30));
        assert!(cache.get(4).is_none());
        assert_eq!(cache.stats().bytes, 60);
        cache.insert(block(16, 500));
        assert!(cache.get(16).is_none());
    }
}
