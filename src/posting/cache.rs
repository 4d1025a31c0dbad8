use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use xxhash_rust::xxh64::xxh64;

use super::list::PostingList;
use crate::storage::{EngineMetrics, KvStore};
use crate::types::Result;

/// Shared handle to a cached posting list.
pub type ListHandle = Arc<RwLock<PostingList>>;

type Shard = Mutex<LruCache<Vec<u8>, ListHandle>>;

/// Process-wide sharded LRU of posting lists.
///
/// Holds at most one live instance per key: an entry that a transaction
/// still references, or that carries uncommitted layers, is never evicted.
pub struct PostingCache {
    shards: Vec<Shard>,
    per_shard_cap: usize,
    metrics: Arc<dyn EngineMetrics>,
}

impl PostingCache {
    /// Creates a cache holding roughly `capacity` lists across `shards` shards.
    pub fn new(shards: usize, capacity: usize, metrics: Arc<dyn EngineMetrics>) -> Self {
        let shard_count = shards.max(1);
        let per_shard_cap = (capacity / shard_count).max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::unbounded()))
            .collect();
        Self {
            shards,
            per_shard_cap,
            metrics,
        }
    }

    /// Returns the cached list for `key`, loading it from `kv` on a miss.
    pub fn get_or_load(&self, key: &[u8], kv: &dyn KvStore) -> Result<ListHandle> {
        let mut shard = self.shard_for(key).lock();
        if let Some(handle) = shard.get(key) {
            self.metrics.cache_lookup(true);
            return Ok(Arc::clone(handle));
        }
        self.metrics.cache_lookup(false);
        // Loading under the shard lock keeps a single instance per key.
        let handle = Arc::new(RwLock::new(PostingList::load(key.to_vec(), kv)?));
        shard.put(key.to_vec(), Arc::clone(&handle));
        self.evict_over_capacity(&mut shard);
        Ok(handle)
    }

    /// Returns the cached list for `key` without loading.
    pub fn peek(&self, key: &[u8]) -> Option<ListHandle> {
        self.shard_for(key).lock().peek(key).cloned()
    }

    /// Drops every cached list whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &[u8]) -> usize {
        let mut dropped = 0;
        for shard in &self.shards {
            let mut guard = shard.lock();
            let doomed: Vec<Vec<u8>> = guard
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                guard.pop(&key);
                dropped += 1;
            }
        }
        dropped
    }

    /// Cached lists with keys starting with `prefix`.
    pub fn lists_with_prefix(&self, prefix: &[u8]) -> Vec<ListHandle> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(_, handle)| Arc::clone(handle))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of cached lists.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Returns `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_over_capacity(&self, shard: &mut LruCache<Vec<u8>, ListHandle>) {
        let mut budget = shard.len();
        while shard.len() > self.per_shard_cap && budget > 0 {
            budget -= 1;
            let Some((key, handle)) = shard.pop_lru() else {
                break;
            };
            let pinned = Arc::strong_count(&handle) > 1
                || handle.try_read().map_or(true, |list| list.has_pending());
            if pinned {
                shard.put(key, handle);
            }
        }
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        let idx = (xxh64(key, 0) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }
}
