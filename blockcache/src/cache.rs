//! An in-memory, capacity-bounded [Cacher] with least-recently-used eviction.
//!
//! Entries are keyed by a structured `(namespace, key, block)` tuple rather than a formatted
//! string, so purging one object can never match blocks of another object whose key happens to
//! share a prefix. The namespace is a random id drawn when the cache is created. Caches obtained
//! through [BlockCache::partition] share the same store (and capacity budget) but get their own
//! namespace, so readers over unrelated backends can share memory without colliding.

use crate::{Cacher, Error};
use bytes::Bytes;
use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// The key of a cached block.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BlockKey {
    namespace: u64,
    key: String,
    block: u64,
}

/// A thread-safe LRU cache of blocks. Cloning is cheap and yields a handle to the same namespace.
#[derive(Clone)]
pub struct BlockCache {
    /// The namespace of every entry inserted through this handle.
    namespace: u64,

    /// The store, shared with every partition of this cache.
    entries: Arc<Mutex<LruCache<BlockKey, Bytes>>>,
}

impl BlockCache {
    /// Return a new cache holding at most `capacity` blocks.
    ///
    /// Returns [Error::InvalidCapacity] if `capacity` is 0.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        let capacity = NonZeroUsize::new(capacity).ok_or(Error::InvalidCapacity)?;
        Ok(Self {
            namespace: rand::random(),
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
        })
    }

    /// Return a cache with a fresh namespace that shares this cache's store and capacity.
    pub fn partition(&self) -> Self {
        let mut namespace = rand::random();
        while namespace == self.namespace {
            namespace = rand::random();
        }
        Self {
            namespace,
            entries: self.entries.clone(),
        }
    }

    /// The maximum number of blocks held by the underlying store.
    pub fn capacity(&self) -> usize {
        self.entries.lock().unwrap().cap().get()
    }

    /// The number of blocks currently held by the underlying store, across all partitions.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Returns true if the underlying store holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn block_key(&self, key: &str, block: u64) -> BlockKey {
        BlockKey {
            namespace: self.namespace,
            key: key.to_string(),
            block,
        }
    }

    /// Remove every entry of this namespace accepted by `filter`, returning how many were removed.
    fn remove_where(&self, filter: impl Fn(&BlockKey) -> bool) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let doomed: Vec<BlockKey> = entries
            .iter()
            .map(|(k, _)| k)
            .filter(|k| k.namespace == self.namespace && filter(k))
            .cloned()
            .collect();
        for k in &doomed {
            entries.pop(k);
        }
        doomed.len()
    }
}

impl Cacher for BlockCache {
    fn add(&self, key: &str, block: u64, data: Bytes) {
        let key = self.block_key(key, block);
        self.entries.lock().unwrap().put(key, data);
    }

    fn get(&self, key: &str, block: u64) -> Option<Bytes> {
        let key = self.block_key(key, block);
        self.entries.lock().unwrap().get(&key).cloned()
    }

    fn purge_key(&self, key: &str) {
        let removed = self.remove_where(|k| k.key == key);
        debug!(key, removed, "purged object blocks");
    }

    fn purge(&self) {
        let removed = self.remove_where(|_| true);
        debug!(removed, "purged cache");
    }
}
