//! Cache access accounting
//!
//! The tracker owns the hit/miss/population counters the cache exposes and
//! the LRU list of row entries. Counters are relaxed atomics; the LRU is a
//! mutex-guarded [`lru::LruCache`] keyed by entry id, most recently used
//! first.

use crate::partition::EntryId;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters and LRU list shared by all readers of a cache
pub struct CacheTracker {
    row_hits: AtomicU64,
    row_misses: AtomicU64,
    mispopulations: AtomicU64,
    static_row_insertions: AtomicU64,
    row_tombstone_reads: AtomicU64,
    range_tombstone_reads: AtomicU64,
    dummy_row_hits: AtomicU64,
    lru: Mutex<LruCache<EntryId, ()>>,
}

impl CacheTracker {
    /// Create a tracker with empty counters
    pub fn new() -> Self {
        Self {
            row_hits: AtomicU64::new(0),
            row_misses: AtomicU64::new(0),
            mispopulations: AtomicU64::new(0),
            static_row_insertions: AtomicU64::new(0),
            row_tombstone_reads: AtomicU64::new(0),
            range_tombstone_reads: AtomicU64::new(0),
            dummy_row_hits: AtomicU64::new(0),
            lru: Mutex::new(LruCache::unbounded()),
        }
    }

    #[inline]
    pub fn on_row_hit(&self) {
        self.row_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_row_miss(&self) {
        self.row_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_mispopulate(&self) {
        self.mispopulations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_static_row_insert(&self) {
        self.static_row_insertions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_row_tombstone_read(&self) {
        self.row_tombstone_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_range_tombstone_read(&self) {
        self.range_tombstone_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_dummy_row_hit(&self) {
        self.dummy_row_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Link a freshly inserted entry into the LRU, most recent first
    pub fn insert(&self, id: EntryId) {
        self.lru.lock().put(id, ());
    }

    /// Record a use of an entry, linking it if needed
    pub fn touch(&self, id: EntryId) {
        self.lru.lock().put(id, ());
    }

    /// Detach an evicted entry from the LRU
    pub fn remove(&self, id: EntryId) {
        self.lru.lock().pop(&id);
    }

    /// True while the entry is linked
    pub fn lru_contains(&self, id: EntryId) -> bool {
        self.lru.lock().contains(&id)
    }

    /// Number of linked entries
    pub fn lru_len(&self) -> usize {
        self.lru.lock().len()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            row_hits: self.row_hits.load(Ordering::Relaxed),
            row_misses: self.row_misses.load(Ordering::Relaxed),
            mispopulations: self.mispopulations.load(Ordering::Relaxed),
            static_row_insertions: self.static_row_insertions.load(Ordering::Relaxed),
            row_tombstone_reads: self.row_tombstone_reads.load(Ordering::Relaxed),
            range_tombstone_reads: self.range_tombstone_reads.load(Ordering::Relaxed),
            dummy_row_hits: self.dummy_row_hits.load(Ordering::Relaxed),
        }
    }
}

impl Default for CacheTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time counter values
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub row_hits: u64,
    pub row_misses: u64,
    pub mispopulations: u64,
    pub static_row_insertions: u64,
    pub row_tombstone_reads: u64,
    pub range_tombstone_reads: u64,
    pub dummy_row_hits: u64,
}
