//! Versioned partition storage model
//!
//! The cache stores each partition as an ordered list of *versions*, latest
//! first. A version maps table-domain positions to [`RowEntry`] values. Older
//! versions are immutable except for continuity and range-tombstone bits;
//! insertions only go into the latest version. Every version carries a tail
//! dummy at `after_all_clustered_rows` so a storage successor always exists.
//!
//! [`Region`] stands in for the log-structured allocator: it hands out entry
//! ids, gates allocations (with injectable failure for tests), and tracks the
//! *reference generation* that cursor and weak-reference handles are
//! validated against. `invalidate_references` bumps the generation; handles
//! captured under an older generation must re-locate themselves by position.

use crate::error::{Error, Result};
use crate::fragment::Row;
use crate::position::Position;
use crate::tombstone::Tombstone;
use crate::tracker::CacheTracker;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier of a cache row entry, stable across re-lookup
pub type EntryId = u64;

/// Monotonic per-partition label; a changed phase means the cache was
/// invalidated for the key while a read was in flight
pub type Phase = u64;

/// Identifier of a partition version
pub type VersionId = u64;

/// Decorated partition key, opaque bytes
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey(Bytes);

impl PartitionKey {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A partition-key range, used only by the partition fast-forward surface
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionRange {
    pub start: Option<PartitionKey>,
    pub end: Option<PartitionKey>,
}

/// Table schema descriptor
#[derive(Clone, Debug)]
pub struct Schema {
    /// Table name, for logging
    pub table: String,
    /// Whether the table defines static columns
    pub has_static_columns: bool,
}

impl Schema {
    /// Schema without static columns
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            has_static_columns: false,
        }
    }

    /// Enable static columns
    pub fn with_static_columns(mut self) -> Self {
        self.has_static_columns = true;
        self
    }
}

/// Allocator stand-in: entry ids, allocation gating, reference generations
pub struct Region {
    reference_generation: AtomicU64,
    next_entry_id: AtomicU64,
    scheduled_alloc_failures: AtomicU64,
    alloc_failed: AtomicBool,
    section_active: AtomicBool,
}

impl Region {
    /// Fresh region
    pub fn new() -> Self {
        Self {
            reference_generation: AtomicU64::new(0),
            next_entry_id: AtomicU64::new(1),
            scheduled_alloc_failures: AtomicU64::new(0),
            alloc_failed: AtomicBool::new(false),
            section_active: AtomicBool::new(false),
        }
    }

    /// Current reference generation
    #[inline]
    pub fn reference_generation(&self) -> u64 {
        self.reference_generation.load(Ordering::Acquire)
    }

    /// Invalidate all outstanding position handles
    pub fn invalidate_references(&self) {
        self.reference_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Schedule the next allocation to fail; failure injection for tests
    pub fn fail_next_allocation(&self) {
        self.scheduled_alloc_failures.fetch_add(1, Ordering::AcqRel);
    }

    /// Gate an allocation; failing sets the flag the update-section exit
    /// inspects
    pub fn try_alloc(&self) -> Result<()> {
        let failed = self
            .scheduled_alloc_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            self.alloc_failed.store(true, Ordering::Release);
            return Err(Error::memory("allocation failed during cache population"));
        }
        Ok(())
    }

    pub(crate) fn next_entry_id(&self) -> EntryId {
        self.next_entry_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn take_alloc_failure(&self) -> bool {
        self.alloc_failed.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn enter_section(&self) {
        let was_active = self.section_active.swap(true, Ordering::AcqRel);
        debug_assert!(!was_active, "allocator sections must not nest");
    }

    pub(crate) fn exit_section(&self) {
        self.section_active.store(false, Ordering::Release);
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}

/// One cache entry in a version
///
/// `continuous` and `range_tombstone` describe the half-open interval from
/// the entry's predecessor in the same version up to and including the entry,
/// in storage order. A dummy entry has no payload; it exists only to carry
/// these bits at a position where no row lives.
#[derive(Clone, Debug)]
pub struct RowEntry {
    pub id: EntryId,
    pub dummy: bool,
    pub continuous: bool,
    pub range_tombstone: Option<Tombstone>,
    pub row: Row,
}

impl RowEntry {
    /// Entry holding a row payload, discontinuous until marked
    pub fn new_row(row: Row) -> Self {
        Self {
            id: 0,
            dummy: false,
            continuous: false,
            range_tombstone: None,
            row,
        }
    }

    /// Payload-less marker entry
    pub fn new_dummy() -> Self {
        Self {
            id: 0,
            dummy: true,
            continuous: false,
            range_tombstone: None,
            row: Row::new(),
        }
    }

    /// Set the interval tombstone
    pub fn with_range_tombstone(mut self, tombstone: Option<Tombstone>) -> Self {
        self.range_tombstone = tombstone;
        self
    }

    /// Set the continuity bit
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }
}

/// One version of a partition: entries in table order
pub(crate) struct Version {
    pub(crate) id: VersionId,
    pub(crate) entries: BTreeMap<Position, RowEntry>,
}

impl Version {
    fn new(id: VersionId, region: &Region) -> (Self, EntryId) {
        let tail_id = region.next_entry_id();
        let mut entries = BTreeMap::new();
        let mut tail = RowEntry::new_dummy();
        tail.id = tail_id;
        entries.insert(Position::after_all(), tail);
        (Self { id, entries }, tail_id)
    }

    pub(crate) fn get(&self, pos: &Position) -> Option<&RowEntry> {
        self.entries.get(pos)
    }

    /// Least entry with table position `>= pos`
    pub(crate) fn first_at_or_after(&self, pos: &Position) -> Option<(&Position, &RowEntry)> {
        self.entries
            .range((Bound::Included(pos), Bound::Unbounded))
            .next()
    }

    /// Least entry with table position `> pos`
    pub(crate) fn first_after(&self, pos: &Position) -> Option<(&Position, &RowEntry)> {
        self.entries
            .range((Bound::Excluded(pos), Bound::Unbounded))
            .next()
    }

    /// Greatest entry with table position `<= pos`
    pub(crate) fn last_at_or_before(&self, pos: &Position) -> Option<(&Position, &RowEntry)> {
        self.entries
            .range((Bound::Unbounded, Bound::Included(pos)))
            .next_back()
    }

    /// Greatest entry with table position `< pos`
    pub(crate) fn last_before(&self, pos: &Position) -> Option<(&Position, &RowEntry)> {
        self.entries
            .range((Bound::Unbounded, Bound::Excluded(pos)))
            .next_back()
    }
}

pub(crate) struct PartitionData {
    /// Versions, latest first
    pub(crate) versions: Vec<Version>,
    pub(crate) static_row: Option<Row>,
    pub(crate) static_row_continuous: bool,
    pub(crate) partition_tombstone: Option<Tombstone>,
}

struct PartitionInner {
    key: PartitionKey,
    data: RwLock<PartitionData>,
    phase: AtomicU64,
}

/// The row cache: tracker, region, and the partitions themselves
pub struct RowCache {
    schema: Arc<Schema>,
    region: Arc<Region>,
    tracker: Arc<CacheTracker>,
    partitions: Mutex<HashMap<PartitionKey, Arc<PartitionInner>>>,
    next_version_id: Arc<AtomicU64>,
}

impl RowCache {
    /// Create an empty cache for `schema`
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            region: Arc::new(Region::new()),
            tracker: Arc::new(CacheTracker::new()),
            partitions: Mutex::new(HashMap::new()),
            next_version_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Cache-wide tracker
    pub fn tracker(&self) -> &Arc<CacheTracker> {
        &self.tracker
    }

    /// Cache-wide region
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Table schema
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Current phase of `key`; a fresh partition starts at phase 0
    pub fn phase_of(&self, key: &PartitionKey) -> Phase {
        self.partitions
            .lock()
            .get(key)
            .map(|p| p.phase.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Advance the phase of `key`, failing reads that raced the change
    pub fn bump_phase(&self, key: &PartitionKey) {
        if let Some(p) = self.partitions.lock().get(key) {
            p.phase.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn partition(&self, key: &PartitionKey) -> Arc<PartitionInner> {
        let mut partitions = self.partitions.lock();
        if let Some(p) = partitions.get(key) {
            return p.clone();
        }
        let (version, tail_id) = Version::new(self.next_version_id(), &self.region);
        self.tracker.insert(tail_id);
        let inner = Arc::new(PartitionInner {
            key: key.clone(),
            data: RwLock::new(PartitionData {
                versions: vec![version],
                static_row: None,
                static_row_continuous: false,
                partition_tombstone: None,
            }),
            phase: AtomicU64::new(0),
        });
        partitions.insert(key.clone(), inner.clone());
        inner
    }

    fn next_version_id(&self) -> VersionId {
        self.next_version_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a snapshot of `key`, creating an empty partition if absent
    pub fn snapshot(&self, key: &PartitionKey) -> PartitionSnapshot {
        let partition = self.partition(key);
        let base_version = partition.data.read().versions[0].id;
        PartitionSnapshot {
            schema: self.schema.clone(),
            region: self.region.clone(),
            tracker: self.tracker.clone(),
            partition,
            base_version,
            next_version_id: self.next_version_id.clone(),
        }
    }

    /// Evict the entry at `pos` (table domain) from every version of `key`
    ///
    /// The storage successor in each touched version loses its continuity
    /// information. All outstanding references are invalidated. The tail
    /// dummy cannot be evicted. Returns true when anything was removed.
    pub fn evict_row(&self, key: &PartitionKey, pos: &Position) -> bool {
        if pos.is_after_all() {
            return false;
        }
        let Some(partition) = self.partitions.lock().get(key).cloned() else {
            return false;
        };
        let mut removed = Vec::new();
        {
            let mut data = partition.data.write();
            for version in data.versions.iter_mut() {
                if let Some(entry) = version.entries.remove(pos) {
                    removed.push(entry.id);
                    if let Some((_, succ)) = version
                        .entries
                        .range_mut((Bound::Excluded(pos), Bound::Unbounded))
                        .next()
                    {
                        succ.continuous = false;
                        succ.range_tombstone = None;
                    }
                }
            }
        }
        if removed.is_empty() {
            return false;
        }
        for id in removed {
            self.tracker.remove(id);
        }
        self.region.invalidate_references();
        true
    }
}

/// Reference-counted handle over a shared partition
///
/// Cloneable; all clones observe the same shared state. `at_latest_version`
/// compares the partition's current latest version with the one captured
/// when the snapshot was opened.
#[derive(Clone)]
pub struct PartitionSnapshot {
    schema: Arc<Schema>,
    region: Arc<Region>,
    tracker: Arc<CacheTracker>,
    partition: Arc<PartitionInner>,
    base_version: VersionId,
    next_version_id: Arc<AtomicU64>,
}

impl PartitionSnapshot {
    /// Table schema
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Partition key
    pub fn key(&self) -> &PartitionKey {
        &self.partition.key
    }

    /// Region backing the partition
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Cache tracker
    pub fn tracker(&self) -> &Arc<CacheTracker> {
        &self.tracker
    }

    pub(crate) fn read_data(&self) -> RwLockReadGuard<'_, PartitionData> {
        self.partition.data.read()
    }

    /// The static row, if populated
    pub fn static_row(&self, _digest_requested: bool) -> Option<Row> {
        self.partition.data.read().static_row.clone()
    }

    /// Whether the static row is fully represented in cache
    pub fn static_row_continuous(&self) -> bool {
        self.partition.data.read().static_row_continuous
    }

    /// Merge `row` into the cached static row
    pub fn set_static_row(&self, row: Row) {
        let mut data = self.partition.data.write();
        match &mut data.static_row {
            Some(existing) => {
                let mut merged = row;
                merged.merge_older(existing);
                *existing = merged;
            }
            slot @ None => *slot = Some(row),
        }
    }

    /// Mark the static row fully represented
    pub fn set_static_row_continuous(&self, continuous: bool) {
        self.partition.data.write().static_row_continuous = continuous;
    }

    /// Partition-level tombstone
    pub fn partition_tombstone(&self) -> Option<Tombstone> {
        self.partition.data.read().partition_tombstone
    }

    /// Set the partition-level tombstone
    pub fn set_partition_tombstone(&self, tombstone: Option<Tombstone>) {
        self.partition.data.write().partition_tombstone = tombstone;
    }

    /// Record a use of the partition
    pub fn touch(&self) {
        let tail_id = self
            .partition
            .data
            .read()
            .versions
            .first()
            .and_then(|v| v.get(&Position::after_all()))
            .map(|e| e.id);
        if let Some(id) = tail_id {
            self.tracker.touch(id);
        }
    }

    /// True while no newer version was created after this snapshot opened
    pub fn at_latest_version(&self) -> bool {
        self.partition.data.read().versions[0].id == self.base_version
    }

    /// True while a single version holds the whole partition
    pub fn at_oldest_version(&self) -> bool {
        self.partition.data.read().versions.len() == 1
    }

    /// Id of the current latest version
    pub fn latest_version_id(&self) -> VersionId {
        self.partition.data.read().versions[0].id
    }

    /// Start a new latest version, as a write racing this read would
    pub fn push_version(&self) {
        let id = self.next_version_id.fetch_add(1, Ordering::Relaxed);
        let (version, tail_id) = Version::new(id, &self.region);
        self.tracker.insert(tail_id);
        self.partition.data.write().versions.insert(0, version);
    }

    /// Insert `entry` into the latest version at `pos` (table domain)
    ///
    /// Allocation-gated. Returns the entry id and whether a new entry was
    /// created; an existing entry at `pos` is returned untouched.
    pub fn insert_in_latest(&self, pos: Position, entry: RowEntry) -> Result<(EntryId, bool)> {
        self.region.try_alloc()?;
        let mut data = self.partition.data.write();
        let latest = &mut data.versions[0];
        if let Some(existing) = latest.get(&pos) {
            return Ok((existing.id, false));
        }
        let id = self.region.next_entry_id();
        let mut entry = entry;
        entry.id = id;
        latest.entries.insert(pos, entry);
        Ok((id, true))
    }

    /// Run `f` on the latest-version entry at `pos`
    pub fn with_entry_in_latest<R>(
        &self,
        pos: &Position,
        f: impl FnOnce(&mut RowEntry) -> R,
    ) -> Option<R> {
        let mut data = self.partition.data.write();
        data.versions[0].entries.get_mut(pos).map(f)
    }

    /// Run `f` on the entry at `pos` in version `version`
    pub fn with_entry<R>(
        &self,
        version: VersionId,
        pos: &Position,
        f: impl FnOnce(&mut RowEntry) -> R,
    ) -> Option<R> {
        let mut data = self.partition.data.write();
        data.versions
            .iter_mut()
            .find(|v| v.id == version)
            .and_then(|v| v.entries.get_mut(pos).map(f))
    }

    /// Locate the newest version holding an entry at `pos`
    pub fn find_entry(&self, pos: &Position) -> Option<(VersionId, EntryId)> {
        let data = self.partition.data.read();
        data.versions
            .iter()
            .find_map(|v| v.get(pos).map(|e| (v.id, e.id)))
    }

    /// Remove the latest-version entry at `pos`; the tail dummy is kept
    pub fn remove_from_latest(&self, pos: &Position) -> Option<EntryId> {
        if pos.is_after_all() {
            return None;
        }
        let mut data = self.partition.data.write();
        data.versions[0].entries.remove(pos).map(|e| e.id)
    }

    /// Clone of the storage successor of `pos` in the latest version
    pub fn latest_successor(&self, pos: &Position) -> Option<RowEntry> {
        let data = self.partition.data.read();
        data.versions[0].first_after(pos).map(|(_, e)| e.clone())
    }

    /// Newest entry at `pos` across versions, for assertions
    pub fn entry_snapshot(&self, pos: &Position) -> Option<RowEntry> {
        let data = self.partition.data.read();
        data.versions.iter().find_map(|v| v.get(pos).cloned())
    }

    /// Latest-version entries in table order, for assertions
    pub fn latest_entries(&self) -> Vec<(Position, RowEntry)> {
        let data = self.partition.data.read();
        data.versions[0]
            .entries
            .iter()
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::ClusteringKey;

    fn k(v: i64) -> Position {
        Position::at_key(ClusteringKey::from_int(v))
    }

    #[test]
    fn test_scheduled_allocation_failure_fires_once() {
        let region = Region::new();
        region.fail_next_allocation();
        assert!(region.try_alloc().is_err());
        assert!(region.try_alloc().is_ok());
        assert!(region.take_alloc_failure());
        assert!(!region.take_alloc_failure());
    }

    #[test]
    fn test_snapshot_version_visibility() {
        let cache = RowCache::new(Arc::new(Schema::new("t")));
        let key = PartitionKey::new(&b"pk"[..]);
        let snp = cache.snapshot(&key);
        assert!(snp.at_latest_version());
        assert!(snp.at_oldest_version());

        snp.push_version();
        assert!(!snp.at_latest_version());
        assert!(!snp.at_oldest_version());

        // A snapshot opened after the write sees the new latest version.
        let snp2 = cache.snapshot(&key);
        assert!(snp2.at_latest_version());
        assert!(!snp2.at_oldest_version());
    }

    #[test]
    fn test_insert_returns_existing_entry() {
        let cache = RowCache::new(Arc::new(Schema::new("t")));
        let snp = cache.snapshot(&PartitionKey::new(&b"pk"[..]));
        let (id, inserted) = snp.insert_in_latest(k(1), RowEntry::new_row(Row::new())).unwrap();
        assert!(inserted);
        let (id2, inserted2) = snp.insert_in_latest(k(1), RowEntry::new_dummy()).unwrap();
        assert_eq!(id, id2);
        assert!(!inserted2);
    }

    #[test]
    fn test_evict_clears_successor_continuity() {
        let cache = RowCache::new(Arc::new(Schema::new("t")));
        let key = PartitionKey::new(&b"pk"[..]);
        let snp = cache.snapshot(&key);
        snp.insert_in_latest(k(1), RowEntry::new_row(Row::new()))
            .unwrap();
        snp.insert_in_latest(k(2), RowEntry::new_row(Row::new()).with_continuous(true))
            .unwrap();

        let generation = cache.region().reference_generation();
        assert!(cache.evict_row(&key, &k(1)));
        let survivor = snp.entry_snapshot(&k(2)).unwrap();
        assert!(!survivor.continuous);
        assert!(cache.region().reference_generation() > generation);

        // The tail sentinel is not evictable.
        assert!(!cache.evict_row(&key, &Position::after_all()));
    }
}
