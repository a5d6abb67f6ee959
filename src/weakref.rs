//! Weak reference to the last populated cache entry
//!
//! The population engine remembers the most recently produced entry so it can
//! stamp continuity over the interval ending at the next one. The reference
//! is *weak*: eviction can remove the entry at any suspension point, and
//! allocator invalidation can unbind it. [`RowWeakref::refresh`] re-locates
//! the entry by table position; a failed refresh detaches the reference and
//! the caller must give up the continuity claim.

use crate::partition::{EntryId, PartitionSnapshot, VersionId};
use crate::position::Position;
use crate::tombstone::Tombstone;

struct WeakTarget {
    /// Table-domain position of the entry
    position: Position,
    id: EntryId,
    version: VersionId,
}

/// Detachable reference to a previously produced cache entry
pub struct RowWeakref {
    snapshot: PartitionSnapshot,
    target: Option<WeakTarget>,
}

impl RowWeakref {
    /// Detached reference bound to `snapshot`
    pub fn new(snapshot: PartitionSnapshot) -> Self {
        Self {
            snapshot,
            target: None,
        }
    }

    /// Drop the reference
    pub fn detach(&mut self) {
        self.target = None;
    }

    /// True while pointing at an entry
    pub fn is_engaged(&self) -> bool {
        self.target.is_some()
    }

    /// Point at the entry at `position` in version `version`
    pub fn point_at(&mut self, version: VersionId, position: Position, id: EntryId) {
        self.target = Some(WeakTarget {
            position,
            id,
            version,
        });
    }

    /// Point at the entry at `position` in the latest version
    pub fn point_at_latest(&mut self, position: Position, id: EntryId) {
        let version = self.snapshot.latest_version_id();
        self.point_at(version, position, id);
    }

    /// Re-locate the entry after possible invalidation
    ///
    /// Returns false and detaches when the entry is gone.
    pub fn refresh(&mut self) -> bool {
        let Some(target) = &mut self.target else {
            return false;
        };
        match self.snapshot.find_entry(&target.position) {
            Some((version, id)) => {
                target.version = version;
                target.id = id;
                true
            }
            None => {
                self.target = None;
                false
            }
        }
    }

    /// True when the entry lives in the latest version
    pub fn is_in_latest_version(&self) -> bool {
        self.target
            .as_ref()
            .is_some_and(|t| t.version == self.snapshot.latest_version_id())
    }

    /// Rebind to the latest version after a promotion
    pub fn set_latest(&mut self, id: EntryId) {
        let latest = self.snapshot.latest_version_id();
        if let Some(target) = &mut self.target {
            target.version = latest;
            target.id = id;
        }
    }

    /// Table-domain position of the entry
    pub fn position(&self) -> Option<&Position> {
        self.target.as_ref().map(|t| &t.position)
    }

    /// Entry id, while engaged
    pub fn entry_id(&self) -> Option<EntryId> {
        self.target.as_ref().map(|t| t.id)
    }

    /// Set the entry's continuity bit; no-op when detached
    pub fn set_continuous(&self, continuous: bool) {
        self.with_entry(|e| e.continuous = continuous);
    }

    /// Set the entry's interval tombstone; no-op when detached
    pub fn set_range_tombstone(&self, tombstone: Option<Tombstone>) {
        self.with_entry(|e| e.range_tombstone = tombstone);
    }

    /// The entry's dummy flag; detached reads as false
    pub fn dummy(&self) -> bool {
        self.with_entry(|e| e.dummy).unwrap_or(false)
    }

    /// The entry's continuity bit; detached reads as false
    pub fn continuous(&self) -> bool {
        self.with_entry(|e| e.continuous).unwrap_or(false)
    }

    /// The entry's interval tombstone; detached reads as none
    pub fn range_tombstone(&self) -> Option<Tombstone> {
        self.with_entry(|e| e.range_tombstone).flatten()
    }

    fn with_entry<R>(&self, f: impl FnOnce(&mut crate::partition::RowEntry) -> R) -> Option<R> {
        let target = self.target.as_ref()?;
        self.snapshot.with_entry(target.version, &target.position, f)
    }
}
