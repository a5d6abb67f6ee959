//! Deletion tombstones for clustering ranges and rows
//!
//! A tombstone is a `(timestamp, deletion_time)` pair. The *active deletion*
//! over a stretch of clustering space is an `Option<Tombstone>`, where `None`
//! means no deletion applies. When two tombstones cover the same interval the
//! one written later (greater timestamp, ties broken by deletion time) wins.

use std::fmt;

/// A deletion marker
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tombstone {
    /// Write timestamp of the deletion
    pub timestamp: i64,
    /// Wall-clock deletion time, used for expiry
    pub deletion_time: i64,
}

impl Tombstone {
    /// Create a tombstone
    pub fn new(timestamp: i64, deletion_time: i64) -> Self {
        Self {
            timestamp,
            deletion_time,
        }
    }

    /// Merge two optional tombstones, keeping the later write
    pub fn merge(a: Option<Tombstone>, b: Option<Tombstone>) -> Option<Tombstone> {
        match (a, b) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, None) => x,
            (None, y) => y,
        }
    }
}

impl fmt::Debug for Tombstone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tomb({}, {})", self.timestamp, self.deletion_time)
    }
}
