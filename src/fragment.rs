//! Mutation fragments
//!
//! The reader produces an ordered stream of fragments for one partition:
//! exactly one [`Fragment::PartitionStart`], an optional static row, then
//! clustering rows interleaved with range-tombstone changes in strictly
//! increasing query-domain position, closed by one [`Fragment::PartitionEnd`].

use crate::partition::PartitionKey;
use crate::position::{ClusteringKey, Position};
use crate::tombstone::Tombstone;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Row payload: named cells plus an optional row tombstone
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    /// Deletion covering the whole row
    pub tombstone: Option<Tombstone>,
    /// Cell values by column name
    pub cells: BTreeMap<String, Bytes>,
}

impl Row {
    /// Empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cell
    pub fn with_cell(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.cells.insert(name.into(), value.into());
        self
    }

    /// Set the row tombstone
    pub fn with_tombstone(mut self, tombstone: Tombstone) -> Self {
        self.tombstone = Some(tombstone);
        self
    }

    /// True when the row carries no cells and no tombstone
    pub fn is_empty(&self) -> bool {
        self.tombstone.is_none() && self.cells.is_empty()
    }

    /// Fold an older version of the row into this one; this row's cells win
    pub fn merge_older(&mut self, older: &Row) {
        self.tombstone = Tombstone::merge(self.tombstone, older.tombstone);
        for (name, value) in &older.cells {
            self.cells
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// One element of the partition stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fragment {
    /// Opens the partition, carrying its tombstone
    PartitionStart {
        key: PartitionKey,
        tombstone: Option<Tombstone>,
    },
    /// The partition's static row
    StaticRow { row: Row },
    /// A clustered row
    ClusteringRow { key: ClusteringKey, row: Row },
    /// The active range tombstone changes at `position`
    RangeTombstoneChange {
        position: Position,
        tombstone: Option<Tombstone>,
    },
    /// Closes the partition
    PartitionEnd,
}

impl Fragment {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Fragment::PartitionStart { .. } => "partition_start",
            Fragment::StaticRow { .. } => "static_row",
            Fragment::ClusteringRow { .. } => "clustering_row",
            Fragment::RangeTombstoneChange { .. } => "range_tombstone_change",
            Fragment::PartitionEnd => "partition_end",
        }
    }

    /// Stream position of the fragment
    pub fn position(&self) -> Position {
        match self {
            Fragment::PartitionStart { .. } | Fragment::StaticRow { .. } => Position::before_all(),
            Fragment::ClusteringRow { key, .. } => Position::at_key(key.clone()),
            Fragment::RangeTombstoneChange { position, .. } => position.clone(),
            Fragment::PartitionEnd => Position::after_all(),
        }
    }

    /// True for a clustering row
    pub fn is_clustering_row(&self) -> bool {
        matches!(self, Fragment::ClusteringRow { .. })
    }

    /// True for a range-tombstone change
    pub fn is_range_tombstone_change(&self) -> bool {
        matches!(self, Fragment::RangeTombstoneChange { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_older_keeps_newer_cells() {
        let mut newer = Row::new().with_cell("a", &b"new"[..]);
        let older = Row::new()
            .with_cell("a", &b"old"[..])
            .with_cell("b", &b"kept"[..]);
        newer.merge_older(&older);
        assert_eq!(newer.cells["a"], Bytes::from_static(b"new"));
        assert_eq!(newer.cells["b"], Bytes::from_static(b"kept"));
    }

    #[test]
    fn test_merge_older_merges_tombstones() {
        let mut newer = Row::new().with_tombstone(Tombstone::new(3, 30));
        let older = Row::new().with_tombstone(Tombstone::new(7, 70));
        newer.merge_older(&older);
        assert_eq!(newer.tombstone, Some(Tombstone::new(7, 70)));
    }

    #[test]
    fn test_fragment_positions() {
        let key = ClusteringKey::from_int(4);
        let row = Fragment::ClusteringRow {
            key: key.clone(),
            row: Row::new(),
        };
        assert_eq!(row.position(), Position::at_key(key));
        assert!(Fragment::PartitionEnd.position().is_after_all());
    }
}
