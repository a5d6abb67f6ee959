//! Cursor over a versioned partition snapshot
//!
//! [`RowCursor`] is the reader's only view into the cache's positional
//! structure. It exposes a query-domain API over the table-ordered versions:
//! seeking merges entries across versions, and interval attributes
//! (continuity, range tombstone) merge the bits of each version's covering
//! entry.
//!
//! The cursor is a *handle*, not a pointer: it remembers its query position
//! and the region generation it was captured under. Eviction or failed
//! population invalidates it; [`RowCursor::maybe_refresh`] re-locates the
//! cursor by position and reports whether the logical position survived.

use crate::error::Result;
use crate::fragment::Row;
use crate::partition::{EntryId, PartitionSnapshot, RowEntry, Version, VersionId};
use crate::position::{no_row_between, Position, PositionCmp};
use crate::tombstone::Tombstone;

/// Movable pointer into a partition snapshot
pub struct RowCursor {
    snapshot: PartitionSnapshot,
    cmp: PositionCmp,
    reversed: bool,
    /// Query-domain position; survives invalidation as the refresh target
    position: Position,
    generation: u64,
    valid: bool,
}

impl RowCursor {
    /// Cursor over `snapshot`, reading in the given direction
    pub fn new(snapshot: PartitionSnapshot, reversed: bool) -> Self {
        Self {
            snapshot,
            cmp: PositionCmp::new(reversed),
            reversed,
            position: Position::before_all(),
            generation: 0,
            valid: false,
        }
    }

    /// True while the captured references are still safe to use
    pub fn iterators_valid(&self) -> bool {
        self.valid && self.generation == self.snapshot.region().reference_generation()
    }

    /// Revalidate without re-seeking; the pointed-at state must be intact
    pub fn force_valid(&mut self) {
        self.generation = self.snapshot.region().reference_generation();
        self.valid = true;
    }

    /// Query-domain position of the cursor
    pub fn position(&self) -> &Position {
        &self.position
    }

    fn to_table(&self, pos: &Position) -> Position {
        if self.reversed {
            pos.reversed()
        } else {
            pos.clone()
        }
    }

    fn to_query(&self, pos: &Position) -> Position {
        self.to_table(pos)
    }

    fn table_position(&self) -> Position {
        self.to_table(&self.position)
    }

    /// Move to the least merged entry with query position `>= target`
    ///
    /// Returns *adjacent*: no clustering row can lie between `target` and
    /// the position the cursor landed on, so continuity up to the cursor
    /// needs no re-derivation.
    pub fn advance_to(&mut self, target: &Position) -> bool {
        let found = self.seek_at_or_after(target);
        self.position = found.unwrap_or_else(Position::after_all);
        self.force_valid();
        self.cmp.eq(&self.position, target) || no_row_between(target, &self.position)
    }

    /// Advance strictly past the current entry in query order
    ///
    /// In reversed mode the cursor can fall off the first storage entry; it
    /// then reports the query upper sentinel without pointing at anything,
    /// and interval attributes remain meaningful.
    pub fn next(&mut self) -> bool {
        let tpos = self.table_position();
        let best = {
            let data = self.snapshot.read_data();
            let mut best: Option<Position> = None;
            for version in &data.versions {
                let cand = if !self.reversed {
                    version.first_after(&tpos)
                } else {
                    version.last_before(&tpos)
                };
                if let Some((p, _)) = cand {
                    best = Some(self.closer_table_pos(best, p));
                }
            }
            best
        };
        match best {
            Some(t) => {
                self.position = self.to_query(&t);
                true
            }
            None => {
                self.position = Position::after_all();
                false
            }
        }
    }

    /// Re-locate after invalidation; true when the logical position held
    pub fn maybe_refresh(&mut self) -> bool {
        if self.iterators_valid() {
            return true;
        }
        let old = self.position.clone();
        self.advance_to(&old);
        self.cmp.eq(&self.position, &old)
    }

    /// Whether the interval immediately query-before the cursor is fully
    /// represented in the snapshot
    pub fn continuous(&self) -> bool {
        let tpos = self.table_position();
        let data = self.snapshot.read_data();
        data.versions
            .iter()
            .any(|v| self.interval_cover(v, &tpos).is_some_and(|e| e.continuous))
    }

    /// Tombstone of the interval immediately query-before the cursor
    pub fn range_tombstone(&self) -> Option<Tombstone> {
        let tpos = self.table_position();
        let data = self.snapshot.read_data();
        data.versions.iter().fold(None, |acc, v| {
            Tombstone::merge(acc, self.interval_cover(v, &tpos).and_then(|e| e.range_tombstone))
        })
    }

    /// Tombstone applying to the row position itself
    ///
    /// Differs from [`Self::range_tombstone`] exactly when a dummy sits
    /// between `before_key(row)` and the row, carrying a change that covers
    /// only the row.
    pub fn range_tombstone_for_row(&self) -> Option<Tombstone> {
        let tpos = self.table_position();
        let data = self.snapshot.read_data();
        data.versions.iter().fold(None, |acc, v| {
            Tombstone::merge(
                acc,
                v.first_at_or_after(&tpos).and_then(|(_, e)| e.range_tombstone),
            )
        })
    }

    /// True when no version holds a real row at the cursor position
    pub fn dummy(&self) -> bool {
        let tpos = self.table_position();
        let data = self.snapshot.read_data();
        data.versions
            .iter()
            .filter_map(|v| v.get(&tpos))
            .all(|e| e.dummy)
    }

    /// Merged row payload across versions, newest cells winning
    pub fn row(&self) -> Option<Row> {
        let tpos = self.table_position();
        let data = self.snapshot.read_data();
        let mut merged: Option<Row> = None;
        for version in &data.versions {
            if let Some(e) = version.get(&tpos) {
                if !e.dummy {
                    match &mut merged {
                        None => merged = Some(e.row.clone()),
                        Some(m) => m.merge_older(&e.row),
                    }
                }
            }
        }
        merged
    }

    /// Newest version holding the cursor's entry, for weak references
    pub fn entry_ref(&self) -> Option<(VersionId, Position, EntryId)> {
        let tpos = self.table_position();
        let data = self.snapshot.read_data();
        data.versions
            .iter()
            .find_map(|v| v.get(&tpos).map(|e| (v.id, tpos.clone(), e.id)))
    }

    /// Promote the cursor's entry into the latest version
    ///
    /// Inherits continuity and tombstone from the latest-version storage
    /// successor when that successor is continuous: the covering interval is
    /// fully represented, so its sub-intervals are too. Returns the entry id
    /// and whether a new entry was created.
    pub fn ensure_entry_in_latest(&mut self) -> Result<(EntryId, bool)> {
        let tpos = self.table_position();
        {
            let data = self.snapshot.read_data();
            if let Some(e) = data.versions[0].get(&tpos) {
                return Ok((e.id, false));
            }
        }
        let dummy = self.dummy();
        let row = self.row().unwrap_or_default();
        let (continuous, range_tombstone) = match self.snapshot.latest_successor(&tpos) {
            Some(succ) if succ.continuous => (true, succ.range_tombstone),
            _ => (false, None),
        };
        let entry = RowEntry {
            id: 0,
            dummy,
            continuous,
            range_tombstone,
            row,
        };
        let (id, inserted) = self.snapshot.insert_in_latest(tpos, entry)?;
        if inserted {
            self.snapshot.tracker().insert(id);
        }
        Ok((id, inserted))
    }

    /// Record LRU use of the entries under the cursor
    pub fn touch(&self) {
        if !self.iterators_valid() {
            return;
        }
        let tpos = self.table_position();
        let ids: Vec<EntryId> = {
            let data = self.snapshot.read_data();
            data.versions
                .iter()
                .filter_map(|v| v.get(&tpos).map(|e| e.id))
                .collect()
        };
        for id in ids {
            self.snapshot.tracker().touch(id);
        }
    }

    /// Per-version entry whose bits cover the interval query-before `tpos`
    ///
    /// Forward: the least entry at or after the position (its interval ends
    /// at the entry). Reversed: the least entry strictly after, since the
    /// storage-order successor is the continuity carrier.
    fn interval_cover<'a>(&self, version: &'a Version, tpos: &Position) -> Option<&'a RowEntry> {
        let found = if !self.reversed {
            version.first_at_or_after(tpos)
        } else {
            version.first_after(tpos)
        };
        found.map(|(_, e)| e)
    }

    fn closer_table_pos(&self, best: Option<Position>, candidate: &Position) -> Position {
        match best {
            None => candidate.clone(),
            Some(b) => {
                let take = if !self.reversed {
                    *candidate < b
                } else {
                    *candidate > b
                };
                if take {
                    candidate.clone()
                } else {
                    b
                }
            }
        }
    }

    fn seek_at_or_after(&self, target: &Position) -> Option<Position> {
        let target_t = self.to_table(target);
        let data = self.snapshot.read_data();
        let mut best: Option<Position> = None;
        for version in &data.versions {
            let cand = if !self.reversed {
                version.first_at_or_after(&target_t)
            } else {
                version.last_at_or_before(&target_t)
            };
            if let Some((p, _)) = cand {
                best = Some(self.closer_table_pos(best, p));
            }
        }
        best.map(|t| self.to_query(&t))
    }
}
