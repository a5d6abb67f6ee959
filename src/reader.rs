//! Read-through, continuity-tracking partition reader
//!
//! [`CacheRowReader`] serves an ordered stream of clustering rows and
//! range-tombstone changes for one partition, restricted to the query's
//! clustering ranges. Intervals already marked continuous are emitted from
//! the cache snapshot; missing intervals are fetched from the underlying
//! source, installed back into the cache, and marked continuous so the next
//! read over them never leaves the cache.
//!
//! ## State machine
//!
//! ```text
//! before_static_row -> reading_from_cache <-> move_to_underlying
//!                                 ^                  |
//!                                 |                  v
//!                                 +---- reading_from_underlying
//!                      (any) -> end_of_stream
//! ```
//!
//! Between suspension points the reader maintains:
//!
//! - `lower_bound <= upper_bound` in query order, `lower_bound` never at a
//!   row position;
//! - everything below `lower_bound` has been emitted, and every tombstone
//!   change at or below it;
//! - while reading from cache, the cursor points at the least entry at or
//!   above `lower_bound` and `next_row_in_range` mirrors
//!   `cursor < upper_bound`;
//! - while reading from underlying, `underlying_upper_bound` is the smaller
//!   of `before(cursor)` and the range's upper bound;
//! - `current_tombstone` is the last emitted, still-open tombstone and holds
//!   over `[last-change-position, lower_bound)`.

use crate::context::{ContextHolder, ReadContext};
use crate::error::{Error, Result};
use crate::fragment::{Fragment, Row};
use crate::partition::{PartitionKey, PartitionRange, PartitionSnapshot, RowCache, RowEntry, Schema};
use crate::position::{no_row_between, ClusteringKey, Position, PositionCmp, PositionRange, RowRange};
use crate::section::LsaManager;
use crate::source::{FragmentBuffer, MutationReader, DEFAULT_BUFFER_CAPACITY};
use crate::tombstone::Tombstone;
use crate::tracker::CacheTracker;
use crate::cursor::RowCursor;
use crate::weakref::RowWeakref;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReaderState {
    BeforeStaticRow,
    ReadingFromCache,
    MoveToUnderlying,
    ReadingFromUnderlying,
    EndOfStream,
}

/// Streaming reader over one cached partition
pub struct CacheRowReader<'a> {
    schema: Arc<Schema>,
    snapshot: PartitionSnapshot,
    /// Query-order clustering ranges
    ranges: Vec<RowRange>,
    range_idx: usize,
    lsa: LsaManager,
    /// Most recently populated entry, table domain
    last_row: RowWeakref,
    /// Query domain; never a row position
    lower_bound: Position,
    /// Query domain
    upper_bound: Position,
    underlying_upper_bound: Option<Position>,
    ctx: ContextHolder<'a>,
    cursor: RowCursor,
    /// Last emitted, still-open tombstone
    current_tombstone: Option<Tombstone>,
    state: ReaderState,
    next_row_in_range: bool,
    /// Whether any range-tombstone change was emitted from the underlying
    has_rt: bool,
    /// Whether the current population interval starts before all rows
    population_range_starts_before_all_rows: bool,
    underlying: Option<Box<dyn MutationReader>>,
    buffer: FragmentBuffer,
}

impl<'a> CacheRowReader<'a> {
    /// Reader over `snapshot`, restricted to `ranges` in query order
    ///
    /// The partition-start fragment is emitted immediately. The context is
    /// either borrowed (`&ReadContext`) or owned (`Box<ReadContext>`); only
    /// an owned context is closed by [`MutationReader::close`].
    pub fn new(
        schema: Arc<Schema>,
        key: PartitionKey,
        ranges: Vec<RowRange>,
        ctx: impl Into<ContextHolder<'a>>,
        snapshot: PartitionSnapshot,
        cache: &RowCache,
    ) -> Self {
        let ctx = ctx.into();
        let reversed = ctx.get().is_reversed();
        trace!(
            table = %schema.table,
            reversed,
            owned_ctx = ctx.is_owned(),
            "cache reader created"
        );
        let mut buffer = FragmentBuffer::new(DEFAULT_BUFFER_CAPACITY);
        buffer.push(Fragment::PartitionStart {
            key,
            tombstone: snapshot.partition_tombstone(),
        });
        Self {
            schema,
            lsa: LsaManager::new(cache.region().clone()),
            last_row: RowWeakref::new(snapshot.clone()),
            cursor: RowCursor::new(snapshot.clone(), reversed),
            snapshot,
            ranges,
            range_idx: 0,
            lower_bound: Position::before_all(),
            upper_bound: Position::before_all(),
            underlying_upper_bound: None,
            ctx,
            current_tombstone: None,
            state: ReaderState::BeforeStaticRow,
            next_row_in_range: false,
            has_rt: false,
            population_range_starts_before_all_rows: false,
            underlying: None,
            buffer,
        }
    }

    /// Use a non-default fill target, mostly for tests exercising resumption
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer.set_capacity(capacity);
        self
    }

    fn ctx(&self) -> &ReadContext {
        self.ctx.get()
    }

    fn tracker(&self) -> &Arc<CacheTracker> {
        self.snapshot.tracker()
    }

    fn reversed(&self) -> bool {
        self.ctx.get().is_reversed()
    }

    fn cmp(&self) -> PositionCmp {
        PositionCmp::new(self.reversed())
    }

    fn to_table_domain(&self, pos: &Position) -> Position {
        if self.reversed() {
            pos.reversed()
        } else {
            pos.clone()
        }
    }

    fn to_query_domain(&self, pos: &Position) -> Position {
        self.to_table_domain(pos)
    }

    fn after_current_range(&self, pos: &Position) -> bool {
        self.cmp().ge(pos, &self.upper_bound)
    }

    /// Population predicate: the snapshot must still be the latest version
    /// and the cache phase for the key must match the one the read observed
    fn can_populate(&self) -> bool {
        self.snapshot.at_latest_version()
            && self.ctx().cache().phase_of(self.ctx().key()) == self.ctx().phase()
    }

    fn current_range_is_singular(&self) -> bool {
        self.ranges
            .get(self.range_idx)
            .is_some_and(|r| r.is_singular())
    }

    fn finish_reader(&mut self) {
        trace!("end of stream");
        self.buffer.push(Fragment::PartitionEnd);
        self.buffer.set_end_of_stream(true);
        self.state = ReaderState::EndOfStream;
    }

    async fn ensure_underlying(&mut self) -> Result<()> {
        if self.underlying.is_none() {
            let reader = self.ctx().open_underlying().await?;
            self.underlying = Some(reader);
        }
        Ok(())
    }

    async fn process_static_row(&mut self) -> Result<()> {
        if self.snapshot.static_row_continuous() {
            self.tracker().on_row_hit();
            let static_row = {
                let _section = self.lsa.read_section();
                self.snapshot.static_row(self.ctx().digest_requested())
            };
            if let Some(row) = static_row {
                if !row.is_empty() {
                    self.buffer.push(Fragment::StaticRow { row });
                }
            }
            Ok(())
        } else {
            self.tracker().on_row_miss();
            self.ensure_underlying().await?;
            let fragment = match self.underlying.as_mut() {
                Some(underlying) => underlying.next_fragment().await?,
                None => None,
            };
            match fragment {
                Some(Fragment::StaticRow { row }) => {
                    self.maybe_add_static_row_to_cache(&row);
                    self.buffer.push(Fragment::StaticRow { row });
                }
                Some(other) => {
                    return Err(Error::underlying(format!(
                        "expected static row before fast-forward, got {}",
                        other.kind()
                    )));
                }
                None => {}
            }
            self.maybe_set_static_row_continuous();
            Ok(())
        }
    }

    async fn do_fill_buffer(&mut self) -> Result<()> {
        match self.state {
            ReaderState::MoveToUnderlying => {
                self.prepare_underlying_read().await?;
                self.read_from_underlying().await
            }
            ReaderState::ReadingFromUnderlying => self.read_from_underlying().await,
            ReaderState::ReadingFromCache => {
                self.read_from_cache();
                Ok(())
            }
            ReaderState::BeforeStaticRow | ReaderState::EndOfStream => Ok(()),
        }
    }

    /// Engage the underlying source for `[lower_bound, underlying_upper_bound)`
    async fn prepare_underlying_read(&mut self) -> Result<()> {
        self.ensure_underlying().await?;
        self.state = ReaderState::ReadingFromUnderlying;
        self.population_range_starts_before_all_rows =
            self.lower_bound.is_before_all() && !self.reversed();
        let upper = if self.next_row_in_range {
            self.cursor.position().before()
        } else {
            self.upper_bound.clone()
        };
        self.underlying_upper_bound = Some(upper.clone());

        if !self.ctx().partition_exists() {
            trace!("partition does not exist in underlying source");
            if self.current_tombstone.is_some() {
                trace!(pos = ?self.lower_bound, "closing tombstone before absent partition");
                self.buffer.push(Fragment::RangeTombstoneChange {
                    position: self.lower_bound.clone(),
                    tombstone: None,
                });
                self.current_tombstone = None;
            }
            return Ok(());
        }

        let window = PositionRange::new(self.lower_bound.clone(), upper);
        trace!(start = ?window.start, end = ?window.end, "fast-forwarding underlying");
        if let Some(underlying) = self.underlying.as_mut() {
            underlying.fast_forward_to(window).await?;
        }

        // A tombstone carried over from the cache must be closed unless the
        // underlying stream opens with a matching change at the same spot.
        if self.current_tombstone.is_some() {
            let cmp = self.cmp();
            let lower_bound = self.lower_bound.clone();
            let continues = match self.underlying.as_mut() {
                Some(underlying) => match underlying.peek().await? {
                    Some(Fragment::RangeTombstoneChange { position, .. }) => {
                        cmp.eq(position, &lower_bound)
                    }
                    _ => false,
                },
                None => false,
            };
            if !continues {
                trace!(pos = ?self.lower_bound, "closing cache tombstone at underlying handoff");
                self.buffer.push(Fragment::RangeTombstoneChange {
                    position: self.lower_bound.clone(),
                    tombstone: None,
                });
                self.current_tombstone = None;
            }
        }
        Ok(())
    }

    async fn read_from_underlying(&mut self) -> Result<()> {
        while self.state == ReaderState::ReadingFromUnderlying && !self.buffer.is_full() {
            let fragment = match self.underlying.as_mut() {
                Some(underlying) => underlying.next_fragment().await?,
                None => None,
            };
            match fragment {
                Some(fragment) => {
                    self.tracker().on_row_miss();
                    self.offer_from_underlying(fragment);
                }
                None => {
                    self.finish_underlying_range();
                    break;
                }
            }
        }
        Ok(())
    }

    /// The underlying range is exhausted: advance the lower bound, restore
    /// the cursor, and either extend continuity to it or seal the interval
    /// and move on
    fn finish_underlying_range(&mut self) {
        if let Some(upper) = self.underlying_upper_bound.take() {
            self.lower_bound = upper;
        }
        self.state = ReaderState::ReadingFromCache;
        let _section = self.lsa.update_section();
        let same_position = self.cursor.maybe_refresh();
        trace!(
            same_position,
            in_range = self.next_row_in_range,
            next = ?self.cursor.position(),
            "underlying range done"
        );
        if !same_position {
            // Eviction moved the cursor while we were away; continuity to
            // the old position can no longer be claimed.
            self.tracker().on_mispopulate();
            let cursor_pos = self.cursor.position().clone();
            self.next_row_in_range = !self.after_current_range(&cursor_pos);
            if !self.cursor.continuous() {
                self.last_row.detach();
                self.start_reading_from_underlying();
            }
            return;
        }
        if self.next_row_in_range {
            self.maybe_update_continuity();
        } else {
            if self.can_populate() {
                if self.current_range_is_singular() {
                    self.seal_singular_range();
                } else if self.ensure_population_lower_bound() {
                    self.seal_range_upper_bound();
                }
            } else {
                self.tracker().on_mispopulate();
            }
            self.move_to_next_range();
        }
    }

    /// Seal a one-key range after reading it from the underlying source
    ///
    /// Inserts an empty row entry at the key so a later hit needs no dummy
    /// pair around it, inheriting the successor's continuity. Skipped when
    /// range tombstones were observed: were they evicted later, the entry
    /// would claim an interval whose tombstone it cannot reproduce.
    fn seal_singular_range(&mut self) {
        if self.has_rt {
            return;
        }
        let Some(start) = self.ranges[self.range_idx].start.clone() else {
            return;
        };
        let pos = Position::at_key(start.key);
        match self.snapshot.insert_in_latest(pos.clone(), RowEntry::new_row(Row::new())) {
            Ok((id, true)) => {
                self.tracker().insert(id);
                let continuous = self
                    .snapshot
                    .latest_successor(&pos)
                    .is_some_and(|succ| succ.continuous);
                self.snapshot.with_entry_in_latest(&pos, |e| e.continuous = continuous);
                trace!(pos = ?pos, continuous, "inserted empty row for singular range");
            }
            Ok((_, false)) => {}
            Err(_) => {
                self.tracker().on_mispopulate();
            }
        }
    }

    /// Seal a general range by carrying continuity on a dummy at its upper
    /// bound
    fn seal_range_upper_bound(&mut self) {
        let pos = self.to_table_domain(&self.upper_bound);
        match self.snapshot.insert_in_latest(pos.clone(), RowEntry::new_dummy()) {
            Ok((id, inserted)) => {
                if inserted {
                    self.tracker().insert(id);
                    trace!(pos = ?pos, "inserted range-end dummy");
                }
                let tombstone = self.current_tombstone;
                if self.reversed() {
                    self.last_row.set_continuous(true);
                    self.last_row.set_range_tombstone(tombstone);
                } else {
                    self.snapshot.with_entry_in_latest(&pos, |e| {
                        e.continuous = true;
                        e.range_tombstone = tombstone;
                    });
                }
                self.maybe_drop_last_entry(tombstone);
            }
            Err(_) => {
                self.tracker().on_mispopulate();
            }
        }
    }

    /// Mark the interval between `last_row` and the cursor continuous,
    /// provided the snapshot still matches the latest version
    fn maybe_update_continuity(&mut self) {
        let cursor_pos = self.cursor.position().clone();
        let last_pos = self
            .last_row
            .position()
            .map(|p| self.to_query_domain(p))
            .unwrap_or_else(Position::before_all);
        if !(self.can_populate()
            && self.ensure_population_lower_bound()
            && !self.cmp().eq(&last_pos, &cursor_pos))
        {
            self.tracker().on_mispopulate();
            return;
        }
        let Ok((_entry_id, _)) = self.cursor.ensure_entry_in_latest() else {
            self.tracker().on_mispopulate();
            return;
        };
        let tombstone = self.current_tombstone;
        let cursor_table = self.to_table_domain(&cursor_pos);
        if self.reversed() {
            let Some(last_table) = self.last_row.position().cloned() else {
                self.tracker().on_mispopulate();
                return;
            };
            if tombstone != self.last_row.range_tombstone() && !self.last_row.dummy() {
                // The carrier's stored tombstone only applies to the row
                // itself now; a fresh dummy takes over the interval.
                let dummy_pos = last_table.before();
                match self.snapshot.insert_in_latest(dummy_pos.clone(), RowEntry::new_dummy()) {
                    Ok((id, inserted)) => {
                        if inserted {
                            self.tracker().insert(id);
                            trace!(pos = ?dummy_pos, "inserted interval dummy");
                        }
                        self.snapshot.with_entry_in_latest(&dummy_pos, |e| {
                            e.continuous = true;
                            e.range_tombstone = tombstone;
                        });
                        self.last_row.set_continuous(true);
                    }
                    Err(_) => {
                        self.tracker().on_mispopulate();
                        return;
                    }
                }
            } else {
                trace!(pos = ?last_table, rt = ?tombstone, "marking continuous");
                self.last_row.set_continuous(true);
                self.last_row.set_range_tombstone(tombstone);
            }
        } else {
            let attrs = self
                .snapshot
                .with_entry_in_latest(&cursor_table, |e| (e.range_tombstone, e.dummy));
            let Some((entry_rt, entry_dummy)) = attrs else {
                self.tracker().on_mispopulate();
                return;
            };
            if tombstone != entry_rt && !entry_dummy {
                let dummy_pos = cursor_table.before();
                match self.snapshot.insert_in_latest(dummy_pos.clone(), RowEntry::new_dummy()) {
                    Ok((id, inserted)) => {
                        if inserted {
                            self.tracker().insert(id);
                            trace!(pos = ?dummy_pos, "inserted interval dummy");
                        }
                        self.snapshot.with_entry_in_latest(&dummy_pos, |e| {
                            e.continuous = true;
                            e.range_tombstone = tombstone;
                        });
                        self.snapshot
                            .with_entry_in_latest(&cursor_table, |e| e.continuous = true);
                    }
                    Err(_) => {
                        self.tracker().on_mispopulate();
                        return;
                    }
                }
            } else {
                trace!(pos = ?cursor_table, rt = ?tombstone, "marking continuous");
                self.snapshot.with_entry_in_latest(&cursor_table, |e| {
                    e.continuous = true;
                    e.range_tombstone = tombstone;
                });
            }
        }
        self.maybe_drop_last_entry(tombstone);
    }

    /// Make sure the lower end of the population interval exists in the
    /// latest version, so a continuity bit stamped on the upper end has a
    /// well-defined reach
    ///
    /// After a successful return, `last_row` points at the population lower
    /// bound, or the interval starts before all rows and `last_row` is
    /// detached (forward reads only).
    fn ensure_population_lower_bound(&mut self) -> bool {
        if self.population_range_starts_before_all_rows {
            return true;
        }
        if !self.last_row.refresh() {
            return false;
        }
        if !self.last_row.is_in_latest_version() {
            let Some(last_table) = self.last_row.position().cloned() else {
                return false;
            };
            let last_query = self.to_query_domain(&last_table);
            let mut cursor = RowCursor::new(self.snapshot.clone(), self.reversed());
            cursor.advance_to(&last_query);
            if !self.cmp().eq(cursor.position(), &last_query) {
                return false;
            }
            match cursor.ensure_entry_in_latest() {
                Ok((id, inserted)) => {
                    if inserted {
                        trace!(pos = ?last_table, "promoted population lower bound");
                    }
                    self.last_row.set_latest(id);
                }
                Err(_) => return false,
            }
        }
        true
    }

    /// Install a clustering row received from the underlying source
    fn maybe_add_row_to_cache(&mut self, key: &ClusteringKey, row: &Row) {
        if !self.can_populate() {
            self.last_row.detach();
            self.population_range_starts_before_all_rows = false;
            self.tracker().on_mispopulate();
            return;
        }
        trace!(key = ?key, rt = ?self.current_tombstone, "populating row");
        let _section = self.lsa.update_section();
        let pos = Position::at_key(key.clone());
        let tombstone = self.current_tombstone;
        let entry = RowEntry::new_row(row.clone()).with_range_tombstone(tombstone);
        match self.snapshot.insert_in_latest(pos.clone(), entry) {
            Ok((id, inserted)) => {
                if inserted {
                    self.tracker().insert(id);
                }
                if self.ensure_population_lower_bound() {
                    if self.reversed() {
                        self.last_row.set_continuous(true);
                        // The tombstone must also apply to the carrier row
                        // itself, else a change right after it would have
                        // produced a different entry.
                        self.last_row.set_range_tombstone(tombstone);
                    } else {
                        self.snapshot.with_entry_in_latest(&pos, |e| {
                            e.continuous = true;
                            e.range_tombstone = tombstone;
                        });
                    }
                } else {
                    self.tracker().on_mispopulate();
                }
                self.last_row.point_at_latest(pos, id);
                self.population_range_starts_before_all_rows = false;
            }
            Err(_) => {
                self.last_row.detach();
                self.population_range_starts_before_all_rows = false;
                self.tracker().on_mispopulate();
            }
        }
    }

    /// Track and install a range-tombstone change from the underlying
    /// source; returns whether the change should be emitted
    fn maybe_add_rtc_to_cache(
        &mut self,
        position: &Position,
        tombstone: Option<Tombstone>,
    ) -> bool {
        let cmp = self.cmp();
        trace!(pos = ?position, rt = ?tombstone, "tombstone change from underlying");

        // The closing change at the window boundary is not emitted: the
        // interval is empty, or the read resumes from cache under the same
        // tombstone.
        if let Some(upper) = &self.underlying_upper_bound {
            if cmp.eq(position, upper) {
                self.lower_bound = position.clone();
                return false;
            }
        }

        let previous = std::mem::replace(&mut self.current_tombstone, tombstone);
        if self.current_tombstone == previous {
            return false;
        }

        if !self.can_populate() {
            self.last_row.detach();
            self.population_range_starts_before_all_rows = false;
            self.tracker().on_mispopulate();
            return true;
        }

        let _section = self.lsa.update_section();
        let pos_table = self.to_table_domain(position);
        match self
            .snapshot
            .insert_in_latest(pos_table.clone(), RowEntry::new_dummy())
        {
            Ok((id, inserted)) => {
                if inserted {
                    self.tracker().insert(id);
                }
                if self.ensure_population_lower_bound() {
                    // The underlying may emit coincident changes; the first
                    // one covers an empty interval and marks nothing.
                    let last_query = self.last_row.position().map(|p| self.to_query_domain(p));
                    let interval_nonempty = match &last_query {
                        Some(p) => cmp.lt(p, position),
                        None => true,
                    };
                    if interval_nonempty {
                        if self.reversed() {
                            self.last_row.set_continuous(true);
                            self.last_row.set_range_tombstone(previous);
                        } else {
                            self.snapshot.with_entry_in_latest(&pos_table, |e| {
                                e.continuous = true;
                                e.range_tombstone = previous;
                            });
                        }
                    }
                } else {
                    self.tracker().on_mispopulate();
                }
                self.last_row.point_at_latest(pos_table, id);
                self.population_range_starts_before_all_rows = false;
            }
            Err(_) => {
                self.last_row.detach();
                self.population_range_starts_before_all_rows = false;
                self.tracker().on_mispopulate();
            }
        }
        true
    }

    fn maybe_add_static_row_to_cache(&mut self, row: &Row) {
        if self.can_populate() {
            trace!("populating static row");
            self.tracker().on_static_row_insert();
            let _section = self.lsa.update_section();
            self.snapshot.set_static_row(row.clone());
        } else {
            self.tracker().on_mispopulate();
        }
    }

    fn maybe_set_static_row_continuous(&mut self) {
        if self.can_populate() {
            trace!("marking static row continuous");
            self.snapshot.set_static_row_continuous(true);
        } else {
            self.tracker().on_mispopulate();
        }
    }

    fn offer_from_underlying(&mut self, fragment: Fragment) {
        trace!(kind = fragment.kind(), pos = ?fragment.position(), "fragment from underlying");
        match fragment {
            Fragment::ClusteringRow { key, row } => {
                self.maybe_add_row_to_cache(&key, &row);
                self.add_clustering_row_to_buffer(key, row);
            }
            Fragment::RangeTombstoneChange { position, tombstone } => {
                if self.maybe_add_rtc_to_cache(&position, tombstone) {
                    self.add_rtc_to_buffer(position, tombstone);
                }
            }
            other => {
                warn!(kind = other.kind(), "unexpected fragment inside clustering window");
            }
        }
    }

    /// Append a clustering row, even past the fill target: the invariant is
    /// that the row matching the cursor has been emitted before the cursor
    /// moves past it
    fn add_clustering_row_to_buffer(&mut self, key: ClusteringKey, row: Row) {
        let new_lower = Position::after_key(key.clone());
        let has_row_tombstone = row.tombstone.is_some();
        self.buffer.push(Fragment::ClusteringRow { key, row });
        self.lower_bound = new_lower;
        if has_row_tombstone {
            self.tracker().on_row_tombstone_read();
        }
    }

    fn add_rtc_to_buffer(&mut self, position: Position, tombstone: Option<Tombstone>) {
        debug_assert!(!position.is_clustering_row());
        self.has_rt = true;
        self.lower_bound = position.clone();
        self.buffer
            .push(Fragment::RangeTombstoneChange { position, tombstone });
        self.tracker().on_range_tombstone_read();
    }

    /// Emit from the cache while the interval ahead is continuous
    fn read_from_cache(&mut self) {
        let _section = self.lsa.read_section();
        if !self.cursor.iterators_valid() {
            // Eviction invalidated the cursor; whatever continuity the range
            // had may be gone with it.
            let target = self.lower_bound.clone();
            let adjacent = self.cursor.advance_to(&target);
            let cursor_pos = self.cursor.position().clone();
            self.next_row_in_range = !self.after_current_range(&cursor_pos);
            if !adjacent && !self.cursor.continuous() {
                self.last_row.detach();
                self.start_reading_from_underlying();
                return;
            }
        }
        self.cursor.maybe_refresh();
        trace!(
            lb = ?self.lower_bound,
            ub = ?self.upper_bound,
            next = ?self.cursor.position(),
            rt = ?self.current_tombstone,
            "reading from cache"
        );
        while self.state == ReaderState::ReadingFromCache {
            self.copy_from_cache_to_buffer();
            if self.ctx().permit().need_preempt() || self.buffer.is_full() {
                break;
            }
        }
    }

    fn copy_from_cache_to_buffer(&mut self) {
        self.cursor.touch();
        let cmp = self.cmp();

        let cursor_rt = self.cursor.range_tombstone();
        if cursor_rt != self.current_tombstone {
            let upper = if self.next_row_in_range {
                self.cursor.position().before()
            } else {
                self.upper_bound.clone()
            };
            if !cmp.eq(&self.lower_bound, &upper) {
                trace!(pos = ?self.lower_bound, rt = ?cursor_rt, "tombstone change from cache");
                self.buffer.push(Fragment::RangeTombstoneChange {
                    position: self.lower_bound.clone(),
                    tombstone: cursor_rt,
                });
                self.current_tombstone = cursor_rt;
                self.lower_bound = upper;
                self.tracker().on_range_tombstone_read();
            }
        }

        if self.next_row_in_range {
            let row_rt = self.cursor.range_tombstone_for_row();
            if row_rt != self.current_tombstone {
                // A change covering only the row itself.
                let new_lower = self.cursor.position().before();
                self.buffer.push(Fragment::RangeTombstoneChange {
                    position: new_lower.clone(),
                    tombstone: row_rt,
                });
                self.lower_bound = new_lower;
                self.current_tombstone = row_rt;
                self.tracker().on_range_tombstone_read();
            }
            self.append_cursor_row();
            self.move_to_next_entry();
        } else {
            self.move_to_next_range();
        }
    }

    fn append_cursor_row(&mut self) {
        if !self.cursor.dummy() {
            self.tracker().on_row_hit();
            let Some(key) = self.cursor.position().key().cloned() else {
                return;
            };
            let row = self.cursor.row().unwrap_or_default();
            self.add_clustering_row_to_buffer(key, row);
        } else {
            let pos = self.cursor.position().clone();
            if self.cmp().lt(&self.lower_bound, &pos) {
                self.lower_bound = pos;
            }
            self.tracker().on_dummy_row_hit();
        }
    }

    /// Step the cursor; stay in cache while the next interval is continuous
    fn move_to_next_entry(&mut self) {
        if no_row_between(self.cursor.position(), &self.upper_bound) {
            self.move_to_next_range();
            return;
        }
        let previous_entry = self.cursor.entry_ref();
        self.cursor.next();
        match previous_entry {
            Some((version, pos, id)) => self.last_row.point_at(version, pos, id),
            None => self.last_row.detach(),
        }
        let cursor_pos = self.cursor.position().clone();
        self.next_row_in_range = !self.after_current_range(&cursor_pos);
        trace!(
            next = ?cursor_pos,
            in_range = self.next_row_in_range,
            "cursor advanced"
        );
        if !self.cursor.continuous() {
            self.start_reading_from_underlying();
        } else {
            let rt = self.cursor.range_tombstone();
            self.maybe_drop_last_entry(rt);
        }
    }

    /// Drop the `last_row` dummy when it no longer adds information
    ///
    /// Only safe when the snapshot is both the latest and the oldest
    /// version: no other snapshot's view depends on the entry. Keeps the
    /// cursor valid for the next step. No reversed-mode elision rule has
    /// been established, so reversed reads skip it.
    fn maybe_drop_last_entry(&mut self, tombstone: Option<Tombstone>) {
        if self.reversed() {
            return;
        }
        if !self.last_row.is_engaged() {
            return;
        }
        if !(self.last_row.dummy()
            && self.last_row.continuous()
            && self.last_row.range_tombstone() == tombstone)
        {
            return;
        }
        if !(self.snapshot.at_latest_version() && self.snapshot.at_oldest_version()) {
            return;
        }
        let Some(pos) = self.last_row.position().cloned() else {
            return;
        };
        trace!(pos = ?pos, "dropping redundant dummy");
        if let Some(id) = self.snapshot.remove_from_latest(&pos) {
            self.tracker().remove(id);
        }
        self.last_row.detach();
        // Iterators may point at the removed entry.
        self.snapshot.region().invalidate_references();
        self.cursor.force_valid();
    }

    fn start_reading_from_underlying(&mut self) {
        trace!(
            lb = ?self.lower_bound,
            next_in_range = self.next_row_in_range,
            "switching to underlying"
        );
        self.state = ReaderState::MoveToUnderlying;
        self.cursor.touch();
    }

    /// Close the open tombstone at the range end and advance to the next
    /// range, or finish the stream
    fn move_to_next_range(&mut self) {
        if self.current_tombstone.is_some() {
            trace!(pos = ?self.upper_bound, "closing tombstone at range end");
            self.buffer.push(Fragment::RangeTombstoneChange {
                position: self.upper_bound.clone(),
                tombstone: None,
            });
            self.current_tombstone = None;
        }
        let next = self.range_idx + 1;
        if next >= self.ranges.len() {
            self.range_idx = next;
            self.finish_reader();
        } else {
            self.move_to_range(next);
        }
    }

    fn move_to_range(&mut self, idx: usize) {
        let lower = self.ranges[idx].start_position();
        let upper = self.ranges[idx].end_position();
        self.last_row.detach();
        self.lower_bound = lower;
        self.upper_bound = upper;
        self.range_idx = idx;
        let target = self.lower_bound.clone();
        let adjacent = self.cursor.advance_to(&target);
        let cursor_pos = self.cursor.position().clone();
        self.next_row_in_range = !self.after_current_range(&cursor_pos);
        trace!(
            lb = ?self.lower_bound,
            ub = ?self.upper_bound,
            next = ?cursor_pos,
            adjacent,
            "moved to range"
        );
        if !adjacent && !self.cursor.continuous() {
            // A singular range gets no dummy: a hit would then cost three
            // entries (before, at, after) instead of one.
            let range = &self.ranges[idx];
            if range.has_start() && !range.is_singular() {
                if self.can_populate() {
                    let pos = self.to_table_domain(&self.lower_bound);
                    match self.snapshot.insert_in_latest(pos.clone(), RowEntry::new_dummy()) {
                        Ok((id, inserted)) => {
                            if inserted {
                                self.tracker().insert(id);
                                trace!(pos = ?pos, "inserted range-start dummy");
                            }
                            let version = self.snapshot.latest_version_id();
                            self.last_row.point_at(version, pos, id);
                        }
                        Err(_) => {
                            self.tracker().on_mispopulate();
                        }
                    }
                } else {
                    self.tracker().on_mispopulate();
                }
            }
            self.start_reading_from_underlying();
        }
    }
}

#[async_trait]
impl<'a> MutationReader for CacheRowReader<'a> {
    fn buffer(&self) -> &FragmentBuffer {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut FragmentBuffer {
        &mut self.buffer
    }

    async fn fill_buffer(&mut self) -> Result<()> {
        if self.buffer.end_of_stream() {
            return Ok(());
        }
        if self.state == ReaderState::BeforeStaticRow {
            self.snapshot.touch();
            if self.schema.has_static_columns {
                self.process_static_row().await?;
            }
            if self.ranges.is_empty() {
                self.finish_reader();
                return Ok(());
            }
            self.state = ReaderState::ReadingFromCache;
            let _section = self.lsa.update_section();
            self.move_to_range(0);
        }
        while !self.buffer.end_of_stream() && !self.buffer.is_full() {
            self.do_fill_buffer().await?;
        }
        Ok(())
    }

    /// Position-range fast-forward is not part of this reader's contract
    async fn fast_forward_to(&mut self, _range: PositionRange) -> Result<()> {
        Err(Error::unsupported(
            "cache reader cannot fast-forward to a position range",
        ))
    }

    async fn fast_forward_to_partition(&mut self, _range: &PartitionRange) -> Result<()> {
        self.buffer.clear();
        self.buffer.set_end_of_stream(true);
        self.state = ReaderState::EndOfStream;
        Ok(())
    }

    /// Join the close of the owned context (if any) and of the engaged
    /// underlying holder (if any); idempotent
    async fn close(&mut self) -> Result<()> {
        let mut underlying = self.underlying.take();
        let close_underlying = async {
            match underlying.as_mut() {
                Some(reader) => reader.close().await,
                None => Ok(()),
            }
        };
        let close_context = async {
            if let ContextHolder::Owned(ctx) = &self.ctx {
                ctx.close().await;
            }
        };
        let (result, ()) = futures::join!(close_underlying, close_context);
        result
    }
}
