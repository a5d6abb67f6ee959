//! Shared test harness: an in-memory underlying source and reader builders

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_db_cache::{
    CacheRowReader, ClusteringKey, Error, Fragment, FragmentBuffer, MutationReader, PartitionKey,
    PartitionRange, Position, PositionCmp, PositionRange, ReadContext, ReadPermit, Result, Row,
    RowCache, RowRange, Schema, Tombstone, UnderlyingFactory,
};

/// Counters shared between a factory and the readers it opens
#[derive(Default)]
pub struct SourceStats {
    pub opens: AtomicU64,
    pub fast_forwards: AtomicU64,
}

impl SourceStats {
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn fast_forwards(&self) -> u64 {
        self.fast_forwards.load(Ordering::Relaxed)
    }
}

/// Underlying source backed by a fixed fragment list in query order
pub struct MemoryFactory {
    fragments: Vec<Fragment>,
    static_row: Option<Row>,
    reversed: bool,
    partition_exists: bool,
    stats: Arc<SourceStats>,
}

#[async_trait]
impl UnderlyingFactory for MemoryFactory {
    async fn open(&self) -> Result<Box<dyn MutationReader>> {
        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryReader::new(
            self.fragments.clone(),
            self.static_row.clone(),
            self.reversed,
            self.stats.clone(),
        )))
    }

    fn partition_exists(&self) -> bool {
        self.partition_exists
    }
}

/// Factory that fails the test if the reader ever consults the underlying
pub struct ForbiddenUnderlying;

#[async_trait]
impl UnderlyingFactory for ForbiddenUnderlying {
    async fn open(&self) -> Result<Box<dyn MutationReader>> {
        Err(Error::underlying("underlying source must not be consulted"))
    }
}

/// Windowed reader over the factory's fragments
///
/// Implements the protocol the cache reader expects: the static row before
/// the first fast-forward; after `fast_forward_to([a, b))` the in-window
/// fragments, with a leading tombstone change at `a` when one is active
/// there and a closing change at `b` when one is active at the end.
pub struct MemoryReader {
    buffer: FragmentBuffer,
    fragments: Vec<Fragment>,
    pending: VecDeque<Fragment>,
    cmp: PositionCmp,
    stats: Arc<SourceStats>,
}

impl MemoryReader {
    fn new(
        fragments: Vec<Fragment>,
        static_row: Option<Row>,
        reversed: bool,
        stats: Arc<SourceStats>,
    ) -> Self {
        let mut pending = VecDeque::new();
        if let Some(row) = static_row {
            pending.push_back(Fragment::StaticRow { row });
        }
        Self {
            buffer: FragmentBuffer::new(8),
            fragments,
            pending,
            cmp: PositionCmp::new(reversed),
            stats,
        }
    }

    fn window_fragments(&self, range: &PositionRange) -> VecDeque<Fragment> {
        let mut out = VecDeque::new();
        let mut active: Option<Tombstone> = None;
        let mut opened = false;
        for fragment in &self.fragments {
            let pos = fragment.position();
            if self.cmp.lt(&pos, &range.start) {
                if let Fragment::RangeTombstoneChange { tombstone, .. } = fragment {
                    active = *tombstone;
                }
                continue;
            }
            if self.cmp.ge(&pos, &range.end) {
                break;
            }
            if !opened {
                opened = true;
                if active.is_some() {
                    out.push_back(Fragment::RangeTombstoneChange {
                        position: range.start.clone(),
                        tombstone: active,
                    });
                }
            }
            if let Fragment::RangeTombstoneChange { tombstone, .. } = fragment {
                active = *tombstone;
            }
            out.push_back(fragment.clone());
        }
        if !opened && active.is_some() {
            out.push_back(Fragment::RangeTombstoneChange {
                position: range.start.clone(),
                tombstone: active,
            });
        }
        if active.is_some() {
            out.push_back(Fragment::RangeTombstoneChange {
                position: range.end.clone(),
                tombstone: None,
            });
        }
        out
    }
}

#[async_trait]
impl MutationReader for MemoryReader {
    fn buffer(&self) -> &FragmentBuffer {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut FragmentBuffer {
        &mut self.buffer
    }

    async fn fill_buffer(&mut self) -> Result<()> {
        while !self.buffer.is_full() {
            match self.pending.pop_front() {
                Some(fragment) => self.buffer.push(fragment),
                None => break,
            }
        }
        if self.pending.is_empty() {
            self.buffer.set_end_of_stream(true);
        }
        Ok(())
    }

    async fn fast_forward_to(&mut self, range: PositionRange) -> Result<()> {
        self.stats.fast_forwards.fetch_add(1, Ordering::Relaxed);
        self.pending = self.window_fragments(&range);
        self.buffer.clear();
        self.buffer.set_end_of_stream(false);
        Ok(())
    }

    async fn fast_forward_to_partition(&mut self, _range: &PartitionRange) -> Result<()> {
        self.pending.clear();
        self.buffer.clear();
        self.buffer.set_end_of_stream(true);
        Ok(())
    }
}

/// Builder wiring a cache, a memory underlying, and a reader together
pub struct ReaderBuilder {
    pub cache: Arc<RowCache>,
    pub key: PartitionKey,
    pub fragments: Vec<Fragment>,
    pub static_row: Option<Row>,
    pub ranges: Vec<RowRange>,
    pub reversed: bool,
    pub partition_exists: bool,
    pub buffer_capacity: Option<usize>,
    pub permit: Option<ReadPermit>,
    pub stats: Arc<SourceStats>,
}

impl ReaderBuilder {
    pub fn new() -> Self {
        Self::with_schema(Schema::new("test_table"))
    }

    pub fn with_schema(schema: Schema) -> Self {
        Self {
            cache: Arc::new(RowCache::new(Arc::new(schema))),
            key: PartitionKey::new(&b"pk0"[..]),
            fragments: Vec::new(),
            static_row: None,
            ranges: Vec::new(),
            reversed: false,
            partition_exists: true,
            buffer_capacity: None,
            permit: None,
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn fragments(mut self, fragments: Vec<Fragment>) -> Self {
        self.fragments = fragments;
        self
    }

    pub fn static_row(mut self, row: Row) -> Self {
        self.static_row = Some(row);
        self
    }

    pub fn ranges(mut self, ranges: Vec<RowRange>) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }

    pub fn absent_partition(mut self) -> Self {
        self.partition_exists = false;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    pub fn permit(mut self, permit: ReadPermit) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Build a reader over the shared cache; call again for a repeat read
    pub fn build(&self) -> CacheRowReader<'static> {
        let factory = MemoryFactory {
            fragments: self.fragments.clone(),
            static_row: self.static_row.clone(),
            reversed: self.reversed,
            partition_exists: self.partition_exists,
            stats: self.stats.clone(),
        };
        self.build_with_factory(Box::new(factory))
    }

    /// Build a reader that must be served from cache alone
    pub fn build_cache_only(&self) -> CacheRowReader<'static> {
        self.build_with_factory(Box::new(ForbiddenUnderlying))
    }

    fn build_with_factory(&self, factory: Box<dyn UnderlyingFactory>) -> CacheRowReader<'static> {
        let snapshot = self.cache.snapshot(&self.key);
        let mut ctx =
            ReadContext::new(self.cache.clone(), self.key.clone(), factory).with_reversed(self.reversed);
        if let Some(permit) = &self.permit {
            ctx = ctx.with_permit(permit.clone());
        }
        let mut reader = CacheRowReader::new(
            self.cache.schema().clone(),
            self.key.clone(),
            self.ranges.clone(),
            Box::new(ctx),
            snapshot,
            &self.cache,
        );
        if let Some(capacity) = self.buffer_capacity {
            reader = reader.with_buffer_capacity(capacity);
        }
        reader
    }
}

pub fn k(v: i64) -> ClusteringKey {
    ClusteringKey::from_int(v)
}

pub fn key_int(key: &ClusteringKey) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(key.as_bytes());
    (u64::from_be_bytes(buf) ^ (1 << 63)) as i64
}

pub fn sample_row(v: i64) -> Row {
    Row::new().with_cell("v", v.to_string())
}

pub fn row_frag(v: i64) -> Fragment {
    Fragment::ClusteringRow {
        key: k(v),
        row: sample_row(v),
    }
}

/// Change fragment at `before(key)`
pub fn rtc_before(v: i64, tombstone: Option<Tombstone>) -> Fragment {
    Fragment::RangeTombstoneChange {
        position: Position::before_key(k(v)),
        tombstone,
    }
}

/// Drain the whole stream
pub async fn drain(reader: &mut CacheRowReader<'_>) -> Vec<Fragment> {
    let mut out = Vec::new();
    while !reader.is_end_of_stream() {
        reader.fill_buffer().await.expect("fill_buffer failed");
        while let Some(fragment) = reader.pop_fragment() {
            out.push(fragment);
        }
    }
    out
}

/// Clustering-row keys of a fragment sequence, as integers
pub fn row_keys(fragments: &[Fragment]) -> Vec<i64> {
    fragments
        .iter()
        .filter_map(|f| match f {
            Fragment::ClusteringRow { key, .. } => Some(key_int(key)),
            _ => None,
        })
        .collect()
}

/// Clustering rows and tombstone changes only
pub fn body(fragments: &[Fragment]) -> Vec<Fragment> {
    fragments
        .iter()
        .filter(|f| f.is_clustering_row() || f.is_range_tombstone_change())
        .cloned()
        .collect()
}

/// What a reversed read must emit, computed from a forward emission
///
/// Rows reverse directly. A change at position `p` introducing tombstone `t`
/// becomes, in the reversed stream, a change at `p.reversed()` introducing
/// whatever was active *before* `p` in the forward stream.
pub fn reverse_expected(forward_body: &[Fragment]) -> Vec<Fragment> {
    let mut active: Option<Tombstone> = None;
    let mut out = Vec::new();
    for fragment in forward_body {
        match fragment {
            Fragment::ClusteringRow { .. } => out.push(fragment.clone()),
            Fragment::RangeTombstoneChange { position, tombstone } => {
                out.push(Fragment::RangeTombstoneChange {
                    position: position.reversed(),
                    tombstone: active,
                });
                active = *tombstone;
            }
            _ => {}
        }
    }
    out.reverse();
    out
}

/// Assert fragment positions strictly increase and tombstone changes form an
/// at-most-one-open sequence starting and ending closed
pub fn assert_well_formed(fragments: &[Fragment], reversed: bool) {
    let cmp = PositionCmp::new(reversed);
    assert!(
        matches!(fragments.first(), Some(Fragment::PartitionStart { .. })),
        "stream must open with partition start"
    );
    assert!(
        matches!(fragments.last(), Some(Fragment::PartitionEnd)),
        "stream must close with partition end"
    );
    let starts = fragments
        .iter()
        .filter(|f| matches!(f, Fragment::PartitionStart { .. }))
        .count();
    let ends = fragments
        .iter()
        .filter(|f| matches!(f, Fragment::PartitionEnd))
        .count();
    assert_eq!((starts, ends), (1, 1), "exactly one start and one end");

    let body = body(fragments);
    let mut last_row_pos: Option<Position> = None;
    let mut active: Option<Tombstone> = None;
    for fragment in &body {
        let pos = fragment.position();
        if let Some(prev) = &last_row_pos {
            if fragment.is_clustering_row() {
                assert!(
                    cmp.lt(prev, &pos),
                    "row positions must strictly increase: {:?} then {:?}",
                    prev,
                    pos
                );
            } else {
                assert!(
                    cmp.le(prev, &pos),
                    "change must not precede earlier output: {:?} then {:?}",
                    prev,
                    pos
                );
            }
        }
        if fragment.is_clustering_row() {
            last_row_pos = Some(pos);
        } else if let Fragment::RangeTombstoneChange { position, tombstone } = fragment {
            if tombstone.is_none() {
                assert!(active.is_some(), "closing an already-closed tombstone");
            }
            active = *tombstone;
            last_row_pos = Some(position.clone());
        }
    }
    assert!(active.is_none(), "stream ended with an open tombstone");
}
