//! Read context: everything one partition read needs from its surroundings
//!
//! A [`ReadContext`] bundles the permit, the cache handle, the read
//! direction, the observed phase, and access to the underlying source. A
//! reader either borrows the context from its creator or owns it; the
//! tagged [`ContextHolder`] records which, and `close()` only closes what
//! the reader owns.

use crate::error::Result;
use crate::partition::{Phase, PartitionKey, RowCache};
use crate::source::MutationReader;
use async_trait::async_trait;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Admission token for one read, carrying the preemption interval
#[derive(Clone)]
pub struct ReadPermit {
    inner: Arc<PermitInner>,
}

struct PermitInner {
    /// Yield after this many emission steps; `None` never preempts
    preempt_interval: Option<NonZeroU64>,
    ops: AtomicU64,
}

impl ReadPermit {
    /// Permit that never asks for preemption
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PermitInner {
                preempt_interval: None,
                ops: AtomicU64::new(0),
            }),
        }
    }

    /// Permit that requests a yield every `interval` emission steps
    pub fn with_preempt_interval(interval: u64) -> Self {
        Self {
            inner: Arc::new(PermitInner {
                preempt_interval: NonZeroU64::new(interval),
                ops: AtomicU64::new(0),
            }),
        }
    }

    /// True when the reader should yield back to the caller
    pub fn need_preempt(&self) -> bool {
        match self.inner.preempt_interval {
            Some(interval) => {
                let n = self.inner.ops.fetch_add(1, Ordering::Relaxed) + 1;
                n % interval.get() == 0
            }
            None => false,
        }
    }
}

impl Default for ReadPermit {
    fn default() -> Self {
        Self::new()
    }
}

/// Supplier of the underlying reader for one partition
#[async_trait]
pub trait UnderlyingFactory: Send + Sync {
    /// Open the underlying reader; called lazily, at most once per read
    async fn open(&self) -> Result<Box<dyn MutationReader>>;

    /// Whether the partition exists in the underlying source at all
    fn partition_exists(&self) -> bool {
        true
    }
}

/// Per-read state shared between the cache and the reader
pub struct ReadContext {
    cache: Arc<RowCache>,
    key: PartitionKey,
    reversed: bool,
    digest_requested: bool,
    phase: Phase,
    permit: ReadPermit,
    underlying: Box<dyn UnderlyingFactory>,
    closed: AtomicBool,
}

impl ReadContext {
    /// Context for reading `key`, observing the cache's current phase
    pub fn new(
        cache: Arc<RowCache>,
        key: PartitionKey,
        underlying: Box<dyn UnderlyingFactory>,
    ) -> Self {
        let phase = cache.phase_of(&key);
        Self {
            cache,
            key,
            reversed: false,
            digest_requested: false,
            phase,
            permit: ReadPermit::new(),
            underlying,
            closed: AtomicBool::new(false),
        }
    }

    /// Read in reversed clustering order
    pub fn with_reversed(mut self, reversed: bool) -> Self {
        self.reversed = reversed;
        self
    }

    /// Request digest computation for produced rows
    pub fn with_digest_requested(mut self, digest_requested: bool) -> Self {
        self.digest_requested = digest_requested;
        self
    }

    /// Use a specific permit
    pub fn with_permit(mut self, permit: ReadPermit) -> Self {
        self.permit = permit;
        self
    }

    /// The cache being read through
    pub fn cache(&self) -> &Arc<RowCache> {
        &self.cache
    }

    /// The partition key being read
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Whether clustering order is inverted
    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    /// Whether row digests were requested
    pub fn digest_requested(&self) -> bool {
        self.digest_requested
    }

    /// Phase observed when the read was admitted
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The read's permit
    pub fn permit(&self) -> &ReadPermit {
        &self.permit
    }

    /// Whether the partition exists in the underlying source
    pub fn partition_exists(&self) -> bool {
        self.underlying.partition_exists()
    }

    /// Open the underlying reader
    pub async fn open_underlying(&self) -> Result<Box<dyn MutationReader>> {
        self.underlying.open().await
    }

    /// Release the context; idempotent, never fails
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// True once closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Who owns the read context
///
/// The cache outlives both forms; a tagged holder avoids shared-ownership
/// cycles between the reader, the context, and the cache.
pub enum ContextHolder<'a> {
    /// The caller keeps ownership and closes the context itself
    Borrowed(&'a ReadContext),
    /// The reader owns the context and closes it in `close()`
    Owned(Box<ReadContext>),
}

impl ContextHolder<'_> {
    /// Access the context either way
    pub fn get(&self) -> &ReadContext {
        match self {
            ContextHolder::Borrowed(ctx) => ctx,
            ContextHolder::Owned(ctx) => ctx,
        }
    }

    /// True for the owning form
    pub fn is_owned(&self) -> bool {
        matches!(self, ContextHolder::Owned(_))
    }
}

impl<'a> From<&'a ReadContext> for ContextHolder<'a> {
    fn from(ctx: &'a ReadContext) -> Self {
        ContextHolder::Borrowed(ctx)
    }
}

impl From<Box<ReadContext>> for ContextHolder<'static> {
    fn from(ctx: Box<ReadContext>) -> Self {
        ContextHolder::Owned(ctx)
    }
}
