//! # Strata DB Cache
//!
//! Read-through, continuity-tracking row cache reader for the Strata
//! wide-column store.
//!
//! This crate provides:
//! - Position algebra over clustering space, in forward and reversed domains
//! - A versioned partition snapshot model with region-backed reference
//!   invalidation
//! - The streaming [`CacheRowReader`]: serves clustering rows and
//!   range-tombstone changes from a cache snapshot, fetches missing
//!   intervals from an underlying source, and installs them back with
//!   continuity markers so repeated reads stay in cache
//!
//! ## Design Principles
//!
//! 1. **Async at the I/O seam only**: the underlying source is async;
//!    traversal of in-memory cache state is synchronous, inside scoped
//!    allocator sections that never span an `.await`
//! 2. **Handles, not pointers**: cursors and weak references re-locate by
//!    position after invalidation instead of dangling
//! 3. **Explicit state machine**: transitions between cache and underlying
//!    reads are an enum with checkable invariants, not ad-hoc branching
//!
//! ## Example
//!
//! ```ignore
//! use strata_db_cache::{CacheRowReader, MutationReader, ReadContext, RowRange};
//!
//! let snapshot = cache.snapshot(&key);
//! let ctx = Box::new(ReadContext::new(cache.clone(), key.clone(), underlying));
//! let mut reader = CacheRowReader::new(schema, key, ranges, ctx, snapshot, &cache);
//! reader.fill_buffer().await?;
//! while let Some(fragment) = reader.pop_fragment() {
//!     // consume the stream
//! }
//! ```

pub mod position;
pub mod tombstone;
pub mod fragment;
pub mod partition;
pub mod tracker;
pub mod section;
pub mod cursor;
pub mod weakref;
pub mod context;
pub mod source;
pub mod reader;
pub mod error;

// Re-export main types
pub use context::{ContextHolder, ReadContext, ReadPermit, UnderlyingFactory};
pub use cursor::RowCursor;
pub use error::{Error, Result};
pub use fragment::{Fragment, Row};
pub use partition::{
    EntryId, PartitionKey, PartitionRange, PartitionSnapshot, Phase, Region, RowCache, RowEntry,
    Schema, VersionId,
};
pub use position::{
    ClusteringKey, Position, PositionCmp, PositionRange, RangeBound, RowRange, Weight,
};
pub use reader::CacheRowReader;
pub use section::{LsaManager, ReadSection, UpdateSection};
pub use source::{FragmentBuffer, MutationReader, DEFAULT_BUFFER_CAPACITY};
pub use tombstone::Tombstone;
pub use tracker::{CacheTracker, TrackerStats};
pub use weakref::RowWeakref;
