//! Mutation fragment stream interface
//!
//! [`MutationReader`] is the driver surface shared by the cache reader and
//! the underlying sources it consumes. Implementations own a
//! [`FragmentBuffer`]; `fill_buffer` produces into it and the provided
//! `peek`/`next_fragment` helpers drain it.
//!
//! ## Contract for underlying sources
//!
//! An underlying source consumed by the cache reader must:
//!
//! - yield the partition's static row (if any) from `next_fragment` *before*
//!   the first fast-forward, then report exhaustion;
//! - after `fast_forward_to([a, b))`, yield clustering rows and
//!   range-tombstone changes with positions inside the window in query
//!   order, emitting a leading change at `a` when a tombstone is active
//!   there and a closing change at `b` when one is still active at the end;
//! - report exhaustion (`next_fragment` returning `None`) at the end of each
//!   window, until fast-forwarded again.

use crate::error::Result;
use crate::fragment::Fragment;
use crate::partition::PartitionRange;
use crate::position::PositionRange;
use async_trait::async_trait;
use std::collections::VecDeque;

/// Default number of fragments a reader buffers per fill
pub const DEFAULT_BUFFER_CAPACITY: usize = 32;

/// Output buffer shared by reader implementations
pub struct FragmentBuffer {
    queue: VecDeque<Fragment>,
    capacity: usize,
    end_of_stream: bool,
}

impl FragmentBuffer {
    /// Buffer holding up to `capacity` fragments per fill
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            end_of_stream: false,
        }
    }

    /// Change the fill target
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    /// Append a fragment; the buffer accepts overshoot past capacity
    pub fn push(&mut self, fragment: Fragment) {
        self.queue.push_back(fragment);
    }

    /// Remove and return the oldest fragment
    pub fn pop(&mut self) -> Option<Fragment> {
        self.queue.pop_front()
    }

    /// Oldest fragment without removing it
    pub fn front(&self) -> Option<&Fragment> {
        self.queue.front()
    }

    /// True once the fill target is reached
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Buffered fragment count
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Drop buffered fragments up to the next partition boundary
    ///
    /// Single-partition readers have no next boundary, so everything goes.
    pub fn clear_to_next_partition(&mut self) {
        self.queue.clear();
    }

    /// Whether the producer finished
    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Mark or unmark the producer as finished
    pub fn set_end_of_stream(&mut self, end: bool) {
        self.end_of_stream = end;
    }
}

/// A producer of mutation fragments for one partition
#[async_trait]
pub trait MutationReader: Send {
    /// The reader's output buffer
    fn buffer(&self) -> &FragmentBuffer;

    /// The reader's output buffer, mutably
    fn buffer_mut(&mut self) -> &mut FragmentBuffer;

    /// Produce fragments until the buffer is full or the stream ends
    async fn fill_buffer(&mut self) -> Result<()>;

    /// Restrict the stream to a clustering window
    async fn fast_forward_to(&mut self, range: PositionRange) -> Result<()>;

    /// Skip to a partition-key range
    async fn fast_forward_to_partition(&mut self, range: &PartitionRange) -> Result<()>;

    /// Skip the rest of the current partition
    async fn next_partition(&mut self) -> Result<()> {
        let buffer = self.buffer_mut();
        buffer.clear_to_next_partition();
        if buffer.is_empty() {
            buffer.set_end_of_stream(true);
        }
        Ok(())
    }

    /// Release owned resources; idempotent
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Remove and return the oldest buffered fragment
    fn pop_fragment(&mut self) -> Option<Fragment> {
        self.buffer_mut().pop()
    }

    /// True when nothing is buffered
    fn is_buffer_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    /// True once the producer finished and the buffer drained
    fn is_end_of_stream(&self) -> bool {
        self.buffer().end_of_stream() && self.buffer().is_empty()
    }

    /// Next fragment without consuming it, filling as needed
    async fn peek(&mut self) -> Result<Option<&Fragment>> {
        while self.buffer().is_empty() && !self.buffer().end_of_stream() {
            self.fill_buffer().await?;
        }
        Ok(self.buffer().front())
    }

    /// Produce and consume the next fragment
    ///
    /// `None` marks the end of the current window (for fast-forwarded
    /// sources) or of the stream.
    async fn next_fragment(&mut self) -> Result<Option<Fragment>> {
        while self.buffer().is_empty() && !self.buffer().end_of_stream() {
            self.fill_buffer().await?;
        }
        Ok(self.buffer_mut().pop())
    }
}
