//! Error types for strata-db-cache

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Cache reader error type
#[derive(Error, Debug)]
pub enum Error {
    /// Operation not supported by this reader
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Allocation failed while populating the cache
    ///
    /// Never surfaced to the caller of the reader: population degrades to an
    /// emission-only path and the read continues from the underlying source.
    #[error("Memory exhausted: {0}")]
    MemoryExhausted(String),

    /// Failure reported by the underlying source, propagated unchanged
    #[error("Underlying source error: {0}")]
    Underlying(String),

    /// Cache state error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Create a memory-exhaustion error
    pub fn memory(msg: impl Into<String>) -> Self {
        Error::MemoryExhausted(msg.into())
    }

    /// Create an underlying-source error
    pub fn underlying(msg: impl Into<String>) -> Self {
        Error::Underlying(msg.into())
    }

    /// Create a cache error
    pub fn cache(msg: impl Into<String>) -> Self {
        Error::Cache(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// True for the population allocation-failure kind
    #[inline]
    pub fn is_memory_exhausted(&self) -> bool {
        matches!(self, Error::MemoryExhausted(_))
    }
}
