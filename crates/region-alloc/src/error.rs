//! Allocator Error Types
//!
//! Construction is the only fallible surface that carries an error value.
//! Hot-path failures stay plain: `allocate`/`create` report exhaustion with
//! `None`, `release`/`destroy` report foreign pointers with `false`.

use thiserror::Error;

/// Errors reported while building an allocator region
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Requested capacity was zero
    #[error("capacity must be greater than zero")]
    ZeroCapacity,

    /// Requested chunk limit was zero
    #[error("chunk limit must be greater than zero")]
    ZeroChunkLimit,

    /// Backing layout could not be computed
    #[error("invalid backing layout: {bytes} bytes aligned to {align}")]
    InvalidLayout {
        /// The number of bytes the region asked for
        bytes: usize,
        /// The alignment the region asked for
        align: usize,
    },

    /// The system allocator refused the backing buffer
    #[error("failed to allocate {bytes} bytes of backing memory")]
    BackingAllocationFailed {
        /// The number of bytes that could not be allocated
        bytes: usize,
    },
}

/// Result type for allocator construction
pub type PoolResult<T> = Result<T, PoolError>;
