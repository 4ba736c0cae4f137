//! Region-Style Memory Allocators
//!
//! Preallocated, bounded memory carved out once and recycled in O(1), for
//! hot paths that cannot afford the general-purpose heap:
//! - [`BlockPool`]: fixed-capacity blocks over an intrusive LIFO free list,
//!   with a lock-free concurrent flavor
//! - [`ChainedPool`]: a chain of block pools that grows on exhaustion and
//!   retires drained chunks into a single reserve slot for reuse
//! - [`StackRegion`] / [`DualStackRegion`]: bump regions with marker-based
//!   LIFO rewind
//!
//! Every allocator comes in a single-threaded and a concurrent flavor built
//! from the same code, selected by a [`ThreadPolicy`] type parameter. The
//! single-threaded flavor compiles its synchronization down to plain loads
//! and stores.
//!
//! ## Core Design Principles
//!
//! 1. **No hidden heap traffic**: backing buffers are sized at construction;
//!    steady-state operation never calls the system allocator
//! 2. **Intrusive bookkeeping**: free-list links and owning-chunk trailers
//!    live inside the blocks they describe, not in side tables
//! 3. **Errors are values**: exhaustion is `None`, foreign pointers are
//!    `false`; nothing panics on a recoverable condition
//! 4. **Structure changes are rare**: chained pools take a readers-writer
//!    spinlock only to grow or retire chunks, never per block

#![warn(missing_docs)]

mod cell;

pub mod block_pool;
pub mod chained_pool;
pub mod error;
pub mod stack_region;
pub mod sync;

pub use crate::block_pool::{BlockPool, ConcurrentBlockPool, PoolRef};
pub use crate::chained_pool::{ChainRef, ChainStats, ChainedPool, ConcurrentChainedPool};
pub use crate::error::{PoolError, PoolResult};
pub use crate::stack_region::{
    ConcurrentStackRegion, DualStackRegion, Marker, ScopedMarker, StackRegion,
};
pub use crate::sync::{MultiThread, RwSpinLock, SingleThread, ThreadPolicy};
