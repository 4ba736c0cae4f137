//! Growable pools built from chains of fixed block pools
//!
//! A chained pool owns an ordered list of chunks, each a [`BlockPool`] plus a
//! live-allocation counter. Allocation walks the chain in insertion order and
//! grows it when every chunk is full; a chunk whose live count drains to zero
//! is retired into a single reserve slot and reused before any fresh chunk is
//! built. Chunk records themselves come from a meta pool sized at the chunk
//! limit, so the chain never touches the heap after the chunks exist.
//!
//! Concurrency model:
//! - per-chunk free lists run the lock-free block-pool protocol on their own
//! - chain structure and the reserve slot change only under the write side
//!   of a readers-writer spinlock
//! - the allocate fast path holds the read side only; growth re-validates
//!   the chain length under the write side, retirement re-validates the
//!   live count

use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use tracing::{debug, trace, warn};

use crate::block_pool::BlockPool;
use crate::error::{PoolError, PoolResult};
use crate::sync::{CountSlot, MultiThread, RegionGate, SingleThread, ThreadPolicy};

/// Block layout inside a chunk: the caller's payload followed by a trailer
/// naming the owning chunk. `repr(C)` places the trailer at the first
/// suitably aligned offset past the payload.
#[repr(C)]
struct Slot<T, P: ThreadPolicy> {
    payload: ManuallyDrop<T>,
    owner: *mut Chunk<T, P>,
}

/// One link of the chain: a block pool plus the count of its live blocks.
struct Chunk<T, P: ThreadPolicy> {
    pool: BlockPool<Slot<T, P>, P>,
    live: P::Counter,
}

impl<T, P: ThreadPolicy> Chunk<T, P> {
    fn new(capacity: usize) -> PoolResult<Self> {
        Ok(Self {
            pool: BlockPool::new(capacity)?,
            live: CountSlot::new(0),
        })
    }
}

/// Chain structure. Mutated only under the write gate.
struct ChainLinks<T, P: ThreadPolicy> {
    active: Vec<NonNull<Chunk<T, P>>>,
    reserved: Option<NonNull<Chunk<T, P>>>,
}

/// A pool that grows by whole chunks and shrinks by retiring empty ones.
///
/// `chunk_capacity` blocks per chunk, at most `max_chunks` chunks alive at
/// once (counting the reserve slot). Exhaustion is reported with `None` once
/// the chunk limit is reached and no chunk has room.
pub struct ChainedPool<T, P: ThreadPolicy = SingleThread> {
    meta: BlockPool<Chunk<T, P>, SingleThread>,
    links: UnsafeCell<ChainLinks<T, P>>,
    gate: P::Gate,
    chunk_capacity: usize,
}

/// Concurrent flavor of [`ChainedPool`].
pub type ConcurrentChainedPool<T> = ChainedPool<T, MultiThread>;

unsafe impl<T: Send, P: ThreadPolicy> Send for ChainedPool<T, P> {}
unsafe impl<T: Send> Sync for ChainedPool<T, MultiThread> {}

impl<T, P: ThreadPolicy> ChainedPool<T, P> {
    /// Creates a pool with one chunk already in the chain.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ZeroCapacity`] when `chunk_capacity` is zero and
    /// [`PoolError::ZeroChunkLimit`] when `max_chunks` is zero.
    pub fn new(chunk_capacity: usize, max_chunks: usize) -> PoolResult<Self> {
        if chunk_capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        if max_chunks == 0 {
            return Err(PoolError::ZeroChunkLimit);
        }

        let meta = BlockPool::new(max_chunks)?;
        let first = meta
            .create(Chunk::new(chunk_capacity)?)
            .expect("fresh meta pool cannot be full");

        let mut active = Vec::with_capacity(max_chunks);
        active.push(first);

        Ok(Self {
            meta,
            links: UnsafeCell::new(ChainLinks {
                active,
                reserved: None,
            }),
            gate: Default::default(),
            chunk_capacity,
        })
    }

    /// Hands out one uninitialized block, or `None` at the chunk cap.
    ///
    /// Walks the chain in insertion order under the read gate; on a full
    /// traversal, takes the write gate, re-validates that the chain did not
    /// change in between, then promotes the reserve chunk or builds a fresh
    /// one and retries the fast path.
    pub fn allocate(&self) -> Option<NonNull<T>> {
        loop {
            let seen_chunks = {
                let _gate = self.gate.read();
                let links = unsafe { &*self.links.get() };
                for &chunk in &links.active {
                    let record = unsafe { chunk.as_ref() };
                    if let Some(slot) = record.pool.allocate() {
                        let slot_ptr = slot.as_ptr();
                        unsafe { ptr::addr_of_mut!((*slot_ptr).owner).write(chunk.as_ptr()) };
                        record.live.incr();
                        let payload = unsafe { ptr::addr_of_mut!((*slot_ptr).payload) };
                        return Some(unsafe { NonNull::new_unchecked(payload.cast::<T>()) });
                    }
                }
                links.active.len()
            };

            let _gate = self.gate.write();
            let links = unsafe { &mut *self.links.get() };
            if links.active.len() != seen_chunks {
                // Another thread grew or shrank the chain while the read
                // gate was down; the fast path may succeed now.
                continue;
            }

            if let Some(reserved) = links.reserved.take() {
                links.active.push(reserved);
                trace!("promoted reserve chunk back into the chain");
                continue;
            }

            match Chunk::new(self.chunk_capacity)
                .ok()
                .and_then(|chunk| self.meta.create(chunk))
            {
                Some(chunk) => {
                    links.active.push(chunk);
                    debug!("grew chain to {} chunks", links.active.len());
                    continue;
                }
                None => {
                    warn!(
                        "chain at capacity: {} chunks of {} blocks",
                        self.meta.capacity(),
                        self.chunk_capacity
                    );
                    return None;
                }
            }
        }
    }

    /// Constructs `value` in a fresh block, or `None` at the chunk cap.
    pub fn create(&self, value: T) -> Option<NonNull<T>> {
        let block = self.allocate()?;
        unsafe { block.as_ptr().write(value) };
        Some(block)
    }

    /// Returns `block` to its owning chunk, retiring the chunk when its last
    /// live block goes.
    ///
    /// Returns `false` and mutates nothing when `block` does not belong to
    /// any chunk of this pool. Double release is not detected.
    ///
    /// # Safety
    ///
    /// `block` must be a pointer previously returned by this pool and not
    /// released since, or a foreign pointer whose trailer bytes (one chunk
    /// pointer past the payload) are still readable. Any payload must
    /// already be dead; this call does not run destructors.
    pub unsafe fn release(&self, block: NonNull<T>) -> bool {
        unsafe { self.reclaim(block, false) }
    }

    /// Runs `T`'s destructor in place, then releases the block.
    ///
    /// # Safety
    ///
    /// `block` must hold a live payload previously obtained from this pool
    /// and not released since, or be a pointer outside the pool entirely.
    pub unsafe fn destroy(&self, block: NonNull<T>) -> bool {
        unsafe { self.reclaim(block, true) }
    }

    /// Constructs `value` in a fresh block and leases it back.
    pub fn acquire(&self, value: T) -> Option<ChainRef<'_, T, P>> {
        let block = self.create(value)?;
        Some(ChainRef { block, pool: self })
    }

    /// Bytes handed out across every chunk plus the meta-pool records.
    pub fn used_memory(&self) -> usize {
        let _gate = self.gate.read();
        let links = unsafe { &*self.links.get() };
        let chunk_bytes: usize = links
            .active
            .iter()
            .chain(links.reserved.iter())
            .map(|chunk| unsafe { chunk.as_ref() }.pool.used_memory())
            .sum();
        self.meta.used_memory() + chunk_bytes
    }

    /// Snapshot of the chain for monitoring and tests.
    pub fn stats(&self) -> ChainStats {
        let _gate = self.gate.read();
        let links = unsafe { &*self.links.get() };
        ChainStats {
            active_chunks: links.active.len(),
            reserved_chunks: usize::from(links.reserved.is_some()),
            live_blocks: links
                .active
                .iter()
                .chain(links.reserved.iter())
                .map(|chunk| unsafe { chunk.as_ref() }.live.get())
                .sum(),
            chunk_capacity: self.chunk_capacity,
            max_chunks: self.meta.capacity(),
            meta_used_bytes: self.meta.used_memory(),
        }
    }

    /// Shared release/destroy path.
    unsafe fn reclaim(&self, block: NonNull<T>, run_drop: bool) -> bool {
        let slot = block.cast::<Slot<T, P>>();
        let owner = unsafe { ptr::addr_of!((*slot.as_ptr()).owner).read() };

        // The trailer must name a chunk this pool currently runs. A chunk
        // holding a live block cannot sit in the reserve slot, so the active
        // list is the whole search space.
        {
            let _gate = self.gate.read();
            let links = unsafe { &*self.links.get() };
            if !links.active.iter().any(|chunk| chunk.as_ptr() == owner) {
                return false;
            }
        }

        let chunk = unsafe { &*owner };
        if !chunk.pool.contains(slot) {
            return false;
        }

        if run_drop {
            unsafe { ptr::drop_in_place(block.as_ptr()) };
        }
        let released = unsafe { chunk.pool.release(slot) };
        debug_assert!(released, "owning chunk refused one of its own blocks");

        if chunk.live.decr() == 1 {
            self.retire(unsafe { NonNull::new_unchecked(owner) });
        }
        true
    }

    /// Moves a drained chunk out of the chain and into the reserve slot,
    /// destroying whatever the slot held before.
    fn retire(&self, chunk: NonNull<Chunk<T, P>>) {
        let _gate = self.gate.write();
        let links = unsafe { &mut *self.links.get() };

        // A concurrent allocation may have revived the chunk between the
        // decrement and the gate.
        if unsafe { chunk.as_ref() }.live.get() != 0 {
            return;
        }
        let Some(position) = links.active.iter().position(|&c| c == chunk) else {
            // A racing release already retired it.
            return;
        };

        if let Some(displaced) = links.reserved.take() {
            debug!("destroying displaced reserve chunk");
            let destroyed = unsafe { self.meta.destroy(displaced) };
            debug_assert!(destroyed, "reserve record outlived the meta pool");
        }
        links.active.remove(position);
        links.reserved = Some(chunk);
        trace!("retired drained chunk into the reserve slot");
    }
}

impl<T, P: ThreadPolicy> Drop for ChainedPool<T, P> {
    fn drop(&mut self) {
        let links = self.links.get_mut();
        for chunk in links.active.drain(..) {
            let destroyed = unsafe { self.meta.destroy(chunk) };
            debug_assert!(destroyed, "chain record outlived the meta pool");
        }
        if let Some(chunk) = links.reserved.take() {
            let destroyed = unsafe { self.meta.destroy(chunk) };
            debug_assert!(destroyed, "reserve record outlived the meta pool");
        }
    }
}

/// Point-in-time view of a chained pool's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStats {
    /// Chunks currently in the chain
    pub active_chunks: usize,
    /// One when the reserve slot is occupied, zero otherwise
    pub reserved_chunks: usize,
    /// Blocks handed out and not yet released, across all chunks
    pub live_blocks: usize,
    /// Blocks per chunk
    pub chunk_capacity: usize,
    /// Upper bound on simultaneously existing chunks
    pub max_chunks: usize,
    /// Bytes of meta-pool records backing the existing chunks
    pub meta_used_bytes: usize,
}

/// Lease over one chained-pool block.
///
/// Dereferences to the payload and hands the block back on drop, running the
/// payload's destructor first.
pub struct ChainRef<'a, T, P: ThreadPolicy = SingleThread> {
    block: NonNull<T>,
    pool: &'a ChainedPool<T, P>,
}

unsafe impl<T: Send> Send for ChainRef<'_, T, MultiThread> {}

impl<T, P: ThreadPolicy> Deref for ChainRef<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.block.as_ref() }
    }
}

impl<T, P: ThreadPolicy> DerefMut for ChainRef<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.block.as_mut() }
    }
}

impl<T, P: ThreadPolicy> Drop for ChainRef<'_, T, P> {
    fn drop(&mut self) {
        let destroyed = unsafe { self.pool.destroy(self.block) };
        debug_assert!(destroyed, "leased block no longer belongs to its pool");
    }
}
