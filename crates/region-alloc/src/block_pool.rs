//! Fixed-capacity block pools with an intrusive free list
//!
//! Performance characteristics:
//! - `allocate`: O(1), lock-free in the concurrent flavor
//! - `release`: O(1), wait-free on the uncontended path
//! - No heap traffic after construction
//! - Free-list links live inside the cells they describe
//!
//! The pool hands out raw block addresses; object lifetime stays with the
//! caller unless the `create`/`destroy` pair or a [`PoolRef`] lease is used.

use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use crate::cell::StorageCell;
use crate::error::{PoolError, PoolResult};
use crate::sync::{CountSlot, MultiThread, PtrSlot, SingleThread, ThreadPolicy};

/// A pool of `capacity` equally sized blocks, recycled in LIFO order.
///
/// The single-threaded flavor (`BlockPool<T>`) compiles the free-list
/// operations down to plain pointer moves. The concurrent flavor
/// ([`ConcurrentBlockPool`]) runs the same algorithm over an atomic head:
/// `allocate` is a compare-and-swap loop that pops the head, `release` one
/// that pushes it back.
///
/// An ABA hand-over between the head load and the swap is tolerated rather
/// than prevented. The backing buffer is never deallocated while the pool
/// lives, so a stale competitor dereferences valid cells at worst and loses
/// its swap in the common case. No generation tags are carried.
pub struct BlockPool<T, P: ThreadPolicy = SingleThread> {
    cells: Box<[StorageCell<T, P>]>,
    head: P::Ptr<StorageCell<T, P>>,
    in_use: P::Counter,
}

/// Concurrent flavor of [`BlockPool`].
pub type ConcurrentBlockPool<T> = BlockPool<T, MultiThread>;

unsafe impl<T: Send, P: ThreadPolicy> Send for BlockPool<T, P> {}
unsafe impl<T: Send> Sync for BlockPool<T, MultiThread> {}

impl<T, P: ThreadPolicy> BlockPool<T, P> {
    /// Creates a pool with every cell chained onto the free list.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ZeroCapacity`] when `capacity` is zero.
    pub fn new(capacity: usize) -> PoolResult<Self> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }

        let mut cells = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            cells.push(StorageCell::new_free());
        }
        let cells = cells.into_boxed_slice();

        // Chain cell i onto cell i + 1, last cell terminates the list.
        for index in 0..capacity - 1 {
            let next = &cells[index + 1] as *const StorageCell<T, P> as *mut StorageCell<T, P>;
            unsafe { cells[index].set_link(next) };
        }
        unsafe { cells[capacity - 1].set_link(ptr::null_mut()) };

        let head: P::Ptr<StorageCell<T, P>> =
            PtrSlot::new(&cells[0] as *const StorageCell<T, P> as *mut StorageCell<T, P>);

        Ok(Self {
            cells,
            head,
            in_use: CountSlot::new(0),
        })
    }

    /// Pops the head cell off the free list.
    ///
    /// The concurrent flavor re-reads the head on a failed swap and must
    /// re-check for exhaustion: another thread may have drained the pool
    /// between the load and the swap.
    fn pop_cell(&self) -> Option<&StorageCell<T, P>> {
        let mut head = self.head.load();
        loop {
            let cell = NonNull::new(head)?;
            let next = unsafe { cell.as_ref().link() }.load();
            match self.head.compare_exchange_acquire(head, next) {
                Ok(_) => {
                    self.in_use.incr();
                    return Some(unsafe { cell.as_ref() });
                }
                Err(observed) => head = observed,
            }
        }
    }

    /// Hands out one uninitialized block, or `None` when the pool is full.
    pub fn allocate(&self) -> Option<NonNull<T>> {
        let cell = self.pop_cell()?;
        // Payload is uninitialized; the caller writes before reading.
        Some(unsafe { NonNull::new_unchecked(cell.payload_ptr()) })
    }

    /// Constructs `value` in a fresh block, or `None` when the pool is full.
    pub fn create(&self, value: T) -> Option<NonNull<T>> {
        let cell = self.pop_cell()?;
        Some(unsafe { cell.emplace(value) })
    }

    /// Returns `block` to the free list.
    ///
    /// Returns `false` and mutates nothing when `block` lies outside the
    /// pool's backing buffer. Double release of a live-looking block is not
    /// detected.
    ///
    /// # Safety
    ///
    /// `block` must be a pointer previously returned by this pool's
    /// `allocate`/`create` and not released since, or a pointer outside the
    /// pool entirely. Any payload must already be dead or trivially
    /// droppable; this call does not run destructors.
    pub unsafe fn release(&self, block: NonNull<T>) -> bool {
        let Some(cell) = self.cell_of(block) else {
            return false;
        };
        let cell_ptr = cell as *const StorageCell<T, P> as *mut StorageCell<T, P>;

        let mut head = self.head.load();
        unsafe { cell.set_link(head) };
        loop {
            match self.head.compare_exchange_release(head, cell_ptr) {
                Ok(_) => break,
                Err(observed) => {
                    head = observed;
                    unsafe { cell.link() }.store(observed);
                }
            }
        }

        self.in_use.decr();
        true
    }

    /// Runs `T`'s destructor in place, then releases the block.
    ///
    /// Returns `false` and mutates nothing when `block` lies outside the
    /// pool's backing buffer.
    ///
    /// # Safety
    ///
    /// `block` must hold a live payload previously obtained from this pool
    /// and not released since, or be a pointer outside the pool entirely.
    pub unsafe fn destroy(&self, block: NonNull<T>) -> bool {
        if self.cell_of(block).is_none() {
            return false;
        }
        unsafe { ptr::drop_in_place(block.as_ptr()) };
        unsafe { self.release(block) }
    }

    /// Constructs `value` in a fresh block and leases it back.
    ///
    /// The lease destroys the value and releases the block on drop.
    pub fn acquire(&self, value: T) -> Option<PoolRef<'_, T, P>> {
        let block = self.create(value)?;
        Some(PoolRef { block, pool: self })
    }

    /// True when every block is handed out.
    pub fn full(&self) -> bool {
        self.head.load().is_null()
    }

    /// True when `block` points into this pool's backing buffer.
    pub fn contains(&self, block: NonNull<T>) -> bool {
        self.cell_of(block).is_some()
    }

    /// Number of blocks the pool was built with.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Number of blocks currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.get()
    }

    /// Bytes of backing memory currently handed out.
    pub fn used_memory(&self) -> usize {
        self.in_use.get() * size_of::<StorageCell<T, P>>()
    }

    /// Maps a block address back to its cell, or `None` for foreign pointers.
    fn cell_of(&self, block: NonNull<T>) -> Option<&StorageCell<T, P>> {
        let base = self.cells.as_ptr() as usize;
        let stride = size_of::<StorageCell<T, P>>();
        let address = block.as_ptr() as usize;
        if address < base || address >= base + stride * self.cells.len() {
            return None;
        }
        let offset = address - base;
        debug_assert_eq!(offset % stride, 0, "pointer does not sit on a cell boundary");
        Some(&self.cells[offset / stride])
    }
}

/// Lease over one pool block.
///
/// Dereferences to the payload and hands the block back on drop, running the
/// payload's destructor first.
pub struct PoolRef<'a, T, P: ThreadPolicy = SingleThread> {
    block: NonNull<T>,
    pool: &'a BlockPool<T, P>,
}

unsafe impl<T: Send> Send for PoolRef<'_, T, MultiThread> {}

impl<T, P: ThreadPolicy> Deref for PoolRef<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.block.as_ref() }
    }
}

impl<T, P: ThreadPolicy> DerefMut for PoolRef<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.block.as_mut() }
    }
}

impl<T, P: ThreadPolicy> Drop for PoolRef<'_, T, P> {
    fn drop(&mut self) {
        // The lease came out of this pool, so destroy cannot miss.
        let destroyed = unsafe { self.pool.destroy(self.block) };
        debug_assert!(destroyed, "leased block no longer belongs to its pool");
    }
}
