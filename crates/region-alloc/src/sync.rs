//! Synchronization strategies for the allocator family
//!
//! Every pool in this crate exists in a single-threaded and a concurrent
//! flavor. The two flavors share one algorithm; what differs is how the
//! free-list head, the live counters, and the chain structure are guarded.
//! That difference is captured here as a thread policy: [`SingleThread`]
//! collapses every primitive to plain loads and stores, [`MultiThread`]
//! swaps in atomics and a readers-writer spinlock.

use std::cell::Cell;
use std::hint;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::SingleThread {}
    impl Sealed for super::MultiThread {}
}

/// A slot holding a raw pointer, with policy-dependent synchronization.
///
/// Used for the free-list head of a block pool and for the intrusive `next`
/// links threaded through free cells.
pub trait PtrSlot<T> {
    /// Creates a slot holding `ptr`.
    fn new(ptr: *mut T) -> Self;

    /// Reads the current pointer (acquire in the concurrent flavor).
    fn load(&self) -> *mut T;

    /// Overwrites the pointer without ordering guarantees beyond the policy's
    /// plain store. Publication happens through the exchange methods.
    fn store(&self, ptr: *mut T);

    /// Compare-and-swap used when taking a cell off the free list.
    ///
    /// Acquire-release on success, relaxed on failure; the error value is the
    /// pointer observed instead.
    fn compare_exchange_acquire(&self, current: *mut T, new: *mut T) -> Result<*mut T, *mut T>;

    /// Compare-and-swap used when pushing a cell back onto the free list.
    ///
    /// Release on success, relaxed on failure.
    fn compare_exchange_release(&self, current: *mut T, new: *mut T) -> Result<*mut T, *mut T>;
}

impl<T> PtrSlot<T> for Cell<*mut T> {
    fn new(ptr: *mut T) -> Self {
        Cell::new(ptr)
    }

    fn load(&self) -> *mut T {
        self.get()
    }

    fn store(&self, ptr: *mut T) {
        self.set(ptr);
    }

    fn compare_exchange_acquire(&self, current: *mut T, new: *mut T) -> Result<*mut T, *mut T> {
        let seen = self.get();
        if seen == current {
            self.set(new);
            Ok(seen)
        } else {
            Err(seen)
        }
    }

    fn compare_exchange_release(&self, current: *mut T, new: *mut T) -> Result<*mut T, *mut T> {
        self.compare_exchange_acquire(current, new)
    }
}

impl<T> PtrSlot<T> for AtomicPtr<T> {
    fn new(ptr: *mut T) -> Self {
        AtomicPtr::new(ptr)
    }

    fn load(&self) -> *mut T {
        self.load(Ordering::Acquire)
    }

    fn store(&self, ptr: *mut T) {
        self.store(ptr, Ordering::Relaxed);
    }

    fn compare_exchange_acquire(&self, current: *mut T, new: *mut T) -> Result<*mut T, *mut T> {
        self.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed)
    }

    fn compare_exchange_release(&self, current: *mut T, new: *mut T) -> Result<*mut T, *mut T> {
        self.compare_exchange_weak(current, new, Ordering::Release, Ordering::Relaxed)
    }
}

/// A slot holding a `usize`, with policy-dependent synchronization.
///
/// Backs the live-allocation counters and the stack-region head offsets.
pub trait CountSlot {
    /// Creates a slot holding `value`.
    fn new(value: usize) -> Self;

    /// Reads the current value (acquire in the concurrent flavor).
    fn get(&self) -> usize;

    /// Overwrites the current value.
    fn set(&self, value: usize);

    /// Adds one and returns the previous value.
    fn incr(&self) -> usize;

    /// Subtracts one and returns the previous value.
    fn decr(&self) -> usize;

    /// Compare-and-swap for claiming a range of a bump region.
    fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize>;
}

impl CountSlot for Cell<usize> {
    fn new(value: usize) -> Self {
        Cell::new(value)
    }

    fn get(&self) -> usize {
        Cell::get(self)
    }

    fn set(&self, value: usize) {
        Cell::set(self, value);
    }

    fn incr(&self) -> usize {
        let previous = Cell::get(self);
        Cell::set(self, previous + 1);
        previous
    }

    fn decr(&self) -> usize {
        let previous = Cell::get(self);
        debug_assert!(previous > 0, "counter underflow");
        Cell::set(self, previous - 1);
        previous
    }

    fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize> {
        let seen = Cell::get(self);
        if seen == current {
            Cell::set(self, new);
            Ok(seen)
        } else {
            Err(seen)
        }
    }
}

impl CountSlot for AtomicUsize {
    fn new(value: usize) -> Self {
        AtomicUsize::new(value)
    }

    fn get(&self) -> usize {
        self.load(Ordering::Acquire)
    }

    fn set(&self, value: usize) {
        self.store(value, Ordering::Release);
    }

    fn incr(&self) -> usize {
        self.fetch_add(1, Ordering::AcqRel)
    }

    fn decr(&self) -> usize {
        self.fetch_sub(1, Ordering::AcqRel)
    }

    fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize> {
        self.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed)
    }
}

/// Guard over the structure of a chained pool.
///
/// Readers may overlap freely; a writer excludes everyone. The no-op flavor
/// exists so the single-threaded chained pool runs the same code path with
/// the lock compiled away.
pub trait RegionGate: Default {
    /// RAII guard for shared access.
    type ReadGuard<'a>
    where
        Self: 'a;

    /// RAII guard for exclusive access.
    type WriteGuard<'a>
    where
        Self: 'a;

    /// Acquires shared access, spinning until no writer holds the gate.
    fn read(&self) -> Self::ReadGuard<'_>;

    /// Acquires exclusive access, spinning until the gate is idle.
    fn write(&self) -> Self::WriteGuard<'_>;
}

/// Gate used by the single-threaded pools. Does nothing.
#[derive(Debug, Default)]
pub struct NoopGate;

impl RegionGate for NoopGate {
    type ReadGuard<'a>
        = ()
    where
        Self: 'a;
    type WriteGuard<'a>
        = ()
    where
        Self: 'a;

    fn read(&self) -> Self::ReadGuard<'_> {}

    fn write(&self) -> Self::WriteGuard<'_> {}
}

const WRITER_HELD: isize = -1;

/// Readers-writer spinlock over a single atomic word.
///
/// State is the reader count: zero when idle, positive while readers hold
/// the lock, [`WRITER_HELD`] while a writer does. There is no reader-to-
/// writer upgrade; callers drop the read guard and re-validate after taking
/// the write guard.
#[derive(Debug)]
pub struct RwSpinLock {
    state: AtomicIsize,
}

impl RwSpinLock {
    /// Creates an idle lock.
    pub const fn new() -> Self {
        Self {
            state: AtomicIsize::new(0),
        }
    }

    /// Acquires shared access.
    pub fn read(&self) -> RwReadGuard<'_> {
        loop {
            let seen = self.state.load(Ordering::Acquire);
            if seen >= 0
                && self
                    .state
                    .compare_exchange_weak(seen, seen + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return RwReadGuard { lock: self };
            }
            hint::spin_loop();
        }
    }

    /// Acquires exclusive access.
    pub fn write(&self) -> RwWriteGuard<'_> {
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER_HELD, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwWriteGuard { lock: self };
            }
            hint::spin_loop();
        }
    }
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionGate for RwSpinLock {
    type ReadGuard<'a>
        = RwReadGuard<'a>
    where
        Self: 'a;
    type WriteGuard<'a>
        = RwWriteGuard<'a>
    where
        Self: 'a;

    fn read(&self) -> Self::ReadGuard<'_> {
        RwSpinLock::read(self)
    }

    fn write(&self) -> Self::WriteGuard<'_> {
        RwSpinLock::write(self)
    }
}

/// Shared-access guard returned by [`RwSpinLock::read`].
#[derive(Debug)]
pub struct RwReadGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for RwReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive-access guard returned by [`RwSpinLock::write`].
#[derive(Debug)]
pub struct RwWriteGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for RwWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

/// Synchronization strategy shared by every allocator in the crate.
///
/// Implemented by exactly two marker types. The pools never branch on the
/// policy; they go through these associated types and let the compiler
/// collapse the single-threaded flavor to plain memory operations.
pub trait ThreadPolicy: sealed::Sealed + 'static {
    /// Pointer slot for free-list heads and intrusive links.
    type Ptr<T>: PtrSlot<T>;

    /// Counter slot for live counts and bump offsets.
    type Counter: CountSlot;

    /// Gate guarding chain structure.
    type Gate: RegionGate;
}

/// Policy for pools owned by one thread. No atomics, no locking.
#[derive(Debug, Clone, Copy)]
pub struct SingleThread;

/// Policy for pools shared across threads. Lock-free free lists plus the
/// readers-writer spinlock for structural changes.
#[derive(Debug, Clone, Copy)]
pub struct MultiThread;

impl ThreadPolicy for SingleThread {
    type Ptr<T> = Cell<*mut T>;
    type Counter = Cell<usize>;
    type Gate = NoopGate;
}

impl ThreadPolicy for MultiThread {
    type Ptr<T> = AtomicPtr<T>;
    type Counter = AtomicUsize;
    type Gate = RwSpinLock;
}
