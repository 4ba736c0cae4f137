//! Untagged storage cells backing the block pools
//!
//! A cell is a fixed region of bytes that holds either a live payload or,
//! while the cell sits on a free list, the intrusive link to the next free
//! cell. The two occupants share the same bytes; the owning pool's free-list
//! structure is the only record of which one is present. The cell never asks.

use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};

use crate::sync::{PtrSlot, ThreadPolicy};

/// One block of pool-backed storage.
///
/// Non-movable once a pool has chained it: its address lives in free-list
/// links held elsewhere. Pools keep cells inside a boxed slice that never
/// reallocates.
#[repr(C)]
pub(crate) struct StorageCell<T, P: ThreadPolicy> {
    state: UnsafeCell<CellState<T, P>>,
}

/// Payload and free-list link overlap, so a free pool costs no memory
/// beyond its cells.
#[repr(C)]
union CellState<T, P: ThreadPolicy> {
    payload: ManuallyDrop<T>,
    link: ManuallyDrop<P::Ptr<StorageCell<T, P>>>,
}

impl<T, P: ThreadPolicy> StorageCell<T, P> {
    /// Creates a cell in the free state with a dangling link.
    pub(crate) fn new_free() -> Self {
        Self {
            state: UnsafeCell::new(CellState {
                link: ManuallyDrop::new(PtrSlot::new(ptr::null_mut())),
            }),
        }
    }

    /// Address of the payload bytes. Valid to compute in either state.
    pub(crate) fn payload_ptr(&self) -> *mut T {
        unsafe { ptr::addr_of_mut!((*self.state.get()).payload).cast::<T>() }
    }

    /// Constructs `value` in place and returns the inhabitant.
    ///
    /// # Safety
    ///
    /// The cell must be off the free list and must not already hold a live
    /// payload (or the previous payload must have been dropped in place).
    pub(crate) unsafe fn emplace(&self, value: T) -> NonNull<T> {
        let payload = self.payload_ptr();
        unsafe { payload.write(value) };
        unsafe { NonNull::new_unchecked(payload) }
    }

    /// Reinterprets the cell as a free-list node pointing at `next`.
    ///
    /// # Safety
    ///
    /// Any previous payload must already be dead; this overwrites its bytes.
    pub(crate) unsafe fn set_link(&self, next: *mut StorageCell<T, P>) {
        unsafe {
            ptr::addr_of_mut!((*self.state.get()).link)
                .write(ManuallyDrop::new(PtrSlot::new(next)));
        }
    }

    /// View of the intrusive link.
    ///
    /// # Safety
    ///
    /// The cell must currently be a free-list node, i.e. `set_link` ran since
    /// any payload died. Concurrent pools may read a link that a racing
    /// thread is repurposing; that is tolerated because cells are never
    /// unmapped while the pool lives, and a stale read is fenced out by the
    /// head compare-and-swap that follows it.
    pub(crate) unsafe fn link(&self) -> &P::Ptr<StorageCell<T, P>> {
        unsafe { &*ptr::addr_of!((*self.state.get()).link).cast::<P::Ptr<StorageCell<T, P>>>() }
    }
}
