//! Bump regions with marker-based rewind
//!
//! A stack region owns a fixed byte buffer and a single head offset.
//! `allocate` bumps the head, `free` rewinds it to a previously recorded
//! marker, `clear` rewinds to the start. Nothing is tracked per allocation;
//! whole scopes are discarded at once. The dual variant lays a bottom-up and
//! a top-down region over one shared buffer so two lifetime patterns can
//! grow toward each other; keeping them from colliding is the caller's
//! business, the regions do not check.

use std::alloc::{Layout, alloc, dealloc};
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use crate::error::{PoolError, PoolResult};
use crate::sync::{CountSlot, MultiThread, SingleThread, ThreadPolicy};

/// Backing buffers are cache-line aligned so any reasonable payload
/// alignment is available from offset zero.
const REGION_ALIGN: usize = 64;

/// Saved head position of a [`StackRegion`], used to rewind in LIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    offset: usize,
}

impl Marker {
    /// Byte offset of the saved head from the start of the region.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// A fixed buffer carved by bumping a head offset.
///
/// The concurrent flavor ([`ConcurrentStackRegion`]) claims ranges with a
/// compare-and-swap loop on the head; `free`, `clear`, and markers stay
/// meaningful only under caller-side coordination there.
pub struct StackRegion<P: ThreadPolicy = SingleThread> {
    base: NonNull<u8>,
    capacity: usize,
    head: P::Counter,
    grows_down: bool,
    backing: Option<Layout>,
}

/// Concurrent flavor of [`StackRegion`].
pub type ConcurrentStackRegion = StackRegion<MultiThread>;

unsafe impl<P: ThreadPolicy> Send for StackRegion<P> {}
unsafe impl Sync for StackRegion<MultiThread> {}

impl<P: ThreadPolicy> StackRegion<P> {
    /// Allocates a region of `bytes` bytes growing upward from its start.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ZeroCapacity`] for an empty region,
    /// [`PoolError::InvalidLayout`] when the layout cannot be formed, and
    /// [`PoolError::BackingAllocationFailed`] when the system allocator
    /// refuses the buffer.
    pub fn new(bytes: usize) -> PoolResult<Self> {
        let (base, layout) = allocate_backing(bytes)?;
        Ok(Self {
            base,
            capacity: bytes,
            head: CountSlot::new(0),
            grows_down: false,
            backing: Some(layout),
        })
    }

    /// Lays a region over an existing buffer without owning it.
    fn from_raw(base: NonNull<u8>, capacity: usize, grows_down: bool) -> Self {
        Self {
            base,
            capacity,
            head: CountSlot::new(if grows_down { capacity } else { 0 }),
            grows_down,
            backing: None,
        }
    }

    /// Claims `bytes` bytes with no alignment guarantee.
    pub fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        self.allocate_aligned(bytes, 1)
    }

    /// Claims `bytes` bytes whose start is `align`-aligned.
    ///
    /// `align` must be a power of two. Returns `None` when the remaining
    /// space cannot fit the request.
    pub fn allocate_aligned(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        let base = self.base.as_ptr() as usize;
        loop {
            let head = self.head.get();
            let (start, next_head) = if self.grows_down {
                let raw = (base + head).checked_sub(bytes)?;
                let start = raw & !(align - 1);
                if start < base {
                    return None;
                }
                (start, start - base)
            } else {
                let start = (base + head + align - 1) & !(align - 1);
                let end = start.checked_add(bytes)?;
                if end > base + self.capacity {
                    return None;
                }
                (start, end - base)
            };

            if self.head.compare_exchange(head, next_head).is_ok() {
                return NonNull::new(start as *mut u8);
            }
            // Another thread moved the head; recompute and retry.
        }
    }

    /// Records the current head.
    pub fn head(&self) -> Marker {
        Marker {
            offset: self.head.get(),
        }
    }

    /// Rewinds the head to `marker`, discarding everything claimed since.
    ///
    /// Destructors of discarded objects do not run; callers pair `create`
    /// with `destroy` before rewinding past it.
    pub fn free(&self, marker: Marker) {
        debug_assert!(marker.offset <= self.capacity, "marker out of range");
        if self.grows_down {
            debug_assert!(marker.offset >= self.head.get(), "marker rewinds forward");
        } else {
            debug_assert!(marker.offset <= self.head.get(), "marker rewinds forward");
        }
        self.head.set(marker.offset);
    }

    /// Rewinds the head to the start state.
    pub fn clear(&self) {
        self.head
            .set(if self.grows_down { self.capacity } else { 0 });
    }

    /// Bytes still claimable before the region runs out.
    pub fn free_bytes(&self) -> usize {
        let head = self.head.get();
        if self.grows_down { head } else { self.capacity - head }
    }

    /// Total bytes the region was built over.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Constructs `value` in freshly claimed, properly aligned bytes.
    pub fn create<U>(&self, value: U) -> Option<NonNull<U>> {
        let block = self
            .allocate_aligned(size_of::<U>(), align_of::<U>())?
            .cast::<U>();
        unsafe { block.as_ptr().write(value) };
        Some(block)
    }

    /// Runs `U`'s destructor in place. The bytes stay claimed until a marker
    /// recorded before the allocation is freed.
    ///
    /// Returns `false` and mutates nothing when `block` lies outside the
    /// region.
    ///
    /// # Safety
    ///
    /// `block` must hold a live `U` previously built by this region's
    /// `create` and not destroyed since, or be a pointer outside the region
    /// entirely.
    pub unsafe fn destroy<U>(&self, block: NonNull<U>) -> bool {
        let address = block.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        if address < base || address >= base + self.capacity {
            return false;
        }
        unsafe { ptr::drop_in_place(block.as_ptr()) };
        true
    }

    /// Records the head and rewinds to it when the guard drops.
    pub fn scope(&self) -> ScopedMarker<'_, P> {
        ScopedMarker {
            region: self,
            marker: self.head(),
        }
    }
}

impl<P: ThreadPolicy> Drop for StackRegion<P> {
    fn drop(&mut self) {
        if let Some(layout) = self.backing.take() {
            unsafe { dealloc(self.base.as_ptr(), layout) };
        }
    }
}

/// RAII marker for a [`StackRegion`] scope.
///
/// Records the head on creation and rewinds to it on drop, discarding every
/// allocation made inside the scope.
pub struct ScopedMarker<'a, P: ThreadPolicy = SingleThread> {
    region: &'a StackRegion<P>,
    marker: Marker,
}

impl<P: ThreadPolicy> ScopedMarker<'_, P> {
    /// The head position this scope rewinds to.
    pub fn marker(&self) -> Marker {
        self.marker
    }
}

impl<P: ThreadPolicy> Drop for ScopedMarker<'_, P> {
    fn drop(&mut self) {
        self.region.free(self.marker);
    }
}

/// Two stack regions sharing one buffer: `bottom` grows up from the start,
/// `top` grows down from the end.
pub struct DualStackRegion<P: ThreadPolicy = SingleThread> {
    bottom: StackRegion<P>,
    top: StackRegion<P>,
    base: NonNull<u8>,
    layout: Layout,
}

unsafe impl<P: ThreadPolicy> Send for DualStackRegion<P> {}
unsafe impl Sync for DualStackRegion<MultiThread> {}

impl<P: ThreadPolicy> DualStackRegion<P> {
    /// Allocates one buffer of `bytes` bytes shared by both halves.
    ///
    /// # Errors
    ///
    /// Same conditions as [`StackRegion::new`].
    pub fn new(bytes: usize) -> PoolResult<Self> {
        let (base, layout) = allocate_backing(bytes)?;
        Ok(Self {
            bottom: StackRegion::from_raw(base, bytes, false),
            top: StackRegion::from_raw(base, bytes, true),
            base,
            layout,
        })
    }

    /// The bottom-up half.
    pub fn bottom(&self) -> &StackRegion<P> {
        &self.bottom
    }

    /// The top-down half.
    pub fn top(&self) -> &StackRegion<P> {
        &self.top
    }

    /// Total bytes shared by the two halves.
    pub fn capacity(&self) -> usize {
        self.bottom.capacity()
    }
}

impl<P: ThreadPolicy> Drop for DualStackRegion<P> {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Allocates the cache-line aligned backing buffer for a region.
fn allocate_backing(bytes: usize) -> PoolResult<(NonNull<u8>, Layout)> {
    if bytes == 0 {
        return Err(PoolError::ZeroCapacity);
    }
    let layout = Layout::from_size_align(bytes, REGION_ALIGN).map_err(|_| {
        PoolError::InvalidLayout {
            bytes,
            align: REGION_ALIGN,
        }
    })?;
    let raw = unsafe { alloc(layout) };
    match NonNull::new(raw) {
        Some(base) => Ok((base, layout)),
        None => Err(PoolError::BackingAllocationFailed { bytes }),
    }
}
