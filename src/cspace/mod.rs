//! Capability slot allocation
//!
//! A process addresses its capabilities through integer slot indices in its
//! own capability space. [`SlotAllocator`] hands out empty slots from a
//! configured range, recycling freed slots LIFO before any never-used slot.
//!
//! Allocated slots are returned as [`CSlot`], an owned handle that is neither
//! `Copy` nor `Clone`. Freeing consumes the handle, so a slot cannot be freed
//! twice or used after it has been recycled.
//!
//! [`CSpace`] pairs an allocator with the kernel so the common
//! allocate-then-invoke sequences (mint, copy out a received capability,
//! delete-and-free) roll back cleanly on failure.

use alloc::vec::Vec;
use core::fmt;

use crate::error::{SrvError, SrvResult};
use crate::kernel::Kernel;
use crate::pool::{IdPool, IdStore};
use crate::types::{Badge, CPtr};

// ============================================================================
// Owned slot handle
// ============================================================================

/// An allocated capability slot, owned by whoever holds this value
#[derive(PartialEq, Eq, Hash)]
#[must_use = "an allocated slot leaks unless it is freed"]
pub struct CSlot(CPtr);

impl CSlot {
    /// Slot index, for passing to kernel invocations
    #[inline]
    pub fn cptr(&self) -> CPtr {
        self.0
    }

    /// Give up ownership without recycling the slot.
    ///
    /// Used when the slot is handed to a collaborator that frees it later.
    pub fn into_raw(self) -> CPtr {
        self.0
    }
}

impl fmt::Debug for CSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CSlot({:#x})", self.0 .0)
    }
}

// ============================================================================
// Slot allocator
// ============================================================================

/// Allocator of empty slots in `[start, end)`
#[derive(Debug)]
pub struct SlotAllocator<S = Vec<usize>> {
    pool: IdPool<S>,
}

impl SlotAllocator<Vec<usize>> {
    /// Create a heap-backed allocator over `[start, end)`
    pub fn new(start: CPtr, end: CPtr) -> SrvResult<Self> {
        if end < start {
            return Err(SrvError::InvalidArgument);
        }
        Ok(Self {
            pool: IdPool::new(start.0, end.0),
        })
    }
}

impl<const N: usize> SlotAllocator<heapless::Vec<usize, N>> {
    /// Create an allocator whose free list lives in a fixed buffer of `N`
    /// entries, for use before a heap is available.
    ///
    /// The buffer must be able to hold every slot of the range.
    pub fn new_static(start: CPtr, end: CPtr) -> SrvResult<Self> {
        if end < start || end.0 - start.0 > N {
            return Err(SrvError::InvalidArgument);
        }
        Ok(Self {
            pool: IdPool::with_store(start.0, end.0, heapless::Vec::new()),
        })
    }
}

impl<S: IdStore<usize>> SlotAllocator<S> {
    /// Allocate an empty slot, or `None` when the range is exhausted
    pub fn alloc(&mut self) -> Option<CSlot> {
        self.pool.alloc().map(|raw| CSlot(CPtr(raw)))
    }

    /// Return a slot to the free list.
    ///
    /// The slot must be empty; use [`SlotAllocator::free_delete`] if it
    /// still holds a capability.
    pub fn free(&mut self, slot: CSlot) {
        let raw = slot.into_raw();
        if !self.pool.free(raw.0) {
            log::warn!("slot allocator: ignoring free of foreign slot {}", raw);
        }
    }

    /// Delete the capability in `slot`, then free the slot.
    ///
    /// If the kernel refuses the delete the slot is not recycled, since it
    /// may still hold a capability.
    pub fn free_delete<K: Kernel + ?Sized>(&mut self, slot: CSlot, kernel: &K) -> SrvResult<()> {
        if let Err(e) = kernel.delete(slot.cptr()) {
            log::warn!("slot allocator: delete of {} failed: {}", slot.cptr(), e);
            return Err(e);
        }
        self.free(slot);
        Ok(())
    }

    /// Whether `cptr` is currently free
    pub fn is_free(&self, cptr: CPtr) -> bool {
        self.pool.is_free(cptr.0)
    }

    /// Number of slots handed out
    pub fn in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Number of slots still available
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    /// Tear down the allocator, releasing any heap storage
    pub fn deinit(self) {
        let in_use = self.in_use();
        if in_use > 0 {
            log::debug!("slot allocator: deinit with {} slots still held", in_use);
        }
    }
}

// ============================================================================
// Capability space
// ============================================================================

/// Slot allocation plus the kernel operations that go with it.
///
/// Object-safe so object factories can receive it as `&mut dyn CapSpace`.
pub trait CapSpace {
    /// Allocate an empty slot
    fn alloc_slot(&mut self) -> SrvResult<CSlot>;

    /// Recycle an empty slot
    fn free_slot(&mut self, slot: CSlot);

    /// Delete the capability in `slot` and recycle it
    fn release_slot(&mut self, slot: CSlot) -> SrvResult<()>;

    /// Revoke derived capabilities, delete, and recycle
    fn revoke_release_slot(&mut self, slot: CSlot) -> SrvResult<()>;

    /// Mint a badged copy of `src` into a fresh slot
    fn mint(&mut self, src: CPtr, badge: Badge) -> SrvResult<CSlot>;

    /// Move the `index`th received capability into a fresh slot
    fn copyout(&mut self, index: usize) -> SrvResult<CSlot>;
}

/// A slot allocator bound to the kernel that manages the slots
pub struct CSpace<K, S = Vec<usize>> {
    slots: SlotAllocator<S>,
    kernel: K,
}

impl<K: Kernel, S: IdStore<usize>> CSpace<K, S> {
    /// Bind `slots` to `kernel`
    pub fn new(kernel: K, slots: SlotAllocator<S>) -> Self {
        Self { slots, kernel }
    }

    /// The kernel handle
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// The slot allocator
    pub fn slots(&self) -> &SlotAllocator<S> {
        &self.slots
    }

    /// Tear down, returning the kernel handle
    pub fn into_kernel(self) -> K {
        self.slots.deinit();
        self.kernel
    }

    /// Allocate a slot and fill it with `f`, recycling the slot if `f` fails
    pub fn alloc_with<F>(&mut self, f: F) -> SrvResult<CSlot>
    where
        F: FnOnce(&K, CPtr) -> SrvResult<()>,
    {
        let slot = self.slots.alloc().ok_or(SrvError::ResourceExhausted)?;
        match f(&self.kernel, slot.cptr()) {
            Ok(()) => Ok(slot),
            Err(e) => {
                self.slots.free(slot);
                Err(e)
            }
        }
    }
}

impl<K: Kernel, S: IdStore<usize>> CapSpace for CSpace<K, S> {
    fn alloc_slot(&mut self) -> SrvResult<CSlot> {
        self.slots.alloc().ok_or(SrvError::ResourceExhausted)
    }

    fn free_slot(&mut self, slot: CSlot) {
        self.slots.free(slot);
    }

    fn release_slot(&mut self, slot: CSlot) -> SrvResult<()> {
        self.slots.free_delete(slot, &self.kernel)
    }

    fn revoke_release_slot(&mut self, slot: CSlot) -> SrvResult<()> {
        self.kernel.revoke(slot.cptr())?;
        self.slots.free_delete(slot, &self.kernel)
    }

    fn mint(&mut self, src: CPtr, badge: Badge) -> SrvResult<CSlot> {
        self.alloc_with(|k, dest| k.mint(dest, src, badge))
    }

    fn copyout(&mut self, index: usize) -> SrvResult<CSlot> {
        self.alloc_with(|k, dest| k.copyout(dest, index))
    }
}
