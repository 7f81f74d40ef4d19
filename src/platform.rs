//! OS collaborator surface.
//!
//! The hypervisor core never talks to the embedding kernel directly; every
//! primitive it needs (non-paged executable memory, physical/virtual
//! inversion, core enumeration, inter-processor broadcast, bug-check) comes
//! through the [`Platform`] trait. The trait object is created once by the
//! embedder and passed explicitly to everything that needs it; there are no
//! crate-level globals.

use core::ptr::NonNull;

use crate::{FatalError, HypervisorError, Result};

/// Size of one page and of every paging-structure frame.
pub const PAGE_SIZE: usize = 4096;

/// Primitives provided by the embedding kernel.
///
/// All memory returned by [`Platform::alloc_pages`] must be non-pageable,
/// executable, zeroed, 4 KiB-aligned and physically contiguous, so that the
/// inversion of any of its frames through [`Platform::phys_to_virt`] stays
/// valid for the lifetime of the allocation.
pub trait Platform: Sync {
    /// Allocate `pages` pages. `None` when the pool is exhausted.
    fn alloc_pages(&self, pages: usize) -> Option<NonNull<u8>>;

    /// Release an allocation made by [`Platform::alloc_pages`].
    ///
    /// # Safety
    /// `ptr` must come from `alloc_pages` with the same `pages` count and must
    /// not be used afterwards.
    unsafe fn free_pages(&self, ptr: NonNull<u8>, pages: usize);

    /// Translate a host-virtual address to host-physical. `None` when the
    /// address is not mapped or not resident.
    fn virt_to_phys(&self, va: *const u8) -> Option<u64>;

    /// Invert a host-physical address to host-virtual. `None` when the frame
    /// has no kernel mapping.
    fn phys_to_virt(&self, pa: u64) -> Option<NonNull<u8>>;

    /// Number of logical cores in the system.
    fn core_count(&self) -> usize;

    /// Index of the executing core, `0..core_count()`.
    fn current_core(&self) -> usize;

    /// Run `f` once on every logical core and block until all have finished.
    /// The aggregate is success iff every core returned success; otherwise one
    /// of the per-core errors.
    fn run_on_each_core(&self, f: &(dyn Fn() -> Result<()> + Sync)) -> Result<()>;

    /// Bug-check the machine. Called for contract violations that must never
    /// be masked.
    fn fatal(&self, err: FatalError) -> !;
}

/// An owning handle to a page-aligned, physically contiguous allocation.
///
/// Captures the physical base at allocation time so paging structures can be
/// wired up without re-translating, and frees the pages on drop.
pub struct PageBlock {
    ptr: NonNull<u8>,
    pages: usize,
    pa: u64,
    platform: &'static dyn Platform,
}

// The referenced memory is exclusively owned and never thread-affine.
unsafe impl Send for PageBlock {}
unsafe impl Sync for PageBlock {}

impl PageBlock {
    pub fn alloc(platform: &'static dyn Platform, pages: usize) -> Result<Self> {
        let ptr = platform
            .alloc_pages(pages)
            .ok_or(HypervisorError::OutOfMemory)?;
        let Some(pa) = platform.virt_to_phys(ptr.as_ptr()) else {
            unsafe { platform.free_pages(ptr, pages) };
            return Err(HypervisorError::OutOfMemory);
        };
        Ok(Self {
            ptr,
            pages,
            pa,
            platform,
        })
    }

    pub fn va(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Physical base address of the allocation.
    pub fn pa(&self) -> u64 {
        self.pa
    }

    /// Physical address of page `index` within the allocation.
    pub fn page_pa(&self, index: usize) -> u64 {
        debug_assert!(index < self.pages);
        self.pa + (index * PAGE_SIZE) as u64
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// View the allocation as a `T`. `T` must fit and tolerate the zeroed
    /// initial contents.
    pub fn as_ptr<T>(&self) -> *mut T {
        debug_assert!(core::mem::size_of::<T>() <= self.pages * PAGE_SIZE);
        self.ptr.as_ptr().cast()
    }
}

impl Drop for PageBlock {
    fn drop(&mut self) {
        unsafe { self.platform.free_pages(self.ptr, self.pages) };
    }
}
