//! Extended Page Tables (EPT) for Intel VMX
//!
//! EPT provides second-level address translation (Guest Physical → Host
//! Physical). The hypervisor builds an identity mapping of the host's
//! physical address space out of 2 MiB leaves and splits individual large
//! pages into 4 KiB leaves on demand, so single pages can be redirected or
//! have their permissions narrowed without touching their neighbours.
//!
//! ```text
//! Guest Virtual --[Guest PT]--> Guest Physical --[EPT]--> Host Physical
//!      (GVA)                          (GPA)                   (HPA)
//! ```
//!
//! Directory entries store physical frame numbers; the walk re-derives
//! host-virtual pointers through the platform's physical-to-virtual
//! inversion, which is guaranteed valid for structures the hypervisor itself
//! allocated.

use arrayvec::ArrayVec;
use bitfield::bitfield;
use core::ptr::NonNull;
use log::trace;
use x86::bits64::paging::{BASE_PAGE_SHIFT, VAddr, pd_index, pdpt_index, pml4_index, pt_index};

use crate::platform::{PAGE_SIZE, PageBlock, Platform};
use crate::{FatalError, HypervisorError, Result};

pub mod mapping;
pub mod mtrr;

use mtrr::{MemoryType, Mtrr};

/// Entries per paging structure.
pub const ENTRY_COUNT: usize = 512;

/// Most PML4 entries (512 GiB each) the identity map can cover.
pub const MAX_PML4: usize = 4;

/// Page-table slots available for 2 MiB splits on one core. Splits are
/// monotonic; slots return only at teardown.
pub const SPLIT_CAPACITY: usize = 32;

bitfield! {
    /// One 64-bit EPT paging-structure word.
    ///
    /// The same layout serves three variants distinguished by position and
    /// the large bit: a directory entry referencing the next level, a 2 MiB
    /// leaf, and a 4 KiB leaf. Accessors that are only meaningful for one
    /// variant assert it.
    ///
    /// Reference: Intel SDM Figure 29-1, formats of EPT paging-structure entries.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct EptEntry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub large, set_large: 7;
    pub accessed, set_accessed: 8;
    pub dirty, set_dirty: 9;
    pub pfn, set_pfn: 51, 12;
}

impl EptEntry {
    /// A directory entry granting read, write and fetch unconditionally.
    fn directory(table_pa: u64) -> Self {
        let mut entry = EptEntry::default();
        entry.set_readable(true);
        entry.set_writable(true);
        entry.set_executable(true);
        entry.set_pfn(table_pa >> BASE_PAGE_SHIFT);
        entry
    }

    /// Physical address of the next-level table. Directory variant only.
    fn next_table(&self) -> u64 {
        debug_assert!(!self.large());
        self.pfn() << BASE_PAGE_SHIFT
    }
}

/// A 4 KiB page of 512 EPT entries; the shape of every level.
#[repr(C, align(4096))]
pub struct EptTable {
    pub(crate) entries: [EptEntry; ENTRY_COUNT],
}

/// Fixed-capacity source of page tables for 2 MiB splits.
///
/// The slots live in one non-paged block so a split never allocates; the
/// use counter only ever grows.
pub struct SplitArena {
    block: PageBlock,
    used: usize,
}

impl SplitArena {
    pub fn new(platform: &'static dyn Platform) -> Result<Self> {
        Ok(Self {
            block: PageBlock::alloc(platform, SPLIT_CAPACITY)?,
            used: 0,
        })
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Hand out the next slot as an empty page table.
    fn take(&mut self) -> Result<(NonNull<EptTable>, u64)> {
        if self.used == SPLIT_CAPACITY {
            return Err(HypervisorError::SplitArenaFull);
        }
        let index = self.used;
        self.used += 1;
        let va = unsafe { self.block.va().add(index * PAGE_SIZE) };
        let table = unsafe { NonNull::new_unchecked(va) };
        Ok((table.cast(), self.block.page_pa(index)))
    }
}

/// Directory structures hanging off one PML4 entry: the PDPT page and all
/// 512 page directories in one contiguous allocation.
struct DirectoryLevel {
    pdpt: PageBlock,
    pds: PageBlock,
}

/// A read-only view of the leaf covering a guest-physical address.
#[derive(Debug, Clone, Copy)]
pub struct LeafView {
    pub entry: EptEntry,
    pub large: bool,
}

/// Per-core EPT hierarchy.
pub struct Ept {
    platform: &'static dyn Platform,
    // Field order is teardown order: directory levels before the root.
    levels: ArrayVec<DirectoryLevel, MAX_PML4>,
    pml4: PageBlock,
}

impl Ept {
    /// Build the identity mapping: every 2 MiB region within the first
    /// `pml4_count x 512 GiB` of physical space maps to itself through a
    /// large-page leaf whose memory type comes from the MTRR snapshot. When
    /// the fixed-range MTRRs are active the first 2 MiB are split and the
    /// first MiB of 4 KiB leaves retyped from the fixed ranges.
    pub fn build(
        platform: &'static dyn Platform,
        pml4_count: usize,
        mtrr: &Mtrr,
        arena: &mut SplitArena,
    ) -> Result<Self> {
        debug_assert!(pml4_count >= 1 && pml4_count <= MAX_PML4);
        trace!("building identity EPT over {pml4_count} PML4 entries");

        let pml4 = PageBlock::alloc(platform, 1)?;
        let mut levels: ArrayVec<DirectoryLevel, MAX_PML4> = ArrayVec::new();

        for p in 0..pml4_count {
            let pdpt = PageBlock::alloc(platform, 1)?;
            let pds = PageBlock::alloc(platform, ENTRY_COUNT)?;

            let pml4_table = unsafe { &mut *pml4.as_ptr::<EptTable>() };
            pml4_table.entries[p] = EptEntry::directory(pdpt.pa());

            let pdpt_table = unsafe { &mut *pdpt.as_ptr::<EptTable>() };
            for i in 0..ENTRY_COUNT {
                pdpt_table.entries[i] = EptEntry::directory(pds.page_pa(i));

                let pd = unsafe { &mut *pds.as_ptr::<EptTable>().add(i) };
                for (j, pde) in pd.entries.iter_mut().enumerate() {
                    let pa = (((p * ENTRY_COUNT + i) * ENTRY_COUNT + j) as u64) << 21;
                    let kind = mtrr.resolve(pa)?;
                    pde.set_readable(true);
                    pde.set_writable(true);
                    pde.set_executable(true);
                    pde.set_memory_type(kind as u64);
                    pde.set_large(true);
                    pde.set_pfn(pa >> BASE_PAGE_SHIFT);
                }
            }

            levels.push(DirectoryLevel { pdpt, pds });
        }

        let mut ept = Self {
            platform,
            levels,
            pml4,
        };
        if mtrr.fixed_overlay_enabled() {
            ept.apply_fixed_overlay(mtrr, arena)?;
        }
        Ok(ept)
    }

    /// The VMCS EPT pointer for this hierarchy: write-back paging-structure
    /// accesses and a 4-level walk.
    ///
    /// Reference: Intel SDM Table 25-9, format of extended-page-table pointer.
    pub fn pointer(&self) -> u64 {
        let mut eptp = EptPointer::default();
        eptp.set_memory_type(MemoryType::WriteBack as u64);
        eptp.set_walk_length_minus_one(3);
        eptp.set_pfn(self.pml4.pa() >> BASE_PAGE_SHIFT);
        eptp.0
    }

    /// Point the 4 KiB leaf for `gpa` at `target_pa` with the given
    /// read/write and fetch permissions, splitting the covering 2 MiB page
    /// if one is still in place. The memory type set at split time is
    /// preserved.
    pub fn change_mapping(
        &mut self,
        arena: &mut SplitArena,
        gpa: u64,
        target_pa: u64,
        rw: bool,
        fetch: bool,
    ) -> Result<()> {
        let leaf = self.walk_leaf_mut(gpa, arena)?;
        leaf.set_pfn(target_pa >> BASE_PAGE_SHIFT);
        leaf.set_readable(rw);
        leaf.set_writable(rw);
        leaf.set_executable(fetch);
        Ok(())
    }

    /// Read-only walk to whatever leaf currently covers `gpa`.
    pub fn leaf(&self, gpa: u64) -> Option<LeafView> {
        let addr = VAddr::from(gpa);
        if pml4_index(addr) >= self.levels.len() {
            return None;
        }
        let pml4_table = unsafe { &*self.pml4.as_ptr::<EptTable>() };
        let pdpt = unsafe { &*self.table_at(pml4_table.entries[pml4_index(addr)].next_table()) };
        let pd = unsafe { &*self.table_at(pdpt.entries[pdpt_index(addr)].next_table()) };
        let pde = pd.entries[pd_index(addr)];
        if pde.large() {
            return Some(LeafView {
                entry: pde,
                large: true,
            });
        }
        let pt = unsafe { &*self.table_at(pde.next_table()) };
        Some(LeafView {
            entry: pt.entries[pt_index(addr)],
            large: false,
        })
    }

    /// Replace the first MiB's memory types with the fixed-range MTRR
    /// layout, one 4 KiB leaf per block byte.
    fn apply_fixed_overlay(&mut self, mtrr: &Mtrr, arena: &mut SplitArena) -> Result<()> {
        for page in 0..mtrr::FIXED_PAGES {
            let pa = (page as u64) << BASE_PAGE_SHIFT;
            let leaf = self.walk_leaf_mut(pa, arena)?;
            leaf.set_memory_type(mtrr.fixed_type(pa) as u64);
        }
        Ok(())
    }

    /// Walk to the 4 KiB leaf for `gpa`, splitting a 2 MiB leaf on the way
    /// if necessary.
    fn walk_leaf_mut(&mut self, gpa: u64, arena: &mut SplitArena) -> Result<&mut EptEntry> {
        let addr = VAddr::from(gpa);
        if pml4_index(addr) >= self.levels.len() {
            return Err(HypervisorError::OutOfRange);
        }
        let pml4_table = unsafe { &*self.pml4.as_ptr::<EptTable>() };
        let pdpt =
            unsafe { &mut *self.table_at(pml4_table.entries[pml4_index(addr)].next_table()) };
        let pd = unsafe { &mut *self.table_at(pdpt.entries[pdpt_index(addr)].next_table()) };
        let pde = &mut pd.entries[pd_index(addr)];
        if pde.large() {
            Self::split_large(pde, arena)?;
        }
        let pt = unsafe { &mut *self.table_at(pde.next_table()) };
        Ok(&mut pt.entries[pt_index(addr)])
    }

    /// Replace a 2 MiB leaf with a page table of 512 identity 4 KiB leaves
    /// inheriting the parent's memory type. Fails without side effects when
    /// the arena is exhausted.
    fn split_large(pde: &mut EptEntry, arena: &mut SplitArena) -> Result<()> {
        let parent = *pde;
        debug_assert!(parent.large());
        let (pt_ptr, pt_pa) = arena.take()?;

        let pt = unsafe { &mut *pt_ptr.as_ptr() };
        for (i, pte) in pt.entries.iter_mut().enumerate() {
            pte.set_readable(true);
            pte.set_writable(true);
            pte.set_executable(true);
            pte.set_memory_type(parent.memory_type());
            pte.set_pfn(parent.pfn() + i as u64);
        }
        *pde = EptEntry::directory(pt_pa);
        trace!(
            "split 2 MiB page at {:#x} into 4 KiB leaves",
            parent.pfn() << BASE_PAGE_SHIFT
        );
        Ok(())
    }

    /// Host-virtual view of a paging-structure frame. Inversion failure for
    /// memory the hypervisor allocated itself is a contract violation.
    fn table_at(&self, pa: u64) -> *mut EptTable {
        match self.platform.phys_to_virt(pa) {
            Some(va) => va.as_ptr().cast(),
            None => self.platform.fatal(FatalError::PhysicalInversionFailed(pa)),
        }
    }
}

bitfield! {
    /// The VMCS field value teaching the processor how to walk this EPT.
    ///
    /// Reference: Intel SDM Table 25-9, format of extended-page-table pointer.
    #[derive(Clone, Copy, Default)]
    pub struct EptPointer(u64);
    impl Debug;

    pub memory_type, set_memory_type: 2, 0;
    pub walk_length_minus_one, set_walk_length_minus_one: 5, 3;
    pub enable_accessed_dirty, set_enable_accessed_dirty: 6;
    pub pfn, set_pfn: 51, 12;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::TestPlatform;
    use x86::msr::{IA32_MTRR_DEF_TYPE, IA32_MTRR_FIX64K_00000, IA32_MTRRCAP};

    fn write_back_mtrr() -> Mtrr {
        let msrs = [(IA32_MTRRCAP, 0u64), (IA32_MTRR_DEF_TYPE, (1 << 11) | 6)];
        Mtrr::from_reader(&mut |msr| {
            msrs.iter()
                .find(|(m, _)| *m == msr)
                .map(|(_, v)| *v)
                .unwrap_or(0)
        })
        .unwrap()
    }

    fn fixed_mtrr() -> Mtrr {
        // Fixed ranges active; first 64 KiB block uncacheable, rest write-back.
        let msrs = [
            (IA32_MTRRCAP, 1u64 << 8),
            (IA32_MTRR_DEF_TYPE, (1 << 11) | (1 << 10) | 6),
            (IA32_MTRR_FIX64K_00000, u64::from_le_bytes([0, 6, 6, 6, 6, 6, 6, 6])),
        ];
        Mtrr::from_reader(&mut |msr| {
            msrs.iter()
                .find(|(m, _)| *m == msr)
                .map(|(_, v)| *v)
                .unwrap_or(0)
        })
        .unwrap()
    }

    fn build(platform: &'static TestPlatform) -> (Ept, SplitArena) {
        let mut arena = SplitArena::new(platform).unwrap();
        let ept = Ept::build(platform, 1, &write_back_mtrr(), &mut arena).unwrap();
        (ept, arena)
    }

    #[test]
    fn identity_build_uses_large_leaves() {
        let (ept, arena) = build(TestPlatform::leaked());
        assert_eq!(arena.used(), 0);

        let leaf = ept.leaf(0x0020_0000).unwrap();
        assert!(leaf.large);
        assert!(leaf.entry.readable() && leaf.entry.writable() && leaf.entry.executable());
        assert_eq!(leaf.entry.pfn(), 0x0020_0000 >> BASE_PAGE_SHIFT);
        assert_eq!(leaf.entry.memory_type(), MemoryType::WriteBack as u64);

        // Highest 2 MiB region of the covered 512 GiB.
        let top = (512u64 << 30) - (1 << 21);
        let leaf = ept.leaf(top).unwrap();
        assert_eq!(leaf.entry.pfn(), top >> BASE_PAGE_SHIFT);
    }

    #[test]
    fn addresses_beyond_the_identity_range_miss() {
        let platform = TestPlatform::leaked();
        let (mut ept, mut arena) = build(platform);
        let beyond = 512u64 << 30;
        assert!(ept.leaf(beyond).is_none());
        assert_eq!(
            ept.change_mapping(&mut arena, beyond, beyond, true, true),
            Err(HypervisorError::OutOfRange)
        );
    }

    #[test]
    fn change_mapping_splits_and_rewrites_one_leaf() {
        let platform = TestPlatform::leaked();
        let (mut ept, mut arena) = build(platform);

        ept.change_mapping(&mut arena, 0x0040_0000, 0x0040_0000, false, false)
            .unwrap();
        assert_eq!(arena.used(), 1);

        let leaf = ept.leaf(0x0040_0000).unwrap();
        assert!(!leaf.large);
        assert!(!leaf.entry.readable() && !leaf.entry.writable() && !leaf.entry.executable());
        assert_eq!(leaf.entry.pfn(), 0x0040_0000 >> BASE_PAGE_SHIFT);
        assert_eq!(leaf.entry.memory_type(), MemoryType::WriteBack as u64);

        // Sibling leaves keep the identity mapping and full permissions.
        let sibling = ept.leaf(0x0040_1000).unwrap();
        assert!(!sibling.large);
        assert!(sibling.entry.readable() && sibling.entry.writable());
        assert_eq!(sibling.entry.pfn(), 0x0040_1000 >> BASE_PAGE_SHIFT);

        // A second change in the same 2 MiB region reuses the split.
        ept.change_mapping(&mut arena, 0x0040_1000, 0x0090_0000, true, false)
            .unwrap();
        assert_eq!(arena.used(), 1);
        let leaf = ept.leaf(0x0040_1000).unwrap();
        assert_eq!(leaf.entry.pfn(), 0x0090_0000 >> BASE_PAGE_SHIFT);
        assert!(leaf.entry.readable() && !leaf.entry.executable());
    }

    #[test]
    fn the_thirty_third_split_fails_without_state_change() {
        let platform = TestPlatform::leaked();
        let (mut ept, mut arena) = build(platform);

        for k in 0..SPLIT_CAPACITY as u64 {
            ept.change_mapping(&mut arena, k << 21, k << 21, false, false)
                .unwrap();
            assert_eq!(arena.used(), k as usize + 1);
        }
        let next = (SPLIT_CAPACITY as u64) << 21;
        assert_eq!(
            ept.change_mapping(&mut arena, next, next, false, false),
            Err(HypervisorError::SplitArenaFull)
        );
        assert_eq!(arena.used(), SPLIT_CAPACITY);
        let leaf = ept.leaf(next).unwrap();
        assert!(leaf.large, "failed split must leave the 2 MiB leaf intact");
    }

    #[test]
    fn fixed_overlay_retypes_the_first_mebibyte() {
        let platform = TestPlatform::leaked();
        let mut arena = SplitArena::new(platform).unwrap();
        let ept = Ept::build(platform, 1, &fixed_mtrr(), &mut arena).unwrap();

        // The overlay consumed exactly one split.
        assert_eq!(arena.used(), 1);
        let low = ept.leaf(0x0000).unwrap();
        assert!(!low.large);
        assert_eq!(low.entry.memory_type(), MemoryType::Uncacheable as u64);
        let high = ept.leaf(0x0001_0000).unwrap();
        assert_eq!(high.entry.memory_type(), MemoryType::WriteBack as u64);
        // Past the fixed MiB the rest of the split 2 MiB page keeps the
        // variable-resolved type.
        let tail = ept.leaf(0x0010_0000).unwrap();
        assert!(!tail.large);
        assert_eq!(tail.entry.memory_type(), MemoryType::WriteBack as u64);
    }

    #[test]
    fn teardown_returns_every_page() {
        let platform = TestPlatform::leaked();
        let (ept, arena) = build(platform);
        assert!(platform.live_allocs() > 0);
        drop(ept);
        drop(arena);
        assert_eq!(platform.live_allocs(), 0);
    }

    #[test]
    fn ept_pointer_encodes_walk_and_memory_type() {
        let (ept, _arena) = build(TestPlatform::leaked());
        let eptp = ept.pointer();
        assert_eq!(eptp & 0b111, MemoryType::WriteBack as u64);
        assert_eq!((eptp >> 3) & 0b111, 3);
        assert_eq!(eptp & 0xFFF, eptp & 0b11_1111);
    }
}
