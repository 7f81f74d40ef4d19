//! Per-core hypervisor state.
//!
//! Every logical core owns one [`CoreState`]: the VMXON and VMCS regions, the
//! MSR bitmap, the root-mode stack, the EPT hierarchy with its split arena,
//! and the mapping table. Nothing in here is shared between cores; the
//! VM-exit handler mutates only the state of the core it runs on.

use alloc::boxed::Box;

use crate::Result;
use crate::ept::mapping::{self, AccessKind, MappingTable};
use crate::ept::mtrr::Mtrr;
use crate::ept::{Ept, SplitArena};
use crate::platform::{PAGE_SIZE, PageBlock, Platform};

/// Pages of the root-mode stack (32 KiB).
pub const HOST_STACK_PAGES: usize = 8;

/// Bytes kept above the host RSP for the exit-context cell.
const CONTEXT_RESERVE: usize = 64;

/// Run state of the per-core VM-exit dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmState {
    /// No VM exit has been taken on this core yet
    NotEntered,
    /// The dispatcher is or has been servicing exits
    Running,
    /// A shutdown hypercall is tearing the core down
    ShuttingDown,
}

/// Pointers the VM-exit handler recovers from the root-mode stack.
///
/// The cell sits exactly at the VMCS host RSP, so the handler finds it at a
/// fixed offset above the saved register frame.
#[repr(C)]
pub struct ExitContext {
    pub state: *mut CoreState,
    pub platform: &'static dyn Platform,
}

/// All state one virtualized core owns.
pub struct CoreState {
    pub(crate) vmxon: PageBlock,
    pub(crate) vmcs: PageBlock,
    pub(crate) msr_bitmap: PageBlock,
    host_stack: PageBlock,
    pub(crate) ept: Ept,
    pub(crate) arena: SplitArena,
    pub(crate) mappings: MappingTable,
    pub(crate) eptp: u64,
    pub(crate) vmm_state: VmmState,
    pub(crate) virtualized: bool,
    pub(crate) platform: &'static dyn Platform,
}

impl CoreState {
    /// Allocate the regions and build the identity EPT for one core. Runs in
    /// normal kernel context; nothing here touches VMX hardware.
    pub fn new(
        platform: &'static dyn Platform,
        pml4_count: usize,
        mtrr: &Mtrr,
    ) -> Result<Box<Self>> {
        let vmxon = PageBlock::alloc(platform, 1)?;
        let vmcs = PageBlock::alloc(platform, 1)?;
        // Left all-zero: a zeroed bitmap causes no MSR-access exits.
        let msr_bitmap = PageBlock::alloc(platform, 1)?;
        let host_stack = PageBlock::alloc(platform, HOST_STACK_PAGES)?;
        let mut arena = SplitArena::new(platform)?;
        let ept = Ept::build(platform, pml4_count, mtrr, &mut arena)?;
        let eptp = ept.pointer();

        let mut state = Box::new(Self {
            vmxon,
            vmcs,
            msr_bitmap,
            host_stack,
            ept,
            arena,
            mappings: MappingTable::new(),
            eptp,
            vmm_state: VmmState::NotEntered,
            virtualized: false,
            platform,
        });
        state.write_exit_context();
        Ok(state)
    }

    /// The VMCS host RSP for this core: 16-byte aligned, with the
    /// [`ExitContext`] cell stored at exactly this address. The VM-exit stub
    /// builds its register frame below it.
    pub fn host_rsp(&self) -> u64 {
        self.host_stack.va() as u64 + (HOST_STACK_PAGES * PAGE_SIZE - CONTEXT_RESERVE) as u64
    }

    fn write_exit_context(&mut self) {
        let cell = self.host_rsp() as *mut ExitContext;
        let context = ExitContext {
            state: self as *mut Self,
            platform: self.platform,
        };
        unsafe { core::ptr::write(cell, context) };
    }

    pub fn eptp(&self) -> u64 {
        self.eptp
    }

    pub fn is_virtualized(&self) -> bool {
        self.virtualized
    }

    /// Install a split mapping on this core. Root-mode (hypercall) path.
    pub fn install_mapping(&mut self, guest: u64, rw: u64, fetch: u64) -> Result<()> {
        mapping::install(
            &mut self.ept,
            &mut self.arena,
            &mut self.mappings,
            guest,
            rw,
            fetch,
        )
    }

    /// Remove a split mapping on this core. Root-mode (hypercall) path.
    pub fn remove_mapping(&mut self, guest: u64) -> Result<()> {
        mapping::remove(&mut self.ept, &mut self.arena, &mut self.mappings, guest)
    }

    /// Flip the active view of a mapped page. Root-mode (violation) path.
    pub fn flip_mapping(&mut self, guest: u64, kind: AccessKind) -> Result<()> {
        mapping::flip(
            &mut self.ept,
            &mut self.arena,
            &mut self.mappings,
            guest,
            kind,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::TestPlatform;
    use x86::msr::{IA32_MTRR_DEF_TYPE, IA32_MTRRCAP};

    fn mtrr() -> Mtrr {
        let msrs = [(IA32_MTRRCAP, 0u64), (IA32_MTRR_DEF_TYPE, (1 << 11) | 6)];
        Mtrr::from_reader(&mut |msr| {
            msrs.iter()
                .find(|(m, _)| *m == msr)
                .map(|(_, v)| *v)
                .unwrap_or(0)
        })
        .unwrap()
    }

    #[test]
    fn host_rsp_is_aligned_and_carries_the_context() {
        let platform = TestPlatform::leaked();
        let state = CoreState::new(platform, 1, &mtrr()).unwrap();
        assert_eq!(state.host_rsp() % 16, 0);

        let context = unsafe { &*(state.host_rsp() as *const ExitContext) };
        assert_eq!(context.state, &*state as *const CoreState as *mut CoreState);
    }

    #[test]
    fn mapping_operations_route_through_the_core_state() {
        let platform = TestPlatform::leaked();
        let mut state = CoreState::new(platform, 1, &mtrr()).unwrap();
        state.install_mapping(0x5000, 0x6000, 0x7000).unwrap();
        state.flip_mapping(0x5000, AccessKind::Fetch).unwrap();
        let leaf = state.ept.leaf(0x5000).unwrap().entry;
        assert_eq!(leaf.pfn(), 0x7);
        state.remove_mapping(0x5000).unwrap();
        assert!(state.mappings.is_empty());
    }

    #[test]
    fn dropping_the_state_frees_every_region() {
        let platform = TestPlatform::leaked();
        let state = CoreState::new(platform, 1, &mtrr()).unwrap();
        assert!(platform.live_allocs() >= 5);
        drop(state);
        assert_eq!(platform.live_allocs(), 0);
    }
}
