//! Lifecycle: bring the hypervisor up on every logical core, keep the
//! control path serialized while it runs, and tear everything down in
//! reverse creation order.
//!
//! All allocation happens here in normal kernel context before any core is
//! virtualized; the enable broadcast only performs the per-core hardware
//! sequence against state that already exists. The [`Hypervisor`] value is
//! the single opaque handle to all of it.

use alloc::boxed::Box;
use alloc::vec::Vec;
use log::{error, info};
use raw_cpuid::CpuId;
use spin::Mutex;

use crate::broadcast;
use crate::ept::mtrr::Mtrr;
use crate::platform::Platform;
use crate::state::CoreState;
use crate::vmexit::cpuid::VENDOR;
use crate::vmx;
use crate::Result;

/// Shared view of the per-core state array for broadcast callbacks. Every
/// core dereferences only its own element, so the aliasing is disjoint.
struct CoreArray {
    ptr: *mut Box<CoreState>,
    len: usize,
}

unsafe impl Sync for CoreArray {}

impl CoreArray {
    fn of(cores: &mut [Box<CoreState>]) -> Self {
        Self {
            ptr: cores.as_mut_ptr(),
            len: cores.len(),
        }
    }

    /// # Safety
    /// Must be called at most once per core index at a time, with the backing
    /// vector outliving the broadcast.
    unsafe fn get(&self, index: usize) -> &mut CoreState {
        debug_assert!(index < self.len);
        unsafe { &mut **self.ptr.add(index) }
    }
}

/// Handle to the running hypervisor. Created by [`Hypervisor::enable`];
/// dropping it shuts every core down again.
pub struct Hypervisor {
    platform: &'static dyn Platform,
    cores: Vec<Box<CoreState>>,
    control: Mutex<()>,
}

impl Hypervisor {
    /// Virtualize every logical core.
    ///
    /// Per-core state and EPT roots are allocated first in normal context;
    /// the broadcast then runs the hardware enable sequence on each core and
    /// launches the running thread as the guest. Any failure tears down the
    /// cores that did come up and reports a single error.
    pub fn enable(platform: &'static dyn Platform) -> Result<Self> {
        vmx::check_prerequisites()?;
        let pml4_count = vmx::pml4_count();
        let mtrr = Mtrr::read()?;
        // Root-mode baseline: every core's VM-exit handler runs on the
        // address space of the enabling context, not of whatever thread the
        // enable broadcast happens to interrupt.
        let system_cr3 = unsafe { vmx::read_cr3() };

        let core_count = platform.core_count();
        let mut cores = Vec::with_capacity(core_count);
        for _ in 0..core_count {
            cores.push(CoreState::new(platform, pml4_count, &mtrr)?);
        }

        let array = CoreArray::of(&mut cores);
        let result = platform.run_on_each_core(&|| {
            let state = unsafe { array.get(platform.current_core()) };
            unsafe { vmx::virtualize_core(state, system_cr3) }
        });
        if let Err(err) = result {
            error!("enable failed: {err:?}");
            shutdown_cores(platform, &mut cores);
            return Err(err);
        }

        info!("virtualization enabled on {core_count} cores");
        Ok(Self {
            platform,
            cores,
            control: Mutex::new(()),
        })
    }

    /// Install a split mapping of `guest_pa` on every core: data accesses
    /// will see `rw_pa`, instruction fetches `fetch_pa`. All frames are
    /// host-physical and page-aligned.
    pub fn install_mapping(&self, guest_pa: u64, rw_pa: u64, fetch_pa: u64) -> Result<()> {
        let _serialized = self.control.lock();
        broadcast::install(self.platform, guest_pa, rw_pa, fetch_pa)
    }

    /// Remove the split mapping of `guest_pa` from every core.
    pub fn remove_mapping(&self, guest_pa: u64) -> Result<()> {
        let _serialized = self.control.lock();
        broadcast::remove(self.platform, guest_pa)
    }

    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    /// Whether the executing system is already running under this
    /// hypervisor, judged by the cloaked CPUID vendor string.
    pub fn is_installed() -> bool {
        CpuId::new()
            .get_vendor_info()
            .is_some_and(|vendor| vendor.as_str() == VENDOR)
    }

    /// Shut the hypervisor down. Equivalent to dropping the handle.
    pub fn disable(self) {}
}

impl Drop for Hypervisor {
    fn drop(&mut self) {
        let _serialized = self.control.lock();
        shutdown_cores(self.platform, &mut self.cores);
        info!("virtualization disabled");
    }
}

/// Broadcast the shutdown hypercall to every virtualized core, then free the
/// per-core state in reverse creation order.
fn shutdown_cores(platform: &'static dyn Platform, cores: &mut Vec<Box<CoreState>>) {
    if cores.is_empty() {
        return;
    }
    let array = CoreArray::of(cores);
    let result = broadcast::shutdown(platform, &|| unsafe {
        array.get(platform.current_core()).is_virtualized()
    });
    if let Err(err) = result {
        error!("shutdown broadcast reported {err:?}");
    }
    while let Some(state) = cores.pop() {
        drop(state);
    }
}
