//! Intel VMX (Virtual Machine Extensions) support
//!
//! Everything that talks to the virtualization hardware directly: the
//! prerequisite checks, IA32_FEATURE_CONTROL handling, control-register
//! fixups, VMXON/VMXOFF, EPT cache invalidation, control-word adjustment
//! against the TRUE capability MSRs, and the two assembly trampolines: the
//! launch path that turns the running thread into the guest, and the VM-exit
//! entry that hands the guest register frame to the dispatcher.

use core::arch::{asm, global_asm};
use log::{debug, error};
use raw_cpuid::CpuId;
use x86::msr::{self, rdmsr, wrmsr};

use crate::ept::MAX_PML4;
use crate::state::CoreState;
use crate::vmcs;
use crate::{HypervisorError, Result};

const VMX_BASIC_TRUE_CONTROLS: u64 = 1 << 55;

const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
const FEATURE_CONTROL_VMX_OUTSIDE_SMX: u64 = 1 << 2;

const CR4_VMXE: u64 = 1 << 13;

// IA32_VMX_EPT_VPID_CAP bits the EPT layout depends on.
const EPT_CAP_WALK_LENGTH_4: u64 = 1 << 6;
const EPT_CAP_WRITE_BACK: u64 = 1 << 14;
const EPT_CAP_2MB_PAGE: u64 = 1 << 16;
const EPT_CAP_INVEPT: u64 = 1 << 20;
const EPT_CAP_INVEPT_ALL_CONTEXT: u64 = 1 << 26;

/// Check that the executing core can host this hypervisor: Intel vendor,
/// VMX present, flexible controls implemented, and the EPT features the
/// identity map is built from.
pub fn check_prerequisites() -> Result<()> {
    let cpuid = CpuId::new();

    let intel = cpuid
        .get_vendor_info()
        .is_some_and(|v| v.as_str() == "GenuineIntel");
    if !intel {
        error!("not an Intel processor");
        return Err(HypervisorError::NotSupported);
    }
    if !cpuid.get_feature_info().is_some_and(|f| f.has_vmx()) {
        error!("VMX not reported by CPUID");
        return Err(HypervisorError::NotSupported);
    }

    let basic = unsafe { rdmsr(msr::IA32_VMX_BASIC) };
    if basic & VMX_BASIC_TRUE_CONTROLS == 0 {
        error!("true VMX controls unavailable");
        return Err(HypervisorError::TrueControlsUnavailable);
    }

    let required = EPT_CAP_WALK_LENGTH_4
        | EPT_CAP_WRITE_BACK
        | EPT_CAP_2MB_PAGE
        | EPT_CAP_INVEPT
        | EPT_CAP_INVEPT_ALL_CONTEXT;
    let caps = unsafe { rdmsr(msr::IA32_VMX_EPT_VPID_CAP) };
    if caps & required != required {
        error!("EPT capabilities insufficient: {caps:#x}");
        return Err(HypervisorError::EptUnsupported);
    }
    Ok(())
}

/// PML4 entries the identity map needs to cover this machine's physical
/// address space, capped at 2 TiB.
pub fn pml4_count() -> usize {
    let bits = CpuId::new()
        .get_processor_capacity_feature_info()
        .map(|info| info.physical_address_bits() as u32)
        .unwrap_or(36);
    compute_pml4_count(bits)
}

fn compute_pml4_count(phys_bits: u32) -> usize {
    let shift = phys_bits.saturating_sub(39).min(31);
    (1usize << shift).min(MAX_PML4)
}

/// Enable VMX-outside-SMX in IA32_FEATURE_CONTROL, locking the register if
/// firmware left it unlocked. Fails when it is locked the other way.
pub fn enable_feature_control() -> Result<()> {
    let value = unsafe { rdmsr(msr::IA32_FEATURE_CONTROL) };
    if value & FEATURE_CONTROL_LOCK != 0 {
        if value & FEATURE_CONTROL_VMX_OUTSIDE_SMX == 0 {
            error!("VMX locked off in IA32_FEATURE_CONTROL");
            return Err(HypervisorError::FeatureControlLocked);
        }
        return Ok(());
    }
    unsafe {
        wrmsr(
            msr::IA32_FEATURE_CONTROL,
            value | FEATURE_CONTROL_LOCK | FEATURE_CONTROL_VMX_OUTSIDE_SMX,
        )
    };
    Ok(())
}

/// Adjust a desired control word against a capability MSR: allowed-0 bits are
/// forced on, allowed-1 bits bound what may stay set.
pub fn adjust_controls(desired: u32, capability: u64) -> u32 {
    let allowed0 = capability as u32;
    let allowed1 = (capability >> 32) as u32;
    (desired | allowed0) & allowed1
}

/// Fold the FIXED0/FIXED1 constraints into CR0 and CR4 with VMX enabled.
pub unsafe fn apply_fixed_control_registers() {
    unsafe {
        let cr0 = read_cr0();
        write_cr0((cr0 | rdmsr(msr::IA32_VMX_CR0_FIXED0)) & rdmsr(msr::IA32_VMX_CR0_FIXED1));
        let cr4 = read_cr4() | CR4_VMXE;
        write_cr4((cr4 | rdmsr(msr::IA32_VMX_CR4_FIXED0)) & rdmsr(msr::IA32_VMX_CR4_FIXED1));
    }
}

/// Stamp the VMX revision identifier into a VMXON or VMCS region.
pub unsafe fn write_revision_id(region: *mut u8) {
    let revision = unsafe { rdmsr(msr::IA32_VMX_BASIC) } as u32 & 0x7FFF_FFFF;
    unsafe { core::ptr::write(region.cast::<u32>(), revision) };
}

/// Invalidate combined mappings for every EPT context on this core.
///
/// Reference: Intel SDM 29.4.3.1, operations that invalidate cached mappings.
pub fn invept_all_contexts() {
    const ALL_CONTEXT: u64 = 2;
    let descriptor = [0u64; 2];
    unsafe {
        asm!(
            "invept {}, [{}]",
            in(reg) ALL_CONTEXT,
            in(reg) descriptor.as_ptr(),
            options(nostack),
        )
    };
}

/// Virtualize the executing core. On success the function has already
/// returned in non-root mode: the calling thread continues as the guest with
/// the VM-exit dispatcher underneath it.
///
/// # Safety
/// Must run on the core owning `state`, with `state` pinned for the lifetime
/// of virtualization and its exit context written.
pub unsafe fn virtualize_core(state: &mut CoreState, system_cr3: u64) -> Result<()> {
    check_prerequisites()?;
    enable_feature_control()?;
    unsafe {
        apply_fixed_control_registers();
        write_revision_id(state.vmxon.va());
        write_revision_id(state.vmcs.va());
        x86::bits64::vmx::vmxon(state.vmxon.pa()).map_err(|_| HypervisorError::VmxFailure)?;
        vmcs::setup(state, system_cr3)?;
        if mzhv_vmx_launch() != 0 {
            error!("vmlaunch rejected");
            vmxoff();
            return Err(HypervisorError::VmxFailure);
        }
    }
    // Now in guest mode.
    state.virtualized = true;
    debug!("core {} virtualized", state.platform.current_core());
    Ok(())
}

/// Reload the interrupted thread's descriptor tables and address space from
/// the values the VMCS held for the guest. Shutdown path, root mode.
pub unsafe fn restore_host_context(
    cr3: u64,
    gdt_base: u64,
    gdt_limit: u16,
    idt_base: u64,
    idt_limit: u16,
) {
    use x86::dtables::{DescriptorTablePointer, lgdt, lidt};
    unsafe {
        let gdt = DescriptorTablePointer {
            limit: gdt_limit,
            base: gdt_base as *const u64,
        };
        let idt = DescriptorTablePointer {
            limit: idt_limit,
            base: idt_base as *const u64,
        };
        lgdt(&gdt);
        lidt(&idt);
        asm!("mov cr3, {}", in(reg) cr3, options(nostack));
    }
}

/// Leave VMX operation and clear CR4.VMXE. Shutdown path, root mode.
pub unsafe fn vmxoff() {
    unsafe {
        let _ = x86::bits64::vmx::vmxoff();
        write_cr4(read_cr4() & !CR4_VMXE);
    }
}

// Raw control/debug register access. The typed wrappers in the x86 crate
// round-trip through bitflags and drop unknown bits; the VMCS wants the
// words verbatim.

pub(crate) unsafe fn read_cr0() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr0", out(reg) value, options(nomem, nostack)) };
    value
}

pub(crate) unsafe fn read_cr3() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack)) };
    value
}

pub(crate) unsafe fn read_cr4() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr4", out(reg) value, options(nomem, nostack)) };
    value
}

pub(crate) unsafe fn read_dr7() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, dr7", out(reg) value, options(nomem, nostack)) };
    value
}

pub(crate) unsafe fn write_cr0(value: u64) {
    unsafe { asm!("mov cr0, {}", in(reg) value, options(nomem, nostack)) };
}

pub(crate) unsafe fn write_cr4(value: u64) {
    unsafe { asm!("mov cr4, {}", in(reg) value, options(nomem, nostack)) };
}

unsafe extern "sysv64" {
    /// Record the current RSP and the in-guest continuation point in the
    /// VMCS, then VMLAUNCH. Returns zero in the freshly launched guest,
    /// non-zero in root mode when the launch was rejected.
    unsafe fn mzhv_vmx_launch() -> u64;
}

// The launch trampoline and the VM-exit entry. The exit stub builds a
// `GuestRegisters` frame below the VMCS host RSP (the exit-context cell sits
// at the host RSP itself), hands it to `mzhv_vmexit_handler`, and either
// resumes the guest or, after a shutdown with VMX already off, rebuilds
// the guest's stack and jumps back into the interrupted thread. In that case
// the handler has parked the continuation RIP in the frame's RCX slot and
// the continuation RSP in its RDX slot.
global_asm!(
    r#"
.global mzhv_vmx_launch
mzhv_vmx_launch:
    mov rax, 0x681C
    vmwrite rax, rsp
    mov rax, 0x681E
    lea rdx, [rip + 2f]
    vmwrite rax, rdx
    vmlaunch
    mov eax, 1
    ret
2:
    xor eax, eax
    ret

.global mzhv_vmexit_entry
mzhv_vmexit_entry:
    sub rsp, 0x80
    mov [rsp + 0x00], rax
    mov [rsp + 0x08], rcx
    mov [rsp + 0x10], rdx
    mov [rsp + 0x18], rbx
    mov [rsp + 0x20], rbp
    mov [rsp + 0x28], rsi
    mov [rsp + 0x30], rdi
    mov [rsp + 0x38], r8
    mov [rsp + 0x40], r9
    mov [rsp + 0x48], r10
    mov [rsp + 0x50], r11
    mov [rsp + 0x58], r12
    mov [rsp + 0x60], r13
    mov [rsp + 0x68], r14
    mov [rsp + 0x70], r15
    mov qword ptr [rsp + 0x78], 0
    mov rdi, rsp
    call mzhv_vmexit_handler
    test rax, rax
    jnz 3f
    mov rax, [rsp + 0x00]
    mov rcx, [rsp + 0x08]
    mov rdx, [rsp + 0x10]
    mov rbx, [rsp + 0x18]
    mov rbp, [rsp + 0x20]
    mov rsi, [rsp + 0x28]
    mov rdi, [rsp + 0x30]
    mov r8,  [rsp + 0x38]
    mov r9,  [rsp + 0x40]
    mov r10, [rsp + 0x48]
    mov r11, [rsp + 0x50]
    mov r12, [rsp + 0x58]
    mov r13, [rsp + 0x60]
    mov r14, [rsp + 0x68]
    mov r15, [rsp + 0x70]
    add rsp, 0x80
    vmresume
    ud2
3:
    mov rax, [rsp + 0x00]
    mov rbx, [rsp + 0x18]
    mov rbp, [rsp + 0x20]
    mov rsi, [rsp + 0x28]
    mov rdi, [rsp + 0x30]
    mov r8,  [rsp + 0x38]
    mov r9,  [rsp + 0x40]
    mov r10, [rsp + 0x48]
    mov r11, [rsp + 0x50]
    mov r12, [rsp + 0x58]
    mov r13, [rsp + 0x60]
    mov r14, [rsp + 0x68]
    mov r15, [rsp + 0x70]
    mov rcx, [rsp + 0x08]
    mov rdx, [rsp + 0x10]
    mov rsp, rdx
    push rcx
    ret
"#
);
