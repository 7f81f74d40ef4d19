//! VMCS (Virtual Machine Control Structure) implementation
//!
//! The VMCS is a 4KB data structure that stores:
//! - Guest state (registers, segment descriptors, control registers)
//! - Host state (where to return on VM exit)
//! - VM execution controls
//! - VM exit controls
//! - VM entry controls
//!
//! This hypervisor virtualizes the thread it is launched from, so the guest
//! state written here is simply the core's current running state; the host
//! state points at the per-core root-mode stack and the VM-exit entry stub.

use core::arch::asm;

use x86::bits64::vmx::{vmclear, vmptrld, vmwrite};
use x86::msr::{self, rdmsr};
use x86::vmx::vmcs::{control, guest, host};

use crate::state::CoreState;
use crate::vmx::{self, adjust_controls};
use crate::{HypervisorError, Result};

// Primary processor-based controls.
const PROC_USE_MSR_BITMAPS: u32 = 1 << 28;
const PROC_ACTIVATE_SECONDARY: u32 = 1 << 31;

// Secondary processor-based controls. Beyond EPT itself, the guest keeps its
// instruction set: RDTSCP, INVPCID and XSAVES would fault without these.
const SEC_ENABLE_EPT: u32 = 1 << 1;
const SEC_ENABLE_RDTSCP: u32 = 1 << 3;
const SEC_ENABLE_INVPCID: u32 = 1 << 12;
const SEC_ENABLE_XSAVES: u32 = 1 << 20;

// VM-exit controls.
const EXIT_HOST_ADDRESS_SPACE_SIZE: u32 = 1 << 9;
const EXIT_SAVE_IA32_EFER: u32 = 1 << 20;
const EXIT_LOAD_IA32_EFER: u32 = 1 << 21;

// VM-entry controls.
const ENTRY_IA32E_MODE_GUEST: u32 = 1 << 9;
const ENTRY_LOAD_IA32_EFER: u32 = 1 << 15;

/// Access-rights value for an unusable segment.
const AR_UNUSABLE: u32 = 1 << 16;

unsafe extern "sysv64" {
    /// VM-exit entry stub (vmx.rs trampoline).
    unsafe fn mzhv_vmexit_entry();
}

fn write(field: u32, value: u64) -> Result<()> {
    unsafe { vmwrite(field, value) }.map_err(|_| HypervisorError::VmxFailure)
}

/// Initialize and activate the core's VMCS: clear + load the region, then
/// program controls, guest state (the current running state) and host state
/// (the root-mode stack and exit stub). Guest RSP/RIP are filled in by the
/// launch trampoline immediately before VMLAUNCH.
pub unsafe fn setup(state: &CoreState, system_cr3: u64) -> Result<()> {
    unsafe {
        vmclear(state.vmcs.pa()).map_err(|_| HypervisorError::VmxFailure)?;
        vmptrld(state.vmcs.pa()).map_err(|_| HypervisorError::VmxFailure)?;

        setup_controls(state)?;
        setup_guest_state()?;
        setup_host_state(state, system_cr3)?;
    }
    Ok(())
}

unsafe fn setup_controls(state: &CoreState) -> Result<()> {
    let pin = adjust_controls(0, unsafe { rdmsr(msr::IA32_VMX_TRUE_PINBASED_CTLS) });
    write(control::PINBASED_EXEC_CONTROLS, pin as u64)?;

    let proc = adjust_controls(
        PROC_USE_MSR_BITMAPS | PROC_ACTIVATE_SECONDARY,
        unsafe { rdmsr(msr::IA32_VMX_TRUE_PROCBASED_CTLS) },
    );
    write(control::PRIMARY_PROCBASED_EXEC_CONTROLS, proc as u64)?;

    let secondary = adjust_controls(
        SEC_ENABLE_EPT | SEC_ENABLE_RDTSCP | SEC_ENABLE_INVPCID | SEC_ENABLE_XSAVES,
        unsafe { rdmsr(msr::IA32_VMX_PROCBASED_CTLS2) },
    );
    write(control::SECONDARY_PROCBASED_EXEC_CONTROLS, secondary as u64)?;

    let exit = adjust_controls(
        EXIT_HOST_ADDRESS_SPACE_SIZE | EXIT_SAVE_IA32_EFER | EXIT_LOAD_IA32_EFER,
        unsafe { rdmsr(msr::IA32_VMX_TRUE_EXIT_CTLS) },
    );
    write(control::VMEXIT_CONTROLS, exit as u64)?;

    let entry = adjust_controls(
        ENTRY_IA32E_MODE_GUEST | ENTRY_LOAD_IA32_EFER,
        unsafe { rdmsr(msr::IA32_VMX_TRUE_ENTRY_CTLS) },
    );
    write(control::VMENTRY_CONTROLS, entry as u64)?;

    write(control::EXCEPTION_BITMAP, 0)?;
    write(control::CR3_TARGET_COUNT, 0)?;
    write(control::VMEXIT_MSR_STORE_COUNT, 0)?;
    write(control::VMEXIT_MSR_LOAD_COUNT, 0)?;
    write(control::VMENTRY_MSR_LOAD_COUNT, 0)?;

    write(control::MSR_BITMAPS_ADDR_FULL, state.msr_bitmap.pa())?;
    write(control::EPTP_FULL, state.eptp())?;

    // No CR shadowing; guest reads and writes control registers directly.
    write(control::CR0_GUEST_HOST_MASK, 0)?;
    write(control::CR4_GUEST_HOST_MASK, 0)?;
    write(control::CR0_READ_SHADOW, unsafe { vmx::read_cr0() })?;
    write(control::CR4_READ_SHADOW, unsafe { vmx::read_cr4() })?;
    Ok(())
}

unsafe fn setup_guest_state() -> Result<()> {
    let gdtr = read_gdtr();
    let idtr = read_idtr();

    let segments: [(u16, u32, u32, u32, u32); 6] = [
        (read_es(), guest::ES_SELECTOR, guest::ES_LIMIT, guest::ES_ACCESS_RIGHTS, guest::ES_BASE),
        (read_cs(), guest::CS_SELECTOR, guest::CS_LIMIT, guest::CS_ACCESS_RIGHTS, guest::CS_BASE),
        (read_ss(), guest::SS_SELECTOR, guest::SS_LIMIT, guest::SS_ACCESS_RIGHTS, guest::SS_BASE),
        (read_ds(), guest::DS_SELECTOR, guest::DS_LIMIT, guest::DS_ACCESS_RIGHTS, guest::DS_BASE),
        (read_fs(), guest::FS_SELECTOR, guest::FS_LIMIT, guest::FS_ACCESS_RIGHTS, guest::FS_BASE),
        (read_gs(), guest::GS_SELECTOR, guest::GS_LIMIT, guest::GS_ACCESS_RIGHTS, guest::GS_BASE),
    ];
    for (selector, sel_field, limit_field, ar_field, base_field) in segments {
        let descriptor = parse_descriptor(gdtr.base, selector);
        write(sel_field, selector as u64)?;
        write(limit_field, descriptor.limit as u64)?;
        write(ar_field, descriptor.access_rights as u64)?;
        write(base_field, descriptor.base)?;
    }
    // FS and GS bases come from their MSRs in 64-bit mode.
    write(guest::FS_BASE, unsafe { rdmsr(msr::IA32_FS_BASE) })?;
    write(guest::GS_BASE, unsafe { rdmsr(msr::IA32_GS_BASE) })?;

    let tr = read_tr();
    let tss = parse_descriptor(gdtr.base, tr);
    write(guest::TR_SELECTOR, tr as u64)?;
    write(guest::TR_LIMIT, tss.limit as u64)?;
    write(guest::TR_ACCESS_RIGHTS, tss.access_rights as u64)?;
    write(guest::TR_BASE, tss.base)?;

    let ldtr = read_ldtr();
    let ldt = parse_descriptor(gdtr.base, ldtr);
    write(guest::LDTR_SELECTOR, ldtr as u64)?;
    write(guest::LDTR_LIMIT, ldt.limit as u64)?;
    write(guest::LDTR_ACCESS_RIGHTS, ldt.access_rights as u64)?;
    write(guest::LDTR_BASE, ldt.base)?;

    write(guest::GDTR_BASE, gdtr.base as u64)?;
    write(guest::GDTR_LIMIT, gdtr.limit as u64)?;
    write(guest::IDTR_BASE, idtr.base as u64)?;
    write(guest::IDTR_LIMIT, idtr.limit as u64)?;

    unsafe {
        write(guest::CR0, vmx::read_cr0())?;
        write(guest::CR3, vmx::read_cr3())?;
        write(guest::CR4, vmx::read_cr4())?;
        write(guest::DR7, vmx::read_dr7())?;
        write(guest::RFLAGS, read_rflags())?;
        write(guest::IA32_DEBUGCTL_FULL, rdmsr(msr::IA32_DEBUGCTL))?;
        write(guest::IA32_SYSENTER_CS, rdmsr(msr::IA32_SYSENTER_CS))?;
        write(guest::IA32_SYSENTER_ESP, rdmsr(msr::IA32_SYSENTER_ESP))?;
        write(guest::IA32_SYSENTER_EIP, rdmsr(msr::IA32_SYSENTER_EIP))?;
        write(guest::IA32_EFER_FULL, rdmsr(msr::IA32_EFER))?;
    }

    write(guest::LINK_PTR_FULL, u64::MAX)?;
    write(guest::ACTIVITY_STATE, 0)?;
    write(guest::INTERRUPTIBILITY_STATE, 0)?;
    Ok(())
}

unsafe fn setup_host_state(state: &CoreState, system_cr3: u64) -> Result<()> {
    let gdtr = read_gdtr();
    let idtr = read_idtr();

    // Host selectors must carry no RPL or TI bits.
    write(host::ES_SELECTOR, (read_es() & !7) as u64)?;
    write(host::CS_SELECTOR, (read_cs() & !7) as u64)?;
    write(host::SS_SELECTOR, (read_ss() & !7) as u64)?;
    write(host::DS_SELECTOR, (read_ds() & !7) as u64)?;
    write(host::FS_SELECTOR, (read_fs() & !7) as u64)?;
    write(host::GS_SELECTOR, (read_gs() & !7) as u64)?;
    write(host::TR_SELECTOR, (read_tr() & !7) as u64)?;

    // The root-mode address space is the baseline captured by enable, not
    // whatever context the enable broadcast interrupted.
    write(host::CR3, system_cr3)?;
    unsafe {
        write(host::CR0, vmx::read_cr0())?;
        write(host::CR4, vmx::read_cr4())?;
        write(host::FS_BASE, rdmsr(msr::IA32_FS_BASE))?;
        write(host::GS_BASE, rdmsr(msr::IA32_GS_BASE))?;
        write(host::IA32_SYSENTER_CS, rdmsr(msr::IA32_SYSENTER_CS))?;
        write(host::IA32_SYSENTER_ESP, rdmsr(msr::IA32_SYSENTER_ESP))?;
        write(host::IA32_SYSENTER_EIP, rdmsr(msr::IA32_SYSENTER_EIP))?;
        write(host::IA32_EFER_FULL, rdmsr(msr::IA32_EFER))?;
    }

    let tss = parse_descriptor(gdtr.base, read_tr());
    write(host::TR_BASE, tss.base)?;
    write(host::GDTR_BASE, gdtr.base as u64)?;
    write(host::IDTR_BASE, idtr.base as u64)?;

    write(host::RSP, state.host_rsp())?;
    write(host::RIP, mzhv_vmexit_entry as usize as u64)?;
    Ok(())
}

/// A segment descriptor flattened into the pieces the VMCS wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegmentDescriptor {
    base: u64,
    limit: u32,
    access_rights: u32,
}

const UNUSABLE: SegmentDescriptor = SegmentDescriptor {
    base: 0,
    limit: 0,
    access_rights: AR_UNUSABLE,
};

/// Decode a descriptor from the table at `table_base`. System descriptors
/// (TSS, LDT) are 16 bytes and carry the upper base half in the second
/// quadword.
///
/// Reference: Intel SDM Figure 3-8, segment descriptor.
fn parse_descriptor(table_base: u64, selector: u16) -> SegmentDescriptor {
    if selector & !0x7 == 0 {
        return UNUSABLE;
    }
    let index = (selector >> 3) as u64;
    let entry = unsafe { *((table_base + index * 8) as *const u64) };

    let mut base = (entry >> 16) & 0x00FF_FFFF | ((entry >> 56) & 0xFF) << 24;
    let mut limit = (entry & 0xFFFF | (entry >> 32) & 0xF_0000) as u32;
    if entry & (1 << 55) != 0 {
        // Granularity: the limit counts 4 KiB units.
        limit = (limit << 12) | 0xFFF;
    }
    let access = (entry >> 40) & 0xFF;
    let flags = (entry >> 52) & 0xF;
    if access & (1 << 4) == 0 {
        // System descriptor: 16 bytes, upper base half follows.
        let upper = unsafe { *((table_base + index * 8 + 8) as *const u64) };
        base |= (upper & 0xFFFF_FFFF) << 32;
    }
    SegmentDescriptor {
        base,
        limit,
        access_rights: (access | flags << 12) as u32,
    }
}

// Selector, flag and descriptor-table reads. Plain asm; these have no
// privileged-instruction wrappers worth pulling in.

fn read_cs() -> u16 {
    let value: u16;
    unsafe { asm!("mov {:x}, cs", out(reg) value, options(nomem, nostack)) };
    value
}

fn read_ss() -> u16 {
    let value: u16;
    unsafe { asm!("mov {:x}, ss", out(reg) value, options(nomem, nostack)) };
    value
}

fn read_ds() -> u16 {
    let value: u16;
    unsafe { asm!("mov {:x}, ds", out(reg) value, options(nomem, nostack)) };
    value
}

fn read_es() -> u16 {
    let value: u16;
    unsafe { asm!("mov {:x}, es", out(reg) value, options(nomem, nostack)) };
    value
}

fn read_fs() -> u16 {
    let value: u16;
    unsafe { asm!("mov {:x}, fs", out(reg) value, options(nomem, nostack)) };
    value
}

fn read_gs() -> u16 {
    let value: u16;
    unsafe { asm!("mov {:x}, gs", out(reg) value, options(nomem, nostack)) };
    value
}

fn read_tr() -> u16 {
    let value: u16;
    unsafe { asm!("str {:x}", out(reg) value, options(nomem, nostack)) };
    value
}

fn read_ldtr() -> u16 {
    let value: u16;
    unsafe { asm!("sldt {:x}", out(reg) value, options(nomem, nostack)) };
    value
}

fn read_rflags() -> u64 {
    let value: u64;
    unsafe { asm!("pushfq", "pop {}", out(reg) value) };
    value
}

/// Base and limit of a descriptor table register.
#[derive(Debug, Clone, Copy)]
struct TableRegister {
    limit: u16,
    base: u64,
}

fn read_gdtr() -> TableRegister {
    let mut raw = [0u8; 10];
    unsafe { asm!("sgdt [{}]", in(reg) raw.as_mut_ptr(), options(nostack)) };
    decode_table_register(&raw)
}

fn read_idtr() -> TableRegister {
    let mut raw = [0u8; 10];
    unsafe { asm!("sidt [{}]", in(reg) raw.as_mut_ptr(), options(nostack)) };
    decode_table_register(&raw)
}

fn decode_table_register(raw: &[u8; 10]) -> TableRegister {
    TableRegister {
        limit: u16::from_le_bytes([raw[0], raw[1]]),
        base: u64::from_le_bytes([
            raw[2], raw[3], raw[4], raw[5], raw[6], raw[7], raw[8], raw[9],
        ]),
    }
}
