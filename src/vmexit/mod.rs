//! VM-exit dispatch.
//!
//! Hardware re-enters the hypervisor through the assembly stub in `vmx.rs`,
//! which saves the guest's general-purpose registers into a [`GuestRegisters`]
//! frame on the root-mode stack and calls [`mzhv_vmexit_handler`]. The handler
//! recovers the per-core state from the exit-context cell above the frame,
//! routes the exit reason, advances the guest RIP where the exit class calls
//! for it, and tells the stub whether to resume the guest or (after a
//! shutdown hypercall) to hand the thread back unvirtualized.

pub mod cpuid;
pub mod ept;
pub mod vmcall;

use x86::bits64::vmx::{vmread, vmwrite};
use x86::vmx::vmcs::{guest, ro};

use crate::FatalError;
use crate::hyperclient;
use crate::platform::Platform;
use crate::state::{ExitContext, VmmState};
use crate::vmx;

/// Basic exit reasons this hypervisor services.
///
/// Reference: Intel SDM Appendix C, basic exit reasons.
pub const EXIT_REASON_CPUID: u64 = 10;
pub const EXIT_REASON_VMCALL: u64 = 18;
pub const EXIT_REASON_EPT_VIOLATION: u64 = 48;
pub const EXIT_REASON_EPT_MISCONFIGURATION: u64 = 49;

/// Guest general-purpose registers as saved by the exit stub.
///
/// Field order is the stub's store order; RSP is not pushed by hardware and
/// is filled from the VMCS on entry, then written back when the exit class
/// advances the guest.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
}

/// What to do with the guest after a handled exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Step over the exiting instruction and resume
    Advance,
    /// Resume at the same RIP so the instruction retries
    Stay,
    /// Tear this core down and resume the thread unvirtualized
    Shutdown,
}

const STUB_RESUME: u64 = 0;
const STUB_EXIT: u64 = 1;

#[unsafe(no_mangle)]
unsafe extern "sysv64" fn mzhv_vmexit_handler(frame: *mut GuestRegisters) -> u64 {
    // The exit-context cell sits directly above the register frame, at the
    // address the VMCS host RSP was programmed with.
    let context =
        unsafe { &*((frame as usize + size_of::<GuestRegisters>()) as *const ExitContext) };
    let state = unsafe { &mut *context.state };
    let platform = context.platform;
    let frame = unsafe { &mut *frame };

    state.vmm_state = VmmState::Running;
    frame.rsp = must_read(platform, guest::RSP);

    let reason = must_read(platform, ro::EXIT_REASON) & 0xFFFF;
    let outcome = match reason {
        EXIT_REASON_CPUID => {
            cpuid::handle(frame);
            ExitOutcome::Advance
        }
        EXIT_REASON_VMCALL => {
            let op = frame.rcx;
            let outcome = vmcall::handle(state, frame);
            let changed = op == hyperclient::OP_INSTALL || op == hyperclient::OP_REMOVE;
            if changed && frame.rax == hyperclient::STATUS_SUCCESS {
                vmx::invept_all_contexts();
            }
            outcome
        }
        EXIT_REASON_EPT_VIOLATION => {
            let guest_pa = must_read(platform, ro::GUEST_PHYSICAL_ADDR_FULL);
            let qualification = must_read(platform, ro::EXIT_QUALIFICATION);
            ept::handle(state, platform, guest_pa, qualification);
            vmx::invept_all_contexts();
            ExitOutcome::Stay
        }
        EXIT_REASON_EPT_MISCONFIGURATION => {
            let guest_pa = must_read(platform, ro::GUEST_PHYSICAL_ADDR_FULL);
            platform.fatal(FatalError::EptMisconfiguration(guest_pa))
        }
        other => platform.fatal(FatalError::UnknownExitReason(other)),
    };

    match outcome {
        ExitOutcome::Stay => STUB_RESUME,
        ExitOutcome::Advance => {
            advance_guest(platform, frame);
            STUB_RESUME
        }
        ExitOutcome::Shutdown => {
            unsafe { shutdown_core(state, platform, frame) };
            STUB_EXIT
        }
    }
}

/// Step the guest over the instruction that exited and write its stack
/// pointer back.
fn advance_guest(platform: &dyn Platform, frame: &GuestRegisters) {
    let rip =
        must_read(platform, guest::RIP) + must_read(platform, ro::VMEXIT_INSTRUCTION_LEN);
    must_write(platform, guest::RIP, rip);
    must_write(platform, guest::RSP, frame.rsp);
}

/// Wind the core out of VMX operation: restore the interrupted thread's
/// address space and descriptor tables from the VMCS guest fields, VMXOFF,
/// and park the continuation RIP/RSP in the frame's RCX/RDX slots for the
/// stub's final jump.
unsafe fn shutdown_core(
    state: &mut crate::state::CoreState,
    platform: &dyn Platform,
    frame: &mut GuestRegisters,
) {
    state.vmm_state = VmmState::ShuttingDown;

    let resume_rip =
        must_read(platform, guest::RIP) + must_read(platform, ro::VMEXIT_INSTRUCTION_LEN);
    let resume_rsp = frame.rsp;
    let cr3 = must_read(platform, guest::CR3);
    let gdt_base = must_read(platform, guest::GDTR_BASE);
    let gdt_limit = must_read(platform, guest::GDTR_LIMIT);
    let idt_base = must_read(platform, guest::IDTR_BASE);
    let idt_limit = must_read(platform, guest::IDTR_LIMIT);

    unsafe {
        vmx::restore_host_context(cr3, gdt_base, gdt_limit as u16, idt_base, idt_limit as u16);
        vmx::vmxoff();
    }
    state.virtualized = false;

    frame.rcx = resume_rip;
    frame.rdx = resume_rsp;
}

fn must_read(platform: &dyn Platform, field: u32) -> u64 {
    match unsafe { vmread(field) } {
        Ok(value) => value,
        Err(_) => platform.fatal(FatalError::VmcsAccess(field)),
    }
}

fn must_write(platform: &dyn Platform, field: u32, value: u64) {
    if unsafe { vmwrite(field, value) }.is_err() {
        platform.fatal(FatalError::VmcsAccess(field));
    }
}
