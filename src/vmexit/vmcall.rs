//! VMCALL (hyperclient) servicing.
//!
//! The operation code arrives in RCX, arguments in RDX, R8 and R9, and the
//! status goes back to the caller in RAX. Operation codes the hypervisor
//! does not define pass through with every register untouched.

use super::{ExitOutcome, GuestRegisters};
use crate::hyperclient;
use crate::state::CoreState;

/// Dispatch one hypercall against this core's state.
pub fn handle(state: &mut CoreState, frame: &mut GuestRegisters) -> ExitOutcome {
    match frame.rcx {
        hyperclient::OP_SHUTDOWN => {
            frame.rax = hyperclient::STATUS_SUCCESS;
            ExitOutcome::Shutdown
        }
        hyperclient::OP_INSTALL => {
            frame.rax = status(state.install_mapping(frame.rdx, frame.r8, frame.r9));
            ExitOutcome::Advance
        }
        hyperclient::OP_REMOVE => {
            frame.rax = status(state.remove_mapping(frame.rdx));
            ExitOutcome::Advance
        }
        _ => ExitOutcome::Advance,
    }
}

fn status(result: crate::Result<()>) -> u64 {
    match result {
        Ok(()) => hyperclient::STATUS_SUCCESS,
        Err(err) => err.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HypervisorError;
    use crate::ept::mtrr::Mtrr;
    use crate::platform::testing::TestPlatform;
    use x86::msr::{IA32_MTRR_DEF_TYPE, IA32_MTRRCAP};

    fn core_state() -> alloc::boxed::Box<CoreState> {
        let platform = TestPlatform::leaked();
        let msrs = [(IA32_MTRRCAP, 0u64), (IA32_MTRR_DEF_TYPE, (1 << 11) | 6)];
        let mtrr = Mtrr::from_reader(&mut |msr| {
            msrs.iter()
                .find(|(m, _)| *m == msr)
                .map(|(_, v)| *v)
                .unwrap_or(0)
        })
        .unwrap();
        CoreState::new(platform, 1, &mtrr).unwrap()
    }

    fn call_frame(op: u64, arg1: u64, arg2: u64, arg3: u64) -> GuestRegisters {
        GuestRegisters {
            rax: 0xFEED,
            rcx: op,
            rdx: arg1,
            r8: arg2,
            r9: arg3,
            ..Default::default()
        }
    }

    #[test]
    fn install_reports_success_and_creates_the_mapping() {
        let mut state = core_state();
        let mut frame = call_frame(hyperclient::OP_INSTALL, 0x5000, 0x6000, 0x7000);
        assert_eq!(handle(&mut state, &mut frame), ExitOutcome::Advance);
        assert_eq!(frame.rax, hyperclient::STATUS_SUCCESS);
        assert_eq!(state.mappings.len(), 1);
    }

    #[test]
    fn install_failures_surface_as_status_codes() {
        let mut state = core_state();
        let mut frame = call_frame(hyperclient::OP_INSTALL, 0x5001, 0x6000, 0x7000);
        handle(&mut state, &mut frame);
        assert_eq!(frame.rax, HypervisorError::UnalignedAddress.status());
        assert!(state.mappings.is_empty());
    }

    #[test]
    fn remove_round_trips() {
        let mut state = core_state();
        let mut frame = call_frame(hyperclient::OP_INSTALL, 0x5000, 0x6000, 0x7000);
        handle(&mut state, &mut frame);

        let mut frame = call_frame(hyperclient::OP_REMOVE, 0x5000, 0, 0);
        assert_eq!(handle(&mut state, &mut frame), ExitOutcome::Advance);
        assert_eq!(frame.rax, hyperclient::STATUS_SUCCESS);
        assert!(state.mappings.is_empty());

        let mut frame = call_frame(hyperclient::OP_REMOVE, 0x5000, 0, 0);
        handle(&mut state, &mut frame);
        assert_eq!(frame.rax, HypervisorError::MappingNotFound.status());
    }

    #[test]
    fn shutdown_requests_teardown_with_a_success_status() {
        let mut state = core_state();
        let mut frame = call_frame(hyperclient::OP_SHUTDOWN, 0, 0, 0);
        assert_eq!(handle(&mut state, &mut frame), ExitOutcome::Shutdown);
        assert_eq!(frame.rax, hyperclient::STATUS_SUCCESS);
    }

    #[test]
    fn unknown_operations_leave_rax_untouched() {
        let mut state = core_state();
        let mut frame = call_frame(0x1234, 0x5000, 0x6000, 0x7000);
        assert_eq!(handle(&mut state, &mut frame), ExitOutcome::Advance);
        assert_eq!(frame.rax, 0xFEED);
        assert!(state.mappings.is_empty());
    }
}
