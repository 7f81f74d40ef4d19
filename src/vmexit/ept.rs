//! EPT-violation servicing.
//!
//! A violation on a mapped page is the engine working as intended: the guest
//! touched the page with the access kind its leaf currently forbids, so the
//! active view flips to the other host frame. The faulting instruction then
//! retries against the new mapping; RIP is never advanced here. A violation
//! anywhere else means the tables are not what the hypervisor built, which
//! is unrecoverable.

use log::trace;

use crate::FatalError;
use crate::ept::mapping::Access;
use crate::platform::Platform;
use crate::state::CoreState;

/// Resolve one EPT violation by flipping the mapped page the guest touched.
pub fn handle(state: &mut CoreState, platform: &dyn Platform, guest_pa: u64, qualification: u64) {
    let page = guest_pa & !0xFFF;
    let access = Access::from_bits_truncate(qualification);
    let Some(kind) = access.kind() else {
        platform.fatal(FatalError::UnknownAccessKind(qualification));
    };
    trace!("EPT violation at {guest_pa:#x}, {kind:?}");

    if state.flip_mapping(page, kind).is_err() {
        platform.fatal(FatalError::UnhandledEptViolation(guest_pa));
    }
}
