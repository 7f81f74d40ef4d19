//! Cross-core dispatch.
//!
//! Mapping state is per-core, so install, remove and shutdown must reach
//! every logical core. Each entry point broadcasts a function through the
//! platform's inter-processor primitive; on each core the function marshals
//! the request into registers and traps into the local dispatcher with a
//! `vmcall`. The broadcast barrier is the only suspension point callers see,
//! and it serializes whole operations across cores: the aggregate result is
//! success iff every core succeeded.

use crate::Result;
use crate::hyperclient;
use crate::platform::Platform;

/// Install a split mapping on every core.
pub fn install(platform: &dyn Platform, guest: u64, rw: u64, fetch: u64) -> Result<()> {
    let request =
        move || hyperclient::check(hyperclient::call(hyperclient::OP_INSTALL, guest, rw, fetch));
    platform.run_on_each_core(&request)
}

/// Remove a split mapping on every core.
pub fn remove(platform: &dyn Platform, guest: u64) -> Result<()> {
    let request = move || hyperclient::check(hyperclient::call(hyperclient::OP_REMOVE, guest, 0, 0));
    platform.run_on_each_core(&request)
}

/// Shut down every core for which `is_virtualized` reports true. Cores that
/// never came up are skipped; a `vmcall` outside VMX operation would fault.
pub fn shutdown(
    platform: &dyn Platform,
    is_virtualized: &(dyn Fn() -> bool + Sync),
) -> Result<()> {
    platform.run_on_each_core(&|| {
        if is_virtualized() {
            hyperclient::check(hyperclient::call(hyperclient::OP_SHUTDOWN, 0, 0, 0))
        } else {
            Ok(())
        }
    })
}
