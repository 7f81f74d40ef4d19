//! CPUID exit handling.
//!
//! The guest's CPUID executes on the host and comes back almost verbatim.
//! Two leaves are doctored: the vendor identification leaf spells out a
//! different 12-byte string, and the feature leaf reports a hypervisor.

use super::GuestRegisters;

/// Vendor leaf registers after cloaking. In the architectural EBX, EDX, ECX
/// reading order the bytes spell `"AvocadoIntel"`.
pub const VENDOR_EBX: u32 = u32::from_le_bytes(*b"Avoc");
pub const VENDOR_EDX: u32 = u32::from_le_bytes(*b"adoI");
pub const VENDOR_ECX: u32 = u32::from_le_bytes(*b"ntel");

/// The cloaked vendor string as the guest reassembles it.
pub const VENDOR: &str = "AvocadoIntel";

const LEAF_VENDOR: u32 = 0;
const LEAF_FEATURES: u32 = 1;

/// ECX bit of the feature leaf telling the guest a hypervisor is present.
pub const FEATURE_HYPERVISOR_PRESENT: u32 = 1 << 31;

/// Execute CPUID for the guest's leaf/subleaf and hand the doctored result
/// back through the register frame. CPUID zero-extends into the 64-bit
/// registers.
pub fn handle(frame: &mut GuestRegisters) {
    let leaf = frame.rax as u32;
    let result = unsafe { core::arch::x86_64::__cpuid_count(leaf, frame.rcx as u32) };
    let (eax, mut ebx, mut ecx, mut edx) = (result.eax, result.ebx, result.ecx, result.edx);

    match leaf {
        LEAF_VENDOR => {
            ebx = VENDOR_EBX;
            edx = VENDOR_EDX;
            ecx = VENDOR_ECX;
        }
        LEAF_FEATURES => ecx |= FEATURE_HYPERVISOR_PRESENT,
        _ => {}
    }

    frame.rax = eax as u64;
    frame.rbx = ebx as u64;
    frame.rcx = ecx as u64;
    frame.rdx = edx as u64;
}
