//! MZHV is a type-II hypervisor for Intel VT-x that virtualizes the running
//! operating system and exposes a per-page memory remapping facility built on
//! Extended Page Tables.
//!
//! The distinguishing capability is the split read/write versus
//! instruction-fetch mapping: a single guest-physical 4 KiB page can be
//! redirected to one host-physical frame for data access and to a different
//! host-physical frame for instruction fetch, transparently to the guest. The
//! guest is trapped in a ping-pong between the two frames by an EPT leaf whose
//! permission bits only ever allow one access kind at a time.
//!
//! ## Architecture
//! ```text
//! ioctl (MAP/UNMAP) --> control --> broadcast --> vmcall on every core
//!                                                   |
//!                                  VM-exit dispatcher (root mode)
//!                                                   |
//!                              mapping engine <-> EPT tables <- MTRR resolver
//! ```
//!
//! The embedding kernel provides the OS primitives (non-paged executable
//! memory, physical/virtual inversion, core enumeration, inter-processor
//! broadcast, bug-check) through the [`platform::Platform`] trait.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod broadcast;
pub mod control;
pub mod ept;
pub mod hv;
pub mod hyperclient;
pub mod platform;
pub mod state;
pub mod vmcs;
pub mod vmexit;
pub mod vmx;

pub use hv::Hypervisor;
pub use platform::Platform;

/// Hypervisor error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    /// CPU is not an Intel part or does not report VMX
    NotSupported,
    /// IA32_FEATURE_CONTROL is locked with VMX-outside-SMX clear
    FeatureControlLocked,
    /// The processor does not implement the flexible ("true") VMX controls
    TrueControlsUnavailable,
    /// A required EPT or INVEPT capability is missing
    EptUnsupported,
    /// Memory allocation failed
    OutOfMemory,
    /// The MTRRs describe an invalid or conflicting memory-type layout
    MtrrConfiguration,
    /// Address is not 4 KiB aligned
    UnalignedAddress,
    /// Address lies outside the identity-mapped physical range
    OutOfRange,
    /// Every slot of the per-core split arena is in use
    SplitArenaFull,
    /// Every record of the per-core mapping table is in use
    MappingTableFull,
    /// A requested frame collides with an existing mapping record
    MappingConflict,
    /// No mapping record matches the given guest frame
    MappingNotFound,
    /// Request buffer or pointer failed validation
    InvalidParameter,
    /// A VMX instruction or VMCS access failed
    VmxFailure,
}

impl HypervisorError {
    /// Encode for the VMCALL result register. Zero is reserved for success.
    pub fn status(self) -> u64 {
        match self {
            HypervisorError::NotSupported => 1,
            HypervisorError::FeatureControlLocked => 2,
            HypervisorError::TrueControlsUnavailable => 3,
            HypervisorError::EptUnsupported => 4,
            HypervisorError::OutOfMemory => 5,
            HypervisorError::MtrrConfiguration => 6,
            HypervisorError::UnalignedAddress => 7,
            HypervisorError::OutOfRange => 8,
            HypervisorError::SplitArenaFull => 9,
            HypervisorError::MappingTableFull => 10,
            HypervisorError::MappingConflict => 11,
            HypervisorError::MappingNotFound => 12,
            HypervisorError::InvalidParameter => 13,
            HypervisorError::VmxFailure => 14,
        }
    }

    /// Decode a VMCALL result register. `None` for success and for values no
    /// current core produces.
    pub fn from_status(status: u64) -> Option<Self> {
        match status {
            1 => Some(HypervisorError::NotSupported),
            2 => Some(HypervisorError::FeatureControlLocked),
            3 => Some(HypervisorError::TrueControlsUnavailable),
            4 => Some(HypervisorError::EptUnsupported),
            5 => Some(HypervisorError::OutOfMemory),
            6 => Some(HypervisorError::MtrrConfiguration),
            7 => Some(HypervisorError::UnalignedAddress),
            8 => Some(HypervisorError::OutOfRange),
            9 => Some(HypervisorError::SplitArenaFull),
            10 => Some(HypervisorError::MappingTableFull),
            11 => Some(HypervisorError::MappingConflict),
            12 => Some(HypervisorError::MappingNotFound),
            13 => Some(HypervisorError::InvalidParameter),
            14 => Some(HypervisorError::VmxFailure),
            _ => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, HypervisorError>;

/// Contract violations and hardware misbehavior that can never be masked.
/// These bug-check the machine through [`Platform::fatal`].
#[derive(Debug, Clone, Copy)]
pub enum FatalError {
    /// A VM exit with a reason the dispatcher does not handle
    UnknownExitReason(u64),
    /// The processor reported an EPT misconfiguration at this guest-physical
    /// address
    EptMisconfiguration(u64),
    /// An EPT violation hit a page with no registered mapping record
    UnhandledEptViolation(u64),
    /// An EPT violation whose qualification is neither data nor fetch access
    UnknownAccessKind(u64),
    /// The host-physical to host-virtual inversion returned nothing for a
    /// paging-structure frame the hypervisor itself created
    PhysicalInversionFailed(u64),
    /// VMREAD or VMWRITE failed for the given field encoding
    VmcsAccess(u32),
}
