//! Control device surface.
//!
//! The hypervisor is driven from user mode through a named control device
//! with two buffered I/O control functions: MAP installs a split mapping
//! from three caller pointers, UNMAP removes one. The embedding driver owns
//! registration and request plumbing; this module owns the request format,
//! its validation, and the translation of caller virtual addresses into the
//! host-physical frames the mapping engine works in. Create and close
//! operations have no side effects and need nothing from here.

use log::debug;

use crate::hv::Hypervisor;
use crate::{HypervisorError, Result};

/// OS-visible device names.
pub const DEVICE_NAME: &str = "MZHV";
pub const NT_DEVICE_PATH: &str = "\\Device\\MZHV";
pub const DOS_DEVICE_PATH: &str = "\\DosDevices\\MZHV";

/// I/O control function codes.
pub const FUNCTION_MAP: u32 = 0x1337;
pub const FUNCTION_UNMAP: u32 = 0x2137;

/// MAP input: three page-aligned caller virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    /// The page whose identity is split
    pub original: u64,
    /// Frame data accesses will see
    pub rw: u64,
    /// Frame instruction fetches will see
    pub fetch: u64,
}

impl MapRequest {
    /// Decode a buffered MAP input. Shorter buffers than three pointers are
    /// an invalid parameter.
    pub fn parse(input: &[u8]) -> Result<Self> {
        if input.len() < 24 {
            return Err(HypervisorError::InvalidParameter);
        }
        Ok(Self {
            original: read_pointer(input, 0),
            rw: read_pointer(input, 8),
            fetch: read_pointer(input, 16),
        })
    }
}

/// UNMAP input: the originally mapped caller virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapRequest {
    pub original: u64,
}

impl UnmapRequest {
    pub fn parse(input: &[u8]) -> Result<Self> {
        if input.len() < 8 {
            return Err(HypervisorError::InvalidParameter);
        }
        Ok(Self {
            original: read_pointer(input, 0),
        })
    }
}

fn read_pointer(input: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&input[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Dispatch one buffered I/O control request against the running hypervisor.
pub fn dispatch(hv: &Hypervisor, function: u32, input: &[u8]) -> Result<()> {
    match function {
        FUNCTION_MAP => {
            let request = MapRequest::parse(input)?;
            debug!("MAP {request:x?}");
            let guest = translate(hv, request.original)?;
            let rw = translate(hv, request.rw)?;
            let fetch = translate(hv, request.fetch)?;
            hv.install_mapping(guest, rw, fetch)
        }
        FUNCTION_UNMAP => {
            let request = UnmapRequest::parse(input)?;
            debug!("UNMAP {request:x?}");
            let guest = translate(hv, request.original)?;
            hv.remove_mapping(guest)
        }
        _ => Err(HypervisorError::InvalidParameter),
    }
}

/// Resolve a page-aligned caller virtual address to its host-physical frame.
fn translate(hv: &Hypervisor, va: u64) -> Result<u64> {
    if va & 0xFFF != 0 {
        return Err(HypervisorError::UnalignedAddress);
    }
    hv.platform()
        .virt_to_phys(va as *const u8)
        .ok_or(HypervisorError::InvalidParameter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_request_decodes_three_pointers() {
        let mut input = [0u8; 24];
        input[0..8].copy_from_slice(&0x1000u64.to_le_bytes());
        input[8..16].copy_from_slice(&0x2000u64.to_le_bytes());
        input[16..24].copy_from_slice(&0x3000u64.to_le_bytes());
        assert_eq!(
            MapRequest::parse(&input).unwrap(),
            MapRequest {
                original: 0x1000,
                rw: 0x2000,
                fetch: 0x3000,
            }
        );
    }

    #[test]
    fn short_buffers_are_invalid() {
        assert_eq!(
            MapRequest::parse(&[0u8; 23]),
            Err(HypervisorError::InvalidParameter)
        );
        assert_eq!(
            UnmapRequest::parse(&[0u8; 7]),
            Err(HypervisorError::InvalidParameter)
        );
    }

    #[test]
    fn oversized_buffers_take_the_leading_pointers() {
        let mut input = [0u8; 32];
        input[0..8].copy_from_slice(&0x7000u64.to_le_bytes());
        assert_eq!(UnmapRequest::parse(&input).unwrap().original, 0x7000);
    }
}
