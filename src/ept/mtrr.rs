//! Memory-Type Range Register resolution.
//!
//! EPT leaves carry their own memory type, so the identity mapping has to
//! reproduce whatever cacheability the host configured through the MTRRs. The
//! MSRs are snapshotted once at enable time and projected onto leaves from
//! then on; later MTRR changes are not tracked.

use arrayvec::ArrayVec;

use crate::{HypervisorError, Result};

/// Memory types encodable in EPT leaves and MTRRs.
///
/// Reference: Intel SDM Table 12-8, "Memory Types That Can Be Encoded in MTRRs".
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

impl MemoryType {
    pub fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            0 => Ok(MemoryType::Uncacheable),
            1 => Ok(MemoryType::WriteCombining),
            4 => Ok(MemoryType::WriteThrough),
            5 => Ok(MemoryType::WriteProtected),
            6 => Ok(MemoryType::WriteBack),
            _ => Err(HypervisorError::MtrrConfiguration),
        }
    }
}

/// One valid variable-range register, decoded to `[base, base + length)`.
#[derive(Debug, Clone, Copy)]
struct VariableRange {
    base: u64,
    length: u64,
    kind: MemoryType,
}

impl VariableRange {
    fn contains(&self, pa: u64) -> bool {
        self.base <= pa && pa < self.base + self.length
    }
}

/// Architectural maximum of variable-range registers (VCNT is 8 bits).
const MAX_VARIABLE: usize = 255;

/// 4 KiB pages covered by the fixed-range registers (the first MiB).
pub const FIXED_PAGES: usize = 256;

const MTRRCAP_VCNT: u64 = 0xFF;
const MTRRCAP_FIX: u64 = 1 << 8;
const DEF_TYPE_FIXED_ENABLE: u64 = 1 << 10;
const DEF_TYPE_ENABLE: u64 = 1 << 11;
const PHYSMASK_VALID: u64 = 1 << 11;
/// Frame-number portion of a 52-bit physical address.
const FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Snapshot of the MTRR configuration, taken once at enable time.
#[derive(Debug)]
pub struct Mtrr {
    default_type: MemoryType,
    enabled: bool,
    fixed_enabled: bool,
    fixed: [MemoryType; FIXED_PAGES],
    variable: ArrayVec<VariableRange, MAX_VARIABLE>,
}

impl Mtrr {
    /// Snapshot the hardware MTRR MSRs of the executing core.
    pub fn read() -> Result<Self> {
        Self::from_reader(&mut |msr| unsafe { x86::msr::rdmsr(msr) })
    }

    /// Build a snapshot from an arbitrary MSR source.
    pub(crate) fn from_reader(read: &mut dyn FnMut(u32) -> u64) -> Result<Self> {
        use x86::msr::{
            IA32_MTRR_DEF_TYPE, IA32_MTRR_PHYSBASE0, IA32_MTRR_PHYSMASK0, IA32_MTRRCAP,
        };

        let cap = read(IA32_MTRRCAP);
        let def = read(IA32_MTRR_DEF_TYPE);

        let default_type = MemoryType::from_bits(def & 0xFF)?;
        let enabled = def & DEF_TYPE_ENABLE != 0;
        let fixed_supported = cap & MTRRCAP_FIX != 0;
        let fixed_enabled = fixed_supported && enabled && def & DEF_TYPE_FIXED_ENABLE != 0;

        let count = (cap & MTRRCAP_VCNT) as usize;
        let mut variable = ArrayVec::new();
        for i in 0..count {
            let base = read(IA32_MTRR_PHYSBASE0 + 2 * i as u32);
            let mask = read(IA32_MTRR_PHYSMASK0 + 2 * i as u32);
            if mask & PHYSMASK_VALID == 0 {
                continue;
            }
            let mask_pa = mask & FRAME_MASK;
            if mask_pa == 0 {
                return Err(HypervisorError::MtrrConfiguration);
            }
            variable.push(VariableRange {
                base: base & FRAME_MASK,
                // The least-significant set bit of the mask frame gives the
                // power-of-two range size.
                length: 1u64 << mask_pa.trailing_zeros(),
                kind: MemoryType::from_bits(base & 0xFF)?,
            });
        }

        let mut fixed = [default_type; FIXED_PAGES];
        if fixed_enabled {
            Self::read_fixed(read, &mut fixed)?;
        }

        Ok(Self {
            default_type,
            enabled,
            fixed_enabled,
            fixed,
            variable,
        })
    }

    /// Decode the eleven fixed-range MSRs into one memory type per 4 KiB page
    /// of the first MiB. Each MSR byte covers one fixed-range block.
    fn read_fixed(
        read: &mut dyn FnMut(u32) -> u64,
        fixed: &mut [MemoryType; FIXED_PAGES],
    ) -> Result<()> {
        use x86::msr::{
            IA32_MTRR_FIX4K_C0000, IA32_MTRR_FIX4K_C8000, IA32_MTRR_FIX4K_D0000,
            IA32_MTRR_FIX4K_D8000, IA32_MTRR_FIX4K_E0000, IA32_MTRR_FIX4K_E8000,
            IA32_MTRR_FIX4K_F0000, IA32_MTRR_FIX4K_F8000, IA32_MTRR_FIX16K_80000,
            IA32_MTRR_FIX16K_A0000, IA32_MTRR_FIX64K_00000,
        };

        // (MSR, pages per byte). Eleven registers cover 512K + 2x128K + 8x32K.
        let layout: [(u32, usize); 11] = [
            (IA32_MTRR_FIX64K_00000, 16),
            (IA32_MTRR_FIX16K_80000, 4),
            (IA32_MTRR_FIX16K_A0000, 4),
            (IA32_MTRR_FIX4K_C0000, 1),
            (IA32_MTRR_FIX4K_C8000, 1),
            (IA32_MTRR_FIX4K_D0000, 1),
            (IA32_MTRR_FIX4K_D8000, 1),
            (IA32_MTRR_FIX4K_E0000, 1),
            (IA32_MTRR_FIX4K_E8000, 1),
            (IA32_MTRR_FIX4K_F0000, 1),
            (IA32_MTRR_FIX4K_F8000, 1),
        ];

        let mut page = 0usize;
        for (msr, pages_per_byte) in layout {
            let value = read(msr);
            for byte in 0..8 {
                let kind = MemoryType::from_bits((value >> (byte * 8)) & 0xFF)?;
                for _ in 0..pages_per_byte {
                    fixed[page] = kind;
                    page += 1;
                }
            }
        }
        debug_assert_eq!(page, FIXED_PAGES);
        Ok(())
    }

    /// Resolve the memory type for a physical address from the variable
    /// ranges and the default type. Pure; repeated calls agree.
    pub fn resolve(&self, pa: u64) -> Result<MemoryType> {
        // With the MTRRs disabled every access is uncacheable.
        if !self.enabled {
            return Ok(MemoryType::Uncacheable);
        }

        let mut seen = 0u8;
        for range in &self.variable {
            if range.contains(pa) {
                seen |= 1 << range.kind as u8;
            }
        }
        match seen {
            0 => Ok(self.default_type),
            _ if seen.count_ones() == 1 => MemoryType::from_bits(seen.trailing_zeros() as u64),
            _ if seen & (1 << MemoryType::Uncacheable as u8) != 0 => Ok(MemoryType::Uncacheable),
            _ if seen
                == (1 << MemoryType::WriteThrough as u8) | (1 << MemoryType::WriteBack as u8) =>
            {
                Ok(MemoryType::WriteThrough)
            }
            _ => Err(HypervisorError::MtrrConfiguration),
        }
    }

    /// Whether the fixed-range overlay applies to the first MiB.
    pub fn fixed_overlay_enabled(&self) -> bool {
        self.fixed_enabled
    }

    /// Fixed-range memory type for a physical address below 1 MiB.
    pub fn fixed_type(&self, pa: u64) -> MemoryType {
        self.fixed[(pa >> 12) as usize & (FIXED_PAGES - 1)]
    }
}
