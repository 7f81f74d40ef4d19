//! Split read/write versus instruction-fetch mapping engine.
//!
//! A mapping record redirects one guest-physical page to two host frames:
//! data accesses see the rw-target, instruction fetches see the fetch-target.
//! The EPT leaf for the page only ever permits one access kind, so every
//! opposite-kind access traps and the handler flips the leaf to the other
//! frame. Installation leaves the page dormant (no permissions at all) so the
//! very first access already takes the violation path.

use bitflags::bitflags;
use log::{debug, trace};

use super::{Ept, SplitArena};
use crate::{HypervisorError, Result};

/// Mapping records per core.
pub const MAPPING_CAPACITY: usize = 32;

bitflags! {
    /// Access bits of an EPT-violation exit qualification.
    ///
    /// Reference: Intel SDM Table 28-7, exit qualification for EPT violations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const FETCH = 1 << 2;
    }
}

/// The two access classes a mapping distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Data,
    Fetch,
}

impl Access {
    /// Classify a violation. `None` for qualifications that report neither a
    /// data access nor a fetch; those are fatal at the call site.
    pub fn kind(self) -> Option<AccessKind> {
        if self.contains(Access::FETCH) {
            Some(AccessKind::Fetch)
        } else if self.intersects(Access::READ | Access::WRITE) {
            Some(AccessKind::Data)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MappingRecord {
    guest: u64,
    rw: u64,
    fetch: u64,
    valid: bool,
}

/// Fixed-capacity table of the mappings active on one core.
#[derive(Default)]
pub struct MappingTable {
    records: [MappingRecord; MAPPING_CAPACITY],
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of valid records.
    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| r.valid).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, guest: u64) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.valid && r.guest == guest)
    }

    fn first_free(&self) -> Option<usize> {
        self.records.iter().position(|r| !r.valid)
    }

    /// Whether any of the candidate frames appears anywhere in an existing
    /// record. Frames may repeat within one record, but never across records.
    fn conflicts(&self, frames: &[u64]) -> bool {
        self.records.iter().filter(|r| r.valid).any(|r| {
            frames
                .iter()
                .any(|&f| f == r.guest || f == r.rw || f == r.fetch)
        })
    }
}

fn page_aligned(pa: u64) -> bool {
    pa & 0xFFF == 0
}

/// Register a split mapping for `guest` and park its EPT leaf in the dormant
/// state (identity frame, no permissions). Fails without state changes on
/// unaligned frames, frame collisions, a full table or a full split arena.
pub fn install(
    ept: &mut Ept,
    arena: &mut SplitArena,
    table: &mut MappingTable,
    guest: u64,
    rw: u64,
    fetch: u64,
) -> Result<()> {
    if !page_aligned(guest) || !page_aligned(rw) || !page_aligned(fetch) {
        return Err(HypervisorError::UnalignedAddress);
    }
    if table.conflicts(&[guest, rw, fetch]) {
        return Err(HypervisorError::MappingConflict);
    }
    let slot = table.first_free().ok_or(HypervisorError::MappingTableFull)?;

    ept.change_mapping(arena, guest, guest, false, false)?;
    table.records[slot] = MappingRecord {
        guest,
        rw,
        fetch,
        valid: true,
    };
    debug!("installed mapping {guest:#x} -> rw {rw:#x} / fetch {fetch:#x}");
    Ok(())
}

/// Drop the mapping for `guest` and restore its identity leaf with full
/// permissions. Fails without state changes when no record matches.
pub fn remove(
    ept: &mut Ept,
    arena: &mut SplitArena,
    table: &mut MappingTable,
    guest: u64,
) -> Result<()> {
    let index = table.find(guest).ok_or(HypervisorError::MappingNotFound)?;
    ept.change_mapping(arena, guest, guest, true, true)?;
    table.records[index].valid = false;
    debug!("removed mapping {guest:#x}");
    Ok(())
}

/// Swap the active view of a mapped page after an EPT violation: data
/// accesses activate the rw-target and revoke fetch, fetches activate the
/// fetch-target and revoke data access.
pub fn flip(
    ept: &mut Ept,
    arena: &mut SplitArena,
    table: &mut MappingTable,
    guest: u64,
    kind: AccessKind,
) -> Result<()> {
    let index = table.find(guest).ok_or(HypervisorError::MappingNotFound)?;
    let record = table.records[index];
    match kind {
        AccessKind::Data => ept.change_mapping(arena, guest, record.rw, true, false)?,
        AccessKind::Fetch => ept.change_mapping(arena, guest, record.fetch, false, true)?,
    }
    trace!("flipped {guest:#x} to {kind:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::mtrr::Mtrr;
    use crate::platform::testing::TestPlatform;
    use x86::msr::{IA32_MTRR_DEF_TYPE, IA32_MTRRCAP};

    const PAGE: u64 = 0x1000;

    fn fixture() -> (Ept, SplitArena, MappingTable) {
        let platform = TestPlatform::leaked();
        let msrs = [(IA32_MTRRCAP, 0u64), (IA32_MTRR_DEF_TYPE, (1 << 11) | 6)];
        let mtrr = Mtrr::from_reader(&mut |msr| {
            msrs.iter()
                .find(|(m, _)| *m == msr)
                .map(|(_, v)| *v)
                .unwrap_or(0)
        })
        .unwrap();
        let mut arena = SplitArena::new(platform).unwrap();
        let ept = Ept::build(platform, 1, &mtrr, &mut arena).unwrap();
        (ept, arena, MappingTable::new())
    }

    /// Distinct page frames spread across distinct 2 MiB regions so capacity
    /// tests exercise the mapping table rather than the split arena.
    fn page_in_region(region: u64, page: u64) -> u64 {
        (region << 21) | (page << 12)
    }

    #[test]
    fn install_parks_the_leaf_dormant() {
        let (mut ept, mut arena, mut table) = fixture();
        install(&mut ept, &mut arena, &mut table, 0x5000, 0x6000, 0x7000).unwrap();

        let leaf = ept.leaf(0x5000).unwrap().entry;
        assert_eq!(leaf.pfn(), 0x5);
        assert!(!leaf.readable() && !leaf.writable() && !leaf.executable());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unaligned_frames_are_rejected() {
        let (mut ept, mut arena, mut table) = fixture();
        for (g, r, f) in [
            (0x5000 + 1, 0x6000, 0x7000),
            (0x5000, 0x6000 + 1, 0x7000),
            (0x5000, 0x6000, 0x7000 + 1),
        ] {
            assert_eq!(
                install(&mut ept, &mut arena, &mut table, g, r, f),
                Err(HypervisorError::UnalignedAddress)
            );
        }
        assert!(table.is_empty());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn self_references_within_one_record_are_legal() {
        let (mut ept, mut arena, mut table) = fixture();
        // install(A, rw=B, fetch=A): the swap-on-access scenario.
        install(&mut ept, &mut arena, &mut table, 0x5000, 0x6000, 0x5000).unwrap();
    }

    #[test]
    fn frames_of_other_records_are_rejected() {
        let (mut ept, mut arena, mut table) = fixture();
        install(&mut ept, &mut arena, &mut table, 0x5000, 0x6000, 0x5000).unwrap();

        // New guest key collides with an existing rw-target.
        assert_eq!(
            install(&mut ept, &mut arena, &mut table, 0x6000, 0x8000, 0x8000),
            Err(HypervisorError::MappingConflict)
        );
        // rw-target collides with an existing guest key.
        assert_eq!(
            install(&mut ept, &mut arena, &mut table, 0x9000, 0x5000, 0xA000),
            Err(HypervisorError::MappingConflict)
        );
        // fetch-target collides with an existing rw-target.
        assert_eq!(
            install(&mut ept, &mut arena, &mut table, 0x9000, 0xA000, 0x6000),
            Err(HypervisorError::MappingConflict)
        );
        // Duplicate guest key.
        assert_eq!(
            install(&mut ept, &mut arena, &mut table, 0x5000, 0xB000, 0xC000),
            Err(HypervisorError::MappingConflict)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn the_thirty_third_mapping_fails_until_one_is_removed() {
        let (mut ept, mut arena, mut table) = fixture();
        for k in 0..MAPPING_CAPACITY as u64 {
            install(
                &mut ept,
                &mut arena,
                &mut table,
                page_in_region(k, 1),
                page_in_region(k, 2),
                page_in_region(k, 3),
            )
            .unwrap();
        }
        assert_eq!(table.len(), MAPPING_CAPACITY);

        assert_eq!(
            install(
                &mut ept,
                &mut arena,
                &mut table,
                page_in_region(0, 4),
                page_in_region(0, 5),
                page_in_region(0, 6),
            ),
            Err(HypervisorError::MappingTableFull)
        );

        remove(&mut ept, &mut arena, &mut table, page_in_region(7, 1)).unwrap();
        install(
            &mut ept,
            &mut arena,
            &mut table,
            page_in_region(0, 4),
            page_in_region(0, 5),
            page_in_region(0, 6),
        )
        .unwrap();
        assert_eq!(table.len(), MAPPING_CAPACITY);
    }

    #[test]
    fn remove_restores_the_identity_leaf() {
        let (mut ept, mut arena, mut table) = fixture();
        install(&mut ept, &mut arena, &mut table, 0x5000, 0x6000, 0x7000).unwrap();
        flip(&mut ept, &mut arena, &mut table, 0x5000, AccessKind::Data).unwrap();
        remove(&mut ept, &mut arena, &mut table, 0x5000).unwrap();

        let leaf = ept.leaf(0x5000).unwrap().entry;
        assert_eq!(leaf.pfn(), 0x5);
        assert!(leaf.readable() && leaf.writable() && leaf.executable());
        assert!(table.is_empty());

        // The split itself is permanent.
        assert_eq!(arena.used(), 1);
    }

    #[test]
    fn remove_of_an_unknown_key_changes_nothing() {
        let (mut ept, mut arena, mut table) = fixture();
        install(&mut ept, &mut arena, &mut table, 0x5000, 0x6000, 0x7000).unwrap();
        assert_eq!(
            remove(&mut ept, &mut arena, &mut table, 0x8000),
            Err(HypervisorError::MappingNotFound)
        );
        assert_eq!(table.len(), 1);
        let leaf = ept.leaf(0x5000).unwrap().entry;
        assert!(!leaf.readable() && !leaf.writable() && !leaf.executable());
    }

    #[test]
    fn flips_alternate_between_the_two_frames() {
        let (mut ept, mut arena, mut table) = fixture();
        install(&mut ept, &mut arena, &mut table, 0x5000, 0x6000, 0x7000).unwrap();

        flip(&mut ept, &mut arena, &mut table, 0x5000, AccessKind::Data).unwrap();
        let leaf = ept.leaf(0x5000).unwrap().entry;
        assert_eq!(leaf.pfn(), 0x6);
        assert!(leaf.readable() && leaf.writable() && !leaf.executable());

        flip(&mut ept, &mut arena, &mut table, 0x5000, AccessKind::Fetch).unwrap();
        let leaf = ept.leaf(0x5000).unwrap().entry;
        assert_eq!(leaf.pfn(), 0x7);
        assert!(!leaf.readable() && !leaf.writable() && leaf.executable());

        flip(&mut ept, &mut arena, &mut table, 0x5000, AccessKind::Data).unwrap();
        let leaf = ept.leaf(0x5000).unwrap().entry;
        assert_eq!(leaf.pfn(), 0x6);
        assert!(leaf.readable() && leaf.writable() && !leaf.executable());
    }

    #[test]
    fn flip_requires_a_record() {
        let (mut ept, mut arena, mut table) = fixture();
        assert_eq!(
            flip(&mut ept, &mut arena, &mut table, 0x5000, AccessKind::Data),
            Err(HypervisorError::MappingNotFound)
        );
    }

    #[test]
    fn exactly_one_access_class_is_live_after_a_flip() {
        let (mut ept, mut arena, mut table) = fixture();
        install(&mut ept, &mut arena, &mut table, 0x5000, 0x6000, 0x7000).unwrap();
        for kind in [AccessKind::Data, AccessKind::Fetch, AccessKind::Data] {
            flip(&mut ept, &mut arena, &mut table, 0x5000, kind).unwrap();
            let leaf = ept.leaf(0x5000).unwrap().entry;
            let data = leaf.readable() && leaf.writable();
            assert!(data ^ leaf.executable());
        }
    }

    #[test]
    fn qualification_classification() {
        assert_eq!(Access::READ.kind(), Some(AccessKind::Data));
        assert_eq!(Access::WRITE.kind(), Some(AccessKind::Data));
        assert_eq!(
            (Access::READ | Access::WRITE).kind(),
            Some(AccessKind::Data)
        );
        assert_eq!(Access::FETCH.kind(), Some(AccessKind::Fetch));
        assert_eq!(Access::empty().kind(), None);
    }

    #[test]
    fn install_failure_inside_the_ept_leaves_no_record() {
        let (mut ept, mut arena, mut table) = fixture();
        // Exhaust the split arena with permissionless leaves elsewhere.
        for k in 0..crate::ept::SPLIT_CAPACITY as u64 {
            ept.change_mapping(&mut arena, k << 21, k << 21, true, true)
                .unwrap();
        }
        let region = (crate::ept::SPLIT_CAPACITY as u64) << 21;
        assert_eq!(
            install(
                &mut ept,
                &mut arena,
                &mut table,
                region,
                region + PAGE,
                region + 2 * PAGE,
            ),
            Err(HypervisorError::SplitArenaFull)
        );
        assert!(table.is_empty());
    }
}
