//! System MMU Page Table Format
//!
//! Two-level short-descriptor format walked by the translation unit:
//!
//! ```text
//!   IOVA [31:20]  -> level-1 index (4096 entries, 16KB table)
//!   IOVA [19:12]  -> level-2 index (256 entries, 1KB table)
//!   IOVA [11:0]   -> page offset
//! ```
//!
//! Level-1 descriptors (low two bits):
//!
//! | Bits | Meaning |
//! |------|---------|
//! | `00` / `11` | fault |
//! | `01` | page: bits [31:10] hold the level-2 table base |
//! | `10` | section: bits [31:20] map a 1MB block |
//!
//! Level-2 descriptors:
//!
//! | Bits | Meaning |
//! |------|---------|
//! | `00` | fault |
//! | `01` | large page: bits [31:16] map a 64KB block, replicated 16 times |
//! | `1x` | small page: bits [31:12] map a 4KB page |

use crate::{Iova, PhysAddr};

// ============================================================================
// Geometry
// ============================================================================

pub const SECT_SHIFT: u32 = 20;
pub const LPAGE_SHIFT: u32 = 16;
pub const SPAGE_SHIFT: u32 = 12;

/// Section (1MB) mapping size.
pub const SECT_SIZE: u32 = 1 << SECT_SHIFT;
/// Large page (64KB) mapping size.
pub const LPAGE_SIZE: u32 = 1 << LPAGE_SHIFT;
/// Small page (4KB) mapping size.
pub const SPAGE_SIZE: u32 = 1 << SPAGE_SHIFT;

pub const SECT_MASK: u32 = !(SECT_SIZE - 1);
pub const LPAGE_MASK: u32 = !(LPAGE_SIZE - 1);
pub const SPAGE_MASK: u32 = !(SPAGE_SIZE - 1);

/// Level-1 table entries.
pub const NUM_LV1ENTRIES: usize = 4096;
/// Level-2 table entries.
pub const NUM_LV2ENTRIES: usize = 256;

/// Number of level-2 slots a large page occupies.
pub const SPAGES_PER_LPAGE: usize = (LPAGE_SIZE / SPAGE_SIZE) as usize;

/// Level-1 table size in bytes (naturally aligned).
pub const LV1TABLE_SIZE: u32 = (NUM_LV1ENTRIES * 4) as u32;
/// Level-2 table size in bytes.
pub const LV2TABLE_SIZE: u32 = (NUM_LV2ENTRIES * 4) as u32;

/// Mapping granularities the table format can express.
pub const PGSIZE_BITMAP: u32 = SECT_SIZE | LPAGE_SIZE | SPAGE_SIZE;

const LV2TABLE_BASE_MASK: u32 = !(LV2TABLE_SIZE - 1);

/// Level-1 index of `iova`.
#[inline]
pub const fn lv1ent_offset(iova: Iova) -> usize {
    (iova >> SECT_SHIFT) as usize
}

/// Level-2 index of `iova` within its sub-table.
#[inline]
pub const fn lv2ent_offset(iova: Iova) -> usize {
    ((iova >> SPAGE_SHIFT) as usize) & (NUM_LV2ENTRIES - 1)
}

// ============================================================================
// Page Sizes
// ============================================================================

/// One of the three supported mapping granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageSize {
    /// 4KB, one level-2 slot.
    Small,
    /// 64KB, sixteen level-2 slots.
    Large,
    /// 1MB, one level-1 slot.
    Section,
}

impl PageSize {
    /// Decode a byte count. Anything other than 1MB / 64KB / 4KB is rejected.
    pub const fn from_bytes(size: usize) -> Option<Self> {
        match size {
            s if s == SECT_SIZE as usize => Some(Self::Section),
            s if s == LPAGE_SIZE as usize => Some(Self::Large),
            s if s == SPAGE_SIZE as usize => Some(Self::Small),
            _ => None,
        }
    }

    /// Size in bytes.
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Section => SECT_SIZE,
            Self::Large => LPAGE_SIZE,
            Self::Small => SPAGE_SIZE,
        }
    }

    /// Mask selecting the block base.
    pub const fn mask(self) -> u32 {
        !(self.bytes() - 1)
    }

    /// Largest granularity that fits `len` bytes at `iova`/`paddr` alignment.
    pub fn best_fit(iova: Iova, paddr: PhysAddr, len: usize) -> Option<Self> {
        [Self::Section, Self::Large, Self::Small]
            .into_iter()
            .find(|pgsize| {
                let bytes = pgsize.bytes();
                len >= bytes as usize && (iova | paddr) & (bytes - 1) == 0
            })
    }
}

// ============================================================================
// Level-1 Descriptors
// ============================================================================

/// Decoded kind of a level-1 descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lv1Kind {
    Fault,
    Page,
    Section,
}

/// Level-1 descriptor.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lv1Entry(u32);

impl Lv1Entry {
    /// Invalid entry.
    pub const fn fault() -> Self {
        Self(0)
    }

    /// Direct 1MB mapping of `paddr`.
    pub const fn section(paddr: PhysAddr) -> Self {
        Self((paddr & SECT_MASK) | 2)
    }

    /// Indirection to the level-2 table at `table`.
    pub const fn page(table: PhysAddr) -> Self {
        Self((table & LV2TABLE_BASE_MASK) | 1)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn kind(self) -> Lv1Kind {
        match self.0 & 3 {
            1 => Lv1Kind::Page,
            2 => Lv1Kind::Section,
            _ => Lv1Kind::Fault,
        }
    }

    pub const fn is_fault(self) -> bool {
        matches!(self.kind(), Lv1Kind::Fault)
    }

    pub const fn is_page(self) -> bool {
        matches!(self.kind(), Lv1Kind::Page)
    }

    pub const fn is_section(self) -> bool {
        matches!(self.kind(), Lv1Kind::Section)
    }

    /// Physical base of a section mapping.
    pub const fn section_base(self) -> PhysAddr {
        self.0 & SECT_MASK
    }

    /// Physical base of the referenced level-2 table.
    pub const fn lv2_base(self) -> PhysAddr {
        self.0 & LV2TABLE_BASE_MASK
    }
}

// ============================================================================
// Level-2 Descriptors
// ============================================================================

/// Decoded kind of a level-2 descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lv2Kind {
    Fault,
    Large,
    Small,
}

/// Level-2 descriptor.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lv2Entry(u32);

impl Lv2Entry {
    pub const fn fault() -> Self {
        Self(0)
    }

    /// One of the sixteen replicated slots of a 64KB mapping.
    pub const fn large(paddr: PhysAddr) -> Self {
        Self((paddr & LPAGE_MASK) | 1)
    }

    /// 4KB mapping of `paddr`.
    pub const fn small(paddr: PhysAddr) -> Self {
        Self((paddr & SPAGE_MASK) | 2)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn kind(self) -> Lv2Kind {
        if self.0 & 2 != 0 {
            Lv2Kind::Small
        } else if self.0 & 3 == 1 {
            Lv2Kind::Large
        } else {
            Lv2Kind::Fault
        }
    }

    pub const fn is_fault(self) -> bool {
        matches!(self.kind(), Lv2Kind::Fault)
    }

    pub const fn large_base(self) -> PhysAddr {
        self.0 & LPAGE_MASK
    }

    pub const fn small_base(self) -> PhysAddr {
        self.0 & SPAGE_MASK
    }
}

/// Translate through an already-fetched descriptor pair.
///
/// `lv2` is only consulted when `lv1` is a page descriptor. Returns 0 for a
/// fault at either level.
pub fn translate(lv1: Lv1Entry, lv2: Option<Lv2Entry>, iova: Iova) -> PhysAddr {
    match lv1.kind() {
        Lv1Kind::Section => lv1.section_base() + (iova & !SECT_MASK),
        Lv1Kind::Page => match lv2.map(Lv2Entry::kind) {
            Some(Lv2Kind::Small) => lv2.map_or(0, |e| e.small_base()) + (iova & !SPAGE_MASK),
            Some(Lv2Kind::Large) => lv2.map_or(0, |e| e.large_base()) + (iova & !LPAGE_MASK),
            _ => 0,
        },
        Lv1Kind::Fault => 0,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices() {
        assert_eq!(lv1ent_offset(0x1000_0000), 0x100);
        assert_eq!(lv1ent_offset(0xFFF0_0000), NUM_LV1ENTRIES - 1);
        assert_eq!(lv2ent_offset(0x1000_1000), 1);
        assert_eq!(lv2ent_offset(0x100F_F000), 0xFF);
    }

    #[test]
    fn test_lv1_encoding() {
        let sect = Lv1Entry::section(0x5010_0000);
        assert_eq!(sect.kind(), Lv1Kind::Section);
        assert_eq!(sect.section_base(), 0x5010_0000);

        let page = Lv1Entry::page(0x6000_0400);
        assert!(page.is_page());
        assert_eq!(page.lv2_base(), 0x6000_0400);

        assert!(Lv1Entry::fault().is_fault());
        // Both reserved encodings fault.
        assert!(Lv1Entry::from_raw(0x3).is_fault());
    }

    #[test]
    fn test_lv2_encoding() {
        let large = Lv2Entry::large(0x5001_0000);
        assert_eq!(large.kind(), Lv2Kind::Large);
        assert_eq!(large.large_base(), 0x5001_0000);

        let small = Lv2Entry::small(0x5000_3000);
        assert_eq!(small.kind(), Lv2Kind::Small);
        assert_eq!(small.small_base(), 0x5000_3000);
        assert_eq!(Lv2Entry::from_raw(0x5000_3003).kind(), Lv2Kind::Small);
    }

    #[test]
    fn test_translate_offsets() {
        let sect = Lv1Entry::section(0x5000_0000);
        assert_eq!(translate(sect, None, 0x1012_3456), 0x5012_3456);

        let page = Lv1Entry::page(0x6000_0000);
        let large = Lv2Entry::large(0x7001_0000);
        assert_eq!(translate(page, Some(large), 0x1000_4abc), 0x7001_4abc);
        assert_eq!(translate(page, Some(Lv2Entry::fault()), 0x1000_4abc), 0);
        assert_eq!(translate(Lv1Entry::fault(), None, 0x1000_0000), 0);
    }

    #[test]
    fn test_page_size_decode() {
        assert_eq!(PageSize::from_bytes(0x10_0000), Some(PageSize::Section));
        assert_eq!(PageSize::from_bytes(0x1_0000), Some(PageSize::Large));
        assert_eq!(PageSize::from_bytes(0x1000), Some(PageSize::Small));
        assert_eq!(PageSize::from_bytes(0x2000), None);
        assert_eq!(PGSIZE_BITMAP, 0x0011_1000);
    }

    #[test]
    fn test_best_fit() {
        assert_eq!(
            PageSize::best_fit(0x1000_0000, 0x5000_0000, 0x20_0000),
            Some(PageSize::Section)
        );
        // Physical side only 64KB aligned.
        assert_eq!(
            PageSize::best_fit(0x1000_0000, 0x5001_0000, 0x20_0000),
            Some(PageSize::Large)
        );
        assert_eq!(
            PageSize::best_fit(0x1000_1000, 0x5000_1000, 0x20_0000),
            Some(PageSize::Small)
        );
        assert_eq!(PageSize::best_fit(0x1000_0000, 0x5000_0000, 0x800), None);
    }
}
