use core::cmp::{max, min};
use core::fmt::{Display, Formatter, Result};

use crate::fmt::ByteSize;

/// Size of a physical page frame.
const FRAME_SIZE: u64 = 4096;

/// A contiguous range of physical memory as reported by the firmware.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base_addr: u64,
    pub length: u64,
    pub class: MemoryRegionType,
}

impl From<multiboot::MemoryRegion> for MemoryRegion {
    fn from(value: multiboot::MemoryRegion) -> Self {
        Self {
            base_addr: value.base_addr,
            length: value.length,
            class: value.kind.into(),
        }
    }
}

impl MemoryRegion {
    pub fn end_addr(&self) -> u64 {
        self.base_addr.saturating_add(self.length)
    }

    /// The part of this region that lies within `[start, end)`, if any.
    pub fn clip(self, start: u64, end: u64) -> Option<Self> {
        let base_addr = max(self.base_addr, start);
        let end_addr = min(self.end_addr(), end);
        (base_addr < end_addr).then_some(Self {
            base_addr,
            length: end_addr - base_addr,
            ..self
        })
    }

    /// Frame numbers of all frames lying completely within this region.
    pub fn whole_frames(&self) -> core::ops::Range<u64> {
        self.base_addr.div_ceil(FRAME_SIZE)..self.end_addr() / FRAME_SIZE
    }

    /// Only available regions may be handed to the frame allocator. Everything else, reclaimable
    /// ACPI memory included, stays reserved.
    pub fn is_usable(&self) -> bool {
        self.class == MemoryRegionType::Available
    }
}

impl core::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "({:#x}..{:#x}, {})",
            self.base_addr,
            self.end_addr(),
            self.class,
        )
    }
}

impl Display for MemoryRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "{:#011x}..{:#011x}: {} ({})",
            self.base_addr,
            self.end_addr(),
            ByteSize(self.length),
            self.class
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionType {
    Available,
    Reserved,
    /// ACPI tables, usable once they have been parsed.
    Reclaimable,
    /// Must be preserved across hibernation.
    Nvs,
    Defective,
}

impl Display for MemoryRegionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(match self {
            Self::Available => "usable",
            Self::Reserved => "reserved",
            Self::Reclaimable => "ACPI reclaimable",
            Self::Nvs => "ACPI NVS",
            Self::Defective => "defective",
        })
    }
}

impl From<multiboot::MemoryRegionKind> for MemoryRegionType {
    fn from(value: multiboot::MemoryRegionKind) -> Self {
        use multiboot::MemoryRegionKind;
        match value {
            MemoryRegionKind::Available => Self::Available,
            MemoryRegionKind::AcpiReclaimable => Self::Reclaimable,
            MemoryRegionKind::AcpiNvs => Self::Nvs,
            MemoryRegionKind::Defective => Self::Defective,
            MemoryRegionKind::Reserved | MemoryRegionKind::Unknown(_) => Self::Reserved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base_addr: u64, length: u64) -> MemoryRegion {
        MemoryRegion {
            base_addr,
            length,
            class: MemoryRegionType::Available,
        }
    }

    #[test]
    fn clip_cuts_both_ends() {
        let clipped = region(0x1000, 0x9000).clip(0x2000, 0x8000).unwrap();
        assert_eq!((clipped.base_addr, clipped.end_addr()), (0x2000, 0x8000));
        let untouched = region(0x1000, 0x1000).clip(0, u64::MAX).unwrap();
        assert_eq!(untouched, region(0x1000, 0x1000));
    }

    #[test]
    fn clip_to_four_gib() {
        let high = region(0xC000_0000, 0x8000_0000);
        let clipped = high.clip(0, 1 << 32).unwrap();
        assert_eq!(clipped.length, 0x4000_0000);
        assert_eq!(region(1 << 32, 0x1000).clip(0, 1 << 32), None);
    }

    #[test]
    fn frame_rounding() {
        let partial = region(0x2400, 0x2000);
        assert_eq!(partial.whole_frames(), 3..4);
        assert_eq!(region(0x1000, 0).whole_frames(), 1..1);
    }

    #[test]
    fn only_available_is_usable() {
        let mut region = region(0, 0x1000);
        assert!(region.is_usable());
        for class in [
            MemoryRegionType::Reserved,
            MemoryRegionType::Reclaimable,
            MemoryRegionType::Nvs,
            MemoryRegionType::Defective,
        ] {
            region.class = class;
            assert!(!region.is_usable());
        }
    }

    #[test]
    fn converts_multiboot_kinds() {
        use multiboot::MemoryRegionKind as Kind;
        assert_eq!(MemoryRegionType::from(Kind::Available), MemoryRegionType::Available);
        assert_eq!(MemoryRegionType::from(Kind::Reserved), MemoryRegionType::Reserved);
        assert_eq!(
            MemoryRegionType::from(Kind::AcpiReclaimable),
            MemoryRegionType::Reclaimable
        );
        assert_eq!(MemoryRegionType::from(Kind::AcpiNvs), MemoryRegionType::Nvs);
        assert_eq!(MemoryRegionType::from(Kind::Defective), MemoryRegionType::Defective);
        assert_eq!(MemoryRegionType::from(Kind::Unknown(7)), MemoryRegionType::Reserved);
    }

    #[test]
    fn display() {
        let region = MemoryRegion {
            base_addr: 0x10_0000,
            length: 0x7EE_0000,
            class: MemoryRegionType::Available,
        };
        assert_eq!(
            region.to_string(),
            "0x000100000..0x007fe0000: 126 MiB (usable)"
        );
    }
}
