//! Iterator over the memory map buffer passed by the bootloader.
//!
//! The buffer consists of one or more size/structure pairs:
//!
//! ```text
//!         +-------------------+
//! 0       | size              |
//!         +-------------------+  <-- `size` counts from here to the next entry
//! 4       | base_addr         |
//! 12      | length            |
//! 20      | type              |
//!         +-------------------+
//! ```
//!
//! `size` may be larger than the 20 bytes described here. The fields carry no alignment
//! guarantee, so they are decoded byte by byte.

/// Bytes of an entry that follow its `size` field.
const ENTRY_SIZE: usize = 20;

#[derive(Clone)]
pub struct MemoryMapIter<'mmap> {
    buffer: &'mmap [u8],
}

impl<'mmap> From<&'mmap [u8]> for MemoryMapIter<'mmap> {
    fn from(buffer: &'mmap [u8]) -> Self {
        Self { buffer }
    }
}

impl Iterator for MemoryMapIter<'_> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        let size = read_u32(self.buffer, 0)? as usize;
        let next = size.checked_add(4)?;
        let entry = self.buffer.get(4..next.max(4 + ENTRY_SIZE))?;
        let region = MemoryRegion {
            base_addr: read_u64(entry, 0)?,
            length: read_u64(entry, 8)?,
            kind: read_u32(entry, 16)?.into(),
        };
        self.buffer = self.buffer.get(next..).unwrap_or_default();
        Some(region)
    }
}

impl core::fmt::Debug for MemoryMapIter<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.clone()).finish()
    }
}

fn read_u32(buffer: &[u8], at: usize) -> Option<u32> {
    let bytes = buffer.get(at..at + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(buffer: &[u8], at: usize) -> Option<u64> {
    let bytes = buffer.get(at..at + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// A contiguous region of physical memory reported by the memory map.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base_addr: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl core::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:?} @ {:#x} ({} KiB)",
            self.kind,
            self.base_addr,
            self.length >> 10,
        )
    }
}

/// The `type` field of a memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// 1: available RAM
    Available,
    /// 2: reserved, e.g. firmware or memory mapped devices
    Reserved,
    /// 3: usable memory holding ACPI information
    AcpiReclaimable,
    /// 4: reserved memory which needs to be preserved on hibernation
    AcpiNvs,
    /// 5: memory occupied by defective RAM modules
    Defective,
    Unknown(u32),
}

impl From<u32> for MemoryRegionKind {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Defective,
            other => Self::Unknown(other),
        }
    }
}
