//! Hardware format of IA-32 two-level paging structures (4 KiB pages, no PAE).

use bitfield_struct::bitfield;

use crate::addr::{PhysAddr, VirtAddr};
use crate::layout::{ENTRIES, PAGE_SIZE};
use crate::platform::{read_u32, write_u32, zero_page, Platform};

/// One 32-bit entry of a page directory or a page table. Both share this layout; bit 7 selects
/// 4 MiB pages in a directory entry and the PAT index in a table entry.
///
/// | Bits  | Field |
/// |-------|-------|
/// | 0     | present |
/// | 1     | writable |
/// | 2     | user |
/// | 3     | write-through |
/// | 4     | cache disable |
/// | 5     | accessed |
/// | 6     | dirty (table entries only) |
/// | 7     | PS / PAT |
/// | 8     | global |
/// | 9-11  | available to software |
/// | 12-31 | frame number |
///
/// The all-zero entry is the one and only representation of "unmapped".
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large: bool,
    pub global: bool,
    #[bits(3)]
    pub available: u8,
    #[bits(20)]
    pub frame: u32,
}

impl PageEntry {
    pub const UNMAPPED: Self = Self::new();

    /// Entry referring to the frame at `addr` with the given permissions.
    pub const fn mapping(addr: PhysAddr, present: bool, writable: bool, user: bool) -> Self {
        Self::new()
            .with_present(present)
            .with_writable(writable)
            .with_user(user)
            .with_frame(addr.frame_number())
    }

    pub const fn address(&self) -> PhysAddr {
        PhysAddr::from_frame(self.frame())
    }

    pub const fn is_unmapped(&self) -> bool {
        self.into_bits() == 0
    }
}

/// A page table (or directory) reachable at a kernel virtual address.
pub struct PageTable<'p, P: Platform + ?Sized> {
    platform: &'p P,
    base: VirtAddr,
}

impl<'p, P: Platform + ?Sized> PageTable<'p, P> {
    pub fn at(platform: &'p P, base: VirtAddr) -> Self {
        debug_assert!(base.is_page_aligned());
        Self { platform, base }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn entry(&self, slot: usize) -> PageEntry {
        debug_assert!(slot < ENTRIES);
        PageEntry::from_bits(read_u32(self.platform, self.slot_address(slot)))
    }

    pub fn set_entry(&self, slot: usize, entry: PageEntry) {
        debug_assert!(slot < ENTRIES);
        write_u32(self.platform, self.slot_address(slot), entry.into_bits());
    }

    /// Writes the fields of one entry. Neither frames nor cached translations are touched.
    pub fn set_mapping(
        &self,
        slot: usize,
        frame: PhysAddr,
        present: bool,
        writable: bool,
        user: bool,
    ) {
        self.set_entry(slot, PageEntry::mapping(frame, present, writable, user));
    }

    pub fn clear(&self) {
        zero_page(self.platform, self.base);
    }

    /// Slots whose entries are present, in ascending order.
    pub fn present_slots(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        (0..ENTRIES)
            .map(|slot| (slot, self.entry(slot)))
            .filter(|(_, entry)| entry.present())
    }

    fn slot_address(&self, slot: usize) -> VirtAddr {
        self.base.add(slot as u32 * 4)
    }
}

/// Frames occupied by one [`Directory`].
pub const DIRECTORY_FRAMES: u32 = 2;

/// A page directory: the hardware-visible entries in its first frame followed by a frame holding
/// the kernel virtual address of every table the entries refer to.
pub struct Directory<'p, P: Platform + ?Sized> {
    entries: PageTable<'p, P>,
    tables: PageTable<'p, P>,
}

impl<'p, P: Platform + ?Sized> Directory<'p, P> {
    pub fn at(platform: &'p P, base: VirtAddr) -> Self {
        Self {
            entries: PageTable::at(platform, base),
            tables: PageTable::at(platform, base.add(PAGE_SIZE)),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.tables.clear();
    }

    pub fn entry(&self, slot: usize) -> PageEntry {
        self.entries.entry(slot)
    }

    /// The table behind directory slot `slot`, if there is one.
    pub fn table(&self, slot: usize) -> Option<PageTable<'p, P>> {
        if !self.entries.entry(slot).present() {
            return None;
        }
        let base = VirtAddr::new(self.tables.entry(slot).into_bits());
        Some(PageTable::at(self.entries.platform, base))
    }

    /// Installs a table in both halves of the directory.
    pub fn set_table(&self, slot: usize, entry: PageEntry, table: VirtAddr) {
        self.tables
            .set_entry(slot, PageEntry::from_bits(table.as_u32()));
        self.entries.set_entry(slot, entry);
    }

    pub fn clear_slot(&self, slot: usize) {
        self.entries.set_entry(slot, PageEntry::UNMAPPED);
        self.tables.set_entry(slot, PageEntry::UNMAPPED);
    }

    /// Raw contents of both halves of a slot, for sharing it with another directory.
    pub fn slot(&self, slot: usize) -> (PageEntry, VirtAddr) {
        (
            self.entries.entry(slot),
            VirtAddr::new(self.tables.entry(slot).into_bits()),
        )
    }
}
