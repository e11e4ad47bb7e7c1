//! Scratch mappings for physical memory the kernel cannot reach otherwise.
//!
//! The last directory slot of the kernel region holds a page table whose 1024 entries are lent
//! out one at a time. An entry that is all zero is free. Every [`TemporaryWindow::map`] must be
//! paired with an [`TemporaryWindow::unmap`]; a forgotten unmap leaks the slot for good.

use crate::addr::{PhysAddr, VirtAddr};
use crate::error::MemoryError;
use crate::layout::{MemoryLayout, ENTRIES, TABLE_SPAN, WINDOW_BASE, WINDOW_SLOT};
use crate::paging::{PageEntry, PageTable};
use crate::platform::Platform;

pub struct TemporaryWindow {
    /// Kernel virtual address of the window's page table.
    table: VirtAddr,
    layout: MemoryLayout,
}

impl TemporaryWindow {
    pub const fn new(table: VirtAddr, layout: MemoryLayout) -> Self {
        Self { table, layout }
    }

    /// Makes the byte at `addr` accessible and returns its virtual address. Addresses of the
    /// low window are returned directly without using a slot.
    pub fn map<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        addr: PhysAddr,
    ) -> Result<VirtAddr, MemoryError> {
        if let Some(direct) = self.layout.low_to_virtual(addr) {
            return Ok(direct);
        }

        let table = PageTable::at(platform, self.table);
        let slot = (0..ENTRIES)
            .find(|&slot| table.entry(slot).is_unmapped())
            .ok_or(MemoryError::WindowExhausted)?;
        table.set_mapping(slot, addr.align_down(), true, true, false);

        let page = VirtAddr::from_slots(WINDOW_SLOT, slot);
        // The slot may have been used before.
        platform.invalidate_page(page);
        log::trace!("Temporary mapping {page} -> {}", addr.align_down());
        Ok(page.add(addr.page_offset()))
    }

    /// Returns the slot behind `addr` to the pool. Addresses outside the window are ignored.
    /// The translation cache is left alone and the frame is not released.
    pub fn unmap<P: Platform + ?Sized>(&mut self, platform: &P, addr: VirtAddr) {
        if !Self::contains(addr) {
            return;
        }
        PageTable::at(platform, self.table).set_entry(addr.table_slot(), PageEntry::UNMAPPED);
    }

    /// Number of slots currently lent out.
    pub fn slots_in_use<P: Platform + ?Sized>(&self, platform: &P) -> usize {
        let table = PageTable::at(platform, self.table);
        (0..ENTRIES)
            .filter(|&slot| !table.entry(slot).is_unmapped())
            .count()
    }

    pub fn contains(addr: VirtAddr) -> bool {
        addr.as_u32() >= WINDOW_BASE && (addr.as_u32() - WINDOW_BASE) < TABLE_SPAN
    }
}
