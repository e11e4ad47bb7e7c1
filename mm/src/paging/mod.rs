//! Virtual Memory and Paging
//!
//! Every address space consists of one [`Directory`] and the page tables it refers to. All
//! directories and tables are allocated from the low window so the kernel can reach them through
//! the permanent mapping at [`KERNEL_BASE`]. The kernel region (directory slots 768 to 1023) is
//! populated once while booting and afterwards only shared by reference: each new directory
//! copies those slots, so later changes inside the kernel's tables (e.g. heap growth) are seen by
//! every address space at once.

pub mod x86;

use arrayvec::ArrayVec;

use crate::addr::{PhysAddr, VirtAddr};
use crate::error::MemoryError;
use crate::layout::{
    MemoryLayout, ENTRIES, HEAP_BASE, HEAP_LIMIT, KERNEL_BASE, KERNEL_FIRST_SLOT,
    MAX_ADDRESS_SPACES, PAGE_SIZE, WINDOW_SLOT,
};
use crate::physical::{FrameAllocator, RegionClass};
use crate::platform::{copy_page, Platform};
use crate::window::TemporaryWindow;

pub use x86::{Directory, PageEntry, PageTable, DIRECTORY_FRAMES};

/// Handle of an address space. Directory frames are recycled, so the generation tells a
/// released space apart from a later one built in the same frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    directory: PhysAddr,
    generation: u32,
}

impl AddressSpace {
    pub const fn directory(&self) -> PhysAddr {
        self.directory
    }
}

/// Access rights of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags {
    pub writable: bool,
    pub user: bool,
}

impl PageFlags {
    pub const KERNEL: Self = Self {
        writable: true,
        user: false,
    };
}

/// Owner of the kernel address space and bookkeeper of the active one.
pub struct AddressSpaceManager {
    layout: MemoryLayout,
    kernel: Option<AddressSpace>,
    active: Option<AddressSpace>,
    live: ArrayVec<AddressSpace, MAX_ADDRESS_SPACES>,
    generation: u32,
}

impl AddressSpaceManager {
    pub const fn new(layout: MemoryLayout) -> Self {
        Self {
            layout,
            kernel: None,
            active: None,
            live: ArrayVec::new_const(),
            generation: 0,
        }
    }

    pub fn kernel_space(&self) -> Option<AddressSpace> {
        self.kernel
    }

    pub fn active_space(&self) -> Option<AddressSpace> {
        self.active
    }

    /// Builds the kernel address space and makes it the active one. Every table of the kernel
    /// region is created right away; the low window is mapped page by page onto physical
    /// memory starting at zero.
    pub fn initialize_kernel_space<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        frames: &mut FrameAllocator,
    ) -> Result<AddressSpace, MemoryError> {
        let space = self.create_directory(platform, frames)?;
        let directory = self.directory(platform, space);

        for slot in KERNEL_FIRST_SLOT..ENTRIES {
            let table = self.allocate_table(platform, frames)?;
            directory.set_table(
                slot,
                PageEntry::mapping(table.0, true, true, false),
                table.1,
            );
        }

        let low_pages = self.layout.low_frames();
        for page in 0..low_pages {
            let va = VirtAddr::new(KERNEL_BASE + page * PAGE_SIZE);
            self.table_of(platform, space, va)
                .ok_or(MemoryError::NotMapped(va.as_u32()))?
                .set_mapping(
                    va.table_slot(),
                    PhysAddr::from_frame(page),
                    true,
                    true,
                    false,
                );
        }
        log::debug!(
            "Kernel address space @ {}: low window of {} MiB mapped at {:#x}",
            space.directory,
            self.layout.low_window_end >> 20,
            KERNEL_BASE
        );

        self.live
            .try_push(space)
            .map_err(|_| MemoryError::IndexFull)?;
        self.kernel = Some(space);
        self.switch(platform, space)?;
        Ok(space)
    }

    /// Maps the page at `va` to the frame at `pa` in `space`, creating the page table if the
    /// directory slot has none yet.
    pub fn map_page<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        frames: &mut FrameAllocator,
        space: AddressSpace,
        va: VirtAddr,
        pa: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), MemoryError> {
        self.check(space)?;
        if !va.is_page_aligned() {
            return Err(MemoryError::Misaligned(va.as_u32()));
        }
        if !pa.is_page_aligned() {
            return Err(MemoryError::Misaligned(pa.as_u32()));
        }

        let directory = self.directory(platform, space);
        let slot = va.directory_slot();
        let table = match directory.table(slot) {
            Some(table) => table,
            None if slot < KERNEL_FIRST_SLOT => {
                let (table_pa, table_va) = self.allocate_table(platform, frames)?;
                directory.set_table(
                    slot,
                    PageEntry::mapping(table_pa, true, true, true),
                    table_va,
                );
                PageTable::at(platform, table_va)
            }
            // Kernel tables exist from the start; a missing one means a foreign directory.
            None => return Err(MemoryError::KernelRegion(va.as_u32())),
        };

        if table.entry(va.table_slot()).present() {
            return Err(MemoryError::AlreadyMapped(va.as_u32()));
        }
        table.set_mapping(va.table_slot(), pa, true, flags.writable, flags.user);
        log::trace!("Mapped {va} -> {pa} in {}", space.directory);
        Ok(())
    }

    /// Maps a user page. `pa` must be an allocated frame of the high window; it belongs to
    /// `space` from now on and is released together with it.
    pub fn map_user_page<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        frames: &mut FrameAllocator,
        space: AddressSpace,
        va: VirtAddr,
        pa: PhysAddr,
        writable: bool,
    ) -> Result<(), MemoryError> {
        if va.as_u32() >= KERNEL_BASE {
            return Err(MemoryError::KernelRegion(va.as_u32()));
        }
        // Low frames hold directories and tables.
        if self.layout.is_low(pa) {
            return Err(MemoryError::LowFrame(pa.as_u32()));
        }
        if !frames.test_frame(pa) || frames.is_reserved_frame(pa) {
            return Err(MemoryError::UnownedFrame(pa.as_u32()));
        }
        let flags = PageFlags {
            writable,
            user: true,
        };
        self.map_page(platform, frames, space, va, pa, flags)
    }

    /// Removes the user page at `va` from `space` and hands its frame back to the caller.
    pub fn unmap_user_page<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        space: AddressSpace,
        va: VirtAddr,
    ) -> Result<PhysAddr, MemoryError> {
        self.check(space)?;
        if va.as_u32() >= KERNEL_BASE {
            return Err(MemoryError::KernelRegion(va.as_u32()));
        }
        self.unmap_page(platform, space, va)
    }

    /// Maps fresh high frames behind `count` heap pages starting at `va`. Either all pages get
    /// mapped or none.
    pub fn map_kernel_pages<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        frames: &mut FrameAllocator,
        va: VirtAddr,
        count: u32,
    ) -> Result<(), MemoryError> {
        let space = self
            .kernel
            .ok_or(MemoryError::InvalidLayout("kernel address space missing"))?;
        let end = (count as u64) * PAGE_SIZE as u64 + va.as_u32() as u64;
        if va.as_u32() < HEAP_BASE || end > HEAP_LIMIT as u64 {
            return Err(MemoryError::OutOfRange(va.as_u32()));
        }

        for page in 0..count {
            let page_va = va.add(page * PAGE_SIZE);
            let mapped = match frames.allocate(RegionClass::High, 1) {
                Ok(pa) => self
                    .map_page(platform, frames, space, page_va, pa, PageFlags::KERNEL)
                    .map_err(|error| {
                        let _ = frames.free(pa, 1);
                        error
                    }),
                Err(error) => Err(error),
            };
            if let Err(error) = mapped {
                for done in 0..page {
                    let done_va = va.add(done * PAGE_SIZE);
                    if let Ok(pa) = self.unmap_page(platform, space, done_va) {
                        let _ = frames.free(pa, 1);
                    }
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Physical address behind `va` in `space`.
    pub fn translate<P: Platform + ?Sized>(
        &self,
        platform: &P,
        space: AddressSpace,
        va: VirtAddr,
    ) -> Option<PhysAddr> {
        self.check(space).ok()?;
        let entry = self.table_of(platform, space, va)?.entry(va.table_slot());
        entry
            .present()
            .then(|| PhysAddr::new(entry.address().as_u32() | va.page_offset()))
    }

    /// Creates a new address space from `source`. The kernel region is shared; every present
    /// user page is copied into a fresh high frame with the same permissions.
    pub fn clone_space<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        window: &mut TemporaryWindow,
        frames: &mut FrameAllocator,
        source: AddressSpace,
    ) -> Result<AddressSpace, MemoryError> {
        self.check(source)?;
        if self.live.is_full() {
            return Err(MemoryError::IndexFull);
        }
        let space = self.create_directory(platform, frames)?;
        match self.copy_directory(platform, window, frames, source, space) {
            Ok(copied) => {
                log::debug!(
                    "Cloned address space {} into {} ({copied} user pages copied)",
                    source.directory,
                    space.directory
                );
                self.live.push(space);
                Ok(space)
            }
            Err(error) => {
                self.release_user_region(platform, frames, space);
                self.free_directory(frames, space);
                Err(error)
            }
        }
    }

    /// Tears down `space`: its user pages, user tables and directory are returned to the frame
    /// allocator, and the handle is no longer accepted. Neither the kernel space nor the active
    /// one can be released.
    pub fn release<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        frames: &mut FrameAllocator,
        space: AddressSpace,
    ) -> Result<(), MemoryError> {
        self.check(space)?;
        if Some(space) == self.kernel || Some(space) == self.active {
            return Err(MemoryError::SpaceInUse);
        }
        self.live.retain(|live| *live != space);
        self.release_user_region(platform, frames, space);
        self.free_directory(frames, space);
        log::debug!("Released address space {}", space.directory);
        Ok(())
    }

    /// Makes `space` the active address space.
    pub fn switch<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        space: AddressSpace,
    ) -> Result<(), MemoryError> {
        self.check(space)?;
        unsafe {
            // Safety: every live directory carries the shared kernel region.
            platform.load_directory(space.directory);
        }
        self.active = Some(space);
        log::trace!("Switched to address space {}", space.directory);
        Ok(())
    }

    pub fn flush_translations<P: Platform + ?Sized>(&self, platform: &P) {
        platform.flush_translations();
    }

    /// Kernel virtual address of the table behind the temporary window.
    pub fn window_table<P: Platform + ?Sized>(&self, platform: &P) -> Option<VirtAddr> {
        let kernel = self.kernel?;
        Some(self.directory(platform, kernel).table(WINDOW_SLOT)?.base())
    }

    fn copy_directory<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        window: &mut TemporaryWindow,
        frames: &mut FrameAllocator,
        source: AddressSpace,
        target: AddressSpace,
    ) -> Result<u32, MemoryError> {
        let from = self.directory(platform, source);
        let to = self.directory(platform, target);
        let mut copied = 0;

        for slot in KERNEL_FIRST_SLOT..ENTRIES {
            let (entry, table) = from.slot(slot);
            to.set_table(slot, entry, table);
        }

        for slot in 0..KERNEL_FIRST_SLOT {
            let Some(source_table) = from.table(slot) else {
                continue;
            };
            let (table_pa, table_va) = self.allocate_table(platform, frames)?;
            let entry = from.entry(slot).with_frame(table_pa.frame_number());
            to.set_table(slot, entry.with_accessed(false), table_va);
            let target_table = PageTable::at(platform, table_va);

            for (page, entry) in source_table.present_slots() {
                let frame = frames.allocate(RegionClass::High, 1)?;
                if let Err(error) = copy_frame(platform, window, entry.address(), frame) {
                    let _ = frames.free(frame, 1);
                    return Err(error);
                }
                let copy = entry
                    .with_frame(frame.frame_number())
                    .with_accessed(false)
                    .with_dirty(false);
                target_table.set_entry(page, copy);
                copied += 1;
            }
        }
        Ok(copied)
    }

    fn release_user_region<P: Platform + ?Sized>(
        &self,
        platform: &P,
        frames: &mut FrameAllocator,
        space: AddressSpace,
    ) {
        let directory = self.directory(platform, space);
        for slot in 0..KERNEL_FIRST_SLOT {
            let Some(table) = directory.table(slot) else {
                continue;
            };
            for (_, entry) in table.present_slots() {
                if let Err(error) = frames.free(entry.address(), 1) {
                    log::warn!("Cannot release user frame {}: {error}", entry.address());
                }
            }
            if let Err(error) = frames.free(directory.entry(slot).address(), 1) {
                log::warn!("Cannot release page table of slot {slot}: {error}");
            }
            directory.clear_slot(slot);
        }
    }

    fn unmap_page<P: Platform + ?Sized>(
        &self,
        platform: &P,
        space: AddressSpace,
        va: VirtAddr,
    ) -> Result<PhysAddr, MemoryError> {
        let table = self
            .table_of(platform, space, va)
            .ok_or(MemoryError::NotMapped(va.as_u32()))?;
        let entry = table.entry(va.table_slot());
        if !entry.present() {
            return Err(MemoryError::NotMapped(va.as_u32()));
        }
        table.set_entry(va.table_slot(), PageEntry::UNMAPPED);
        if Some(space) == self.active || va.as_u32() >= KERNEL_BASE {
            platform.invalidate_page(va);
        }
        log::trace!("Unmapped {va} in {}", space.directory);
        Ok(entry.address())
    }

    fn check(&self, space: AddressSpace) -> Result<(), MemoryError> {
        if self.live.contains(&space) {
            Ok(())
        } else {
            Err(MemoryError::UnknownSpace(space.directory.as_u32()))
        }
    }

    fn create_directory<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        frames: &mut FrameAllocator,
    ) -> Result<AddressSpace, MemoryError> {
        let directory = frames.allocate(RegionClass::Low, DIRECTORY_FRAMES)?;
        self.generation = self.generation.wrapping_add(1);
        let space = AddressSpace {
            directory,
            generation: self.generation,
        };
        self.directory(platform, space).clear();
        Ok(space)
    }

    fn free_directory(&self, frames: &mut FrameAllocator, space: AddressSpace) {
        if let Err(error) = frames.free(space.directory, DIRECTORY_FRAMES) {
            log::warn!("Cannot release directory {}: {error}", space.directory);
        }
    }

    /// Allocates and zeroes a table in the low window.
    fn allocate_table<P: Platform + ?Sized>(
        &self,
        platform: &P,
        frames: &mut FrameAllocator,
    ) -> Result<(PhysAddr, VirtAddr), MemoryError> {
        let pa = frames.allocate(RegionClass::Low, 1)?;
        let va = self.low_virtual(pa);
        PageTable::at(platform, va).clear();
        Ok((pa, va))
    }

    fn directory<'p, P: Platform + ?Sized>(
        &self,
        platform: &'p P,
        space: AddressSpace,
    ) -> Directory<'p, P> {
        Directory::at(platform, self.low_virtual(space.directory))
    }

    fn table_of<'p, P: Platform + ?Sized>(
        &self,
        platform: &'p P,
        space: AddressSpace,
        va: VirtAddr,
    ) -> Option<PageTable<'p, P>> {
        self.directory(platform, space).table(va.directory_slot())
    }

    /// Directories and tables always live in the low window.
    fn low_virtual(&self, pa: PhysAddr) -> VirtAddr {
        match self.layout.low_to_virtual(pa) {
            Some(va) => va,
            None => panic!("paging structure at {pa} outside of the low window"),
        }
    }
}

/// Copies the contents of one physical frame into another through the temporary window.
fn copy_frame<P: Platform + ?Sized>(
    platform: &P,
    window: &mut TemporaryWindow,
    from: PhysAddr,
    to: PhysAddr,
) -> Result<(), MemoryError> {
    let source = window.map(platform, from)?;
    let target = match window.map(platform, to) {
        Ok(target) => target,
        Err(error) => {
            window.unmap(platform, source);
            return Err(error);
        }
    };
    copy_page(platform, source, target);
    window.unmap(platform, target);
    window.unmap(platform, source);
    Ok(())
}
