//! Test doubles for the hardware: a machine with simulated RAM and paging, and a flat arena for
//! exercising the heap on its own.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;

use crate::addr::{PhysAddr, VirtAddr};
use crate::error::MemoryError;
use crate::heap::HeapBacking;
use crate::layout::{MemoryLayout, BITMAP_WORDS, HEAP_BASE, KERNEL_BASE, PAGE_SIZE};
use crate::paging::PageEntry;
use crate::physical::{FrameAllocator, RegionClass};
use crate::platform::Platform;

/// Page-aligned, zeroed memory that is released on drop.
struct AlignedMemory {
    ptr: *mut u8,
    layout: Layout,
}

impl AlignedMemory {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, PAGE_SIZE as usize).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "test memory allocation failed");
        Self { ptr, layout }
    }
}

impl Drop for AlignedMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

/// A single-core machine with `ram` bytes of physical memory starting at address zero.
///
/// Until the first directory is loaded, kernel addresses translate to `address - KERNEL_BASE`
/// like the boot mapping of the real kernel does. Afterwards every access walks the page tables
/// stored in the simulated RAM, and an access through a missing mapping panics like a page
/// fault would halt the kernel.
pub struct SimulatedMachine {
    ram: AlignedMemory,
    directory: Cell<Option<PhysAddr>>,
    interrupts: Cell<bool>,
    flushes: Cell<usize>,
}

impl SimulatedMachine {
    pub fn new(ram: usize) -> Self {
        Self {
            ram: AlignedMemory::new(ram),
            directory: Cell::new(None),
            interrupts: Cell::new(true),
            flushes: Cell::new(0),
        }
    }

    pub fn active_directory(&self) -> Option<PhysAddr> {
        self.directory.get()
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.get()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.get()
    }

    /// Translates `address` the way the processor would.
    pub fn translate(&self, address: VirtAddr) -> Option<PhysAddr> {
        let Some(directory) = self.directory.get() else {
            let offset = address.as_u32().checked_sub(KERNEL_BASE)?;
            return Some(PhysAddr::new(offset));
        };
        let pde = self.read_entry(directory, address.directory_slot());
        if !pde.present() {
            return None;
        }
        let pte = self.read_entry(pde.address(), address.table_slot());
        pte.present()
            .then(|| PhysAddr::new(pte.address().as_u32() | address.page_offset()))
    }

    pub fn write_bytes(&self, address: VirtAddr, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            unsafe { self.pointer(address.add(i as u32)).write(*byte) }
        }
    }

    pub fn read_bytes(&self, address: VirtAddr, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| unsafe { self.pointer(address.add(i as u32)).read() })
            .collect()
    }

    pub fn write_physical(&self, address: PhysAddr, bytes: &[u8]) {
        let start = self.physical(address);
        unsafe { start.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) }
    }

    pub fn read_physical(&self, address: PhysAddr, len: usize) -> Vec<u8> {
        let start = self.physical(address);
        unsafe { core::slice::from_raw_parts(start, len).to_vec() }
    }

    fn read_entry(&self, table: PhysAddr, slot: usize) -> PageEntry {
        let entry = PhysAddr::new(table.as_u32() + slot as u32 * 4);
        PageEntry::from_bits(unsafe { self.physical(entry).cast::<u32>().read() })
    }

    fn physical(&self, address: PhysAddr) -> *mut u8 {
        let offset = address.as_u32() as usize;
        assert!(
            offset < self.ram.layout.size(),
            "bus error: no RAM at {address}"
        );
        unsafe { self.ram.ptr.add(offset) }
    }
}

impl Platform for SimulatedMachine {
    fn pointer(&self, address: VirtAddr) -> *mut u8 {
        match self.translate(address) {
            Some(physical) => self.physical(physical),
            None => panic!("page fault at {address}"),
        }
    }

    unsafe fn load_directory(&self, directory: PhysAddr) {
        self.directory.set(Some(directory));
        self.flushes.set(self.flushes.get() + 1);
    }

    fn flush_translations(&self) {
        self.flushes.set(self.flushes.get() + 1);
    }

    fn invalidate_page(&self, _address: VirtAddr) {}

    fn disable_interrupts(&self) -> bool {
        self.interrupts.replace(false)
    }

    fn restore_interrupts(&self, enabled: bool) {
        self.interrupts.set(enabled);
    }
}

/// RAM of the machines used by most tests.
pub const MACHINE_RAM: usize = 16 << 20;

/// Layout matching [`MACHINE_RAM`]: the lower half is the low window.
pub fn test_layout() -> MemoryLayout {
    MemoryLayout {
        low_window_end: 8 << 20,
        heap_initial_pages: 16,
    }
}

/// A machine with [`MACHINE_RAM`] bytes of RAM and a frame allocator that knows about all of it
/// except frame zero.
pub fn machine_with_frames() -> (SimulatedMachine, FrameAllocator, MemoryLayout) {
    let layout = test_layout();
    let bitmap = vec![0u32; BITMAP_WORDS].leak();
    let mut frames = FrameAllocator::new(bitmap, &layout);
    frames.add_available(0, MACHINE_RAM as u64);
    frames.reserve(0, PAGE_SIZE as u64);
    (SimulatedMachine::new(MACHINE_RAM), frames, layout)
}

/// Flat memory behind the heap region, handed out page by page.
pub struct HeapArena {
    memory: AlignedMemory,
    capacity: u32,
    mapped: u32,
}

/// Maps the heap region of an [`HeapArena`] onto its memory.
#[derive(Clone, Copy)]
pub struct ArenaPlatform {
    base: *mut u8,
    len: usize,
}

impl HeapArena {
    pub fn new(pages: u32) -> Self {
        Self {
            memory: AlignedMemory::new((pages * PAGE_SIZE) as usize),
            capacity: pages,
            mapped: 0,
        }
    }

    pub fn platform(&self) -> ArenaPlatform {
        ArenaPlatform {
            base: self.memory.ptr,
            len: self.memory.layout.size(),
        }
    }

    pub fn mapped_pages(&self) -> u32 {
        self.mapped
    }

    pub fn write(&self, address: VirtAddr, bytes: &[u8]) {
        let start = self.platform().pointer(address);
        unsafe { start.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) }
    }

    pub fn read(&self, address: VirtAddr, len: usize) -> Vec<u8> {
        let start = self.platform().pointer(address);
        unsafe { core::slice::from_raw_parts(start, len).to_vec() }
    }
}

impl HeapBacking for HeapArena {
    fn map_pages(&mut self, at: VirtAddr, count: u32) -> Result<(), MemoryError> {
        assert_eq!(at.as_u32(), HEAP_BASE + self.mapped * PAGE_SIZE);
        if self.mapped + count > self.capacity {
            return Err(MemoryError::OutOfFrames(RegionClass::High));
        }
        self.mapped += count;
        Ok(())
    }
}

impl Platform for ArenaPlatform {
    fn pointer(&self, address: VirtAddr) -> *mut u8 {
        let offset = address
            .as_u32()
            .checked_sub(HEAP_BASE)
            .map(|offset| offset as usize)
            .filter(|&offset| offset < self.len);
        match offset {
            Some(offset) => unsafe { self.base.add(offset) },
            None => panic!("page fault at {address}"),
        }
    }

    unsafe fn load_directory(&self, _directory: PhysAddr) {}

    fn flush_translations(&self) {}

    fn invalidate_page(&self, _address: VirtAddr) {}

    fn disable_interrupts(&self) -> bool {
        false
    }

    fn restore_interrupts(&self, _enabled: bool) {}
}
