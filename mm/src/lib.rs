//! Memory management core of the kernel
//!
//! Four components, each depending on the ones before it:
//!
//! 1. [`physical::FrameAllocator`]: one bit per physical frame.
//! 2. [`paging::AddressSpaceManager`]: two-level page tables, the kernel address space and
//!    cloning of address spaces.
//! 3. [`window::TemporaryWindow`]: short-lived mappings of arbitrary physical memory.
//! 4. [`heap::Heap`]: the kernel's general purpose allocator.
//!
//! [`MemoryCore`] owns all four and is the interface for the rest of the kernel. Each component
//! sits behind its own lock, and every entry point masks interrupts for its whole duration. Locks
//! are always taken in the order heap, address spaces, window, frames.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod error;
pub mod fault;
pub mod heap;
pub mod layout;
pub mod ordered;
pub mod paging;
pub mod physical;
pub mod platform;
pub mod window;

#[cfg(test)]
mod testing;

use core::ops::Range;

use spin::Mutex;
use types::mem::MemoryRegion;

pub use addr::{PhysAddr, VirtAddr};
pub use error::MemoryError;
pub use heap::HeapStats;
pub use layout::MemoryLayout;
pub use paging::AddressSpace;
pub use physical::{FrameStats, RegionClass};
pub use platform::{InterruptGuard, Platform};

use heap::{Heap, HeapBacking};
use paging::AddressSpaceManager;
use physical::FrameAllocator;
use window::TemporaryWindow;

pub struct MemoryCore<P: Platform> {
    platform: P,
    layout: MemoryLayout,
    heap: Mutex<Heap>,
    spaces: Mutex<AddressSpaceManager>,
    window: Mutex<TemporaryWindow>,
    frames: Mutex<FrameAllocator>,
}

impl<P: Platform> MemoryCore<P> {
    /// Brings up the memory core.
    ///
    /// The frame bitmap is built from `memory_map`: available regions become allocatable, every
    /// other region as well as each range in `reserved` (the kernel image, for instance) is
    /// reserved. The low window is shrunk if it would leave too little memory above it. Then the
    /// kernel address space is built and activated, and the heap receives its initial pages.
    pub fn bootstrap(
        platform: P,
        layout: MemoryLayout,
        bitmap: &'static mut [u32],
        memory_map: impl Iterator<Item = MemoryRegion> + Clone,
        reserved: &[Range<u64>],
    ) -> Result<Self, MemoryError> {
        layout.validate()?;
        let memory_top = memory_map
            .clone()
            .filter(MemoryRegion::is_usable)
            .map(|region| region.end_addr())
            .max()
            .unwrap_or(0);
        let fitted = layout.fit_to_memory(memory_top);
        if fitted != layout {
            log::info!(
                "Low window reduced to {} MiB to leave high memory for the heap",
                fitted.low_window_end >> 20
            );
        }
        let layout = fitted;

        let mut frames = FrameAllocator::new(bitmap, &layout);
        for region in memory_map.clone().filter(MemoryRegion::is_usable) {
            frames.add_available(region.base_addr, region.length);
        }
        for region in memory_map.filter(|region| !region.is_usable()) {
            frames.reserve(region.base_addr, region.length);
        }
        for range in reserved {
            frames.reserve(range.start, range.end.saturating_sub(range.start));
        }
        log::debug!("Physical frames: {:?}", frames.stats());

        let mut spaces = AddressSpaceManager::new(layout);
        spaces.initialize_kernel_space(&platform, &mut frames)?;
        let window_table = spaces
            .window_table(&platform)
            .ok_or(MemoryError::InvalidLayout("temporary window has no page table"))?;
        let window = TemporaryWindow::new(window_table, layout);

        let mut heap = Heap::new();
        heap.initialize(
            &platform,
            &mut KernelPages {
                platform: &platform,
                spaces: &mut spaces,
                frames: &mut frames,
            },
            layout.heap_initial_pages,
        )?;

        log::info!(
            "Memory core ready: {} MiB low window, {}",
            layout.low_window_end >> 20,
            heap.stats(&platform)
        );
        Ok(Self {
            platform,
            layout,
            heap: Mutex::new(heap),
            spaces: Mutex::new(spaces),
            window: Mutex::new(window),
            frames: Mutex::new(frames),
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn allocate_frames(&self, class: RegionClass, count: u32) -> Result<PhysAddr, MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.frames.lock().allocate(class, count)
    }

    pub fn free_frames(&self, base: PhysAddr, count: u32) -> Result<(), MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.frames.lock().free(base, count)
    }

    pub fn frame_stats(&self) -> FrameStats {
        let _irq = InterruptGuard::new(&self.platform);
        self.frames.lock().stats()
    }

    /// Maps the frame at `pa` at the user address `va` of `space`. The frame must have been
    /// allocated by the caller and is owned by `space` afterwards.
    pub fn map_user_page(
        &self,
        space: AddressSpace,
        va: VirtAddr,
        pa: PhysAddr,
        writable: bool,
    ) -> Result<(), MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        let mut spaces = self.spaces.lock();
        let mut frames = self.frames.lock();
        spaces.map_user_page(&self.platform, &mut frames, space, va, pa, writable)
    }

    /// Removes the user page at `va` and returns its frame, which is owned by the caller again.
    pub fn unmap_user_page(
        &self,
        space: AddressSpace,
        va: VirtAddr,
    ) -> Result<PhysAddr, MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.spaces.lock().unmap_user_page(&self.platform, space, va)
    }

    pub fn translate(&self, space: AddressSpace, va: VirtAddr) -> Option<PhysAddr> {
        let _irq = InterruptGuard::new(&self.platform);
        self.spaces.lock().translate(&self.platform, space, va)
    }

    pub fn clone_address_space(&self, source: AddressSpace) -> Result<AddressSpace, MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        let mut spaces = self.spaces.lock();
        let mut window = self.window.lock();
        let mut frames = self.frames.lock();
        spaces.clone_space(&self.platform, &mut window, &mut frames, source)
    }

    pub fn release_address_space(&self, space: AddressSpace) -> Result<(), MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        let mut spaces = self.spaces.lock();
        let mut frames = self.frames.lock();
        spaces.release(&self.platform, &mut frames, space)
    }

    pub fn switch_address_space(&self, space: AddressSpace) -> Result<(), MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.spaces.lock().switch(&self.platform, space)
    }

    pub fn flush_translations(&self) {
        let _irq = InterruptGuard::new(&self.platform);
        self.spaces.lock().flush_translations(&self.platform);
    }

    pub fn kernel_space(&self) -> Option<AddressSpace> {
        let _irq = InterruptGuard::new(&self.platform);
        self.spaces.lock().kernel_space()
    }

    pub fn active_space(&self) -> Option<AddressSpace> {
        let _irq = InterruptGuard::new(&self.platform);
        self.spaces.lock().active_space()
    }

    /// Maps the physical address `pa` and returns where it can be accessed. Must be paired with
    /// [`MemoryCore::unmap_temporary`]; prefer [`MemoryCore::map_temporary`].
    pub fn map_temporary_raw(&self, pa: PhysAddr) -> Result<VirtAddr, MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.window.lock().map(&self.platform, pa)
    }

    pub fn unmap_temporary(&self, va: VirtAddr) {
        let _irq = InterruptGuard::new(&self.platform);
        self.window.lock().unmap(&self.platform, va);
    }

    /// Maps the physical address `pa` for as long as the returned guard lives.
    pub fn map_temporary(&self, pa: PhysAddr) -> Result<TemporaryMapping<'_, P>, MemoryError> {
        let address = self.map_temporary_raw(pa)?;
        Ok(TemporaryMapping {
            core: self,
            address,
        })
    }

    /// Allocates `size` bytes of kernel heap, 16-byte aligned.
    pub fn heap_allocate(&self, size: u32) -> Result<VirtAddr, MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        let mut heap = self.heap.lock();
        let mut spaces = self.spaces.lock();
        let mut frames = self.frames.lock();
        let mut backing = KernelPages {
            platform: &self.platform,
            spaces: &mut spaces,
            frames: &mut frames,
        };
        heap.allocate(&self.platform, &mut backing, size)
    }

    pub fn heap_free(&self, address: VirtAddr) -> Result<(), MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.heap.lock().free(&self.platform, address)
    }

    pub fn heap_stats(&self) -> HeapStats {
        let _irq = InterruptGuard::new(&self.platform);
        self.heap.lock().stats(&self.platform)
    }

    pub fn verify_heap(&self) -> Result<HeapStats, MemoryError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.heap.lock().verify(&self.platform)
    }

    pub fn dump_heap(&self) {
        let _irq = InterruptGuard::new(&self.platform);
        self.heap.lock().dump(&self.platform);
    }
}

/// A temporary mapping that is removed again on drop.
pub struct TemporaryMapping<'c, P: Platform> {
    core: &'c MemoryCore<P>,
    address: VirtAddr,
}

impl<P: Platform> TemporaryMapping<'_, P> {
    pub fn address(&self) -> VirtAddr {
        self.address
    }

    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.core.platform.pointer(self.address).cast()
    }
}

impl<P: Platform> Drop for TemporaryMapping<'_, P> {
    fn drop(&mut self) {
        self.core.unmap_temporary(self.address);
    }
}

/// Heap growth through the kernel address space.
struct KernelPages<'a, P: Platform> {
    platform: &'a P,
    spaces: &'a mut AddressSpaceManager,
    frames: &'a mut FrameAllocator,
}

impl<P: Platform> HeapBacking for KernelPages<'_, P> {
    fn map_pages(&mut self, at: VirtAddr, count: u32) -> Result<(), MemoryError> {
        self.spaces
            .map_kernel_pages(self.platform, self.frames, at, count)
    }
}
