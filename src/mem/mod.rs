//! Memory management
//!
//! The kernel's single instance of the memory core, set up from the bootloader's memory map.

mod heap;

use core::ops::Range;

use mm::layout::BITMAP_WORDS;
use mm::{MemoryCore, MemoryLayout};
use spin::Once;
use types::fmt::ByteSize;
use types::mem::MemoryRegion;

use crate::arch::X86Platform;

/// Physical memory below 1 MiB is left alone: real mode data structures, the BIOS and legacy
/// devices live there.
const LEGACY_MEMORY: Range<u64> = 0..0x10_0000;

/// Physical memory beyond 4 GiB cannot be reached without PAE.
const ADDRESSABLE_LIMIT: u64 = 1 << 32;

static MEMORY: Once<MemoryCore<X86Platform>> = Once::new();

/// One bit per physical frame of the 32-bit address space.
static mut FRAME_BITMAP: [u32; BITMAP_WORDS] = [0; BITMAP_WORDS];

/// The memory core, once [`bootstrap_subsystem`] has run.
pub fn memory() -> Option<&'static MemoryCore<X86Platform>> {
    MEMORY.get()
}

/// Hands all usable memory to the memory core and switches to the kernel address space.
/// Everything in `boot_ranges` stays untouched, as do the kernel image and the first MiB.
pub fn bootstrap_subsystem(
    layout: MemoryLayout,
    memory_map: impl Iterator<Item = MemoryRegion> + Clone,
    boot_ranges: &[Range<u64>],
) {
    let memory_map = memory_map.filter_map(|region| region.clip(0, ADDRESSABLE_LIMIT));
    print_memory_map(memory_map.clone());

    let mut reserved = [LEGACY_MEMORY, kernel_image(), 0..0, 0..0, 0..0];
    for (slot, range) in reserved[2..].iter_mut().zip(boot_ranges) {
        *slot = range.clone();
    }

    let memory = MEMORY.call_once(|| {
        let bitmap = unsafe {
            // Safety: `call_once` runs this closure exactly once.
            &mut *core::ptr::addr_of_mut!(FRAME_BITMAP)
        };
        match MemoryCore::bootstrap(X86Platform, layout, bitmap, memory_map, &reserved) {
            Ok(memory) => memory,
            Err(error) => panic!("Cannot bring up the memory subsystem: {error}"),
        }
    });
    log::info!(
        "Physical memory below {} is mapped directly",
        ByteSize::from(memory.layout().low_window_end)
    );

    heap::self_test();
}

/// Physical range occupied by the kernel image, as defined by the linker script.
fn kernel_image() -> Range<u64> {
    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }
    // The symbols carry physical addresses; only their addresses are taken.
    let start = unsafe { core::ptr::addr_of!(__kernel_start) } as usize as u64;
    let end = unsafe { core::ptr::addr_of!(__kernel_end) } as usize as u64;
    start..end
}

/// Prints the bootloader-provided memory map to the kernel log.
fn print_memory_map(memory_map: impl Iterator<Item = MemoryRegion>) {
    log::info!("Bootloader-provided memory map:");

    let (bytes, frames) = memory_map
        .inspect(|region| log::info!("├─ {region}"))
        .filter(MemoryRegion::is_usable)
        .fold((0, 0), |(bytes, frames), region| {
            let whole = region.whole_frames();
            (bytes + region.length, frames + (whole.end - whole.start))
        });

    log::info!(
        "└─ total memory available: {} ({frames} frames)",
        ByteSize(bytes)
    );
}
