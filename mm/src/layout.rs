//! Fixed layout of the 32-bit virtual address space and the few knobs that can be tuned at boot.
//!
//! ```text
//! 0x0000_0000 +----------------------+
//!             | user region          |  per address space, deep-copied on clone
//! 0xC000_0000 +----------------------+  KERNEL_BASE (directory slot 768)
//!             | low window           |  physical [0, low_window_end) at KERNEL_BASE + pa
//!             |   (up to 896 MiB)    |
//! 0xF800_0000 +----------------------+  HEAP_BASE (directory slot 992)
//!             | kernel heap          |
//! 0xFFC0_0000 +----------------------+  WINDOW_BASE (directory slot 1023)
//!             | temporary window     |  1024 scratch slots
//!             +----------------------+
//! ```
//!
//! Every slot from 768 upwards is shared by reference between all address spaces.

use crate::addr::{PhysAddr, VirtAddr};
use crate::error::MemoryError;

pub const PAGE_SIZE: u32 = 0x1000;

/// Entries in a page directory as well as in a page table.
pub const ENTRIES: usize = 1024;

/// Bytes mapped by a single page table.
pub const TABLE_SPAN: u32 = PAGE_SIZE * ENTRIES as u32;

pub const KERNEL_BASE: u32 = 0xC000_0000;
pub const KERNEL_FIRST_SLOT: usize = (KERNEL_BASE >> 22) as usize;

pub const HEAP_BASE: u32 = 0xF800_0000;

pub const WINDOW_BASE: u32 = 0xFFC0_0000;
pub const WINDOW_SLOT: usize = (WINDOW_BASE >> 22) as usize;

/// The heap may grow up to the temporary window.
pub const HEAP_LIMIT: u32 = WINDOW_BASE;

/// Largest physical range that fits between [`KERNEL_BASE`] and [`HEAP_BASE`].
pub const LOW_WINDOW_MAX: u32 = HEAP_BASE - KERNEL_BASE;

/// Number of frames in the 32-bit physical address space.
pub const FRAME_COUNT: u32 = 1 << 20;

/// Number of bitmap words needed to track every frame in [`FRAME_COUNT`].
pub const BITMAP_WORDS: usize = FRAME_COUNT as usize / 32;

/// Capacity of each of the heap's free-block indices.
pub const FREE_INDEX_CAPACITY: usize = 1024;

/// Address spaces that can exist at the same time, the kernel's included.
pub const MAX_ADDRESS_SPACES: usize = 256;

/// Boot-time tunables of the memory core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// End of the physical range that stays mapped at [`KERNEL_BASE`] in every address space.
    /// Frames below this address form the low window, everything above is the high window.
    pub low_window_end: u32,

    /// Pages mapped into the heap while the memory core starts up.
    pub heap_initial_pages: u32,
}

impl MemoryLayout {
    pub const DEFAULT: Self = Self {
        low_window_end: LOW_WINDOW_MAX,
        heap_initial_pages: 1024,
    };

    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.low_window_end == 0 || self.low_window_end % TABLE_SPAN != 0 {
            return Err(MemoryError::InvalidLayout(
                "low window must be a non-zero multiple of 4 MiB",
            ));
        }
        if self.low_window_end > LOW_WINDOW_MAX {
            return Err(MemoryError::InvalidLayout("low window exceeds 896 MiB"));
        }
        if self.heap_initial_pages == 0 || self.heap_initial_pages > self.heap_max_pages() {
            return Err(MemoryError::InvalidLayout(
                "initial heap does not fit the heap region",
            ));
        }
        Ok(())
    }

    /// Applies `mm.lowmem=<MiB>` and `mm.heap=<pages>` options from a kernel command line.
    /// Unknown words are skipped, malformed values are logged and ignored.
    pub fn apply_command_line(&mut self, command_line: &str) {
        for (key, value) in command_line
            .split_ascii_whitespace()
            .filter_map(|word| word.split_once('='))
        {
            match key {
                "mm.lowmem" => match value.parse::<u32>() {
                    Ok(mib) if mib > 0 && mib % 4 == 0 && mib <= LOW_WINDOW_MAX >> 20 => {
                        self.low_window_end = mib << 20;
                    }
                    _ => log::warn!("Ignoring invalid option mm.lowmem={value}"),
                },
                "mm.heap" => match value.parse::<u32>() {
                    Ok(pages) if pages > 0 && pages <= self.heap_max_pages() => {
                        self.heap_initial_pages = pages;
                    }
                    _ => log::warn!("Ignoring invalid option mm.heap={value}"),
                },
                _ => {}
            }
        }
    }

    /// Shrinks the low window on machines whose usable memory ends at `memory_top`, so that an
    /// eighth of that memory and at least the initial heap are left to the high window. The low
    /// window never drops below one page table's span.
    pub fn fit_to_memory(self, memory_top: u64) -> Self {
        let high = (memory_top / 8).max(self.heap_initial_pages as u64 * PAGE_SIZE as u64);
        let limit = memory_top.saturating_sub(high) / TABLE_SPAN as u64 * TABLE_SPAN as u64;
        let limit = limit.max(TABLE_SPAN as u64);
        if self.low_window_end as u64 <= limit {
            return self;
        }
        Self {
            // Smaller than the current window, so it fits.
            low_window_end: limit as u32,
            ..self
        }
    }

    pub const fn heap_max_pages(&self) -> u32 {
        (HEAP_LIMIT - HEAP_BASE) / PAGE_SIZE
    }

    /// Number of frames in the low window.
    pub const fn low_frames(&self) -> u32 {
        self.low_window_end / PAGE_SIZE
    }

    pub const fn is_low(&self, addr: PhysAddr) -> bool {
        addr.as_u32() < self.low_window_end
    }

    /// Kernel virtual address of a low-window physical address.
    pub fn low_to_virtual(&self, addr: PhysAddr) -> Option<VirtAddr> {
        self.is_low(addr)
            .then(|| VirtAddr::new(KERNEL_BASE + addr.as_u32()))
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
