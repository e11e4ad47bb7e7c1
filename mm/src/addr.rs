//! Physical and virtual addresses of the 32-bit address space.

use core::fmt::{Debug, Display, Formatter, Result};

use crate::layout::PAGE_SIZE;

/// An address in physical memory. Physical memory beyond 4 GiB is never handed out, so 32 bits
/// suffice.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

/// An address in the (current) virtual address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Physical address of the first byte of frame number `frame`.
    pub const fn from_frame(frame: u32) -> Self {
        Self(frame << 12)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn frame_number(self) -> u32 {
        self.0 >> 12
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Virtual address covered by page table `table_slot` of directory slot `dir_slot`.
    pub const fn from_slots(dir_slot: usize, table_slot: usize) -> Self {
        Self(((dir_slot as u32) << 22) | ((table_slot as u32) << 12))
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Index into the page directory (bits 31..22).
    pub const fn directory_slot(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Index into the page table (bits 21..12).
    pub const fn table_slot(self) -> usize {
        ((self.0 >> 12) & 0x3ff) as usize
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn is_aligned(self, alignment: u32) -> bool {
        self.0 & (alignment - 1) == 0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }

    /// Wrapping add. Callers are expected to stay inside the 32-bit space.
    pub const fn add(self, bytes: u32) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    pub const fn sub(self, bytes: u32) -> Self {
        Self(self.0.wrapping_sub(bytes))
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl Display for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl Display for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Round `value` up to the next multiple of the power of two `align`. `None` on overflow.
pub const fn align_up(value: u32, align: u32) -> Option<u32> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}
