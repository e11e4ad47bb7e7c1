//! This crate contains the structures used to implement the multiboot boot protocol as defined in
//! the corresponding specification:
//!
//! https://www.gnu.org/software/grub/manual/multiboot/multiboot.html (version 0.6.96)
//!
//! All addresses in the boot information are physical. A kernel that does not run identity
//! mapped passes the offset at which it can reach physical memory to [`BootInfo::from_addr`].

#![cfg_attr(not(test), no_std)]

mod header;
mod mmap;

use core::ops::Range;

pub use header::*;
pub use mmap::*;

/// Value of `eax` when a multiboot-compliant bootloader enters the kernel.
pub const BOOTLOADER_MAGIC: u32 = 0x2bad_b002;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidBootInfo {
    #[error("multiboot magic value mismatch: {0:#010x}")]
    Magic(u32),
    #[error("multiboot information structure missing")]
    Null,
    #[error("multiboot information structure misaligned: {0:#010x}")]
    Misaligned(u32),
}

#[derive(Clone, Copy)]
pub struct BootInfo<'mb> {
    inner: &'mb InnerBootInfo,
    offset: usize,
}

impl<'mb> BootInfo<'mb> {
    /// Checks the bootloader magic value and the address of the information structure.
    ///
    /// ### Safety
    ///
    /// Physical memory must be accessible at `offset + physical address` and the information
    /// structure as well as everything it points to must not be mutated during `'mb`.
    pub unsafe fn from_addr(magic: u32, addr: u32, offset: usize) -> Result<Self, InvalidBootInfo> {
        if magic != BOOTLOADER_MAGIC {
            return Err(InvalidBootInfo::Magic(magic));
        }
        if addr == 0 {
            return Err(InvalidBootInfo::Null);
        }
        let ptr = (offset + addr as usize) as *const InnerBootInfo;
        if !ptr.is_aligned() {
            return Err(InvalidBootInfo::Misaligned(addr));
        }
        Ok(Self {
            inner: unsafe {
                // Safety: non-null and aligned, the caller vouches for the rest.
                &*ptr
            },
            offset,
        })
    }

    /// Returns the kernel command line if the bootloader passed one.
    pub fn command_line(&self) -> Option<&'mb core::ffi::CStr> {
        if !self.inner.flags.is_cmdline_valid() || self.inner.cmdline == 0 {
            return None;
        }
        let ptr = self.physical::<core::ffi::c_char>(self.inner.cmdline);
        Some(unsafe { core::ffi::CStr::from_ptr(ptr) })
    }

    /// Returns an iterator over the memory map, or `None` if there is no memory map present.
    pub fn memory_map(&self) -> Option<MemoryMapIter<'mb>> {
        let range = self.memory_map_range()?;
        let buffer = unsafe {
            // Safety: the bootloader marked the memory map valid and its address is non-null.
            core::slice::from_raw_parts::<'mb>(
                self.physical::<u8>(self.inner.mmap),
                (range.end - range.start) as usize,
            )
        };
        Some(buffer.into())
    }

    /// Physical memory of the information structure itself.
    pub fn info_range(&self) -> Range<u64> {
        let start = (self.inner as *const InnerBootInfo as usize - self.offset) as u64;
        start..start + core::mem::size_of::<InnerBootInfo>() as u64
    }

    /// Physical memory of the memory map buffer.
    pub fn memory_map_range(&self) -> Option<Range<u64>> {
        if !self.inner.flags.is_mmap_valid() || self.inner.mmap == 0 {
            return None;
        }
        let start = self.inner.mmap as u64;
        Some(start..start + self.inner.mmap_length as u64)
    }

    /// Physical memory of the command line, terminator included.
    pub fn command_line_range(&self) -> Option<Range<u64>> {
        let length = self.command_line()?.to_bytes_with_nul().len() as u64;
        let start = self.inner.cmdline as u64;
        Some(start..start + length)
    }

    fn physical<T>(&self, addr: u32) -> *const T {
        (self.offset + addr as usize) as *const T
    }
}

impl core::fmt::Debug for BootInfo<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Multiboot")
            .field("flags", &self.inner.flags)
            .field("cmdline", &self.command_line())
            .field("mmap", &self.memory_map())
            .finish_non_exhaustive()
    }
}

/// The information structure the bootloader passes in `ebx`. Only the fields up to the memory
/// map are declared.
#[repr(C)]
#[derive(Debug)]
struct InnerBootInfo {
    /// Indicates the presence and validity of the other fields.
    flags: BootInfoFlags,

    /// Lower memory in KiB, valid if bit 0 is set.
    _mem_lower: u32,

    /// Upper memory in KiB, starting at 1 MiB. Valid if bit 0 is set.
    _mem_upper: u32,

    _boot_device: u32,

    /// Physical address of the zero-terminated command line, valid if bit 2 is set.
    cmdline: u32,

    _mods_count: u32,
    _mods_addr: u32,
    _syms: [u32; 4],

    /// Size of the memory map buffer in bytes, valid if bit 6 is set.
    mmap_length: u32,

    /// Physical address of the memory map buffer, valid if bit 6 is set.
    mmap: u32,
}

#[derive(Clone, Copy)]
#[repr(transparent)]
struct BootInfoFlags(u32);

impl BootInfoFlags {
    const NAMES: [(&'static str, u32); 13] = [
        ("MEM", 0),
        ("BOOTDEV", 1),
        ("CMDLINE", 2),
        ("MODS", 3),
        ("SYMBOLS", 4),
        ("ELFSHT", 5),
        ("MMAP", 6),
        ("DRV", 7),
        ("CFG", 8),
        ("BLDR", 9),
        ("APM", 10),
        ("VBE", 11),
        ("FBR", 12),
    ];

    fn is_nth_bit_set(&self, bit: u32) -> bool {
        self.0 & (1 << bit) != 0
    }

    fn is_cmdline_valid(&self) -> bool {
        self.is_nth_bit_set(2)
    }

    fn is_mmap_valid(&self) -> bool {
        self.is_nth_bit_set(6)
    }
}

impl core::fmt::Debug for BootInfoFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{{ ")?;
        for name in Self::NAMES
            .iter()
            .filter_map(|(name, bit)| self.is_nth_bit_set(*bit).then_some(name))
        {
            write!(f, "{name}, ")?;
        }
        write!(f, ".. }}")
    }
}
