//! Every multiboot-compliant kernel needs to have the multiboot header structure within the first
//! 8K of its binary. Link it into a custom section (e.g. `.multiboot`) that the linker script
//! places in front of everything else.
//!
//! ```ignore
//! #[used]
//! #[link_section = ".multiboot"]
//! static MULTIBOOT_HEADER: Header = HeaderBuilder::new()
//!     .request_aligned_modules()
//!     .request_memory_map()
//!     .build();
//! ```

/// Magic value identifying the header.
pub const HEADER_MAGIC: u32 = 0x1bad_b002;

/// The part of the multiboot header that an ELF kernel needs. Load addresses and graphics
/// requests are not used, so their flag bits are never set and the fields can be left out.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Header {
    magic: u32,

    /// Bits 0-15 are requirements the bootloader must fulfill, bits 16-31 optional features.
    flags: u32,

    /// Chosen so that `magic + flags + checksum` wraps to zero.
    checksum: u32,
}

const _: [(); 12] = [(); core::mem::size_of::<Header>()];

impl Header {
    pub const fn flags(&self) -> u32 {
        self.flags
    }
}

/// Builds a valid multiboot header from the requested features.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeaderBuilder {
    flags: u32,
}

impl HeaderBuilder {
    pub const fn new() -> Self {
        Self { flags: 0 }
    }

    /// Requests that boot modules be loaded on page boundaries.
    pub const fn request_aligned_modules(self) -> Self {
        Self {
            flags: self.flags | (1 << 0),
        }
    }

    /// Requests the memory size fields and the memory map.
    pub const fn request_memory_map(self) -> Self {
        Self {
            flags: self.flags | (1 << 1),
        }
    }

    pub const fn build(self) -> Header {
        Header {
            magic: HEADER_MAGIC,
            flags: self.flags,
            checksum: 0u32.wrapping_sub(HEADER_MAGIC.wrapping_add(self.flags)),
        }
    }
}
