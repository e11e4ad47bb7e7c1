//! ## Boot procedure implementation
//!
//! A dedicated bootloader (e.g. GRUB) must be used to load the kernel image into memory and pass
//! control to it. The bootloader must also provide the kernel with information about the machine
//! and its configuration (e.g. memory map, command line arguments, etc.). The modalities of these
//! tasks are defined by the boot protocol.

use log::LevelFilter;
use mm::MemoryLayout;

#[cfg(bare_metal)]
mod x86;

/// Settings taken from the kernel command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    pub log_level: LevelFilter,
    pub layout: MemoryLayout,
}

impl BootOptions {
    pub fn from_command_line(command_line: &str) -> Self {
        let mut layout = MemoryLayout::default();
        layout.apply_command_line(command_line);
        Self {
            log_level: crate::logging::level_from_command_line(command_line)
                .unwrap_or(crate::logging::DEFAULT_LEVEL),
            layout,
        }
    }
}

impl Default for BootOptions {
    fn default() -> Self {
        Self::from_command_line("")
    }
}
