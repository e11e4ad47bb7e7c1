//! Kernel for 32-bit x86 PCs, booted by any multiboot-compliant bootloader.
//!
//! Build for bare metal with
//! `cargo build -Zbuild-std=core,alloc --target i686-unknown-none.json`. Hosted builds produce a
//! stub binary and exist so that the boot option parsing can be tested on the host.

#![cfg_attr(bare_metal, no_std)]
#![cfg_attr(bare_metal, no_main)]
#![cfg_attr(not(bare_metal), allow(dead_code))]

#[cfg(bare_metal)]
extern crate alloc;

#[cfg(bare_metal)]
mod arch;

mod boot;

mod logging;

#[cfg(bare_metal)]
mod mem;

/// The panic handler is called whenever the kernel encountered an unrecoverable error. It's purpose
/// is to halt the system and report debug information to the user.
#[cfg(bare_metal)]
#[panic_handler]
fn panic(reason: &core::panic::PanicInfo) -> ! {
    log::error!("Halting due to unrecoverable kernel panic:\n{}", reason);
    arch::halt_core();
}

#[cfg(not(bare_metal))]
fn main() {
    eprintln!("This kernel only runs on bare metal, build it for i686-unknown-none.json");
    std::process::exit(1);
}
