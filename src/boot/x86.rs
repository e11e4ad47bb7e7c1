//! On the x86-32 architecture, this kernel uses the `multiboot` boot protocol. Entry happens in
//! protected mode with paging disabled and the boot information pointer in `ebx`.

use core::arch::naked_asm;
use core::ops::Range;

use mm::layout::{KERNEL_BASE, KERNEL_FIRST_SLOT, LOW_WINDOW_MAX};
use multiboot::BootInfo;

use super::BootOptions;

/// Size of the boot stack. It keeps serving as the kernel stack afterwards.
const BOOT_STACK_SIZE: usize = 0x4000;

/// Multiboot specification requires multiboot header to be present in the first 8K of the kernel
/// binary for the bootloader to search for. It signals to the bootloader that the kernel is
/// multiboot-compliant. Also, the kernel can request features from the bootloader via flags.
#[used]
#[link_section = ".multiboot"]
static MULTIBOOT_HEADER: multiboot::Header = multiboot::HeaderBuilder::new()
    .request_aligned_modules()
    .request_memory_map()
    .build();

#[repr(C, align(4096))]
struct BootDirectory([u32; 1024]);

/// Present, writable, 4 MiB page.
const LARGE_PAGE: u32 = 0x83;

/// The page directory used until the memory core has built the kernel address space. The first
/// 4 MiB are identity mapped so that the entry code keeps running after paging is enabled, and
/// the largest possible low window is mapped at [`KERNEL_BASE`] with 4 MiB pages.
static mut BOOT_DIRECTORY: BootDirectory = {
    let mut entries = [0u32; 1024];
    entries[0] = LARGE_PAGE;
    let mut slot = 0;
    while slot < (LOW_WINDOW_MAX >> 22) as usize {
        entries[KERNEL_FIRST_SLOT + slot] = ((slot as u32) << 22) | LARGE_PAGE;
        slot += 1;
    }
    BootDirectory(entries)
};

#[repr(C, align(16))]
struct BootStack([u8; BOOT_STACK_SIZE]);

static mut BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_SIZE]);

/// The entry point is the first code that gets executed once the bootloader passes control to the
/// kernel. The bootloader jumps to the entry point of the ELF file, which the linker script sets
/// to this function. It lives in `.boot.text` and therefore runs at its physical address.
///
/// Before jumping to the [`multiboot_main()`] function, this function will perform the following
/// tasks:
///
/// 1. Load the boot directory and enable paging with 4 MiB pages.
/// 2. Clear the BSS segment.
/// 3. Setup the boot stack, which lives in the BSS segment.
/// 4. Call [`multiboot_main()`] with the multiboot magic value from `eax` and the physical address
///    of the multiboot information structure from `ebx`.
#[unsafe(naked)]
#[no_mangle]
#[link_section = ".boot.text"]
unsafe extern "C" fn multiboot_start() {
    // Exact machine state at this point is defined by the multiboot specification.
    // * `eax`: Must contain magic value `0x2BADB002`.
    // * `ebx`: Contains the physical address of the multiboot information structure.
    // * `esp`: Stack pointer is in an undefined state. We must load our own.
    naked_asm!(
        "mov ${directory} - {kernel_base}, %ecx",
        "mov %ecx, %cr3",
        "mov %cr4, %ecx",
        "or $0x10, %ecx", // PSE
        "mov %ecx, %cr4",
        "mov %cr0, %ecx",
        "or $0x80000000, %ecx", // PG
        "mov %ecx, %cr0",
        // Paging is on. Everything from here on may use higher half addresses.
        "mov %eax, %esi",
        "mov %ebx, %edx",
        "mov $__bss_start, %edi",
        "mov $__bss_end, %ecx",
        "sub %edi, %ecx",
        "xor %eax, %eax",
        "cld",
        "rep stosb",
        "mov ${stack} + {stack_size}, %esp",
        "xor %ebp, %ebp",
        "push %edx",
        "push %esi",
        "call {main}",
        "ud2",
        directory = sym BOOT_DIRECTORY,
        kernel_base = const KERNEL_BASE,
        stack = sym BOOT_STACK,
        stack_size = const BOOT_STACK_SIZE,
        main = sym multiboot_main,
        options(att_syntax)
    );
}

/// Coming from [`multiboot_start()`], this is the first true Rust code that gets executed after
/// the bootloader passes control to the kernel. Its tasks are:
///
/// 1. Initialize the kernel log.
/// 2. Verify the multiboot magic value and information structure pointer.
/// 3. Initialize the memory subsystem based on the memory map provided by the bootloader via the
///    multiboot information structure.
extern "C" fn multiboot_main(magic: u32, mb_addr: u32) -> ! {
    let multiboot = match unsafe {
        // Safety: the boot directory maps the low window, the structure is never written.
        BootInfo::from_addr(magic, mb_addr, KERNEL_BASE as usize)
    } {
        Ok(multiboot) => multiboot,
        Err(error) => {
            // No log yet, the command line is unknown.
            crate::logging::initialize_kernel_log(crate::logging::DEFAULT_LEVEL);
            panic!("{error}");
        }
    };

    let command_line = multiboot
        .command_line()
        .and_then(|cmdline| cmdline.to_str().ok())
        .unwrap_or("");
    let options = BootOptions::from_command_line(command_line);

    crate::logging::initialize_kernel_log(options.log_level);
    log::info!("Kernel by Alexander Ulmer v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Copyright 2017-2024");
    log::info!("Command line: {command_line:?}");
    log::debug!("Multiboot dump: {:?}", multiboot);

    unsafe {
        // Safety: interrupts are still disabled.
        crate::arch::idt::initialize();
    }

    let Some(memory_map) = multiboot.memory_map() else {
        panic!("Expected multiboot memory map to be present");
    };
    let boot_ranges: [Range<u64>; 3] = [
        multiboot.info_range(),
        multiboot.memory_map_range().unwrap_or_default(),
        multiboot.command_line_range().unwrap_or_default(),
    ];
    crate::mem::bootstrap_subsystem(
        options.layout,
        memory_map.map(types::mem::MemoryRegion::from),
        &boot_ranges,
    );

    crate::arch::halt_core();
}
