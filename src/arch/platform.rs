use core::arch::asm;

use mm::{PhysAddr, Platform, VirtAddr};

/// Interrupt flag in `eflags`.
const EFLAGS_IF: u32 = 1 << 9;

/// The processor the kernel runs on. Kernel virtual addresses are dereferenced directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Platform;

impl Platform for X86Platform {
    fn pointer(&self, address: VirtAddr) -> *mut u8 {
        address.as_mut_ptr()
    }

    unsafe fn load_directory(&self, directory: PhysAddr) {
        unsafe {
            asm!(
                "mov {}, %cr3",
                in(reg) directory.as_u32(),
                options(att_syntax, nostack, preserves_flags)
            );
        }
    }

    fn flush_translations(&self) {
        unsafe {
            asm!(
                "mov %cr3, {tmp}",
                "mov {tmp}, %cr3",
                tmp = out(reg) _,
                options(att_syntax, nostack, preserves_flags)
            );
        }
    }

    fn invalidate_page(&self, address: VirtAddr) {
        unsafe {
            asm!(
                "invlpg ({})",
                in(reg) address.as_u32(),
                options(att_syntax, nostack, preserves_flags)
            );
        }
    }

    fn disable_interrupts(&self) -> bool {
        let eflags: u32;
        unsafe {
            asm!(
                "pushfl",
                "popl {}",
                "cli",
                out(reg) eflags,
                options(att_syntax, nomem)
            );
        }
        eflags & EFLAGS_IF != 0
    }

    fn restore_interrupts(&self, enabled: bool) {
        if enabled {
            super::irq_enable();
        }
    }
}
