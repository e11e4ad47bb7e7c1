//! x86 specifics: port I/O, the processor glue of the memory core and the interrupt table.

use core::arch::asm;

pub mod idt;
pub mod io;
mod platform;

pub use platform::X86Platform;

/// Disable interrupts and stop execution on this core indefinitely.
#[inline(always)]
pub fn halt_core() -> ! {
    irq_disable();
    loop {
        wait_for_irq();
    }
}

#[inline(always)]
fn wait_for_irq() {
    unsafe {
        asm!("hlt", options(att_syntax, nomem, nostack));
    }
}

#[inline(always)]
fn irq_disable() {
    unsafe {
        asm!("cli", options(att_syntax, nomem, nostack));
    }
}

#[inline(always)]
fn irq_enable() {
    unsafe {
        asm!("sti", options(att_syntax, nomem, nostack));
    }
}
