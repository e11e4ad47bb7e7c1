//! Interrupt descriptor table. Only the page fault vector is wired up, every other vector stays
//! non-present and escalates to a triple fault.

use core::arch::{asm, naked_asm};
use core::cell::UnsafeCell;

const PAGE_FAULT_VECTOR: usize = 14;

/// Present, ring 0, 32-bit interrupt gate.
const INTERRUPT_GATE: u8 = 0x8E;

#[derive(Clone, Copy)]
#[repr(C)]
struct Gate {
    offset_low: u16,
    selector: u16,
    _zero: u8,
    flags: u8,
    offset_high: u16,
}

impl Gate {
    const MISSING: Self = Self {
        offset_low: 0,
        selector: 0,
        _zero: 0,
        flags: 0,
        offset_high: 0,
    };

    fn interrupt(handler: u32, selector: u16) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            _zero: 0,
            flags: INTERRUPT_GATE,
            offset_high: (handler >> 16) as u16,
        }
    }
}

#[repr(C, align(8))]
struct Idt(UnsafeCell<[Gate; 256]>);

// Safety: only written by `initialize()` on the boot core before interrupts are enabled.
unsafe impl Sync for Idt {}

static IDT: Idt = Idt(UnsafeCell::new([Gate::MISSING; 256]));

#[repr(C, packed)]
struct Descriptor {
    limit: u16,
    base: u32,
}

/// Installs the page fault handler and loads the table.
///
/// ## Safety
///
/// Must run once, on the boot core, with interrupts disabled.
pub unsafe fn initialize() {
    let selector: u16;
    unsafe {
        // The bootloader's flat code segment stays in use.
        asm!("mov %cs, {0:x}", out(reg) selector, options(att_syntax, nomem, nostack));
        (*IDT.0.get())[PAGE_FAULT_VECTOR] =
            Gate::interrupt(page_fault_entry as usize as u32, selector);

        let descriptor = Descriptor {
            limit: (core::mem::size_of::<[Gate; 256]>() - 1) as u16,
            base: IDT.0.get() as u32,
        };
        asm!(
            "lidt ({})",
            in(reg) core::ptr::addr_of!(descriptor),
            options(att_syntax, readonly, nostack, preserves_flags)
        );
    }
}

/// Passes the faulting address (`cr2`) and the error code pushed by the processor on to
/// [`page_fault`]. Never returns.
#[unsafe(naked)]
extern "C" fn page_fault_entry() {
    naked_asm!(
        "mov %cr2, %eax",
        "pushl (%esp)",
        "pushl %eax",
        "call {handler}",
        "ud2",
        handler = sym page_fault,
        options(att_syntax)
    );
}

extern "C" fn page_fault(address: u32, code: u32) -> ! {
    mm::fault::handle_page_fault(address, code)
}
