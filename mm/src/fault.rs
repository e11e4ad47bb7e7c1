//! Page fault classification. No fault can be resolved yet, so every fault ends the kernel.

use core::fmt::{Display, Formatter};

use bitfield_struct::bitfield;

use crate::addr::VirtAddr;

/// Error code pushed by the processor for a page fault (vector 14).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultCode {
    /// Set for a protection violation, clear for a non-present page.
    pub present: bool,
    /// Set if the faulting access was a write.
    pub write: bool,
    /// Set if the access happened in user mode.
    pub user: bool,
    /// Set if a reserved bit was set in some paging structure.
    pub reserved: bool,
    #[bits(28)]
    __: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address, as found in `cr2`.
    pub address: VirtAddr,
    pub code: PageFaultCode,
}

impl PageFault {
    pub fn new(address: u32, code: u32) -> Self {
        Self {
            address: VirtAddr::new(address),
            code: PageFaultCode::from_bits(code),
        }
    }
}

impl Display for PageFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "page fault @ {}: {} during {} in {} mode",
            self.address,
            if self.code.present() {
                "protection violation"
            } else {
                "page not present"
            },
            if self.code.write() { "write" } else { "read" },
            if self.code.user() { "user" } else { "supervisor" },
        )?;
        if self.code.reserved() {
            f.write_str(", reserved bit set")?;
        }
        Ok(())
    }
}

/// Entry point for the interrupt front end. Reports the fault and halts.
pub fn handle_page_fault(address: u32, code: u32) -> ! {
    let fault = PageFault::new(address, code);
    log::error!("{fault}");
    panic!("unhandled {fault}");
}
