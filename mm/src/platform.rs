//! The seam between the memory core and the processor it runs on.

use crate::addr::{PhysAddr, VirtAddr};

/// Hardware operations needed by the memory core. The kernel implements this for the real
/// processor; tests run the very same code against a simulated machine.
pub trait Platform {
    /// Pointer through which the byte at `address` in the active address space can be accessed.
    fn pointer(&self, address: VirtAddr) -> *mut u8;

    /// Loads the paging root register. Implicitly drops every cached translation.
    ///
    /// ## Safety
    ///
    /// `directory` must be a complete page directory that maps the running kernel.
    unsafe fn load_directory(&self, directory: PhysAddr);

    /// Drops all cached translations without changing the active directory.
    fn flush_translations(&self);

    /// Drops the cached translation of a single page.
    fn invalidate_page(&self, address: VirtAddr);

    /// Masks interrupts on this core and reports whether they were enabled before.
    fn disable_interrupts(&self) -> bool;

    /// Restores the interrupt flag saved by [`Platform::disable_interrupts`].
    fn restore_interrupts(&self, enabled: bool);
}

/// Masks interrupts for as long as it lives and restores the previous state on drop.
pub struct InterruptGuard<'p, P: Platform + ?Sized> {
    platform: &'p P,
    was_enabled: bool,
}

impl<'p, P: Platform + ?Sized> InterruptGuard<'p, P> {
    #[inline]
    pub fn new(platform: &'p P) -> Self {
        let was_enabled = platform.disable_interrupts();
        Self {
            platform,
            was_enabled,
        }
    }
}

impl<P: Platform + ?Sized> Drop for InterruptGuard<'_, P> {
    #[inline]
    fn drop(&mut self) {
        self.platform.restore_interrupts(self.was_enabled);
    }
}

/// Reads the 32-bit word at `address`.
#[inline]
pub(crate) fn read_u32<P: Platform + ?Sized>(platform: &P, address: VirtAddr) -> u32 {
    debug_assert!(address.is_aligned(4));
    unsafe { platform.pointer(address).cast::<u32>().read_volatile() }
}

/// Writes the 32-bit word at `address`.
#[inline]
pub(crate) fn write_u32<P: Platform + ?Sized>(platform: &P, address: VirtAddr, value: u32) {
    debug_assert!(address.is_aligned(4));
    unsafe { platform.pointer(address).cast::<u32>().write_volatile(value) }
}

#[inline]
pub(crate) fn read_u64<P: Platform + ?Sized>(platform: &P, address: VirtAddr) -> u64 {
    debug_assert!(address.is_aligned(8));
    unsafe { platform.pointer(address).cast::<u64>().read_volatile() }
}

#[inline]
pub(crate) fn write_u64<P: Platform + ?Sized>(platform: &P, address: VirtAddr, value: u64) {
    debug_assert!(address.is_aligned(8));
    unsafe { platform.pointer(address).cast::<u64>().write_volatile(value) }
}

/// Zeroes the page at the page-aligned `address`.
pub(crate) fn zero_page<P: Platform + ?Sized>(platform: &P, address: VirtAddr) {
    debug_assert!(address.is_page_aligned());
    unsafe {
        core::ptr::write_bytes(
            platform.pointer(address),
            0,
            crate::layout::PAGE_SIZE as usize,
        )
    }
}

/// Copies one page between two page-aligned addresses.
pub(crate) fn copy_page<P: Platform + ?Sized>(platform: &P, from: VirtAddr, to: VirtAddr) {
    debug_assert!(from.is_page_aligned() && to.is_page_aligned());
    unsafe {
        core::ptr::copy_nonoverlapping(
            platform.pointer(from),
            platform.pointer(to),
            crate::layout::PAGE_SIZE as usize,
        )
    }
}
