use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use mm::heap::ALIGNMENT;
use mm::VirtAddr;

#[cfg_attr(bare_metal, global_allocator)]
static HEAP_MANAGER: HeapManager = HeapManager;

/// Serves Rust allocations from the kernel heap of the memory core.
struct HeapManager;

unsafe impl GlobalAlloc for HeapManager {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT as usize {
            return ptr::null_mut();
        }
        let (Some(memory), Ok(size)) = (super::memory(), u32::try_from(layout.size())) else {
            return ptr::null_mut();
        };
        match memory.heap_allocate(size.max(1)) {
            Ok(payload) => payload.as_mut_ptr(),
            Err(error) => {
                log::warn!("Heap allocation of {layout:?} failed: {error}");
                ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(memory) = super::memory() else {
            return;
        };
        if let Err(error) = memory.heap_free(VirtAddr::new(ptr as usize as u32)) {
            log::warn!("Heap free of {ptr:?} rejected: {error}");
        }
    }
}

/// Allocates and frees a few blocks through the global allocator and checks that the heap is
/// back in shape afterwards.
pub(super) fn self_test() {
    let Some(memory) = super::memory() else {
        return;
    };
    let before = memory.heap_stats();

    let page = Box::new([0xA5u8; 0x1000]);
    let mut large = Vec::<u32>::with_capacity(0x10_0000);
    large.extend((0..0x10_0000).map(|i| i ^ 0xB10C));
    log::debug!("Heap self test: page @ {:p}, large @ {:p}", page, large.as_ptr());
    memory.dump_heap();
    assert!(large.iter().enumerate().all(|(i, &v)| v == i as u32 ^ 0xB10C));
    drop(large);
    drop(page);

    match memory.verify_heap() {
        Ok(after) => {
            log::info!("Kernel heap: {after}");
            log::debug!("Kernel heap before self test: {before}");
        }
        Err(error) => panic!("Kernel heap corrupted by self test: {error}"),
    }
    log::info!("Physical frames: {:?}", memory.frame_stats());
}
