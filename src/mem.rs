//! Wires [`physmem`] and [`kmem`] into the two exported entry points,
//! `kmalloc`/`kfree`. The physical memory manager itself is not built until
//! [`init_physical_memory`] is called with the boot-time region layout
//! (computed by whoever owns the memory map and the linker symbols for the
//! kernel image, both out of scope here).

use lazy_static::lazy_static;
use spin::Mutex;

use kmem::{KmemAllocator, PageSource};
use physmem::{PageOps, PhysMemManager, Region};

struct RealPageOps;

impl PageOps for RealPageOps {
    fn zero_pages(&mut self, addr: usize, pages: u32) {
        // SAFETY: the caller (physmem) only ever passes ranges it just
        // carved out of a region the platform described as usable RAM.
        unsafe {
            core::ptr::write_bytes(addr as *mut u8, 0, pages as usize * physmem::PAGE_SIZE);
        }
    }

    fn copy_pages(&mut self, dst: usize, src: usize, pages: u32) {
        // SAFETY: see above; `dst` and `src` are both allocator-owned
        // non-overlapping ranges during a realloc relocation.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src as *const u8,
                dst as *mut u8,
                pages as usize * physmem::PAGE_SIZE,
            );
        }
    }
}

static PMM: Mutex<Option<PhysMemManager<RealPageOps>>> = Mutex::new(None);

/// Describes physical memory to the allocator. Must be called exactly once,
/// before the first [`kmalloc`].
pub fn init_physical_memory(total_pages: u32, regions: &[Region]) {
    *PMM.lock() = Some(PhysMemManager::new(total_pages, regions, RealPageOps));
}

struct PmmPageSource;

impl PageSource for PmmPageSource {
    fn alloc_pages(&mut self, pages: u32) -> Option<usize> {
        PMM.lock().as_mut()?.alloc(pages).ok()
    }
}

lazy_static! {
    static ref KMEM: Mutex<KmemAllocator<PmmPageSource>> =
        Mutex::new(KmemAllocator::new(PmmPageSource));
}

/// Allocates a zeroed object of at least `size` bytes, or `None` if no
/// cache page could be grown. Kept as `Option` rather than `KResult`,
/// matching the original `kmalloc`'s null-on-failure contract at this one
/// lowest layer.
pub fn kmalloc(size: usize) -> Option<usize> {
    KMEM.lock().alloc(size).ok()
}

/// As [`kmalloc`], but the returned memory is uninitialized.
pub fn kmalloc_raw(size: usize) -> Option<usize> {
    KMEM.lock().alloc_raw(size).ok()
}

pub fn kfree(addr: usize) {
    KMEM.lock().free(addr);
}
