//! Emulated physical memory.

use alloc::{boxed::Box, vec};
use core::ptr::{self, NonNull};

/// Emulated memory for software simulation.
///
/// This provides a simulated physical memory space, starting at physical address zero,
/// so frame contents can be zeroed and copied without real hardware.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: The buffer is uniquely owned by this value. Callers that share it between threads
// (the frame arena) serialize all access behind a lock.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new zero-filled emulated memory region of the specified size.
    pub fn new(size: usize) -> Self {
        let memory: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        let base = NonNull::from(Box::leak(memory)).cast::<u8>();
        Self { base, size }
    }

    /// Translates a physical address to a pointer into the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the address lies outside the emulated memory.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        // SAFETY: `phys` was just checked to be within the allocation.
        unsafe { self.base.as_ptr().add(phys) }
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: `base` and `size` describe the boxed slice leaked in `new`.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.base.as_ptr(),
                self.size,
            )));
        }
    }
}
