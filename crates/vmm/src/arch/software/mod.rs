//! Emulated machine for tests and the simulator.
//!
//! A scale model of a MIPS R3000-class machine:
//! - 32-bit physical and virtual addresses
//! - 4 KiB pages
//! - a 64-entry, software-refilled TLB (see [`SoftwareTlb`])
//! - a single interrupt-enable flag per hardware thread (see [`without_interrupts`])

mod interrupts;
mod memory;
mod tlb;

pub use interrupts::{interrupts_enabled, without_interrupts};
pub use memory::EmulatedMemory;
pub use tlb::SoftwareTlb;

pub const MAX_PHYSICAL_BITS: usize = 32;
pub const MAX_VIRTUAL_BITS: usize = 32;

pub const PAGE_SIZE: usize = 4096;

/// Number of slots in the emulated translation cache.
pub const TLB_SLOTS: usize = 64;

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// The R3000 has no holes in its 32-bit virtual address space.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr >> MAX_VIRTUAL_BITS == 0
}
