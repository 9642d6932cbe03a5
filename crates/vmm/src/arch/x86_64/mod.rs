//! x86_64 architecture-specific implementation.
//!
//! x86_64 refills its TLB from hardware page tables, so the translation cache itself is
//! supplied by the embedding kernel through [`crate::TranslationCache`]. This module only
//! provides the address widths and the interrupt masking used around cache updates.

pub const MAX_PHYSICAL_BITS: usize = 48;

/// 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

pub const PAGE_SIZE: usize = 4096;

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// Accepts canonical addresses: bits 48..64 copy bit 47.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let high = addr >> (MAX_VIRTUAL_BITS - 1);
    high == 0 || high == usize::MAX >> (MAX_VIRTUAL_BITS - 1)
}

/// Runs `f` with interrupts disabled on the executing core, restoring the previous state.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    ::x86_64::instructions::interrupts::without_interrupts(f)
}

/// Returns whether interrupts are enabled on the executing core.
#[inline]
pub fn interrupts_enabled() -> bool {
    ::x86_64::instructions::interrupts::are_enabled()
}
