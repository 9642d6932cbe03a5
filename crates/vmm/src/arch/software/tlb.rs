//! Emulated, software-refilled translation lookaside buffer.

use crate::{TlbEntry, TranslationCache, VirtualAddress};

use super::{TLB_SLOTS, interrupts_enabled};

/// Seed used when a caller asks for the (degenerate) xorshift seed of zero.
const DEFAULT_SEED: u32 = 0x2545_F491;

/// A fully associative, 64-slot translation cache.
///
/// Like the R3000 TLB it is filled entirely by software: the fault handler writes entries
/// into explicit slots, or into a slot picked by the "random" register when every slot is
/// valid. [`probe`](Self::probe) is the lookup the MMU performs on every access.
pub struct SoftwareTlb {
    slots: [TlbEntry; TLB_SLOTS],
    random: u32,
}

impl SoftwareTlb {
    /// Creates an empty TLB with the default replacement seed.
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Creates an empty TLB whose random replacement sequence starts from `seed`.
    pub fn with_seed(seed: u32) -> Self {
        Self {
            slots: [TlbEntry::invalid(); TLB_SLOTS],
            random: if seed == 0 { DEFAULT_SEED } else { seed },
        }
    }

    /// Looks up the valid entry translating `page`, if any.
    pub fn probe(&self, page: VirtualAddress) -> Option<TlbEntry> {
        self.slots
            .iter()
            .copied()
            .find(|entry| entry.is_valid() && entry.page() == page)
    }

    /// Returns the number of valid entries.
    pub fn valid_entries(&self) -> usize {
        self.slots.iter().filter(|entry| entry.is_valid()).count()
    }

    /// Invalidates every slot, as a context switch does.
    pub fn flush(&mut self) {
        crate::tlb::invalidate_all(self);
    }

    fn next_random_slot(&mut self) -> usize {
        // xorshift32
        let mut x = self.random;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.random = x;
        x as usize % TLB_SLOTS
    }
}

impl Default for SoftwareTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationCache for SoftwareTlb {
    fn slot_count(&self) -> usize {
        TLB_SLOTS
    }

    fn read(&self, slot: usize) -> TlbEntry {
        self.slots[slot]
    }

    fn write(&mut self, slot: usize, entry: TlbEntry) {
        debug_assert!(
            !interrupts_enabled(),
            "TLB written with interrupts enabled"
        );
        self.slots[slot] = entry;
    }

    fn write_random(&mut self, entry: TlbEntry) -> usize {
        let slot = self.next_random_slot();
        self.write(slot, entry);
        slot
    }
}
