//! Translation cache (TLB) programming.
//!
//! The cache itself is hardware, reached through [`TranslationCache`]. Every update made
//! here happens with interrupts disabled on the executing core. Other cores are never
//! touched: cross-core shootdown is not supported and panics.

use bitflags::bitflags;

use crate::{PhysicalAddress, VirtualAddress, arch};

bitflags! {
    /// Flags carried in the low word of a TLB entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TlbFlags: u8 {
        /// The entry translates its page.
        const VALID = 1 << 0;
        /// Stores through the entry are allowed.
        const DIRTY = 1 << 1;
    }
}

/// A single translation: virtual page to physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    page: VirtualAddress,
    frame: PhysicalAddress,
    flags: TlbFlags,
}

impl TlbEntry {
    /// Creates an entry mapping `page` to `frame`.
    pub const fn new(page: VirtualAddress, frame: PhysicalAddress, flags: TlbFlags) -> Self {
        Self { page, frame, flags }
    }

    /// An entry that translates nothing.
    pub const fn invalid() -> Self {
        Self::new(
            VirtualAddress::new(0),
            PhysicalAddress::new(0),
            TlbFlags::empty(),
        )
    }

    pub const fn page(&self) -> VirtualAddress {
        self.page
    }

    pub const fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    pub const fn flags(&self) -> TlbFlags {
        self.flags
    }

    pub const fn is_valid(&self) -> bool {
        self.flags.contains(TlbFlags::VALID)
    }

    pub const fn is_dirty(&self) -> bool {
        self.flags.contains(TlbFlags::DIRTY)
    }
}

/// A software-visible translation cache with a fixed number of slots.
///
/// Implementations are per-core. Callers serialize access by disabling interrupts, so
/// implementations need no locking of their own.
pub trait TranslationCache {
    /// Returns the number of slots.
    fn slot_count(&self) -> usize;

    /// Reads the entry in `slot`.
    fn read(&self, slot: usize) -> TlbEntry;

    /// Writes `entry` into `slot`.
    fn write(&mut self, slot: usize, entry: TlbEntry);

    /// Writes `entry` into a slot chosen by the hardware, returning the slot used.
    fn write_random(&mut self, entry: TlbEntry) -> usize;
}

/// Installs `entry`, preferring an invalid slot and evicting a random one otherwise.
///
/// Returns the slot that now holds the entry.
pub(crate) fn install<C>(cache: &mut C, entry: TlbEntry) -> usize
where
    C: TranslationCache + ?Sized,
{
    arch::without_interrupts(|| {
        let free = (0..cache.slot_count()).find(|&slot| !cache.read(slot).is_valid());
        match free {
            Some(slot) => {
                cache.write(slot, entry);
                slot
            }
            None => cache.write_random(entry),
        }
    })
}

/// Invalidates every slot.
pub(crate) fn invalidate_all<C>(cache: &mut C)
where
    C: TranslationCache + ?Sized,
{
    arch::without_interrupts(|| {
        for slot in 0..cache.slot_count() {
            cache.write(slot, TlbEntry::invalid());
        }
    })
}

/// Requests that every core flush its whole TLB.
///
/// # Panics
///
/// Always. Polaris runs this subsystem on a single core.
pub fn tlb_shootdown_all() -> ! {
    panic!("vm: tlb shootdown requested, but multi-core shootdown is not supported");
}

/// Requests that every core drop its translation of `page`.
///
/// # Panics
///
/// Always. Polaris runs this subsystem on a single core.
pub fn tlb_shootdown(page: VirtualAddress) -> ! {
    panic!(
        "vm: tlb shootdown requested for {}, but multi-core shootdown is not supported",
        page
    );
}
