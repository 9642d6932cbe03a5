//! The global page table.
//!
//! One flat table of `(owner, page, frame)` triples is shared by every address space.
//! Entries are told apart only by their [`OwnerId`]; two owners may map the same virtual
//! page at the same time.
//!
//! The table holds two slots per physical frame. A page's *home* slot is derived from its
//! page number the same way a frame's index is derived from its frame number, and its
//! *mirror* slot sits `frame_count` entries later. Lookups and inserts try those two slots
//! first, then fall back to a linear scan of the whole table.

use alloc::{boxed::Box, vec};

use crate::{
    ArenaLayout, FrameArena, OwnerId, PageNumber, PhysicalAddress, VirtualAddress, VmError,
    arch::PAGE_SIZE,
};

/// A single page table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    owner: Option<OwnerId>,
    page: VirtualAddress,
    frame: PhysicalAddress,
}

impl PageTableEntry {
    /// An unused slot.
    pub const EMPTY: Self = Self {
        owner: None,
        page: VirtualAddress::new(0),
        frame: PhysicalAddress::new(0),
    };

    fn is_empty(&self) -> bool {
        self.owner.is_none()
    }

    fn matches(&self, owner: OwnerId, page: VirtualAddress) -> bool {
        self.owner == Some(owner) && self.page == page
    }
}

pub struct PageTable {
    entries: Box<[PageTableEntry]>,
    frame_count: usize,
    base: PageNumber,
    first_allocatable: PhysicalAddress,
    end: PhysicalAddress,
    len: usize,
}

impl PageTable {
    /// Creates an empty table sized for `layout`.
    pub fn new(layout: &ArenaLayout) -> Self {
        Self {
            entries: vec![PageTableEntry::EMPTY; layout.page_table_capacity()].into_boxed_slice(),
            frame_count: layout.frame_count(),
            base: PageNumber::new(layout.base().frame_number().as_usize()),
            first_allocatable: layout.first_allocatable(),
            end: layout.end(),
            len: 0,
        }
    }

    /// Returns the fixed number of slots.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Returns the number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the frame `owner` has mapped at `page`, if any.
    pub fn lookup(&self, owner: OwnerId, page: VirtualAddress) -> Option<PhysicalAddress> {
        let page = page.page_base();
        self.probe(page, |entry| entry.matches(owner, page))
            .map(|index| self.entries[index].frame)
    }

    /// Records that `owner` maps `page` to `frame`.
    ///
    /// The caller guarantees `(owner, page)` is not already mapped. Fails with
    /// [`VmError::InvalidPhysicalAccess`] when `frame` is not an allocatable frame, and with
    /// [`VmError::PageTableFull`] when every slot is taken. The table is unchanged on failure.
    pub fn insert(
        &mut self,
        owner: OwnerId,
        page: VirtualAddress,
        frame: PhysicalAddress,
    ) -> Result<(), VmError> {
        let page = page.page_base();
        if !frame.is_aligned(PAGE_SIZE) || frame < self.first_allocatable || frame >= self.end {
            log::error!(
                "refusing to map {} for {}: {} is not an allocatable frame",
                page,
                owner,
                frame
            );
            return Err(VmError::InvalidPhysicalAccess);
        }
        debug_assert!(
            self.lookup(owner, page).is_none(),
            "{} already maps {}",
            owner,
            page
        );

        let Some(index) = self.probe(page, PageTableEntry::is_empty) else {
            log::warn!("page table full: cannot map {} for {}", page, owner);
            return Err(VmError::PageTableFull);
        };
        self.entries[index] = PageTableEntry {
            owner: Some(owner),
            page,
            frame,
        };
        self.len += 1;
        Ok(())
    }

    /// Empties every slot belonging to `owner`, passing each evicted frame to `release`.
    ///
    /// Returns the number of entries removed. Other owners' entries are untouched.
    pub fn delete_all<F>(&mut self, owner: OwnerId, mut release: F) -> usize
    where
        F: FnMut(PhysicalAddress),
    {
        let mut removed = 0;
        for entry in self.entries.iter_mut() {
            if entry.owner == Some(owner) {
                release(entry.frame);
                *entry = PageTableEntry::EMPTY;
                removed += 1;
            }
        }
        self.len -= removed;
        removed
    }

    /// Gives `new` a private copy of every page `old` has mapped.
    ///
    /// Each copy gets a fresh frame holding the same bytes as the source frame. If a frame
    /// allocation or insert fails, everything already copied for `new` is removed and its
    /// frames are returned to `arena` before the error is reported.
    ///
    /// Returns the number of pages copied.
    pub fn duplicate(
        &mut self,
        old: OwnerId,
        new: OwnerId,
        arena: &mut FrameArena,
    ) -> Result<usize, VmError> {
        let mut copied = 0;
        for index in 0..self.entries.len() {
            let source = self.entries[index];
            if source.owner != Some(old) {
                continue;
            }
            if let Err(err) = self.copy_entry(source, new, arena) {
                let released = self.delete_all(new, |frame| release(arena, new, frame));
                log::warn!(
                    "copy of {} into {} failed after {} page(s): {}",
                    old,
                    new,
                    released,
                    err
                );
                return Err(err);
            }
            copied += 1;
        }
        Ok(copied)
    }

    /// Iterates over the `(page, frame)` pairs mapped by `owner`, in slot order.
    pub fn entries_for(
        &self,
        owner: OwnerId,
    ) -> impl Iterator<Item = (VirtualAddress, PhysicalAddress)> + '_ {
        self.entries
            .iter()
            .filter(move |entry| entry.owner == Some(owner))
            .map(|entry| (entry.page, entry.frame))
    }

    fn copy_entry(
        &mut self,
        source: PageTableEntry,
        new: OwnerId,
        arena: &mut FrameArena,
    ) -> Result<(), VmError> {
        let frame = arena.allocate(1)?;
        let copied = arena
            .copy_frame(source.frame, frame)
            .map_err(VmError::from)
            .and_then(|()| self.insert(new, source.page, frame));
        if copied.is_err() {
            release(arena, new, frame);
        }
        copied
    }

    fn home(&self, page: VirtualAddress) -> usize {
        page.page_number().wrapping_distance_from(self.base) % self.frame_count
    }

    /// Returns the first slot satisfying `predicate`: home, then mirror, then a full scan.
    fn probe<P>(&self, page: VirtualAddress, predicate: P) -> Option<usize>
    where
        P: Fn(&PageTableEntry) -> bool,
    {
        let home = self.home(page);
        [home, home + self.frame_count]
            .into_iter()
            .find(|&index| predicate(&self.entries[index]))
            .or_else(|| self.entries.iter().position(&predicate))
    }
}

/// Returns a frame that was mapped for `owner` to `arena`.
pub(crate) fn release(arena: &mut FrameArena, owner: OwnerId, frame: PhysicalAddress) {
    if let Err(err) = arena.free(frame) {
        log::error!("{} mapped unallocated frame {}: {}", owner, frame, err);
    }
}
