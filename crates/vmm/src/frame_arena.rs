//! Boot-time frame arena.
//!
//! At boot the usable physical range `[first_free, last)` is partitioned once: the front of
//! the range is set aside for the frame table and the global page table, and every frame
//! after that is put on a free list. Allocation and release of single frames are O(1).

use alloc::boxed::Box;
use core::{fmt, mem, ptr};

use crate::{
    AddressTranslator, FrameState, PhysicalAddress,
    arch::PAGE_SIZE,
    frame::Frame,
    page_table::PageTableEntry,
};

/// Errors that can occur during frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No run of free frames large enough is available.
    OutOfMemory,
    /// Zero frames were requested.
    ZeroSized,
    /// Attempted to free an address that is not the start of a live allocation.
    InvalidDeallocation,
    /// A byte access fell outside the allocatable frames.
    OutOfRange,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of physical frames"),
            Self::ZeroSized => f.write_str("zero-sized frame allocation"),
            Self::InvalidDeallocation => f.write_str("invalid frame deallocation"),
            Self::OutOfRange => f.write_str("physical access outside the frame arena"),
        }
    }
}

impl core::error::Error for AllocError {}

/// How the usable physical range is split between metadata and allocatable frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLayout {
    base: PhysicalAddress,
    end: PhysicalAddress,
    frame_count: usize,
    frame_table_size: usize,
    page_table_size: usize,
    first_allocatable: PhysicalAddress,
}

impl ArenaLayout {
    /// Computes the layout for the usable range `[first_free, last)`.
    ///
    /// The frame table gets one entry per frame and the page table two entries per frame,
    /// each rounded up to whole pages.
    ///
    /// # Panics
    ///
    /// Panics if either bound is not page-aligned, or if the metadata would leave no
    /// allocatable frame. Neither is recoverable this early in boot.
    pub fn compute(first_free: PhysicalAddress, last: PhysicalAddress) -> Self {
        assert!(
            first_free.is_aligned(PAGE_SIZE) && last.is_aligned(PAGE_SIZE),
            "usable memory bounds must be page-aligned"
        );

        let frame_count = last.as_usize().saturating_sub(first_free.as_usize()) / PAGE_SIZE;
        let frame_table_size = (frame_count * mem::size_of::<Frame>()).next_multiple_of(PAGE_SIZE);
        let page_table_size =
            (2 * frame_count * mem::size_of::<PageTableEntry>()).next_multiple_of(PAGE_SIZE);

        let first_allocatable = first_free.as_usize() + frame_table_size + page_table_size;
        if first_allocatable >= last.as_usize() {
            panic!(
                "vm: frame metadata consumes all physical memory ({} frames in {}..{})",
                frame_count, first_free, last
            );
        }

        Self {
            base: first_free,
            end: last,
            frame_count,
            frame_table_size,
            page_table_size,
            first_allocatable: PhysicalAddress::new(first_allocatable),
        }
    }

    /// Returns the first usable physical address; the frame table starts here.
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the end (exclusive) of the usable range.
    pub const fn end(&self) -> PhysicalAddress {
        self.end
    }

    /// Returns the total number of frames in the usable range, metadata included.
    pub const fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Returns the page-rounded size of the frame table in bytes.
    pub const fn frame_table_size(&self) -> usize {
        self.frame_table_size
    }

    /// Returns the page-rounded size of the page table in bytes.
    pub const fn page_table_size(&self) -> usize {
        self.page_table_size
    }

    /// Returns the page table's fixed capacity: two entries per frame.
    pub const fn page_table_capacity(&self) -> usize {
        2 * self.frame_count
    }

    /// Returns the physical address where the page table starts.
    pub fn page_table_base(&self) -> PhysicalAddress {
        self.base + self.frame_table_size
    }

    /// Returns the first frame that may be handed out.
    pub const fn first_allocatable(&self) -> PhysicalAddress {
        self.first_allocatable
    }

    /// Returns the number of frames occupied by metadata.
    pub const fn metadata_frames(&self) -> usize {
        (self.frame_table_size + self.page_table_size) / PAGE_SIZE
    }
}

/// The physical frame allocator.
///
/// Frame `i` of the table describes the frame at `base + i * PAGE_SIZE`. The first
/// [`ArenaLayout::metadata_frames`] frames are reserved. The free list is terminated: once
/// every frame is handed out, allocation fails with [`AllocError::OutOfMemory`].
pub struct FrameArena {
    layout: ArenaLayout,
    translator: AddressTranslator,
    frames: Box<[Frame]>,
    head: Option<usize>,
    free: usize,
}

impl FrameArena {
    /// Builds the arena and its free list, in ascending address order.
    pub fn new(layout: ArenaLayout, translator: AddressTranslator) -> Self {
        let reserved = layout.metadata_frames();
        let count = layout.frame_count();

        let frames: Box<[Frame]> = (0..count)
            .map(|index| {
                if index < reserved {
                    Frame::reserved()
                } else {
                    let prev = (index > reserved).then(|| index - 1);
                    let next = (index + 1 < count).then(|| index + 1);
                    Frame::free(prev, next)
                }
            })
            .collect();

        log::debug!(
            "frame arena: {} frames at {}, {} reserved for metadata, first allocatable {}",
            count,
            layout.base(),
            reserved,
            layout.first_allocatable()
        );

        Self {
            layout,
            translator,
            frames,
            head: (reserved < count).then_some(reserved),
            free: count - reserved,
        }
    }

    /// Returns the layout this arena was built from.
    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    /// Allocates `pages` physically-contiguous, zero-filled frames.
    ///
    /// Single frames come straight off the head of the free list. Larger requests take the
    /// first run of `pages` free frames in address order.
    pub fn allocate(&mut self, pages: usize) -> Result<PhysicalAddress, AllocError> {
        if pages == 0 {
            return Err(AllocError::ZeroSized);
        }

        let start = if pages == 1 {
            self.head
        } else {
            self.find_run(pages)
        };
        let Some(start) = start else {
            log::warn!(
                "frame arena exhausted: {} frame(s) requested, {} free",
                pages,
                self.free
            );
            return Err(AllocError::OutOfMemory);
        };

        for index in start..start + pages {
            self.unlink(index);
            self.frames[index].state = FrameState::Tail;
        }
        self.frames[start].state = FrameState::Head { pages };
        self.free -= pages;

        let address = self.address_of(start);
        // SAFETY: the run lies inside the arena and was just taken off the free list.
        unsafe {
            ptr::write_bytes(
                self.translator.phys_to_ptr::<u8>(address),
                0,
                pages * PAGE_SIZE,
            );
        }
        Ok(address)
    }

    /// Returns an allocation made by [`allocate`](Self::allocate) to the free list.
    pub fn free(&mut self, address: PhysicalAddress) -> Result<(), AllocError> {
        let head = self
            .index_of(address)
            .map(|index| (index, self.frames[index].state));
        let Some((start, FrameState::Head { pages })) = head else {
            log::error!("attempted to free {}, which is not an allocation", address);
            return Err(AllocError::InvalidDeallocation);
        };

        // Push in reverse so the run comes back off the list lowest address first.
        for index in (start..start + pages).rev() {
            self.push(index);
        }
        self.free += pages;
        Ok(())
    }

    /// Returns the state of the frame containing `address`, if it belongs to the arena.
    pub fn state(&self, address: PhysicalAddress) -> Option<FrameState> {
        let index = self.index_of(address.align_down(PAGE_SIZE))?;
        Some(self.frames[index].state)
    }

    /// Copies bytes starting at `address` into `buf`.
    pub fn read(&self, address: PhysicalAddress, buf: &mut [u8]) -> Result<(), AllocError> {
        self.check_range(address, buf.len())?;
        // SAFETY: the range was checked to lie within allocatable frames.
        unsafe {
            ptr::copy_nonoverlapping(
                self.translator.phys_to_ptr::<u8>(address),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copies `data` into physical memory starting at `address`.
    pub fn write(&mut self, address: PhysicalAddress, data: &[u8]) -> Result<(), AllocError> {
        self.check_range(address, data.len())?;
        // SAFETY: the range was checked to lie within allocatable frames.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.translator.phys_to_ptr::<u8>(address),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copies one whole frame from `src` to `dst`.
    pub fn copy_frame(
        &mut self,
        src: PhysicalAddress,
        dst: PhysicalAddress,
    ) -> Result<(), AllocError> {
        if !src.is_aligned(PAGE_SIZE) || !dst.is_aligned(PAGE_SIZE) || src == dst {
            return Err(AllocError::OutOfRange);
        }
        self.check_range(src, PAGE_SIZE)?;
        self.check_range(dst, PAGE_SIZE)?;
        // SAFETY: both frames are in range, page-aligned and distinct, so they cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(
                self.translator.phys_to_ptr::<u8>(src),
                self.translator.phys_to_ptr::<u8>(dst),
                PAGE_SIZE,
            );
        }
        Ok(())
    }

    /// Returns the total number of frames, metadata included.
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of frames reserved for metadata.
    pub fn reserved_frames(&self) -> usize {
        self.layout.metadata_frames()
    }

    /// Returns the number of frames on the free list.
    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// Returns the number of frames currently handed out.
    pub fn allocated_frames(&self) -> usize {
        self.total_frames() - self.reserved_frames() - self.free
    }

    fn address_of(&self, index: usize) -> PhysicalAddress {
        self.layout.base() + index * PAGE_SIZE
    }

    fn index_of(&self, address: PhysicalAddress) -> Option<usize> {
        if !address.is_aligned(PAGE_SIZE)
            || address < self.layout.base()
            || address >= self.layout.end()
        {
            return None;
        }
        Some((address - self.layout.base()) / PAGE_SIZE)
    }

    fn check_range(&self, address: PhysicalAddress, len: usize) -> Result<(), AllocError> {
        let end = address.as_usize().checked_add(len).ok_or(AllocError::OutOfRange)?;
        if address < self.layout.first_allocatable() || end > self.layout.end().as_usize() {
            return Err(AllocError::OutOfRange);
        }
        Ok(())
    }

    fn find_run(&self, pages: usize) -> Option<usize> {
        let mut run = 0;
        for (index, frame) in self.frames.iter().enumerate() {
            if frame.is_free() {
                run += 1;
                if run == pages {
                    return Some(index + 1 - pages);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn unlink(&mut self, index: usize) {
        let Frame { prev, next, .. } = self.frames[index];
        match prev {
            Some(prev) => self.frames[prev].next = next,
            None => self.head = next,
        }
        if let Some(next) = next {
            self.frames[next].prev = prev;
        }
        self.frames[index].prev = None;
        self.frames[index].next = None;
    }

    fn push(&mut self, index: usize) {
        self.frames[index] = Frame::free(None, self.head);
        if let Some(head) = self.head {
            self.frames[head].prev = Some(index);
        }
        self.head = Some(index);
    }
}
