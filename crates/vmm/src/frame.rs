/// Allocation state of a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Frame holds arena metadata (frame table or page table) and is never handed out.
    Reserved,
    /// Frame is on the free list.
    Free,
    /// First frame of an allocation spanning `pages` contiguous frames.
    Head { pages: usize },
    /// A non-first frame of a multi-frame allocation.
    Tail,
}

/// Holds metadata for a physical memory frame.
///
/// Free frames are threaded onto a doubly-linked free list through `prev`/`next`, which are
/// indices into the arena's frame table. Links are only meaningful while the frame is
/// [`FrameState::Free`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub(crate) state: FrameState,
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
}

impl Frame {
    /// Metadata for a frame backing the arena's own tables.
    pub(crate) const fn reserved() -> Self {
        Self {
            state: FrameState::Reserved,
            prev: None,
            next: None,
        }
    }

    /// Metadata for a free frame linked between `prev` and `next`.
    pub(crate) const fn free(prev: Option<usize>, next: Option<usize>) -> Self {
        Self {
            state: FrameState::Free,
            prev,
            next,
        }
    }

    pub(crate) fn is_free(&self) -> bool {
        self.state == FrameState::Free
    }
}
