//! The virtual memory manager.
//!
//! [`VirtualMemory`] ties the frame arena and the global page table together and exposes
//! the address-space lifecycle and the page-fault handler to the rest of the kernel.

use core::{
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering},
};
use spin::Mutex;

use crate::{
    AddressSpace, AddressTranslator, ArenaLayout, FaultKind, FrameArena, OwnerId, PageTable,
    Permissions, PhysicalAddress, TlbEntry, TlbFlags, TranslationCache, VirtualAddress, VmError,
    page_table, tlb,
};

/// A snapshot of memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub total_frames: usize,
    pub reserved_frames: usize,
    pub free_frames: usize,
    pub allocated_frames: usize,
    pub page_table_capacity: usize,
    pub page_table_entries: usize,
}

/// The virtual memory manager.
///
/// One instance exists per machine and is shared by every thread. The page table and the
/// frame arena each sit behind their own lock; when both are needed the page table lock is
/// taken first.
pub struct VirtualMemory {
    pages: Mutex<PageTable>,
    frames: Mutex<FrameArena>,
    next_owner: AtomicU64,
}

impl VirtualMemory {
    /// Partitions the usable physical range `[first_free, last)` and builds empty tables.
    ///
    /// # Panics
    ///
    /// Panics if the range is not page-aligned or too small to hold its own metadata.
    pub fn bootstrap(
        first_free: PhysicalAddress,
        last: PhysicalAddress,
        translator: AddressTranslator,
    ) -> Self {
        let layout = ArenaLayout::compute(first_free, last);
        log::debug!(
            "vm: bootstrap {}..{}: {} frames, page table capacity {}",
            first_free,
            last,
            layout.frame_count(),
            layout.page_table_capacity()
        );

        Self {
            pages: Mutex::new(PageTable::new(&layout)),
            frames: Mutex::new(FrameArena::new(layout, translator)),
            next_owner: AtomicU64::new(0),
        }
    }

    /// Returns the boot-time memory layout.
    pub fn layout(&self) -> ArenaLayout {
        *self.frames.lock().layout()
    }

    /// Creates an empty address space with a fresh owner id.
    pub fn create_address_space(&self) -> AddressSpace {
        let space = AddressSpace::new(self.issue_owner());
        log::debug!("vm: created {}", space.owner());
        space
    }

    /// Creates a copy of `old`: the same regions, and a private copy of every resident page.
    ///
    /// On failure nothing of the copy remains: its page table entries are removed and its
    /// frames returned.
    pub fn copy_address_space(&self, old: &AddressSpace) -> Result<AddressSpace, VmError> {
        let new = old.duplicate(self.issue_owner())?;

        let mut pages = self.pages.lock();
        let mut frames = self.frames.lock();
        let copied = pages.duplicate(old.owner(), new.owner(), &mut frames)?;

        log::debug!(
            "vm: copied {} into {} ({} region(s), {} page(s))",
            old.owner(),
            new.owner(),
            new.regions().len(),
            copied
        );
        Ok(new)
    }

    /// Tears down `space`, returning every frame it had mapped to the arena.
    ///
    /// Returns the number of pages released.
    pub fn destroy_address_space(&self, space: AddressSpace) -> usize {
        let mut pages = self.pages.lock();
        let mut frames = self.frames.lock();
        let released = pages.delete_all(space.owner(), |frame| {
            page_table::release(&mut frames, space.owner(), frame)
        });

        log::debug!("vm: destroyed {}, released {} page(s)", space.owner(), released);
        released
    }

    /// Makes `space` current on this core by flushing the TLB.
    pub fn activate<C>(&self, space: &AddressSpace, tlb: &mut C)
    where
        C: TranslationCache + ?Sized,
    {
        log::trace!("vm: activate {}", space.owner());
        tlb::invalidate_all(tlb);
    }

    /// Called when `space` stops being current. Nothing needs to happen.
    pub fn deactivate(&self, _space: &AddressSpace) {}

    /// Resolves a TLB miss at `address` for `space` and installs the translation.
    ///
    /// The first touch of a page allocates a zero-filled frame for it; later faults on the
    /// same page reuse that frame. The installed entry is dirty (writable) when the region
    /// or stack covering `address` allows writes.
    ///
    /// Errors terminate the faulting process: [`VmError::ReadOnlyViolation`],
    /// [`VmError::NoAddressSpace`], [`VmError::SegmentationFault`], or resource exhaustion.
    pub fn handle_fault<C>(
        &self,
        space: Option<&AddressSpace>,
        kind: FaultKind,
        address: VirtualAddress,
        tlb: &mut C,
    ) -> Result<TlbEntry, VmError>
    where
        C: TranslationCache + ?Sized,
    {
        if kind == FaultKind::ReadOnly {
            return Err(VmError::ReadOnlyViolation);
        }
        let space = space.ok_or(VmError::NoAddressSpace)?;

        let page = address.page_base();
        let Some(permissions) = space.permissions_at(page) else {
            log::trace!("vm: {} {:?} fault at {} is unmapped", space.owner(), kind, address);
            return Err(VmError::SegmentationFault(address));
        };

        let frame = {
            let mut pages = self.pages.lock();
            match pages.lookup(space.owner(), page) {
                Some(frame) => frame,
                None => {
                    let frame = self.frames.lock().allocate(1)?;
                    if let Err(err) = pages.insert(space.owner(), page, frame) {
                        page_table::release(&mut self.frames.lock(), space.owner(), frame);
                        return Err(err);
                    }
                    log::trace!("vm: {} demand-mapped {} -> {}", space.owner(), page, frame);
                    frame
                }
            }
        };

        let mut flags = TlbFlags::VALID;
        if permissions.contains(Permissions::WRITE) {
            flags |= TlbFlags::DIRTY;
        }
        let entry = TlbEntry::new(page, frame, flags);
        let slot = tlb::install(tlb, entry);
        log::trace!(
            "vm: {} {:?} fault at {}: slot {} <- {} {}",
            space.owner(),
            kind,
            address,
            slot,
            frame,
            permissions
        );
        Ok(entry)
    }

    /// Returns the physical address `address` maps to in `space`, if its page is resident.
    pub fn translate(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        self.pages
            .lock()
            .lookup(space.owner(), address)
            .map(|frame| frame + address.page_offset())
    }

    /// Returns the number of pages `space` has resident.
    pub fn resident_pages(&self, space: &AddressSpace) -> usize {
        self.pages.lock().entries_for(space.owner()).count()
    }

    /// Allocates `pages` contiguous zero-filled frames for kernel use.
    pub fn allocate_pages(&self, pages: usize) -> Result<PhysicalAddress, VmError> {
        Ok(self.frames.lock().allocate(pages)?)
    }

    /// Returns frames obtained from [`allocate_pages`](Self::allocate_pages).
    pub fn free_pages(&self, address: PhysicalAddress) -> Result<(), VmError> {
        Ok(self.frames.lock().free(address)?)
    }

    /// Copies bytes out of allocatable frames starting at `address`.
    ///
    /// Fails with [`VmError::InvalidPhysicalAccess`] if the range leaves the allocatable frames.
    pub fn read_physical(&self, address: PhysicalAddress, buf: &mut [u8]) -> Result<(), VmError> {
        Ok(self.frames.lock().read(address, buf)?)
    }

    /// Copies `data` into allocatable frames starting at `address`.
    pub fn write_physical(&self, address: PhysicalAddress, data: &[u8]) -> Result<(), VmError> {
        Ok(self.frames.lock().write(address, data)?)
    }

    /// Returns current frame and page-table usage, read under both locks.
    pub fn stats(&self) -> VmStats {
        let pages = self.pages.lock();
        let frames = self.frames.lock();
        VmStats {
            total_frames: frames.total_frames(),
            reserved_frames: frames.reserved_frames(),
            free_frames: frames.free_frames(),
            allocated_frames: frames.allocated_frames(),
            page_table_capacity: pages.capacity(),
            page_table_entries: pages.len(),
        }
    }

    fn issue_owner(&self) -> OwnerId {
        let issued = self.next_owner.fetch_add(1, Ordering::Relaxed);
        OwnerId::new(NonZeroU64::MIN.saturating_add(issued))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        PAGE_SIZE, STACK_PAGES, SoftwareTlb, TLB_SLOTS, USER_STACK_TOP, interrupts_enabled,
    };
    use std::{sync::Arc, thread};

    const FIRST_FREE: usize = 0x2_0000;

    fn vm(frames: usize) -> VirtualMemory {
        let last = FIRST_FREE + frames * PAGE_SIZE;
        VirtualMemory::bootstrap(
            PhysicalAddress::new(FIRST_FREE),
            PhysicalAddress::new(last),
            AddressTranslator::emulated(last),
        )
    }

    fn rw() -> Permissions {
        Permissions::READ | Permissions::WRITE
    }

    fn loaded(vm: &VirtualMemory) -> AddressSpace {
        let mut space = vm.create_address_space();
        space
            .define_region(VirtualAddress::new(0x40_0000), 2 * PAGE_SIZE, Permissions::READ | Permissions::EXECUTE)
            .unwrap();
        space
            .define_region(VirtualAddress::new(0x50_0000), 4 * PAGE_SIZE, rw())
            .unwrap();
        space.define_stack();
        space
    }

    #[test]
    fn owner_ids_are_unique_and_increasing() {
        let vm = vm(32);
        let a = vm.create_address_space();
        let b = vm.create_address_space();
        assert!(a.owner() < b.owner());
        vm.destroy_address_space(a);
        let c = vm.create_address_space();
        assert!(b.owner() < c.owner());
    }

    #[test]
    fn first_fault_maps_zeroed_dirty_frame() {
        let vm = vm(64);
        let space = loaded(&vm);
        let mut tlb = SoftwareTlb::new();
        let address = VirtualAddress::new(0x50_0010);
        let before = vm.stats().allocated_frames;

        let entry = vm
            .handle_fault(Some(&space), FaultKind::Write, address, &mut tlb)
            .unwrap();

        assert_eq!(entry.page(), VirtualAddress::new(0x50_0000));
        assert!(entry.is_valid() && entry.is_dirty());
        assert_eq!(tlb.valid_entries(), 1);
        assert_eq!(tlb.probe(entry.page()), Some(entry));
        assert_eq!(vm.stats().allocated_frames, before + 1);
        assert!(interrupts_enabled());

        let mut buf = [0xFFu8; PAGE_SIZE];
        vm.read_physical(entry.frame(), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn later_fault_reuses_frame() {
        let vm = vm(64);
        let space = loaded(&vm);
        let mut tlb = SoftwareTlb::new();
        let address = VirtualAddress::new(0x50_1000);

        let first = vm
            .handle_fault(Some(&space), FaultKind::Write, address, &mut tlb)
            .unwrap();
        vm.write_physical(first.frame(), b"kept").unwrap();

        // Evict, as a context switch would.
        vm.activate(&space, &mut tlb);
        assert_eq!(tlb.valid_entries(), 0);

        let allocated = vm.stats().allocated_frames;
        let second = vm
            .handle_fault(Some(&space), FaultKind::Read, address + 4, &mut tlb)
            .unwrap();
        assert_eq!(second.frame(), first.frame());
        assert_eq!(vm.stats().allocated_frames, allocated);

        let mut buf = [0u8; 4];
        vm.read_physical(second.frame(), &mut buf).unwrap();
        assert_eq!(&buf, b"kept");
    }

    #[test]
    fn read_only_region_is_mapped_clean() {
        let vm = vm(64);
        let space = loaded(&vm);
        let mut tlb = SoftwareTlb::new();
        let entry = vm
            .handle_fault(Some(&space), FaultKind::Read, VirtualAddress::new(0x40_0000), &mut tlb)
            .unwrap();
        assert!(!entry.is_dirty());
    }

    #[test]
    fn stack_faults_are_writable() {
        let vm = vm(64);
        let space = loaded(&vm);
        let mut tlb = SoftwareTlb::new();
        let bottom = VirtualAddress::new(USER_STACK_TOP - STACK_PAGES * PAGE_SIZE);

        for address in [VirtualAddress::new(USER_STACK_TOP - 4), bottom] {
            let entry = vm
                .handle_fault(Some(&space), FaultKind::Write, address, &mut tlb)
                .unwrap();
            assert!(entry.is_dirty());
        }
        assert_eq!(vm.resident_pages(&space), 2);

        assert_eq!(
            vm.handle_fault(Some(&space), FaultKind::Write, bottom - 1, &mut tlb),
            Err(VmError::SegmentationFault(bottom - 1))
        );
    }

    #[test]
    fn gap_fault_leaves_tables_untouched() {
        let vm = vm(64);
        let space = loaded(&vm);
        let mut tlb = SoftwareTlb::new();
        let before = vm.stats();
        let gap = VirtualAddress::new(0x1000_0000);

        assert_eq!(
            vm.handle_fault(Some(&space), FaultKind::Read, gap, &mut tlb),
            Err(VmError::SegmentationFault(gap))
        );
        assert_eq!(vm.stats(), before);
        assert_eq!(tlb.valid_entries(), 0);
    }

    #[test]
    fn read_only_violation_and_missing_space_are_rejected() {
        let vm = vm(32);
        let space = loaded(&vm);
        let mut tlb = SoftwareTlb::new();
        let address = VirtualAddress::new(0x50_0000);

        assert_eq!(
            vm.handle_fault(Some(&space), FaultKind::ReadOnly, address, &mut tlb),
            Err(VmError::ReadOnlyViolation)
        );
        assert_eq!(
            vm.handle_fault(None, FaultKind::Read, address, &mut tlb),
            Err(VmError::NoAddressSpace)
        );
        assert_eq!(vm.resident_pages(&space), 0);
    }

    #[test]
    fn fault_reports_exhaustion() {
        let vm = vm(8);
        let space = loaded(&vm);
        let mut tlb = SoftwareTlb::new();
        let free = vm.stats().free_frames;
        vm.allocate_pages(free).unwrap();

        assert_eq!(
            vm.handle_fault(Some(&space), FaultKind::Write, VirtualAddress::new(0x50_0000), &mut tlb),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(vm.resident_pages(&space), 0);
    }

    #[test]
    fn tlb_refills_when_full() {
        let vm = vm(128);
        let mut space = vm.create_address_space();
        space
            .define_region(VirtualAddress::new(0x10_0000), (TLB_SLOTS + 8) * PAGE_SIZE, rw())
            .unwrap();
        let mut tlb = SoftwareTlb::with_seed(7);

        for page in 0..TLB_SLOTS + 8 {
            let address = VirtualAddress::new(0x10_0000 + page * PAGE_SIZE);
            let entry = vm
                .handle_fault(Some(&space), FaultKind::Read, address, &mut tlb)
                .unwrap();
            assert_eq!(tlb.probe(address), Some(entry));
        }
        assert_eq!(tlb.valid_entries(), TLB_SLOTS);
    }

    #[test]
    fn copy_has_private_frames() {
        let vm = vm(64);
        let parent = loaded(&vm);
        let mut tlb = SoftwareTlb::new();
        let address = VirtualAddress::new(0x50_0100);
        let entry = vm
            .handle_fault(Some(&parent), FaultKind::Write, address, &mut tlb)
            .unwrap();
        vm.write_physical(entry.frame() + 0x100, b"fork").unwrap();

        let child = vm.copy_address_space(&parent).unwrap();
        assert_ne!(child.owner(), parent.owner());
        assert_eq!(child.regions(), parent.regions());
        assert_eq!(vm.resident_pages(&child), 1);

        let copy = vm.translate(&child, address).unwrap();
        assert_ne!(copy, vm.translate(&parent, address).unwrap());
        let mut buf = [0u8; 4];
        vm.read_physical(copy, &mut buf).unwrap();
        assert_eq!(&buf, b"fork");

        vm.write_physical(entry.frame() + 0x100, b"edit").unwrap();
        vm.read_physical(copy, &mut buf).unwrap();
        assert_eq!(&buf, b"fork");
    }

    #[test]
    fn copy_of_space_without_regions_still_copies_pages() {
        let vm = vm(32);
        let mut space = vm.create_address_space();
        let mut tlb = SoftwareTlb::new();
        space.define_stack();
        vm.handle_fault(Some(&space), FaultKind::Write, VirtualAddress::new(USER_STACK_TOP - 1), &mut tlb)
            .unwrap();

        let child = vm.copy_address_space(&space).unwrap();
        assert!(child.regions().is_empty());
        assert_eq!(vm.resident_pages(&child), 1);
    }

    #[test]
    fn destroy_returns_frames() {
        let vm = vm(64);
        let space = loaded(&vm);
        let mut tlb = SoftwareTlb::new();
        let baseline = vm.stats();
        for offset in 0..4 {
            let address = VirtualAddress::new(0x50_0000 + offset * PAGE_SIZE);
            vm.handle_fault(Some(&space), FaultKind::Write, address, &mut tlb)
                .unwrap();
        }
        assert_eq!(vm.stats().allocated_frames, baseline.allocated_frames + 4);

        assert_eq!(vm.destroy_address_space(space), 4);
        assert_eq!(vm.stats(), baseline);
    }

    #[test]
    fn kernel_pages_round_trip() {
        let vm = vm(32);
        let before = vm.stats().free_frames;
        let run = vm.allocate_pages(3).unwrap();
        assert_eq!(vm.stats().free_frames, before - 3);
        vm.free_pages(run).unwrap();
        assert_eq!(vm.stats().free_frames, before);
        assert_eq!(vm.free_pages(run), Err(VmError::InvalidPhysicalAccess));
    }

    #[test]
    fn concurrent_faults_on_shared_manager() {
        let vm = Arc::new(vm(256));
        let workers: Vec<_> = (0..4u8)
            .map(|worker| {
                let vm = Arc::clone(&vm);
                thread::spawn(move || {
                    let mut space = vm.create_address_space();
                    space
                        .define_region(VirtualAddress::new(0x10_0000), 16 * PAGE_SIZE, rw())
                        .unwrap();
                    let mut tlb = SoftwareTlb::with_seed(u32::from(worker) + 1);

                    for page in 0..16 {
                        let address = VirtualAddress::new(0x10_0000 + page * PAGE_SIZE);
                        let entry = vm
                            .handle_fault(Some(&space), FaultKind::Write, address, &mut tlb)
                            .unwrap();
                        vm.write_physical(entry.frame(), &[worker]).unwrap();
                    }
                    for page in 0..16 {
                        let address = VirtualAddress::new(0x10_0000 + page * PAGE_SIZE);
                        let mut byte = [0u8];
                        vm.read_physical(vm.translate(&space, address).unwrap(), &mut byte)
                            .unwrap();
                        assert_eq!(byte[0], worker);
                    }
                    vm.destroy_address_space(space)
                })
            })
            .collect();

        for worker in workers {
            assert_eq!(worker.join().unwrap(), 16);
        }
        let stats = vm.stats();
        assert_eq!(stats.allocated_frames, 0);
        assert_eq!(stats.page_table_entries, 0);
    }

    #[test]
    fn same_page_faulted_from_two_threads_maps_once() {
        let vm = Arc::new(vm(64));
        let mut space = vm.create_address_space();
        space
            .define_region(VirtualAddress::new(0x10_0000), PAGE_SIZE, rw())
            .unwrap();
        let space = Arc::new(space);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let vm = Arc::clone(&vm);
                let space = Arc::clone(&space);
                thread::spawn(move || {
                    let mut tlb = SoftwareTlb::new();
                    let address = VirtualAddress::new(0x10_0000);
                    vm.handle_fault(Some(&*space), FaultKind::Read, address, &mut tlb)
                        .unwrap()
                        .frame()
                })
            })
            .collect();
        let frames: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert!(frames.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(vm.resident_pages(&space), 1);
    }
}
