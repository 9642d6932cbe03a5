//! Address space management.
//!
//! An address space is the per-process description of which virtual ranges are valid:
//! an ordered list of regions defined by the program loader, plus a fixed user stack.
//! It does not hold mappings itself. Every mapping lives in the global
//! [`PageTable`](crate::PageTable), tagged with the address space's [`OwnerId`].

use alloc::vec::Vec;
use bitflags::bitflags;
use core::{fmt, num::NonZeroU64};

use crate::{VirtualAddress, VmError, arch::PAGE_SIZE};

/// First address above user space.
pub const USER_SPACE_TOP: usize = 0x8000_0000;

/// Initial user stack pointer; the stack grows down from here.
pub const USER_STACK_TOP: usize = USER_SPACE_TOP;

/// Number of pages in the user stack.
pub const STACK_PAGES: usize = 16;

/// Tag identifying the address space that owns a page table entry.
///
/// Owner ids are issued in increasing order by
/// [`VirtualMemory`](crate::VirtualMemory) and are never reused, so an entry can never be
/// mistaken for one belonging to an address space created later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(NonZeroU64);

impl OwnerId {
    pub const fn new(id: NonZeroU64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}

bitflags! {
    /// Access permissions of a region, with the ELF `p_flags` bit values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

impl Permissions {
    /// Builds permissions from individual read/write/execute switches.
    pub fn from_rwx(read: bool, write: bool, execute: bool) -> Self {
        let mut permissions = Self::empty();
        permissions.set(Self::READ, read);
        permissions.set(Self::WRITE, write);
        permissions.set(Self::EXECUTE, execute);
        permissions
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.contains(Self::READ), 'r'),
            flag(self.contains(Self::WRITE), 'w'),
            flag(self.contains(Self::EXECUTE), 'x')
        )
    }
}

/// A contiguous, page-aligned virtual range with fixed permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: VirtualAddress,
    pages: usize,
    permissions: Permissions,
    /// Permissions to restore at `complete_load`; set only while a load is in progress.
    saved: Option<Permissions>,
}

impl Region {
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    pub const fn pages(&self) -> usize {
        self.pages
    }

    /// Returns the first address past the region.
    pub fn end(&self) -> VirtualAddress {
        self.base + self.pages * PAGE_SIZE
    }

    /// Returns the permissions currently in effect, which are writable during a load.
    pub const fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.base && address < self.end()
    }
}

/// A process address space.
///
/// Created empty by [`VirtualMemory::create_address_space`](crate::VirtualMemory::create_address_space).
/// The loader then defines regions, brackets the image copy with
/// [`prepare_load`](Self::prepare_load) / [`complete_load`](Self::complete_load), and
/// finally calls [`define_stack`](Self::define_stack).
#[derive(Debug)]
pub struct AddressSpace {
    owner: OwnerId,
    regions: Vec<Region>,
    loading: bool,
}

impl AddressSpace {
    pub(crate) fn new(owner: OwnerId) -> Self {
        Self {
            owner,
            regions: Vec::new(),
            loading: false,
        }
    }

    /// Returns the id tagging this address space's page table entries.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Returns the regions in definition order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Returns whether a load is in progress.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Defines a region covering `[vaddr, vaddr + size)`, widened to whole pages.
    ///
    /// Regions are appended in definition order. Overlap with earlier regions is not
    /// checked; when regions overlap, the earliest definition wins at fault time. The page at
    /// address zero is never mapped, so a region may not start there.
    pub fn define_region(
        &mut self,
        vaddr: VirtualAddress,
        size: usize,
        permissions: Permissions,
    ) -> Result<(), VmError> {
        let base = vaddr.page_base();
        let pages = size
            .checked_add(vaddr.page_offset())
            .map_or(0, |bytes| bytes.div_ceil(PAGE_SIZE));
        let end = pages
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| base.as_usize().checked_add(bytes));
        match end {
            Some(end)
                if base.as_usize() != 0 && size > 0 && pages > 0 && end <= USER_SPACE_TOP => {}
            _ => return Err(VmError::InvalidRegion),
        }

        self.regions
            .try_reserve(1)
            .map_err(|_| VmError::OutOfMemory)?;
        self.regions.push(Region {
            base,
            pages,
            permissions,
            // A region defined mid-load keeps its own permissions at completion.
            saved: None,
        });

        log::debug!(
            "{}: region {}..{} {}",
            self.owner,
            base,
            base + pages * PAGE_SIZE,
            permissions
        );
        Ok(())
    }

    /// Makes every region writable so the loader can copy the image in.
    ///
    /// The permissions in effect before the load come back at [`complete_load`](Self::complete_load).
    pub fn prepare_load(&mut self) -> Result<(), VmError> {
        if self.loading {
            return Err(VmError::LoadAlreadyPrepared);
        }
        for region in &mut self.regions {
            region.saved = Some(region.permissions);
            region.permissions |= Permissions::WRITE;
        }
        self.loading = true;
        Ok(())
    }

    /// Restores the permissions saved by [`prepare_load`](Self::prepare_load).
    pub fn complete_load(&mut self) -> Result<(), VmError> {
        if !self.loading {
            return Err(VmError::LoadNotPrepared);
        }
        for region in &mut self.regions {
            if let Some(saved) = region.saved.take() {
                region.permissions = saved;
            }
        }
        self.loading = false;
        Ok(())
    }

    /// Sets up the user stack and returns the initial stack pointer.
    ///
    /// The stack is fixed: [`STACK_PAGES`] pages below [`USER_STACK_TOP`].
    pub fn define_stack(&mut self) -> VirtualAddress {
        VirtualAddress::new(USER_STACK_TOP)
    }

    /// Returns the permissions that apply to `address`, or `None` if it is not mapped.
    ///
    /// Regions are searched in definition order before the stack.
    pub fn permissions_at(&self, address: VirtualAddress) -> Option<Permissions> {
        if let Some(region) = self.regions.iter().find(|region| region.contains(address)) {
            return Some(region.permissions);
        }
        let stack = stack_base().as_usize()..USER_STACK_TOP;
        stack
            .contains(&address.as_usize())
            .then_some(Permissions::READ | Permissions::WRITE)
    }

    /// Deep-copies the region list into a new address space owned by `owner`.
    pub(crate) fn duplicate(&self, owner: OwnerId) -> Result<Self, VmError> {
        let mut regions = Vec::new();
        regions
            .try_reserve_exact(self.regions.len())
            .map_err(|_| VmError::OutOfMemory)?;
        regions.extend_from_slice(&self.regions);
        Ok(Self {
            owner,
            regions,
            loading: self.loading,
        })
    }
}

/// Returns the lowest address of the user stack.
pub(crate) const fn stack_base() -> VirtualAddress {
    VirtualAddress::new(USER_STACK_TOP - STACK_PAGES * PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(OwnerId::new(NonZeroU64::new(1).unwrap()))
    }

    fn rw() -> Permissions {
        Permissions::READ | Permissions::WRITE
    }

    #[test]
    fn define_region_aligns_base_and_rounds_size() {
        let mut space = space();
        space
            .define_region(VirtualAddress::new(0x1003), 10, Permissions::READ)
            .unwrap();

        let region = space.regions()[0];
        assert_eq!(region.base(), VirtualAddress::new(0x1000));
        assert_eq!(region.pages(), 1);
        assert_eq!(region.permissions(), Permissions::READ);
    }

    #[test]
    fn define_region_absorbs_prefix_into_size() {
        let mut space = space();
        // 0x1ff0 + 0x20 crosses into the next page.
        space
            .define_region(VirtualAddress::new(0x1ff0), 0x20, rw())
            .unwrap();
        assert_eq!(space.regions()[0].pages(), 2);
    }

    #[test]
    fn define_region_keeps_definition_order() {
        let mut space = space();
        space
            .define_region(VirtualAddress::new(0x40_0000), PAGE_SIZE, Permissions::READ)
            .unwrap();
        space
            .define_region(VirtualAddress::new(0x10_0000), PAGE_SIZE, rw())
            .unwrap();

        let bases: Vec<_> = space.regions().iter().map(Region::base).collect();
        assert_eq!(
            bases,
            [VirtualAddress::new(0x40_0000), VirtualAddress::new(0x10_0000)]
        );
    }

    #[test]
    fn define_region_rejects_empty_null_and_kernel_ranges() {
        let mut space = space();
        assert_eq!(
            space.define_region(VirtualAddress::new(0x1000), 0, rw()),
            Err(VmError::InvalidRegion)
        );
        assert_eq!(
            space.define_region(VirtualAddress::new(USER_SPACE_TOP - PAGE_SIZE), 2 * PAGE_SIZE, rw()),
            Err(VmError::InvalidRegion)
        );
        assert_eq!(
            space.define_region(VirtualAddress::new(0x10), PAGE_SIZE, Permissions::READ),
            Err(VmError::InvalidRegion)
        );
        assert!(space.regions().is_empty());
        assert_eq!(space.permissions_at(VirtualAddress::new(0x10)), None);
    }

    #[test]
    fn first_defined_region_wins_on_overlap() {
        let mut space = space();
        space
            .define_region(VirtualAddress::new(0x1000), PAGE_SIZE, Permissions::READ)
            .unwrap();
        space
            .define_region(VirtualAddress::new(0x1000), PAGE_SIZE, rw())
            .unwrap();
        assert_eq!(
            space.permissions_at(VirtualAddress::new(0x1800)),
            Some(Permissions::READ)
        );
    }

    #[test]
    fn prepare_then_complete_restores_permissions() {
        let mut space = space();
        let originals = [
            Permissions::READ | Permissions::EXECUTE,
            Permissions::READ,
            rw(),
            Permissions::empty(),
        ];
        for (i, permissions) in originals.iter().enumerate() {
            space
                .define_region(VirtualAddress::new((i + 1) * 0x10_0000), PAGE_SIZE, *permissions)
                .unwrap();
        }

        space.prepare_load().unwrap();
        assert!(space.is_loading());
        assert!(
            space
                .regions()
                .iter()
                .all(|region| region.permissions().contains(Permissions::WRITE))
        );

        space.complete_load().unwrap();
        let restored: Vec<_> = space.regions().iter().map(Region::permissions).collect();
        assert_eq!(restored, originals);
        assert!(!space.is_loading());
    }

    #[test]
    fn staging_must_be_paired() {
        let mut space = space();
        assert_eq!(space.complete_load(), Err(VmError::LoadNotPrepared));

        space.prepare_load().unwrap();
        assert_eq!(space.prepare_load(), Err(VmError::LoadAlreadyPrepared));
        space.complete_load().unwrap();
        assert_eq!(space.complete_load(), Err(VmError::LoadNotPrepared));
    }

    #[test]
    fn region_defined_during_load_keeps_its_permissions() {
        let mut space = space();
        space.prepare_load().unwrap();
        space
            .define_region(VirtualAddress::new(0x1000), PAGE_SIZE, Permissions::READ)
            .unwrap();
        space.complete_load().unwrap();
        assert_eq!(space.regions()[0].permissions(), Permissions::READ);
    }

    #[test]
    fn stack_is_read_write_only() {
        let mut space = space();
        let sp = space.define_stack();
        assert_eq!(sp, VirtualAddress::new(USER_STACK_TOP));

        assert_eq!(space.permissions_at(sp - 1), Some(rw()));
        assert_eq!(space.permissions_at(stack_base()), Some(rw()));
        assert_eq!(space.permissions_at(stack_base() - 1), None);
    }

    #[test]
    fn gap_between_regions_and_stack_is_unmapped() {
        let mut space = space();
        space
            .define_region(VirtualAddress::new(0x40_0000), PAGE_SIZE, Permissions::READ)
            .unwrap();
        assert_eq!(space.permissions_at(VirtualAddress::new(0x40_1000)), None);
        assert_eq!(space.permissions_at(VirtualAddress::new(0x1000_0000)), None);
    }

    #[test]
    fn duplicate_copies_regions_under_new_owner() {
        let mut space = space();
        space
            .define_region(VirtualAddress::new(0x40_0000), 3 * PAGE_SIZE, Permissions::READ)
            .unwrap();
        let owner = OwnerId::new(NonZeroU64::new(2).unwrap());
        let copy = space.duplicate(owner).unwrap();
        assert_eq!(copy.owner(), owner);
        assert_eq!(copy.regions(), space.regions());
    }

    #[test]
    fn permissions_display() {
        assert_eq!(format!("{}", Permissions::READ | Permissions::EXECUTE), "r-x");
        assert_eq!(format!("{}", Permissions::from_rwx(true, true, false)), "rw-");
    }
}
