//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, plus the translator the kernel uses to reach a physical frame's contents.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Address translator for reaching physical memory from kernel code.
///
/// This enum supports two modes:
/// - Hardware: physical memory is direct-mapped at a fixed offset (a KSEG0-style window)
/// - Emulated: physical memory is a host buffer (testing mode)
///
/// The translator is owned by the [`FrameArena`](crate::FrameArena), which is the only
/// component that touches frame contents.
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator backed by `size` bytes of zeroed memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Translates a physical address to a typed pointer the kernel can dereference.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        match self {
            Self::Hardware { direct_map_offset } => {
                phys.as_usize().wrapping_add(*direct_map_offset) as *mut T
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys.as_usize()) as *mut T,
        }
    }
}

/// Defines an address newtype and the arithmetic shared by physical and virtual addresses.
macro_rules! address_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns whether the address is a multiple of `align`, a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Rounds the address down to a multiple of `align`, a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Returns the byte offset of the address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 % arch::PAGE_SIZE
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, bytes: usize) -> Self {
                Self::new(self.0 + bytes)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            fn sub(self, bytes: usize) -> Self {
                Self::new(self.0 - bytes)
            }
        }

        /// Distance in bytes between two addresses.
        impl Sub for $name {
            type Output = usize;

            fn sub(self, base: Self) -> usize {
                self.0 - base.0
            }
        }
    };
}

address_type!(
    PhysicalAddress,
    "An address in physical memory, as seen by the frame arena."
);

impl PhysicalAddress {
    /// Wraps `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is wider than the machine's physical address bus.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the number of the frame containing this address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

address_type!(
    VirtualAddress,
    "An address in a process's view of memory.\n\n\
     User mappings live below [`USER_SPACE_TOP`](crate::USER_SPACE_TOP)."
);

impl VirtualAddress {
    /// Wraps `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid virtual address on this machine.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Returns the first address of the page containing this one.
    #[inline]
    pub const fn page_base(self) -> Self {
        self.align_down(arch::PAGE_SIZE)
    }

    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_width_is_enforced() {
        let widest = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
        assert_eq!(PhysicalAddress::new(widest).as_usize(), widest);
    }

    #[test]
    #[should_panic(expected = "physical address exceeds maximum width")]
    fn physical_address_too_wide() {
        PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
    }

    #[test]
    #[should_panic(expected = "address is not canonical")]
    fn virtual_address_too_wide() {
        VirtualAddress::new(1usize << arch::MAX_VIRTUAL_BITS);
    }

    #[test]
    fn page_arithmetic() {
        let addr = VirtualAddress::new(0x40_1003);
        assert_eq!(addr.page_base(), VirtualAddress::new(0x40_1000));
        assert_eq!(addr.page_offset(), 3);
        assert_eq!(addr.page_number(), PageNumber::new(0x401));
        assert!(addr.page_base().is_aligned(arch::PAGE_SIZE));
        assert!(!addr.is_aligned(2));
    }

    #[test]
    fn frame_of_physical_address() {
        let addr = PhysicalAddress::new(7 * arch::PAGE_SIZE + 12);
        assert_eq!(addr.frame_number(), FrameNumber::new(7));
        assert_eq!(addr.align_down(arch::PAGE_SIZE), PhysicalAddress::new(0x7000));
    }

    #[test]
    fn offsets_and_distances() {
        let base = PhysicalAddress::new(0x2_0000);
        assert_eq!((base + 0x1800) - base, 0x1800);
        assert_eq!(base - 0x1000, PhysicalAddress::new(0x1_F000));
    }

    #[test]
    fn formatting() {
        assert_eq!(format!("{}", PhysicalAddress::new(0x2000)), "0x2000");
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x40_0000)),
            "VirtualAddress(0x400000)"
        );
    }

    #[test]
    fn hardware_translator_applies_direct_map_offset() {
        let translator = AddressTranslator::hardware(0x8000_0000);
        let ptr: *mut u8 = translator.phys_to_ptr(PhysicalAddress::new(0x1000));
        assert_eq!(ptr as usize, 0x8000_1000);
    }

    #[test]
    fn emulated_translator_reaches_host_buffer() {
        let translator = AddressTranslator::emulated(2 * arch::PAGE_SIZE);
        let ptr: *mut u8 = translator.phys_to_ptr(PhysicalAddress::new(arch::PAGE_SIZE + 1));
        unsafe {
            ptr.write(0x5A);
            assert_eq!(ptr.read(), 0x5A);
        }
    }
}
