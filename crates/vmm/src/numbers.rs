//! Frame and page numbers.
//!
//! The page table places an entry by comparing the page's number with the number of the
//! first frame in the arena, so both kinds of number share one representation.

use core::fmt;

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};

macro_rules! number_type {
    ($name:ident, $address:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns how many units `self` lies past `base`, modulo the word size.
            #[inline]
            pub const fn wrapping_distance_from(self, base: Self) -> usize {
                self.0.wrapping_sub(base.0)
            }
        }

        impl From<$address> for $name {
            #[inline]
            fn from(addr: $address) -> Self {
                Self(addr.as_usize() / arch::PAGE_SIZE)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

number_type!(
    FrameNumber,
    PhysicalAddress,
    "Index of a physical frame, counted from physical address zero."
);

number_type!(
    PageNumber,
    VirtualAddress,
    "Index of a virtual page, counted from virtual address zero."
);
