//! Errors reported by the virtual memory manager.

use core::fmt;

use crate::{AllocError, VirtualAddress};

/// Errors that can occur in address-space management and fault handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No physical frame (or region storage) could be allocated.
    OutOfMemory,
    /// Every slot of the global page table is in use.
    PageTableFull,
    /// A region was empty, or extended past the top of user space.
    InvalidRegion,
    /// A physical address or size did not describe a valid frame allocation.
    InvalidPhysicalAccess,
    /// `prepare_load` was called twice without `complete_load` in between.
    LoadAlreadyPrepared,
    /// `complete_load` was called without a matching `prepare_load`.
    LoadNotPrepared,
    /// A write hit a page that is mapped read-only.
    ReadOnlyViolation,
    /// The trap reported a fault kind the handler does not know.
    InvalidFaultKind(u32),
    /// A fault was taken with no current address space.
    NoAddressSpace,
    /// The faulting address is not inside any region or the user stack.
    SegmentationFault(VirtualAddress),
}

/// Broad classes of [`VmError`], deciding what the caller does with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The faulting process must be terminated.
    ProcessFatal,
    /// A resource ran out; the operation failed but the system is consistent.
    ResourceExhausted,
    /// The caller broke an API contract. This is a kernel bug, not a user error.
    UsageViolation,
}

impl VmError {
    /// Returns the class of this error.
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::ReadOnlyViolation | Self::NoAddressSpace | Self::SegmentationFault(_) => {
                ErrorClass::ProcessFatal
            }
            Self::OutOfMemory | Self::PageTableFull => ErrorClass::ResourceExhausted,
            Self::InvalidRegion
            | Self::InvalidPhysicalAccess
            | Self::LoadAlreadyPrepared
            | Self::LoadNotPrepared
            | Self::InvalidFaultKind(_) => ErrorClass::UsageViolation,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::PageTableFull => f.write_str("page table full"),
            Self::InvalidRegion => f.write_str("invalid region"),
            Self::InvalidPhysicalAccess => f.write_str("invalid physical memory access"),
            Self::LoadAlreadyPrepared => f.write_str("load already prepared"),
            Self::LoadNotPrepared => f.write_str("load completed without being prepared"),
            Self::ReadOnlyViolation => f.write_str("write to read-only page"),
            Self::InvalidFaultKind(code) => write!(f, "invalid fault kind {}", code),
            Self::NoAddressSpace => f.write_str("fault with no current address space"),
            Self::SegmentationFault(address) => write!(f, "segmentation fault at {}", address),
        }
    }
}

impl core::error::Error for VmError {}

impl From<AllocError> for VmError {
    fn from(error: AllocError) -> Self {
        match error {
            AllocError::OutOfMemory => Self::OutOfMemory,
            AllocError::ZeroSized | AllocError::InvalidDeallocation | AllocError::OutOfRange => {
                Self::InvalidPhysicalAccess
            }
        }
    }
}
