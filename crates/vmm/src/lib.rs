#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager (VMM) is the demand-paging core of the Polaris
//! teaching kernel. It provides:
//!
//! - A frame arena carved out of the usable physical memory range at boot.
//! - A single, fixed-capacity page table shared by every address space.
//! - Per-process address spaces described by permissioned regions plus a fixed user stack.
//! - A page-fault handler that resolves faults to frames and refills the TLB.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod error;
mod fault;
mod frame;
mod frame_arena;
mod numbers;
mod page_table;
mod tlb;
mod vm;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{
    AddressSpace, OwnerId, Permissions, Region, STACK_PAGES, USER_SPACE_TOP, USER_STACK_TOP,
};
pub use error::{ErrorClass, VmError};
pub use fault::FaultKind;
pub use frame::FrameState;
pub use frame_arena::{AllocError, ArenaLayout, FrameArena};
pub use numbers::{FrameNumber, PageNumber};
pub use page_table::{PageTable, PageTableEntry};
pub use tlb::{TlbEntry, TlbFlags, TranslationCache, tlb_shootdown, tlb_shootdown_all};
pub use vm::{VirtualMemory, VmStats};

pub use arch::{PAGE_SIZE, interrupts_enabled, without_interrupts};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, SoftwareTlb, TLB_SLOTS};
