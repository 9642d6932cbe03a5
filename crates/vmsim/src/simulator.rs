//! Replays lifecycle scripts against an emulated machine.
//!
//! The simulator plays the parts of the kernel that sit around the virtual memory manager:
//! the process table, the program loader, and the MMU that turns user loads and stores into
//! TLB lookups and faults.

use std::{collections::BTreeMap, fmt};

use vmm::{
    AddressSpace, AddressTranslator, FaultKind, OwnerId, PAGE_SIZE, PhysicalAddress,
    SoftwareTlb, VirtualAddress, VirtualMemory, VmError, VmStats,
};

use crate::script::{Command, Line};

/// Physical address where usable memory starts; everything below belongs to the kernel image.
pub const FIRST_FREE: usize = 0x2_0000;

/// Smallest machine that leaves room for user frames after the boot metadata.
pub const MIN_FRAMES: usize = 8;

/// Something a command did worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Spawned { name: String, owner: OwnerId },
    RegionDefined { name: String, base: VirtualAddress },
    LoadPrepared { name: String },
    LoadCompleted { name: String },
    StackDefined { name: String, stack_pointer: VirtualAddress },
    Loaded { address: VirtualAddress, value: u8 },
    Stored { address: VirtualAddress, value: u8 },
    Forked { parent: String, child: String, pages: usize },
    ForkFailed { parent: String, child: String, error: VmError },
    Switched { name: String },
    Exited { name: String, pages: usize },
    /// A fault could not be resolved and the process was destroyed.
    Killed { name: String, error: VmError },
    Stats { stats: VmStats, tlb_entries: usize, processes: usize },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawned { name, owner } => write!(f, "{}: spawned ({})", name, owner),
            Self::RegionDefined { name, base } => write!(f, "{}: region at {}", name, base),
            Self::LoadPrepared { name } => write!(f, "{}: load prepared", name),
            Self::LoadCompleted { name } => write!(f, "{}: load complete", name),
            Self::StackDefined { name, stack_pointer } => {
                write!(f, "{}: stack pointer {}", name, stack_pointer)
            }
            Self::Loaded { address, value } => write!(f, "read {} = {:#04x}", address, value),
            Self::Stored { address, value } => write!(f, "write {} = {:#04x}", address, value),
            Self::Forked {
                parent,
                child,
                pages,
            } => write!(f, "{}: forked {} ({} page(s) copied)", parent, child, pages),
            Self::ForkFailed {
                parent,
                child,
                error,
            } => write!(f, "{}: fork of {} failed: {}", parent, child, error),
            Self::Switched { name } => write!(f, "switched to {}", name),
            Self::Exited { name, pages } => {
                write!(f, "{}: exited ({} page(s) released)", name, pages)
            }
            Self::Killed { name, error } => write!(f, "{}: killed: {}", name, error),
            Self::Stats {
                stats,
                tlb_entries,
                processes,
            } => write!(
                f,
                "frames {}/{} used ({} reserved, {} free), page table {}/{}, tlb {}, processes {}",
                stats.allocated_frames,
                stats.total_frames - stats.reserved_frames,
                stats.reserved_frames,
                stats.free_frames,
                stats.page_table_entries,
                stats.page_table_capacity,
                tlb_entries,
                processes
            ),
        }
    }
}

/// Errors that abort a run.
#[derive(Debug)]
pub enum SimError {
    NoCurrentProcess { line: usize },
    UnknownProcess { line: usize, name: String },
    DuplicateProcess { line: usize, name: String },
    /// The script misused the address-space API.
    Vm { line: usize, error: VmError },
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCurrentProcess { line } => write!(f, "line {}: no current process", line),
            Self::UnknownProcess { line, name } => {
                write!(f, "line {}: no process named `{}`", line, name)
            }
            Self::DuplicateProcess { line, name } => {
                write!(f, "line {}: process `{}` already exists", line, name)
            }
            Self::Vm { line, error } => write!(f, "line {}: {}", line, error),
        }
    }
}

impl std::error::Error for SimError {}

/// An emulated single-core machine running the virtual memory manager.
pub struct Simulator {
    vm: VirtualMemory,
    tlb: SoftwareTlb,
    processes: BTreeMap<String, AddressSpace>,
    current: Option<String>,
}

impl Simulator {
    /// Boots a machine with `frames` frames of usable memory.
    ///
    /// # Panics
    ///
    /// Panics if `frames` is below [`MIN_FRAMES`].
    pub fn new(frames: usize, seed: u32) -> Self {
        assert!(frames >= MIN_FRAMES, "machine needs at least {} frames", MIN_FRAMES);
        let last = FIRST_FREE + frames * PAGE_SIZE;
        let vm = VirtualMemory::bootstrap(
            PhysicalAddress::new(FIRST_FREE),
            PhysicalAddress::new(last),
            AddressTranslator::emulated(last),
        );
        log::info!("booted with {} frames ({} reserved)", frames, vm.layout().metadata_frames());

        Self {
            vm,
            tlb: SoftwareTlb::with_seed(seed),
            processes: BTreeMap::new(),
            current: None,
        }
    }

    pub fn vm(&self) -> &VirtualMemory {
        &self.vm
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Iterates over live processes in name order.
    pub fn processes(&self) -> impl Iterator<Item = (&str, &AddressSpace)> {
        self.processes
            .iter()
            .map(|(name, space)| (name.as_str(), space))
    }

    /// Runs every line, passing each event to `report`. Stops at the first script error.
    pub fn run<F>(&mut self, lines: &[Line], mut report: F) -> Result<(), SimError>
    where
        F: FnMut(&Event),
    {
        for line in lines {
            log::debug!("line {}: {:?}", line.number, line.command);
            let event = self.execute(line)?;
            report(&event);
        }
        Ok(())
    }

    /// Executes one line.
    pub fn execute(&mut self, line: &Line) -> Result<Event, SimError> {
        let number = line.number;
        let vm_error = move |error: VmError| SimError::Vm {
            line: number,
            error,
        };

        let event = match &line.command {
            Command::Spawn(name) => {
                self.ensure_unused(number, name)?;
                let space = self.vm.create_address_space();
                let owner = space.owner();
                self.processes.insert(name.clone(), space);
                self.switch_to(name.clone());
                Event::Spawned {
                    name: name.clone(),
                    owner,
                }
            }
            Command::Region {
                vaddr,
                size,
                permissions,
            } => {
                let (name, space) = self.current_mut(number)?;
                space
                    .define_region(*vaddr, *size, *permissions)
                    .map_err(vm_error)?;
                Event::RegionDefined {
                    name,
                    base: vaddr.page_base(),
                }
            }
            Command::Prepare => {
                let (name, space) = self.current_mut(number)?;
                space.prepare_load().map_err(vm_error)?;
                Event::LoadPrepared { name }
            }
            Command::Complete => {
                let (name, space) = self.current_mut(number)?;
                space.complete_load().map_err(vm_error)?;
                // Entries cached during the load may still be writable.
                self.tlb.flush();
                Event::LoadCompleted { name }
            }
            Command::Stack => {
                let (name, space) = self.current_mut(number)?;
                let stack_pointer = space.define_stack();
                Event::StackDefined {
                    name,
                    stack_pointer,
                }
            }
            Command::Read(address) => self.access(number, *address, None)?,
            Command::Write(address, value) => self.access(number, *address, Some(*value))?,
            Command::Fork(child) => {
                self.ensure_unused(number, child)?;
                let parent = self.current_name(number)?;
                let space = self
                    .processes
                    .get(&parent)
                    .ok_or(SimError::NoCurrentProcess { line: number })?;
                match self.vm.copy_address_space(space) {
                    Ok(copy) => {
                        let pages = self.vm.resident_pages(&copy);
                        self.processes.insert(child.clone(), copy);
                        Event::Forked {
                            parent,
                            child: child.clone(),
                            pages,
                        }
                    }
                    Err(error) => Event::ForkFailed {
                        parent,
                        child: child.clone(),
                        error,
                    },
                }
            }
            Command::Switch(name) => {
                if !self.processes.contains_key(name) {
                    return Err(SimError::UnknownProcess {
                        line: number,
                        name: name.clone(),
                    });
                }
                self.switch_to(name.clone());
                Event::Switched { name: name.clone() }
            }
            Command::Exit(name) => {
                let name = match name {
                    Some(name) => name.clone(),
                    None => self.current_name(number)?,
                };
                let pages = self.destroy(number, &name)?;
                Event::Exited { name, pages }
            }
            Command::Stats => Event::Stats {
                stats: self.vm.stats(),
                tlb_entries: self.tlb.valid_entries(),
                processes: self.processes.len(),
            },
        };
        Ok(event)
    }

    /// Performs a user load (`value == None`) or store through the MMU.
    fn access(
        &mut self,
        line: usize,
        address: VirtualAddress,
        value: Option<u8>,
    ) -> Result<Event, SimError> {
        let name = self.current_name(line)?;
        let space = self.processes.get(&name);

        match mmu_translate(&self.vm, &mut self.tlb, space, address, value.is_some()) {
            Ok(physical) => {
                let event = match value {
                    Some(value) => {
                        self.vm
                            .write_physical(physical, &[value])
                            .map_err(|error| SimError::Vm { line, error })?;
                        Event::Stored { address, value }
                    }
                    None => {
                        let mut byte = [0u8];
                        self.vm
                            .read_physical(physical, &mut byte)
                            .map_err(|error| SimError::Vm { line, error })?;
                        Event::Loaded {
                            address,
                            value: byte[0],
                        }
                    }
                };
                Ok(event)
            }
            Err(error) => {
                log::warn!("{}: unresolvable fault at {}: {}", name, address, error);
                self.destroy(line, &name)?;
                Ok(Event::Killed { name, error })
            }
        }
    }

    fn switch_to(&mut self, name: String) {
        if let Some(previous) = self.current.as_ref().and_then(|name| self.processes.get(name)) {
            self.vm.deactivate(previous);
        }
        if let Some(space) = self.processes.get(&name) {
            self.vm.activate(space, &mut self.tlb);
        }
        self.current = Some(name);
    }

    fn destroy(&mut self, line: usize, name: &str) -> Result<usize, SimError> {
        let space = self.processes.remove(name).ok_or_else(|| SimError::UnknownProcess {
            line,
            name: name.to_string(),
        })?;
        if self.current.as_deref() == Some(name) {
            self.vm.deactivate(&space);
            self.tlb.flush();
            self.current = None;
        }
        Ok(self.vm.destroy_address_space(space))
    }

    fn current_name(&self, line: usize) -> Result<String, SimError> {
        self.current
            .clone()
            .ok_or(SimError::NoCurrentProcess { line })
    }

    fn current_mut(&mut self, line: usize) -> Result<(String, &mut AddressSpace), SimError> {
        let name = self.current_name(line)?;
        let space = self
            .processes
            .get_mut(&name)
            .ok_or(SimError::NoCurrentProcess { line })?;
        Ok((name, space))
    }

    fn ensure_unused(&self, line: usize, name: &str) -> Result<(), SimError> {
        if self.processes.contains_key(name) {
            return Err(SimError::DuplicateProcess {
                line,
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

/// Translates a user access the way the MMU does: a TLB hit completes the access, a miss
/// traps into the fault handler, and a store through a clean entry traps as read-only.
fn mmu_translate(
    vm: &VirtualMemory,
    tlb: &mut SoftwareTlb,
    space: Option<&AddressSpace>,
    address: VirtualAddress,
    store: bool,
) -> Result<PhysicalAddress, VmError> {
    let kind = if store {
        FaultKind::Write
    } else {
        FaultKind::Read
    };
    let entry = match tlb.probe(address.page_base()) {
        Some(entry) => entry,
        None => vm.handle_fault(space, kind, address, tlb)?,
    };
    if store && !entry.is_dirty() {
        vm.handle_fault(space, FaultKind::ReadOnly, address, tlb)?;
    }
    Ok(entry.frame() + address.page_offset())
}
