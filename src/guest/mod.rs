//! Virtual-memory management for guest processes.
//!
//! All guest memory is backed by host shared-memory sections, fully
//! committed at creation and mapped with no access. "Allocation" never
//! commits anything; it applies page protection and records the pages as
//! soft-allocated in a per-section bitmap. The manager splits every range
//! operation across the sections that cover it.

mod process;
mod section;

pub use process::{GuestProcess, GuestVm, HostAddressSpace, LocalAddressSpace, RemoteProcess};
pub use section::{PageBitmap, Section};

use bitflags::bitflags;

bitflags! {
    /// Page protection, as carried on the syscall wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProtectionFlags: u8 {
        const EXECUTE = 0x01;
        const READ = 0x02;
        const WRITE = 0x04;
        const GUARD = 0x80;
    }
}

bitflags! {
    /// Allocation placement, as carried on the syscall wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocationFlags: u8 {
        const TOP_DOWN = 0x01;
    }
}

/// Architecture of the guest binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestArchitecture {
    X86,
    X86_64,
}

/// The host's allocation granularity; sections are sized in multiples of
/// this.
pub fn allocation_granularity() -> usize {
    page_size::get()
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}
