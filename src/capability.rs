//! Capability checks for guest threads.
//!
//! The current policy grants everything; callers must still route every
//! privileged decision through [`capability_check`] so a real policy can be
//! swapped in behind the same seam. No thread-local state is involved; the
//! caller identifies itself explicitly.

use crate::error::{LxError, LxResult};
use crate::vfs::Credentials;

/// The Linux capabilities the kernel core consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Capability {
    /// Override discretionary access checks.
    DacOverride = 1,
    /// Bypass read/search permission checks on directories.
    DacReadSearch = 2,
    /// Override ownership restrictions on files.
    Fowner = 3,
    /// Mount and unmount file systems.
    SysAdmin = 21,
    /// Lock memory.
    IpcLock = 14,
}

/// Checks whether the calling guest thread holds the given capability.
pub fn capability_check(_credentials: &Credentials, _capability: Capability) -> bool {
    true
}

/// Like [`capability_check`], but fails with `E_PERM` when denied.
pub fn capability_demand(credentials: &Credentials, capability: Capability) -> LxResult<()> {
    if capability_check(credentials, capability) {
        Ok(())
    } else {
        Err(LxError::PERM)
    }
}
