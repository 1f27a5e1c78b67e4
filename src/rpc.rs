//! The transport boundary.
//!
//! The RPC transport that carries system calls from guest processes is an
//! external collaborator; everything here is the contract it binds to.
//! A new guest thread acquires an [`AttachedThread`] context, whose
//! rundown releases the kernel-side state if the guest dies without
//! detaching. The [`GuestAgent`] channel executes address-space commands
//! inside the guest on the manager's behalf.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::LxResult;
use crate::guest::{AllocationFlags, GuestArchitecture, ProtectionFlags};
use crate::ns::Namespace;
use crate::vfs::Credentials;

/// What a newly attached guest thread needs to start running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStartupInfo {
    pub thread_id: u32,
    pub architecture: GuestArchitecture,
}

/// Commands executed by the agent stub inside a guest process.
pub trait GuestAgent: Send + Sync {
    /// Maps a section object into the guest at `address` (0 lets the guest
    /// side choose) with no access, returning the base address.
    fn map_section(
        &self,
        fd: BorrowedFd<'_>,
        address: usize,
        length: usize,
        flags: AllocationFlags,
    ) -> LxResult<usize>;

    fn unmap_section(&self, address: usize, length: usize) -> LxResult<()>;

    fn protect(&self, address: usize, length: usize, protection: ProtectionFlags) -> LxResult<()>;

    fn lock(&self, address: usize, length: usize) -> LxResult<()>;

    fn unlock(&self, address: usize, length: usize) -> LxResult<()>;
}

/// The exclusive kernel-side context of one attached guest thread.
///
/// The transport holds this for the lifetime of the thread; `rundown` is
/// idempotent and also runs on drop, covering guests that die without
/// detaching.
pub struct AttachedThread {
    thread_id: u32,
    namespace: Namespace,
    credentials: Credentials,
    released: AtomicBool,
    rundown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl AttachedThread {
    pub fn new(
        thread_id: u32,
        namespace: Namespace,
        credentials: Credentials,
        rundown: impl FnOnce() + Send + 'static,
    ) -> AttachedThread {
        AttachedThread {
            thread_id,
            namespace,
            credentials,
            released: AtomicBool::new(false),
            rundown: Mutex::new(Some(Box::new(rundown))),
        }
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Releases the context. Safe to call any number of times.
    pub fn rundown(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(rundown) = self.rundown.lock().take() {
            rundown();
        }
    }
}

impl Drop for AttachedThread {
    fn drop(&mut self) {
        self.rundown();
    }
}

impl std::fmt::Debug for AttachedThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedThread")
            .field("thread_id", &self.thread_id)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn rundown_is_idempotent() {
        let count = Arc::new(AtomicU32::new(0));
        let witness = count.clone();

        let context = AttachedThread::new(7, Namespace::new(), Credentials::root(), move || {
            witness.fetch_add(1, Ordering::SeqCst);
        });

        context.rundown();
        context.rundown();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Dropping after an explicit rundown does not run it again.
        drop(context);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_runs_rundown_for_dead_guests() {
        let count = Arc::new(AtomicU32::new(0));
        let witness = count.clone();

        let context = AttachedThread::new(9, Namespace::new(), Credentials::root(), move || {
            witness.fetch_add(1, Ordering::SeqCst);
        });
        drop(context);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
