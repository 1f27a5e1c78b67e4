//! User-space Linux personality service.
//!
//! lxuser impersonates a Linux kernel to unmodified guest processes that
//! run as native host processes. Guests issue their system calls over a
//! local RPC transport; this crate is the kernel they talk to: a mountable
//! virtual file system with pluggable drivers, composable isolation
//! namespaces, a section-based virtual-memory manager for out-of-process
//! guests, and a printk-style system log.
//!
//! The transport itself, the syscall marshalling layer and the executable
//! loader are external collaborators; see the `rpc` module for the
//! contracts they bind to.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod capability;
pub mod cpio;
pub mod error;
pub mod guest;
pub mod initramfs;
pub mod mount_options;
pub mod ns;
pub mod param;
pub mod rpc;
pub mod stream;
pub mod supervisor;
pub mod syslog;
pub mod vfs;

pub use crate::error::{LxError, LxErrorKind, LxResult};
pub use crate::guest::{
    AllocationFlags, GuestArchitecture, GuestProcess, GuestVm, ProtectionFlags,
};
pub use crate::mount_options::{MountFlags, MountOptions};
pub use crate::ns::{CloneFlags, MountNamespace, Namespace};
pub use crate::supervisor::{StartupError, Supervisor};
pub use crate::syslog::{LogLevel, SystemLog};
pub use crate::vfs::{Credentials, Handle, HandleFlags, Mount, Node, NodeType};
