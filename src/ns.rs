//! Isolation namespaces.
//!
//! A namespace is a composition of seven independently shared domains.
//! Cloning replaces the domains named by the clone mask with fresh
//! instances and shares the rest with the source; the source is never
//! mutated. Only the mount namespace carries real state in this kernel;
//! the other six are structural placeholders that keep their identity
//! semantics.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::error::{LxError, LxResult};
use crate::mount_options::MountFlags;
use crate::vfs::path::{self, PathNode, ResolveFlags};
use crate::vfs::{Credentials, Filesystem, Mount, NodeType};

bitflags! {
    /// The `CLONE_NEW*` namespace bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CloneFlags: u32 {
        const NEWNS = libc::CLONE_NEWNS as u32;
        const NEWCGROUP = libc::CLONE_NEWCGROUP as u32;
        const NEWUTS = libc::CLONE_NEWUTS as u32;
        const NEWIPC = libc::CLONE_NEWIPC as u32;
        const NEWUSER = libc::CLONE_NEWUSER as u32;
        const NEWPID = libc::CLONE_NEWPID as u32;
        const NEWNET = libc::CLONE_NEWNET as u32;
    }
}

/// Isolates process resource usage.
#[derive(Debug, Default)]
pub struct ControlGroupNamespace {}

/// Isolates System V IPC and POSIX message queues.
#[derive(Debug, Default)]
pub struct IpcNamespace {}

/// Isolates network devices, stacks and ports.
#[derive(Debug, Default)]
pub struct NetworkNamespace {}

/// Isolates the process identifier space.
#[derive(Debug, Default)]
pub struct PidNamespace {}

/// Isolates user and group identifiers.
#[derive(Debug, Default)]
pub struct UserNamespace {}

/// Isolates host and domain name strings.
#[derive(Debug, Default)]
pub struct UtsNamespace {}

/// A composition of the seven isolation domains.
#[derive(Debug, Clone)]
pub struct Namespace {
    mount_ns: Arc<MountNamespace>,
    cgroup_ns: Arc<ControlGroupNamespace>,
    uts_ns: Arc<UtsNamespace>,
    ipc_ns: Arc<IpcNamespace>,
    user_ns: Arc<UserNamespace>,
    pid_ns: Arc<PidNamespace>,
    net_ns: Arc<NetworkNamespace>,
}

impl Namespace {
    /// A root namespace with fresh instances of every domain.
    pub fn new() -> Namespace {
        Namespace {
            mount_ns: Arc::new(MountNamespace::new()),
            cgroup_ns: Arc::new(ControlGroupNamespace::default()),
            uts_ns: Arc::new(UtsNamespace::default()),
            ipc_ns: Arc::new(IpcNamespace::default()),
            user_ns: Arc::new(UserNamespace::default()),
            pid_ns: Arc::new(PidNamespace::default()),
            net_ns: Arc::new(NetworkNamespace::default()),
        }
    }

    /// Clones this namespace: each `CLONE_NEW*` bit in `flags` gets a fresh
    /// domain instance, every other domain is shared with `self`.
    pub fn clone_with(&self, flags: CloneFlags) -> Namespace {
        Namespace {
            mount_ns: if flags.contains(CloneFlags::NEWNS) {
                Arc::new(MountNamespace::new())
            } else {
                self.mount_ns.clone()
            },
            cgroup_ns: if flags.contains(CloneFlags::NEWCGROUP) {
                Arc::new(ControlGroupNamespace::default())
            } else {
                self.cgroup_ns.clone()
            },
            uts_ns: if flags.contains(CloneFlags::NEWUTS) {
                Arc::new(UtsNamespace::default())
            } else {
                self.uts_ns.clone()
            },
            ipc_ns: if flags.contains(CloneFlags::NEWIPC) {
                Arc::new(IpcNamespace::default())
            } else {
                self.ipc_ns.clone()
            },
            user_ns: if flags.contains(CloneFlags::NEWUSER) {
                Arc::new(UserNamespace::default())
            } else {
                self.user_ns.clone()
            },
            pid_ns: if flags.contains(CloneFlags::NEWPID) {
                Arc::new(PidNamespace::default())
            } else {
                self.pid_ns.clone()
            },
            net_ns: if flags.contains(CloneFlags::NEWNET) {
                Arc::new(NetworkNamespace::default())
            } else {
                self.net_ns.clone()
            },
        }
    }

    pub fn mount_ns(&self) -> &Arc<MountNamespace> {
        &self.mount_ns
    }

    pub fn cgroup_ns(&self) -> &Arc<ControlGroupNamespace> {
        &self.cgroup_ns
    }

    pub fn uts_ns(&self) -> &Arc<UtsNamespace> {
        &self.uts_ns
    }

    pub fn ipc_ns(&self) -> &Arc<IpcNamespace> {
        &self.ipc_ns
    }

    pub fn user_ns(&self) -> &Arc<UserNamespace> {
        &self.user_ns
    }

    pub fn pid_ns(&self) -> &Arc<PidNamespace> {
        &self.pid_ns
    }

    pub fn net_ns(&self) -> &Arc<NetworkNamespace> {
        &self.net_ns
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::new()
    }
}

struct MountPoint {
    mount: Arc<Mount>,
    /// The path node the mount hides, kept alive for the mount's lifetime.
    #[allow(dead_code)]
    hidden: Option<Arc<PathNode>>,
}

/// The mount table of one mount namespace: canonical absolute paths mapped
/// to mounts, resolved by longest-prefix match.
pub struct MountNamespace {
    mounts: RwLock<BTreeMap<String, MountPoint>>,
}

impl MountNamespace {
    pub fn new() -> MountNamespace {
        MountNamespace {
            mounts: RwLock::new(BTreeMap::new()),
        }
    }

    /// The mount at `/`, if the namespace has been populated.
    pub fn root_mount(&self) -> Option<Arc<Mount>> {
        self.mounts.read().get("/").map(|mp| mp.mount.clone())
    }

    /// The mount installed exactly at `canonical`, if any.
    pub(crate) fn mount_at(&self, canonical: &str) -> Option<Arc<Mount>> {
        self.mounts.read().get(canonical).map(|mp| mp.mount.clone())
    }

    /// Mounts a file system at `path`. The first mount must target `/`.
    /// `MS_REMOUNT` re-validates flags on the existing mount instead.
    pub fn mount(
        &self,
        target: &str,
        fs: Arc<dyn Filesystem>,
        flags: MountFlags,
        data: &[u8],
    ) -> LxResult<()> {
        let credentials = Credentials::root();

        if flags.contains(MountFlags::REMOUNT) {
            let resolved = path::resolve(self, &credentials, None, target, ResolveFlags::empty())?;
            let canonical = resolved.canonical_path();
            let mounts = self.mounts.read();
            let mount_point = mounts.get(&canonical).ok_or(LxError::INVAL)?;
            return mount_point.mount.remount(flags, data);
        }

        // Bootstrapping: the root mount goes in before anything resolves.
        if self.root_mount().is_none() {
            if target != "/" {
                return Err(LxError::NOENT);
            }
            let mount = Arc::new(fs.mount(flags, data)?);
            self.mounts.write().insert(
                "/".to_string(),
                MountPoint {
                    mount,
                    hidden: None,
                },
            );
            return Ok(());
        }

        let resolved = path::resolve(self, &credentials, None, target, ResolveFlags::empty())?;
        if resolved.node.node_type() != NodeType::Directory {
            return Err(LxError::NOTDIR);
        }
        let canonical = resolved.canonical_path();

        let mount = Arc::new(fs.mount(flags, data)?);
        self.mounts.write().insert(
            canonical,
            MountPoint {
                mount,
                hidden: Some(resolved),
            },
        );
        Ok(())
    }

    /// Removes the mount at `path`. The root mount cannot be removed.
    pub fn unmount(&self, target: &str) -> LxResult<()> {
        let credentials = Credentials::root();
        let resolved = path::resolve(self, &credentials, None, target, ResolveFlags::empty())?;
        let canonical = resolved.canonical_path();
        if canonical == "/" {
            return Err(LxError::INVAL);
        }

        match self.mounts.write().remove(&canonical) {
            Some(_) => Ok(()),
            None => Err(LxError::INVAL),
        }
    }

    /// Longest-prefix lookup: which mount owns `canonical`, and the path
    /// remainder relative to that mount's root.
    pub fn mount_for_path(&self, canonical: &str) -> LxResult<(Arc<Mount>, String)> {
        let mounts = self.mounts.read();
        let mut best: Option<(&str, &MountPoint)> = None;

        for (prefix, mount_point) in mounts.iter() {
            let matches = prefix == "/"
                || canonical == prefix
                || (canonical.starts_with(prefix.as_str())
                    && canonical.as_bytes().get(prefix.len()) == Some(&b'/'));
            if matches && best.is_none_or(|(b, _)| prefix.len() > b.len()) {
                best = Some((prefix, mount_point));
            }
        }

        let (prefix, mount_point) = best.ok_or(LxError::NOENT)?;
        let relative = canonical[prefix.len()..].trim_start_matches('/').to_string();
        Ok((mount_point.mount.clone(), relative))
    }
}

impl Default for MountNamespace {
    fn default() -> Self {
        MountNamespace::new()
    }
}

impl std::fmt::Debug for MountNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mounts = self.mounts.read();
        f.debug_struct("MountNamespace")
            .field("mounts", &mounts.keys().collect::<Vec<_>>())
            .finish()
    }
}
