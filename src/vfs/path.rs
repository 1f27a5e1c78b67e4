//! Path resolution.
//!
//! A resolved path is a chain of [`PathNode`]s from the namespace root (or
//! a supplied starting directory) down to the target. The chain carries the
//! owning mount of every step, so `..` walks back across mount boundaries
//! naturally and nothing ever points from a node back to a mount.

use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{LxError, LxResult};
use crate::ns::MountNamespace;

use super::{
    Access, Credentials, Handle, HandleFlags, MAX_SYMBOLIC_LINKS, Mode, Mount, Node, NodeType,
    check_access, check_mount_writable,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResolveFlags: u32 {
        /// Do not follow a symbolic link in the terminal component.
        const NO_FOLLOW = 1;
    }
}

/// One step of a resolved path.
#[derive(Debug)]
pub struct PathNode {
    pub mount: Arc<Mount>,
    pub node: Node,
    /// Component name; empty for the root.
    pub name: String,
    pub parent: Option<Arc<PathNode>>,
}

impl PathNode {
    /// The canonical absolute path of this node, with every symbolic link
    /// already resolved.
    pub fn canonical_path(&self) -> String {
        match &self.parent {
            None => "/".to_string(),
            Some(parent) => {
                let base = parent.canonical_path();
                if base == "/" {
                    format!("/{}", self.name)
                } else {
                    format!("{}/{}", base, self.name)
                }
            }
        }
    }
}

fn root_path(ns: &MountNamespace) -> LxResult<Arc<PathNode>> {
    let mount = ns.root_mount().ok_or(LxError::NOENT)?;
    Ok(Arc::new(PathNode {
        node: mount.root().clone(),
        mount,
        name: String::new(),
        parent: None,
    }))
}

/// Resolves `path` within the namespace, starting at `start` (or at the
/// namespace root for absolute paths and when no start is given).
pub fn resolve(
    ns: &MountNamespace,
    credentials: &Credentials,
    start: Option<Arc<PathNode>>,
    path: &str,
    flags: ResolveFlags,
) -> LxResult<Arc<PathNode>> {
    let mut depth = 0usize;
    resolve_at(ns, credentials, start, path, flags, &mut depth)
}

fn resolve_at(
    ns: &MountNamespace,
    credentials: &Credentials,
    start: Option<Arc<PathNode>>,
    path: &str,
    flags: ResolveFlags,
    depth: &mut usize,
) -> LxResult<Arc<PathNode>> {
    if path.is_empty() {
        return Err(LxError::NOENT);
    }

    let mut current = if path.starts_with('/') {
        root_path(ns)?
    } else {
        match start {
            Some(start) => start,
            None => root_path(ns)?,
        }
    };

    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();

    for (position, component) in components.iter().enumerate() {
        let terminal = position == components.len() - 1;

        match *component {
            "." => continue,
            ".." => {
                // Never walks above the caller's root.
                if let Some(parent) = &current.parent {
                    current = parent.clone();
                }
                continue;
            }
            name => {
                let directory = current.node.as_directory()?;
                check_access(current.node.metadata(), credentials, Access::EXECUTE)?;

                let child = directory.lookup(&current.mount, name)?;
                let mut next = Arc::new(PathNode {
                    mount: current.mount.clone(),
                    node: child,
                    name: name.to_string(),
                    parent: Some(current.clone()),
                });

                // Crossing a mount point switches to the mount's root node.
                if let Some(mount) = ns.mount_at(&next.canonical_path()) {
                    next = Arc::new(PathNode {
                        node: mount.root().clone(),
                        mount,
                        name: name.to_string(),
                        parent: Some(current.clone()),
                    });
                }

                if let Some(link) = next.node.as_symlink() {
                    let follow = !terminal || !flags.contains(ResolveFlags::NO_FOLLOW);
                    if follow {
                        *depth += 1;
                        if *depth > MAX_SYMBOLIC_LINKS {
                            return Err(LxError::LOOP);
                        }

                        let target = link.target(&next.mount)?;
                        // Relative targets resolve from the link's parent
                        // directory; absolute targets restart at the root.
                        let base = if target.starts_with('/') {
                            None
                        } else {
                            Some(current.clone())
                        };
                        next = resolve_at(
                            ns,
                            credentials,
                            base,
                            &target,
                            ResolveFlags::empty(),
                            depth,
                        )?;
                    }
                }

                current = next;
            }
        }
    }

    Ok(current)
}

fn split_parent(path: &str) -> LxResult<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        // "/" or all slashes.
        return Err(LxError::ISDIR);
    }
    if trimmed.len() != path.len() {
        // A trailing slash names a directory; those are not created here.
        return Err(LxError::ISDIR);
    }

    match trimmed.rfind('/') {
        Some(0) => Ok(("/", &trimmed[1..])),
        Some(split) => Ok((&trimmed[..split], &trimmed[split + 1..])),
        None => Ok((".", trimmed)),
    }
}

/// Opens a handle on `path`, translating the `O_*` flags into resolution
/// and driver semantics.
pub fn open(
    ns: &MountNamespace,
    credentials: &Credentials,
    start: Option<Arc<PathNode>>,
    path: &str,
    flags: HandleFlags,
    mode: Mode,
) -> LxResult<Handle> {
    flags.access_mode()?;

    if flags.contains(HandleFlags::CREAT) {
        let (parent_path, name) = split_parent(path)?;
        let parent = resolve(ns, credentials, start, parent_path, ResolveFlags::empty())?;
        let directory = parent.node.as_directory()?;
        check_access(parent.node.metadata(), credentials, Access::WRITE | Access::EXECUTE)?;

        let node = directory.open_node(
            &parent.mount,
            name,
            flags,
            mode,
            credentials.uid,
            credentials.gid,
        )?;
        let path_node = Arc::new(PathNode {
            mount: parent.mount.clone(),
            node,
            name: name.to_string(),
            parent: Some(parent),
        });
        return Handle::open(path_node, flags);
    }

    let resolve_flags = if flags.contains(HandleFlags::NOFOLLOW) {
        ResolveFlags::NO_FOLLOW
    } else {
        ResolveFlags::empty()
    };
    let resolved = resolve(ns, credentials, start, path, resolve_flags)?;

    if resolved.node.node_type() == NodeType::SymbolicLink
        && flags.contains(HandleFlags::NOFOLLOW)
        && !flags.contains(HandleFlags::PATH)
    {
        return Err(LxError::LOOP);
    }

    if !flags.contains(HandleFlags::PATH) {
        let mut needed = Access::empty();
        if flags.readable() {
            needed |= Access::READ;
        }
        if flags.writable() {
            needed |= Access::WRITE;
        }
        check_access(resolved.node.metadata(), credentials, needed)?;

        if flags.contains(HandleFlags::TRUNC) {
            if let Node::File(file) = &resolved.node {
                check_mount_writable(&resolved.mount)?;
                file.set_length(&resolved.mount, 0)?;
            }
        }
    }

    Handle::open(resolved, flags)
}
