//! HostFs: projects a subtree of the host's file system into the guest.
//!
//! Node metadata is queried live from the host on every access; the mode is
//! synthesized as `S_IFDIR|0777` or `S_IFREG|0777` because the driver
//! carries no ownership mapping. With the `sandbox` option (the default)
//! every resolved host path must stay inside the source subtree; anything
//! that escapes, including through host symbolic links, reads as absent.

use std::fs;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{LxError, LxResult};
use crate::mount_options::{MountFlags, MountOptions};

use super::{
    DirectoryEntry, DirectoryNode, FileNode, Filesystem, FilesystemId, Gid, Mode, Mount, Node,
    NodeMetadata, NodeOps, NodeType, SymlinkNode, Timestamp, Uid, check_mount,
    check_mount_writable,
};

const MOUNT_FLAGS: MountFlags = MountFlags::PERMOUNT_MASK
    .union(MountFlags::KERNMOUNT)
    .union(MountFlags::SILENT);

/// Creates a HostFs instance projecting the `source` directory.
///
/// Options: `sandbox` (default) confines resolution to the source subtree;
/// `nosandbox` lifts the containment check.
pub fn create(source: &str, flags: MountFlags, data: &[u8]) -> LxResult<Arc<HostFs>> {
    let options = MountOptions::parse(flags, data);
    if !MOUNT_FLAGS.contains(options.flags()) {
        return Err(LxError::INVAL);
    }

    let mut sandbox = true;
    if options.arguments().contains("sandbox") {
        sandbox = true;
    }
    if options.arguments().contains("nosandbox") {
        sandbox = false;
    }

    let root = fs::canonicalize(source).map_err(LxError::from_host)?;
    if !fs::metadata(&root).map_err(LxError::from_host)?.is_dir() {
        return Err(LxError::NOTDIR);
    }

    let inner = Arc::new(HostFsInner {
        id: FilesystemId::next(),
        flags: options.flags() & !MountFlags::PERMOUNT_MASK,
        root,
        sandbox,
    });

    Ok(Arc::new(HostFs { inner }))
}

struct HostFsInner {
    id: FilesystemId,
    flags: MountFlags,
    root: PathBuf,
    sandbox: bool,
}

impl HostFsInner {
    /// Joins a child name onto a host directory, applying the sandbox
    /// containment rule. Escapes are indistinguishable from absent names.
    fn resolve_child(&self, parent: &Path, name: &str) -> LxResult<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(LxError::INVAL);
        }

        let candidate = parent.join(name);
        if self.sandbox {
            // Containment is checked against the canonical host path, so a
            // symbolic link pointing out of the subtree cannot escape.
            if let Ok(canonical) = fs::canonicalize(&candidate) {
                if !canonical.starts_with(&self.root) {
                    return Err(LxError::NOENT);
                }
            }
        }
        Ok(candidate)
    }

    fn node_for(self: &Arc<Self>, host_path: PathBuf) -> LxResult<Node> {
        let inner = self;
        let meta = fs::metadata(&host_path).map_err(LxError::from_host)?;
        let index = meta.ino() as i64;

        if meta.is_dir() {
            Ok(Node::Directory(Arc::new(HostFsDirectory {
                fs: inner.clone(),
                metadata: NodeMetadata::new(index, NodeType::Directory, 0o777, 0, 0),
                host_path,
            })))
        } else if meta.is_file() {
            Ok(Node::File(Arc::new(HostFsFile {
                fs: inner.clone(),
                metadata: NodeMetadata::new(index, NodeType::File, 0o777, 0, 0),
                host_path,
            })))
        } else {
            // Sockets, devices and the like are not projected.
            Err(LxError::OPNOTSUPP)
        }
    }
}

/// A HostFs instance.
pub struct HostFs {
    inner: Arc<HostFsInner>,
}

impl std::fmt::Debug for HostFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFs")
            .field("id", &self.inner.id)
            .field("root", &self.inner.root)
            .field("sandbox", &self.inner.sandbox)
            .finish()
    }
}

impl Filesystem for HostFs {
    fn id(&self) -> FilesystemId {
        self.inner.id
    }

    fn flags(&self) -> MountFlags {
        self.inner.flags
    }

    fn mount(self: Arc<Self>, flags: MountFlags, data: &[u8]) -> LxResult<Mount> {
        let options = MountOptions::parse(flags, data);
        if !MOUNT_FLAGS.contains(options.flags()) {
            return Err(LxError::INVAL);
        }

        let root = self.inner.node_for(self.inner.root.clone())?;
        Ok(Mount::new(self, root, options.flags()))
    }

    fn remount(&self, flags: MountFlags, data: &[u8]) -> LxResult<MountFlags> {
        let options = MountOptions::parse(flags, data);
        if !MOUNT_FLAGS
            .union(MountFlags::REMOUNT)
            .contains(options.flags())
        {
            return Err(LxError::INVAL);
        }
        Ok(options.flags() & MountFlags::PERMOUNT_MASK)
    }
}

fn host_timestamp(secs: i64, nanos: i64) -> Timestamp {
    Timestamp(secs.saturating_mul(1_000_000_000).saturating_add(nanos))
}

/// Refreshes the cached scalar metadata from a live host stat.
fn refresh_times(metadata: &NodeMetadata, host_path: &Path) {
    if let Ok(meta) = fs::metadata(host_path) {
        metadata.load_times(
            host_timestamp(meta.atime(), meta.atime_nsec()),
            host_timestamp(meta.mtime(), meta.mtime_nsec()),
            host_timestamp(meta.ctime(), meta.ctime_nsec()),
        );
    }
}

struct HostFsDirectory {
    fs: Arc<HostFsInner>,
    metadata: NodeMetadata,
    host_path: PathBuf,
}

impl NodeOps for HostFsDirectory {
    fn filesystem_id(&self) -> FilesystemId {
        self.fs.id
    }

    fn metadata(&self) -> &NodeMetadata {
        refresh_times(&self.metadata, &self.host_path);
        &self.metadata
    }

    fn sync(&self, mount: &Mount) -> LxResult<()> {
        check_mount(mount, self.fs.id)?;
        let dir = fs::File::open(&self.host_path).map_err(LxError::from_host)?;
        dir.sync_all().map_err(LxError::from_host)
    }

    fn sync_data(&self, mount: &Mount) -> LxResult<()> {
        self.sync(mount)
    }
}

impl DirectoryNode for HostFsDirectory {
    fn create_directory(
        &self,
        mount: &Mount,
        name: &str,
        _mode: Mode,
        _uid: Uid,
        _gid: Gid,
    ) -> LxResult<Node> {
        check_mount(mount, self.fs.id)?;
        check_mount_writable(mount)?;

        let path = self.fs.resolve_child(&self.host_path, name)?;
        fs::create_dir(&path).map_err(LxError::from_host)?;
        self.fs.node_for(path)
    }

    fn create_file(
        &self,
        mount: &Mount,
        name: &str,
        _mode: Mode,
        _uid: Uid,
        _gid: Gid,
    ) -> LxResult<Node> {
        check_mount(mount, self.fs.id)?;
        check_mount_writable(mount)?;

        let path = self.fs.resolve_child(&self.host_path, name)?;
        fs::File::options()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(LxError::from_host)?;
        self.fs.node_for(path)
    }

    fn create_symlink(
        &self,
        mount: &Mount,
        name: &str,
        target: &str,
        _uid: Uid,
        _gid: Gid,
    ) -> LxResult<Node> {
        check_mount(mount, self.fs.id)?;
        check_mount_writable(mount)?;

        let path = self.fs.resolve_child(&self.host_path, name)?;
        std::os::unix::fs::symlink(target, &path).map_err(LxError::from_host)?;

        let meta = fs::symlink_metadata(&path).map_err(LxError::from_host)?;
        Ok(Node::SymbolicLink(Arc::new(HostFsSymlink {
            fs: self.fs.clone(),
            metadata: NodeMetadata::new(meta.ino() as i64, NodeType::SymbolicLink, 0o777, 0, 0),
            host_path: path,
        })))
    }

    fn link(&self, mount: &Mount, node: &Node, name: &str) -> LxResult<()> {
        check_mount(mount, self.fs.id)?;
        check_mount_writable(mount)?;
        check_mount(mount, node.filesystem_id())?;
        let _ = name;

        // Hard links would need the source node's host path, which the node
        // contract does not expose.
        Err(LxError::OPNOTSUPP)
    }

    fn unlink(&self, mount: &Mount, name: &str) -> LxResult<()> {
        check_mount(mount, self.fs.id)?;
        check_mount_writable(mount)?;

        let path = self.fs.resolve_child(&self.host_path, name)?;
        let meta = fs::symlink_metadata(&path).map_err(LxError::from_host)?;
        if meta.is_dir() {
            fs::remove_dir(&path).map_err(LxError::from_host)
        } else {
            fs::remove_file(&path).map_err(LxError::from_host)
        }
    }

    fn lookup(&self, mount: &Mount, name: &str) -> LxResult<Node> {
        check_mount(mount, self.fs.id)?;

        let path = self.fs.resolve_child(&self.host_path, name)?;
        if !fs::exists(&path).map_err(LxError::from_host)? {
            return Err(LxError::NOENT);
        }
        self.fs.node_for(path)
    }

    fn enumerate(
        &self,
        mount: &Mount,
        visitor: &mut dyn FnMut(DirectoryEntry<'_>) -> bool,
    ) -> LxResult<()> {
        check_mount(mount, self.fs.id)?;

        for name in [".", ".."] {
            if !visitor(DirectoryEntry {
                name,
                index: self.metadata.index(),
                node_type: NodeType::Directory,
            }) {
                return Ok(());
            }
        }

        for entry in fs::read_dir(&self.host_path).map_err(LxError::from_host)? {
            let entry = entry.map_err(LxError::from_host)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            let node_type = match entry.metadata() {
                Ok(meta) if meta.is_dir() => NodeType::Directory,
                Ok(meta) if meta.is_file() => NodeType::File,
                _ => continue,
            };
            let index = entry.metadata().map(|m| m.ino() as i64).unwrap_or(0);

            if !visitor(DirectoryEntry {
                name,
                index,
                node_type,
            }) {
                break;
            }
        }
        Ok(())
    }
}

struct HostFsFile {
    fs: Arc<HostFsInner>,
    metadata: NodeMetadata,
    host_path: PathBuf,
}

impl NodeOps for HostFsFile {
    fn filesystem_id(&self) -> FilesystemId {
        self.fs.id
    }

    fn metadata(&self) -> &NodeMetadata {
        refresh_times(&self.metadata, &self.host_path);
        &self.metadata
    }

    fn sync(&self, mount: &Mount) -> LxResult<()> {
        check_mount(mount, self.fs.id)?;
        let file = fs::File::open(&self.host_path).map_err(LxError::from_host)?;
        file.sync_all().map_err(LxError::from_host)
    }

    fn sync_data(&self, mount: &Mount) -> LxResult<()> {
        check_mount(mount, self.fs.id)?;
        let file = fs::File::open(&self.host_path).map_err(LxError::from_host)?;
        file.sync_data().map_err(LxError::from_host)
    }
}

impl FileNode for HostFsFile {
    fn read_at(&self, mount: &Mount, offset: u64, buffer: &mut [u8]) -> LxResult<usize> {
        check_mount(mount, self.fs.id)?;

        let file = fs::File::open(&self.host_path).map_err(LxError::from_host)?;
        let mut total = 0;
        while total < buffer.len() {
            match file.read_at(&mut buffer[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(LxError::from_host(err)),
            }
        }
        Ok(total)
    }

    fn write_at(&self, mount: &Mount, offset: u64, buffer: &[u8]) -> LxResult<usize> {
        check_mount(mount, self.fs.id)?;
        check_mount_writable(mount)?;

        let file = fs::File::options()
            .write(true)
            .open(&self.host_path)
            .map_err(LxError::from_host)?;
        file.write_all_at(buffer, offset).map_err(LxError::from_host)?;
        Ok(buffer.len())
    }

    fn length(&self, mount: &Mount) -> LxResult<u64> {
        check_mount(mount, self.fs.id)?;
        Ok(fs::metadata(&self.host_path)
            .map_err(LxError::from_host)?
            .len())
    }

    fn set_length(&self, mount: &Mount, length: u64) -> LxResult<u64> {
        check_mount(mount, self.fs.id)?;
        check_mount_writable(mount)?;

        let file = fs::File::options()
            .write(true)
            .open(&self.host_path)
            .map_err(LxError::from_host)?;
        file.set_len(length).map_err(LxError::from_host)?;
        Ok(length)
    }
}

struct HostFsSymlink {
    fs: Arc<HostFsInner>,
    metadata: NodeMetadata,
    host_path: PathBuf,
}

impl NodeOps for HostFsSymlink {
    fn filesystem_id(&self) -> FilesystemId {
        self.fs.id
    }

    fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    fn sync(&self, mount: &Mount) -> LxResult<()> {
        check_mount(mount, self.fs.id)
    }

    fn sync_data(&self, mount: &Mount) -> LxResult<()> {
        check_mount(mount, self.fs.id)
    }
}

impl SymlinkNode for HostFsSymlink {
    fn target(&self, mount: &Mount) -> LxResult<String> {
        check_mount(mount, self.fs.id)?;
        let target = fs::read_link(&self.host_path).map_err(LxError::from_host)?;
        Ok(target.to_string_lossy().into_owned())
    }
}
