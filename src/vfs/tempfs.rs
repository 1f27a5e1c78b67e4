//! TempFs: an in-memory file system.
//!
//! Node data lives on the heap; quotas bound the total data size and the
//! number of directory entries. This is the writable target the initramfs
//! loader populates, and the general-purpose scratch file system of the
//! virtual machine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{LxError, LxResult};
use crate::mount_options::{MountFlags, MountOptions};
use crate::param::{parse_number, parse_scaled};

use super::{
    DirectoryEntry, DirectoryNode, FileNode, Filesystem, FilesystemId, Gid, Mode, Mount, Node,
    NodeIndex, NodeMetadata, NodeOps, NodeType, SymlinkNode, Uid, check_mount,
    check_mount_writable,
};

const MOUNT_FLAGS: MountFlags = MountFlags::PERMOUNT_MASK
    .union(MountFlags::KERNMOUNT)
    .union(MountFlags::SILENT)
    .union(MountFlags::I_VERSION);

/// Creates a TempFs instance from mount-factory arguments.
///
/// Options: `size=` and `nr_inodes=` set the quotas (scaled integers, zero
/// means unlimited); `mode=`, `uid=`, `gid=` seed the root directory.
pub fn create(_source: &str, flags: MountFlags, data: &[u8]) -> LxResult<Arc<TempFs>> {
    let options = MountOptions::parse(flags, data);
    if !MOUNT_FLAGS.contains(options.flags()) {
        return Err(LxError::INVAL);
    }

    let mut max_size = 0u64;
    let mut max_nodes = 0u64;
    let mut mode: Mode = 0o777;
    let mut uid: Uid = 0;
    let mut gid: Gid = 0;

    if let Some(value) = options.arguments().value("size") {
        max_size = parse_scaled(value).map_err(|_| LxError::INVAL)?;
    }
    if let Some(value) = options.arguments().value("nr_inodes") {
        max_nodes = parse_scaled(value).map_err(|_| LxError::INVAL)?;
    }
    if let Some(value) = options.arguments().value("mode") {
        mode = parse_number(value).ok_or(LxError::INVAL)? as Mode & 0o777;
    }
    if let Some(value) = options.arguments().value("uid") {
        uid = parse_number(value).ok_or(LxError::INVAL)? as Uid;
    }
    if let Some(value) = options.arguments().value("gid") {
        gid = parse_number(value).ok_or(LxError::INVAL)? as Gid;
    }

    let inner = Arc::new(TempFsInner {
        id: FilesystemId::next(),
        flags: options.flags() & !MountFlags::PERMOUNT_MASK,
        max_size: AtomicU64::new(max_size),
        max_nodes: AtomicU64::new(max_nodes),
        size: AtomicU64::new(0),
        nodes: AtomicU64::new(0),
        next_index: AtomicI64::new(1),
    });

    inner.charge_node()?;
    let root = Arc::new(TempFsDirectory {
        fs: inner.clone(),
        metadata: NodeMetadata::new(inner.allocate_index(), NodeType::Directory, mode, uid, gid),
        children: RwLock::new(BTreeMap::new()),
    });

    Ok(Arc::new(TempFs { inner, root }))
}

struct TempFsInner {
    id: FilesystemId,
    flags: MountFlags,
    max_size: AtomicU64,
    max_nodes: AtomicU64,
    size: AtomicU64,
    nodes: AtomicU64,
    next_index: AtomicI64,
}

impl TempFsInner {
    fn allocate_index(&self) -> NodeIndex {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves one directory entry against the node quota.
    fn charge_node(&self) -> LxResult<()> {
        let max = self.max_nodes.load(Ordering::Relaxed);
        let nodes = self.nodes.fetch_add(1, Ordering::Relaxed) + 1;
        if max != 0 && nodes > max {
            self.nodes.fetch_sub(1, Ordering::Relaxed);
            return Err(LxError::NOMEM);
        }
        Ok(())
    }

    fn release_node(&self) {
        self.nodes.fetch_sub(1, Ordering::Relaxed);
    }

    /// Reserves bytes of file data against the size quota.
    fn charge_bytes(&self, count: u64) -> LxResult<()> {
        let max = self.max_size.load(Ordering::Relaxed);
        let size = self.size.fetch_add(count, Ordering::Relaxed) + count;
        if max != 0 && size > max {
            self.size.fetch_sub(count, Ordering::Relaxed);
            return Err(LxError::NOMEM);
        }
        Ok(())
    }

    fn release_bytes(&self, count: u64) {
        self.size.fetch_sub(count, Ordering::Relaxed);
    }
}

/// A TempFs instance.
pub struct TempFs {
    inner: Arc<TempFsInner>,
    root: Arc<TempFsDirectory>,
}

impl std::fmt::Debug for TempFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempFs")
            .field("id", &self.inner.id)
            .field("nodes", &self.inner.nodes.load(Ordering::Relaxed))
            .field("size", &self.inner.size.load(Ordering::Relaxed))
            .finish()
    }
}

impl Filesystem for TempFs {
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

        let root = Node::Directory(self.root.clone());
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

        if let Some(value) = options.arguments().value("size") {
            let max = parse_scaled(value).map_err(|_| LxError::INVAL)?;
            self.inner.max_size.store(max, Ordering::Relaxed);
        }
        if let Some(value) = options.arguments().value("nr_inodes") {
            let max = parse_scaled(value).map_err(|_| LxError::INVAL)?;
            self.inner.max_nodes.store(max, Ordering::Relaxed);
        }

        Ok(options.flags() & MountFlags::PERMOUNT_MASK)
    }
}

struct TempFsDirectory {
    fs: Arc<TempFsInner>,
    metadata: NodeMetadata,
    children: RwLock<BTreeMap<String, Node>>,
}

impl TempFsDirectory {
    /// Validates the mount and the write path for a mutating operation.
    fn begin_mutation(&self, mount: &Mount) -> LxResult<()> {
        check_mount(mount, self.fs.id)?;
        check_mount_writable(mount)
    }

    fn insert_child(&self, name: &str, node: Node) -> LxResult<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(LxError::INVAL);
        }
        let mut children = self.children.write();
        if children.contains_key(name) {
            return Err(LxError::EXIST);
        }
        children.insert(name.to_string(), node);
        self.metadata.touch_modified();
        Ok(())
    }
}

impl NodeOps for TempFsDirectory {
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

impl DirectoryNode for TempFsDirectory {
    fn create_directory(
        &self,
        mount: &Mount,
        name: &str,
        mode: Mode,
        uid: Uid,
        gid: Gid,
    ) -> LxResult<Node> {
        self.begin_mutation(mount)?;
        self.fs.charge_node()?;

        let child = Arc::new(TempFsDirectory {
            fs: self.fs.clone(),
            metadata: NodeMetadata::new(self.fs.allocate_index(), NodeType::Directory, mode, uid, gid),
            children: RwLock::new(BTreeMap::new()),
        });
        let node = Node::Directory(child);

        match self.insert_child(name, node.clone()) {
            Ok(()) => Ok(node),
            Err(err) => {
                self.fs.release_node();
                Err(err)
            }
        }
    }

    fn create_file(
        &self,
        mount: &Mount,
        name: &str,
        mode: Mode,
        uid: Uid,
        gid: Gid,
    ) -> LxResult<Node> {
        self.begin_mutation(mount)?;
        self.fs.charge_node()?;

        let child = Arc::new(TempFsFile {
            fs: self.fs.clone(),
            metadata: NodeMetadata::new(self.fs.allocate_index(), NodeType::File, mode, uid, gid),
            data: RwLock::new(Vec::new()),
        });
        let node = Node::File(child);

        match self.insert_child(name, node.clone()) {
            Ok(()) => Ok(node),
            Err(err) => {
                self.fs.release_node();
                Err(err)
            }
        }
    }

    fn create_symlink(
        &self,
        mount: &Mount,
        name: &str,
        target: &str,
        uid: Uid,
        gid: Gid,
    ) -> LxResult<Node> {
        self.begin_mutation(mount)?;
        self.fs.charge_node()?;

        let child = Arc::new(TempFsSymlink {
            fs: self.fs.clone(),
            metadata: NodeMetadata::new(
                self.fs.allocate_index(),
                NodeType::SymbolicLink,
                0o777,
                uid,
                gid,
            ),
            target: target.to_string(),
        });
        let node = Node::SymbolicLink(child);

        match self.insert_child(name, node.clone()) {
            Ok(()) => Ok(node),
            Err(err) => {
                self.fs.release_node();
                Err(err)
            }
        }
    }

    fn link(&self, mount: &Mount, node: &Node, name: &str) -> LxResult<()> {
        self.begin_mutation(mount)?;
        check_mount(mount, node.filesystem_id())?;
        if node.node_type() == NodeType::Directory {
            return Err(LxError::PERM);
        }

        self.fs.charge_node()?;
        match self.insert_child(name, node.clone()) {
            Ok(()) => {
                node.metadata().touch_ctime();
                Ok(())
            }
            Err(err) => {
                self.fs.release_node();
                Err(err)
            }
        }
    }

    fn unlink(&self, mount: &Mount, name: &str) -> LxResult<()> {
        self.begin_mutation(mount)?;

        let mut children = self.children.write();
        let node = children.get(name).ok_or(LxError::NOENT)?;

        if let Node::Directory(dir) = node {
            let dir = dir.clone();
            drop(children);

            let mut has_children = false;
            dir.enumerate(mount, &mut |entry| {
                if entry.name != "." && entry.name != ".." {
                    has_children = true;
                    return false;
                }
                true
            })?;
            if has_children {
                return Err(LxError::NOTEMPTY);
            }
            self.children.write().remove(name).ok_or(LxError::NOENT)?;
        } else {
            children.remove(name);
            drop(children);
        }

        self.fs.release_node();
        self.metadata.touch_modified();
        Ok(())
    }

    fn lookup(&self, mount: &Mount, name: &str) -> LxResult<Node> {
        check_mount(mount, self.fs.id)?;
        self.children
            .read()
            .get(name)
            .cloned()
            .ok_or(LxError::NOENT)
    }

    fn enumerate(
        &self,
        mount: &Mount,
        visitor: &mut dyn FnMut(DirectoryEntry<'_>) -> bool,
    ) -> LxResult<()> {
        check_mount(mount, self.fs.id)?;

        let own_index = self.metadata.index();
        for name in [".", ".."] {
            if !visitor(DirectoryEntry {
                name,
                index: own_index,
                node_type: NodeType::Directory,
            }) {
                return Ok(());
            }
        }

        for (name, node) in self.children.read().iter() {
            let entry = DirectoryEntry {
                name,
                index: node.metadata().index(),
                node_type: node.node_type(),
            };
            if !visitor(entry) {
                break;
            }
        }

        self.metadata.update_atime(mount.flags());
        Ok(())
    }
}

struct TempFsFile {
    fs: Arc<TempFsInner>,
    metadata: NodeMetadata,
    data: RwLock<Vec<u8>>,
}

impl Drop for TempFsFile {
    fn drop(&mut self) {
        self.fs.release_bytes(self.data.read().len() as u64);
    }
}

impl NodeOps for TempFsFile {
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

impl FileNode for TempFsFile {
    fn read_at(&self, mount: &Mount, offset: u64, buffer: &mut [u8]) -> LxResult<usize> {
        check_mount(mount, self.fs.id)?;

        let data = self.data.read();
        let offset = offset.min(data.len() as u64) as usize;
        let count = buffer.len().min(data.len() - offset);
        buffer[..count].copy_from_slice(&data[offset..offset + count]);
        Ok(count)
    }

    fn write_at(&self, mount: &Mount, offset: u64, buffer: &[u8]) -> LxResult<usize> {
        check_mount(mount, self.fs.id)?;
        check_mount_writable(mount)?;

        let mut data = self.data.write();
        let end = offset as usize + buffer.len();
        if end > data.len() {
            self.fs.charge_bytes((end - data.len()) as u64)?;
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buffer);
        Ok(buffer.len())
    }

    fn length(&self, mount: &Mount) -> LxResult<u64> {
        check_mount(mount, self.fs.id)?;
        Ok(self.data.read().len() as u64)
    }

    fn set_length(&self, mount: &Mount, length: u64) -> LxResult<u64> {
        check_mount(mount, self.fs.id)?;
        check_mount_writable(mount)?;

        let mut data = self.data.write();
        let current = data.len() as u64;
        if length > current {
            self.fs.charge_bytes(length - current)?;
        } else {
            self.fs.release_bytes(current - length);
        }
        data.resize(length as usize, 0);
        Ok(length)
    }
}

struct TempFsSymlink {
    fs: Arc<TempFsInner>,
    metadata: NodeMetadata,
    target: String,
}

impl NodeOps for TempFsSymlink {
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

impl SymlinkNode for TempFsSymlink {
    fn target(&self, mount: &Mount) -> LxResult<String> {
        check_mount(mount, self.fs.id)?;
        Ok(self.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{Handle, HandleFlags, Whence};

    fn mounted(data: &[u8]) -> Mount {
        let fs = create("tmpfs", MountFlags::empty(), data).unwrap();
        fs.mount(MountFlags::empty(), data).unwrap()
    }

    fn root_of(mount: &Mount) -> Arc<dyn DirectoryNode> {
        mount.root().as_directory().unwrap().clone()
    }

    #[test]
    fn create_and_lookup() {
        let mount = mounted(b"");
        let root = root_of(&mount);

        root.create_directory(&mount, "etc", 0o755, 0, 0).unwrap();
        root.create_file(&mount, "data", 0o644, 0, 0).unwrap();

        assert_eq!(
            root.lookup(&mount, "etc").unwrap().node_type(),
            NodeType::Directory
        );
        assert_eq!(
            root.lookup(&mount, "data").unwrap().node_type(),
            NodeType::File
        );
        assert_eq!(root.lookup(&mount, "gone").unwrap_err(), LxError::NOENT);
    }

    #[test]
    fn duplicate_names_collide() {
        let mount = mounted(b"");
        let root = root_of(&mount);
        root.create_file(&mount, "x", 0o644, 0, 0).unwrap();
        assert_eq!(
            root.create_file(&mount, "x", 0o644, 0, 0).unwrap_err(),
            LxError::EXIST
        );
    }

    #[test]
    fn file_read_write() {
        let mount = mounted(b"");
        let root = root_of(&mount);
        let node = root.create_file(&mount, "f", 0o644, 0, 0).unwrap();
        let file = node.as_file().unwrap();

        assert_eq!(file.write_at(&mount, 0, b"hello world").unwrap(), 11);
        assert_eq!(file.length(&mount).unwrap(), 11);

        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(&mount, 6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");

        // Writes past the end zero-fill the gap.
        file.write_at(&mount, 16, b"!").unwrap();
        assert_eq!(file.length(&mount).unwrap(), 17);
        let mut buf = [0xAAu8; 6];
        assert_eq!(file.read_at(&mount, 11, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"\0\0\0\0\0!");
    }

    #[test]
    fn unlink_nonempty_directory_fails() {
        let mount = mounted(b"");
        let root = root_of(&mount);
        let dir_node = root.create_directory(&mount, "d", 0o755, 0, 0).unwrap();
        let dir = dir_node.as_directory().unwrap();
        dir.create_file(&mount, "inner", 0o644, 0, 0).unwrap();

        assert_eq!(root.unlink(&mount, "d").unwrap_err(), LxError::NOTEMPTY);
        dir.unlink(&mount, "inner").unwrap();
        root.unlink(&mount, "d").unwrap();
        assert_eq!(root.lookup(&mount, "d").unwrap_err(), LxError::NOENT);
    }

    #[test]
    fn hard_links_share_content() {
        let mount = mounted(b"");
        let root = root_of(&mount);
        let node = root.create_file(&mount, "orig", 0o644, 0, 0).unwrap();
        root.link(&mount, &node, "alias").unwrap();

        node.as_file()
            .unwrap()
            .write_at(&mount, 0, b"shared")
            .unwrap();

        let alias = root.lookup(&mount, "alias").unwrap();
        let mut buf = [0u8; 6];
        alias.as_file().unwrap().read_at(&mount, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");
        assert_eq!(alias.metadata().index(), node.metadata().index());
    }

    #[test]
    fn node_quota() {
        let mount = mounted(b"nr_inodes=2");
        let root = root_of(&mount);
        // The root itself consumed one of the two.
        root.create_file(&mount, "one", 0o644, 0, 0).unwrap();
        assert_eq!(
            root.create_file(&mount, "two", 0o644, 0, 0).unwrap_err(),
            LxError::NOMEM
        );
    }

    #[test]
    fn size_quota() {
        let mount = mounted(b"size=16");
        let root = root_of(&mount);
        let node = root.create_file(&mount, "f", 0o644, 0, 0).unwrap();
        let file = node.as_file().unwrap();

        file.write_at(&mount, 0, &[1u8; 16]).unwrap();
        assert_eq!(file.write_at(&mount, 16, &[1u8; 1]).unwrap_err(), LxError::NOMEM);

        // Shrinking gives the space back.
        file.set_length(&mount, 0).unwrap();
        file.write_at(&mount, 0, &[2u8; 8]).unwrap();
    }

    #[test]
    fn read_only_mount_rejects_writes() {
        let fs = create("tmpfs", MountFlags::empty(), b"").unwrap();
        let rw = fs.clone().mount(MountFlags::empty(), b"").unwrap();
        let root = root_of(&rw);
        let node = root.create_file(&rw, "f", 0o644, 0, 0).unwrap();

        let ro = fs.mount(MountFlags::RDONLY, b"").unwrap();
        assert_eq!(
            node.as_file().unwrap().write_at(&ro, 0, b"x").unwrap_err(),
            LxError::ROFS
        );
        assert_eq!(
            root.create_file(&ro, "g", 0o644, 0, 0).unwrap_err(),
            LxError::ROFS
        );
        // The same node remains writable through the read-write mount.
        node.as_file().unwrap().write_at(&rw, 0, b"x").unwrap();
    }

    #[test]
    fn symlink_target() {
        let mount = mounted(b"");
        let root = root_of(&mount);
        let node = root
            .create_symlink(&mount, "l", "/etc/passwd", 0, 0)
            .unwrap();
        let link = node.as_symlink().unwrap();
        assert_eq!(link.target(&mount).unwrap(), "/etc/passwd");
    }

    #[test]
    fn enumerate_lists_children_sorted() {
        let mount = mounted(b"");
        let root = root_of(&mount);
        root.create_file(&mount, "b", 0o644, 0, 0).unwrap();
        root.create_file(&mount, "a", 0o644, 0, 0).unwrap();

        let mut names = Vec::new();
        root.enumerate(&mount, &mut |entry| {
            names.push(entry.name.to_string());
            true
        })
        .unwrap();
        assert_eq!(names, vec![".", "..", "a", "b"]);
    }

    #[test]
    fn handles_share_cursor_on_duplicate() {
        let mount = mounted(b"");
        let root = root_of(&mount);
        let node = root.create_file(&mount, "f", 0o644, 0, 0).unwrap();
        node.as_file().unwrap().write_at(&mount, 0, b"0123456789").unwrap();

        let mount = Arc::new(mount);
        let path = Arc::new(crate::vfs::path::PathNode {
            mount: mount.clone(),
            node,
            name: "f".to_string(),
            parent: None,
        });

        let flags = HandleFlags::from_bits_retain(libc::O_RDWR as u32 | libc::O_CLOEXEC as u32);
        let handle = Handle::open(path, flags).unwrap();
        let dup = handle.duplicate();

        // Cursor is shared; CLOEXEC is dropped on the copy.
        handle.seek(4, Whence::Set).unwrap();
        assert_eq!(dup.position(), 4);
        assert!(!dup.flags().contains(HandleFlags::CLOEXEC));
        assert!(handle.flags().contains(HandleFlags::CLOEXEC));

        let mut buf = [0u8; 2];
        dup.read(&mut buf).unwrap();
        assert_eq!(&buf, b"45");
        assert_eq!(handle.position(), 6);

        // Seek relative to the end resolves against the file length.
        assert_eq!(handle.seek(-2, Whence::End).unwrap(), 8);
        assert_eq!(handle.seek(-20, Whence::End).unwrap_err(), LxError::INVAL);
    }
}
