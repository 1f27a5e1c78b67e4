//! RootFs: the read-only single-directory file system used as the
//! universal mount anchor.
//!
//! Its root directory is the only node that will ever exist in it. Child
//! creation, linking and unlinking are forbidden outright with `E_PERM`;
//! lookups find nothing.

use std::sync::Arc;

use crate::error::{LxError, LxResult};
use crate::mount_options::{MountFlags, MountOptions};
use crate::param::parse_number;

use super::{
    DirectoryEntry, DirectoryNode, Filesystem, FilesystemId, Gid, Mode, Mount, Node,
    NodeMetadata, NodeOps, NodeType, Uid, check_mount,
};

/// The mount flags RootFs accepts at creation.
const MOUNT_FLAGS: MountFlags = MountFlags::KERNMOUNT
    .union(MountFlags::NOATIME)
    .union(MountFlags::NODIRATIME)
    .union(MountFlags::RDONLY)
    .union(MountFlags::RELATIME)
    .union(MountFlags::SILENT)
    .union(MountFlags::STRICTATIME)
    .union(MountFlags::NOSUID)
    .union(MountFlags::NODEV)
    .union(MountFlags::NOEXEC);

/// The flags a remount may change.
const REMOUNT_FLAGS: MountFlags = MountFlags::REMOUNT.union(MountFlags::RDONLY);

/// Creates a RootFs instance from mount-factory arguments.
///
/// Recognized options: `mode=`, `uid=`, `gid=` seed the root directory's
/// metadata; anything outside [`MOUNT_FLAGS`] is rejected.
pub fn create(_source: &str, flags: MountFlags, data: &[u8]) -> LxResult<Arc<RootFs>> {
    let options = MountOptions::parse(flags, data);
    if !MOUNT_FLAGS.contains(options.flags()) {
        return Err(LxError::INVAL);
    }

    let mut mode: Mode = 0o755;
    let mut uid: Uid = 0;
    let mut gid: Gid = 0;

    if let Some(value) = options.arguments().value("mode") {
        mode = parse_number(value).ok_or(LxError::INVAL)? as Mode & 0o777;
    }
    if let Some(value) = options.arguments().value("uid") {
        uid = parse_number(value).ok_or(LxError::INVAL)? as Uid;
    }
    if let Some(value) = options.arguments().value("gid") {
        gid = parse_number(value).ok_or(LxError::INVAL)? as Gid;
    }

    let id = FilesystemId::next();
    let root = Arc::new(RootDirectory {
        fs: id,
        metadata: NodeMetadata::new(1, NodeType::Directory, mode, uid, gid),
    });

    Ok(Arc::new(RootFs {
        id,
        flags: options.flags() & !MountFlags::PERMOUNT_MASK,
        root,
    }))
}

/// A RootFs instance. Shared by every mount of it.
pub struct RootFs {
    id: FilesystemId,
    flags: MountFlags,
    root: Arc<RootDirectory>,
}

impl std::fmt::Debug for RootFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootFs")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Filesystem for RootFs {
    fn id(&self) -> FilesystemId {
        self.id
    }

    fn flags(&self) -> MountFlags {
        self.flags
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
        // Only the read-only bit may change on remount.
        if !REMOUNT_FLAGS.contains(options.flags()) {
            return Err(LxError::INVAL);
        }
        Ok(options.flags() & MountFlags::RDONLY)
    }
}

struct RootDirectory {
    fs: FilesystemId,
    metadata: NodeMetadata,
}

impl NodeOps for RootDirectory {
    fn filesystem_id(&self) -> FilesystemId {
        self.fs
    }

    fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    fn sync(&self, mount: &Mount) -> LxResult<()> {
        check_mount(mount, self.fs)
    }

    fn sync_data(&self, mount: &Mount) -> LxResult<()> {
        check_mount(mount, self.fs)
    }
}

impl DirectoryNode for RootDirectory {
    fn create_directory(
        &self,
        mount: &Mount,
        _name: &str,
        _mode: Mode,
        _uid: Uid,
        _gid: Gid,
    ) -> LxResult<Node> {
        check_mount(mount, self.fs)?;
        Err(LxError::PERM)
    }

    fn create_file(
        &self,
        mount: &Mount,
        _name: &str,
        _mode: Mode,
        _uid: Uid,
        _gid: Gid,
    ) -> LxResult<Node> {
        check_mount(mount, self.fs)?;
        Err(LxError::PERM)
    }

    fn create_symlink(
        &self,
        mount: &Mount,
        _name: &str,
        _target: &str,
        _uid: Uid,
        _gid: Gid,
    ) -> LxResult<Node> {
        check_mount(mount, self.fs)?;
        Err(LxError::PERM)
    }

    fn link(&self, mount: &Mount, _node: &Node, _name: &str) -> LxResult<()> {
        check_mount(mount, self.fs)?;
        Err(LxError::PERM)
    }

    fn unlink(&self, mount: &Mount, _name: &str) -> LxResult<()> {
        check_mount(mount, self.fs)?;
        Err(LxError::PERM)
    }

    fn lookup(&self, _mount: &Mount, _name: &str) -> LxResult<Node> {
        Err(LxError::NOENT)
    }

    fn enumerate(
        &self,
        mount: &Mount,
        visitor: &mut dyn FnMut(DirectoryEntry<'_>) -> bool,
    ) -> LxResult<()> {
        check_mount(mount, self.fs)?;

        for name in [".", ".."] {
            let keep_going = visitor(DirectoryEntry {
                name,
                index: self.metadata.index(),
                node_type: NodeType::Directory,
            });
            if !keep_going {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount_with(flags: MountFlags, data: &[u8]) -> (Arc<RootFs>, Mount) {
        let fs = create("rootfs", flags, data).unwrap();
        let mount = fs.clone().mount(flags, data).unwrap();
        (fs, mount)
    }

    #[test]
    fn default_root_metadata() {
        let (_fs, mount) = mount_with(MountFlags::RDONLY | MountFlags::NOSUID, b"");
        let meta = mount.root().metadata();

        assert_eq!(meta.mode(), libc::S_IFDIR | 0o755);
        assert_eq!(meta.uid(), 0);
        assert_eq!(meta.gid(), 0);
        assert!(mount.flags().contains(MountFlags::RDONLY));
    }

    #[test]
    fn create_file_is_forbidden() {
        let (_fs, mount) = mount_with(MountFlags::RDONLY | MountFlags::NOSUID, b"");
        let root = mount.root().as_directory().unwrap().clone();

        assert_eq!(
            root.create_file(&mount, "new", 0o644, 0, 0).unwrap_err(),
            LxError::PERM
        );
        assert_eq!(
            root.create_directory(&mount, "dir", 0o755, 0, 0).unwrap_err(),
            LxError::PERM
        );
        assert_eq!(
            root.create_symlink(&mount, "link", "target", 0, 0).unwrap_err(),
            LxError::PERM
        );
        assert_eq!(root.unlink(&mount, "anything").unwrap_err(), LxError::PERM);
    }

    #[test]
    fn lookup_finds_nothing() {
        let (_fs, mount) = mount_with(MountFlags::empty(), b"");
        let root = mount.root().as_directory().unwrap().clone();
        assert_eq!(root.lookup(&mount, "etc").unwrap_err(), LxError::NOENT);
    }

    #[test]
    fn enumerate_yields_dot_and_dotdot() {
        let (_fs, mount) = mount_with(MountFlags::empty(), b"");
        let root = mount.root().as_directory().unwrap().clone();

        let mut names = Vec::new();
        root.enumerate(&mount, &mut |entry| {
            names.push(entry.name.to_string());
            true
        })
        .unwrap();
        assert_eq!(names, vec![".", ".."]);
    }

    #[test]
    fn metadata_options() {
        let (_fs, mount) = mount_with(MountFlags::empty(), b"mode=0700,uid=1000,gid=100");
        let meta = mount.root().metadata();
        assert_eq!(meta.mode(), libc::S_IFDIR | 0o700);
        assert_eq!(meta.uid(), 1000);
        assert_eq!(meta.gid(), 100);
    }

    #[test]
    fn rejects_unsupported_flags() {
        assert_eq!(
            create("rootfs", MountFlags::MANDLOCK, b"").unwrap_err(),
            LxError::INVAL
        );
        assert_eq!(
            create("rootfs", MountFlags::empty(), b"mode=banana").unwrap_err(),
            LxError::INVAL
        );
    }

    #[test]
    fn remount_accepts_read_only_only() {
        let (_fs, mount) = mount_with(MountFlags::empty(), b"");
        assert!(!mount.is_read_only());

        mount
            .remount(MountFlags::REMOUNT | MountFlags::RDONLY, b"")
            .unwrap();
        assert!(mount.is_read_only());

        assert_eq!(
            mount
                .remount(MountFlags::REMOUNT | MountFlags::NOEXEC, b"")
                .unwrap_err(),
            LxError::INVAL
        );
    }

    #[test]
    fn cross_mount_check() {
        let (_fs_a, mount_a) = mount_with(MountFlags::empty(), b"");
        let (_fs_b, mount_b) = mount_with(MountFlags::empty(), b"");
        let root_a = mount_a.root().as_directory().unwrap().clone();

        assert_eq!(
            root_a.create_file(&mount_b, "x", 0o644, 0, 0).unwrap_err(),
            LxError::XDEV
        );
    }
}
