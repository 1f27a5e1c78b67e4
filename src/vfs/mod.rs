//! Virtual file system contracts.
//!
//! A file system driver produces a [`Mount`]; a mount exposes its flags and
//! the root [`Node`]. Nodes are a tagged sum over the capability traits
//! ([`DirectoryNode`], [`FileNode`], [`SymlinkNode`], plus the plain
//! [`NodeOps`] base for device/pipe/socket nodes) rather than a class
//! hierarchy: a new driver adds variants, not subclasses. A [`Handle`] is an
//! open reference with shared cursor state and per-descriptor flags.
//!
//! Nodes never point back at mounts; every node operation receives the
//! mount it is being performed through and validates that the mount belongs
//! to the node's file system.

mod handle;
pub mod path;
pub mod rootfs;
pub mod tempfs;
pub mod hostfs;

pub use handle::{Handle, Whence};

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::capability::{Capability, capability_check};
use crate::error::{LxError, LxResult};
use crate::mount_options::MountFlags;

/// Maximum recursion depth of symbolic-link resolution.
pub const MAX_SYMBOLIC_LINKS: usize = 40;

pub type Uid = u32;
pub type Gid = u32;
pub type Mode = u32;
pub type NodeIndex = i64;

/// Identity of the caller performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
}

impl Credentials {
    pub const fn root() -> Credentials {
        Credentials { uid: 0, gid: 0 }
    }
}

/// The `S_IFxxx` node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    BlockDevice,
    CharacterDevice,
    Directory,
    File,
    Pipe,
    Socket,
    SymbolicLink,
}

impl NodeType {
    /// The `S_IFMT` bits for this type.
    pub fn mode_bits(self) -> Mode {
        match self {
            NodeType::BlockDevice => libc::S_IFBLK,
            NodeType::CharacterDevice => libc::S_IFCHR,
            NodeType::Directory => libc::S_IFDIR,
            NodeType::File => libc::S_IFREG,
            NodeType::Pipe => libc::S_IFIFO,
            NodeType::Socket => libc::S_IFSOCK,
            NodeType::SymbolicLink => libc::S_IFLNK,
        }
    }

    pub fn from_mode(mode: Mode) -> Option<NodeType> {
        match mode & libc::S_IFMT {
            libc::S_IFBLK => Some(NodeType::BlockDevice),
            libc::S_IFCHR => Some(NodeType::CharacterDevice),
            libc::S_IFDIR => Some(NodeType::Directory),
            libc::S_IFREG => Some(NodeType::File),
            libc::S_IFIFO => Some(NodeType::Pipe),
            libc::S_IFSOCK => Some(NodeType::Socket),
            libc::S_IFLNK => Some(NodeType::SymbolicLink),
            _ => None,
        }
    }
}

/// Process-unique identity of a file system instance, used to verify that
/// a mount and a node belong together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilesystemId(u64);

impl FilesystemId {
    pub fn next() -> FilesystemId {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        FilesystemId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A mountable file system instance.
pub trait Filesystem: Send + Sync {
    fn id(&self) -> FilesystemId;

    /// File-system-level flags (the non-per-mount half of the word).
    fn flags(&self) -> MountFlags;

    /// Creates a mount of this file system.
    fn mount(self: Arc<Self>, flags: MountFlags, data: &[u8]) -> LxResult<Mount>;

    /// Validates a remount request, returning the new per-mount flags.
    fn remount(&self, flags: MountFlags, data: &[u8]) -> LxResult<MountFlags>;
}

/// Nanosecond-resolution wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const DAY: i64 = 86_400 * 1_000_000_000;

    pub fn now() -> Timestamp {
        let nanos = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_nanos() as i64,
            Err(before) => -(before.duration().as_nanos() as i64),
        };
        Timestamp(nanos)
    }
}

/// The metadata scalars shared by every node implementation.
///
/// Each field is individually atomic; no invariant couples two fields, and
/// the change time is folded into every setter.
#[derive(Debug)]
pub struct NodeMetadata {
    index: NodeIndex,
    node_type: NodeType,
    mode: AtomicU32,
    uid: AtomicU32,
    gid: AtomicU32,
    atime: AtomicI64,
    ctime: AtomicI64,
    mtime: AtomicI64,
}

impl NodeMetadata {
    /// Creates metadata with all three timestamps set to now. The type bits
    /// of `mode` are replaced by `node_type` and fixed for the node's life.
    pub fn new(index: NodeIndex, node_type: NodeType, mode: Mode, uid: Uid, gid: Gid) -> Self {
        let now = Timestamp::now().0;
        NodeMetadata {
            index,
            node_type,
            mode: AtomicU32::new((mode & !libc::S_IFMT) | node_type.mode_bits()),
            uid: AtomicU32::new(uid),
            gid: AtomicU32::new(gid),
            atime: AtomicI64::new(now),
            ctime: AtomicI64::new(now),
            mtime: AtomicI64::new(now),
        }
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Type and permission bits.
    pub fn mode(&self) -> Mode {
        self.mode.load(Ordering::Relaxed)
    }

    pub fn uid(&self) -> Uid {
        self.uid.load(Ordering::Relaxed)
    }

    pub fn gid(&self) -> Gid {
        self.gid.load(Ordering::Relaxed)
    }

    pub fn atime(&self) -> Timestamp {
        Timestamp(self.atime.load(Ordering::Relaxed))
    }

    pub fn ctime(&self) -> Timestamp {
        Timestamp(self.ctime.load(Ordering::Relaxed))
    }

    pub fn mtime(&self) -> Timestamp {
        Timestamp(self.mtime.load(Ordering::Relaxed))
    }

    /// Replaces the permission bits; the type bits cannot change.
    pub fn set_mode(&self, mode: Mode) {
        self.mode.store(
            (mode & !libc::S_IFMT) | self.node_type.mode_bits(),
            Ordering::Relaxed,
        );
        self.touch_ctime();
    }

    pub fn set_uid(&self, uid: Uid) {
        self.uid.store(uid, Ordering::Relaxed);
        self.touch_ctime();
    }

    pub fn set_gid(&self, gid: Gid) {
        self.gid.store(gid, Ordering::Relaxed);
        self.touch_ctime();
    }

    pub fn set_atime(&self, time: Timestamp) {
        self.atime.store(time.0, Ordering::Relaxed);
        self.touch_ctime();
    }

    pub fn set_mtime(&self, time: Timestamp) {
        self.mtime.store(time.0, Ordering::Relaxed);
        self.touch_ctime();
    }

    /// Metadata changed: change time only.
    pub fn touch_ctime(&self) {
        self.ctime.store(Timestamp::now().0, Ordering::Relaxed);
    }

    /// Overwrites all three timestamps from an external source of truth
    /// (a backing host file), without the ctime side effect.
    pub fn load_times(&self, atime: Timestamp, mtime: Timestamp, ctime: Timestamp) {
        self.atime.store(atime.0, Ordering::Relaxed);
        self.mtime.store(mtime.0, Ordering::Relaxed);
        self.ctime.store(ctime.0, Ordering::Relaxed);
    }

    /// Content changed: modification time, and therefore change time.
    pub fn touch_modified(&self) {
        let now = Timestamp::now().0;
        self.mtime.store(now, Ordering::Relaxed);
        self.ctime.store(now, Ordering::Relaxed);
    }

    /// Applies the per-mount access-time policy after a read. The caller is
    /// responsible for the handle-level `O_NOATIME` short circuit.
    pub fn update_atime(&self, mount_flags: MountFlags) {
        if mount_flags.contains(MountFlags::NOATIME) {
            return;
        }
        if self.node_type == NodeType::Directory && mount_flags.contains(MountFlags::NODIRATIME) {
            return;
        }

        let now = Timestamp::now();
        if !mount_flags.contains(MountFlags::STRICTATIME) {
            let atime = self.atime();
            let stale = now.0.saturating_sub(atime.0) >= Timestamp::DAY;
            // Relatime is the default policy: update only when the previous
            // access time has fallen behind ctime or mtime, or is a day old.
            if !stale && atime > self.ctime() && atime > self.mtime() {
                return;
            }
        }
        self.atime.store(now.0, Ordering::Relaxed);
    }
}

bitflags! {
    /// Access rights requested against a node, in classic rwx bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        const EXECUTE = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

/// The classic `rwx × {user, group, other}` permission check against the
/// caller's effective identity. `CAP_DAC_OVERRIDE` bypasses it.
pub fn check_access(metadata: &NodeMetadata, credentials: &Credentials, requested: Access) -> LxResult<()> {
    if capability_check(credentials, Capability::DacOverride) {
        return Ok(());
    }

    let mode = metadata.mode();
    let triple = if credentials.uid == metadata.uid() {
        (mode >> 6) & 0o7
    } else if credentials.gid == metadata.gid() {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };

    if requested.bits() & !triple != 0 {
        return Err(LxError::ACCES);
    }
    Ok(())
}

bitflags! {
    /// Linux `O_*` open flags carried by a handle. The access mode lives in
    /// the low two bits and is read through [`HandleFlags::access_mode`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HandleFlags: u32 {
        const WRONLY = libc::O_WRONLY as u32;
        const RDWR = libc::O_RDWR as u32;
        const CREAT = libc::O_CREAT as u32;
        const EXCL = libc::O_EXCL as u32;
        const TRUNC = libc::O_TRUNC as u32;
        const APPEND = libc::O_APPEND as u32;
        const DSYNC = libc::O_DSYNC as u32;
        const DIRECT = libc::O_DIRECT as u32;
        const DIRECTORY = libc::O_DIRECTORY as u32;
        const NOFOLLOW = libc::O_NOFOLLOW as u32;
        const NOATIME = libc::O_NOATIME as u32;
        const CLOEXEC = libc::O_CLOEXEC as u32;
        const SYNC = libc::O_SYNC as u32;
        const PATH = libc::O_PATH as u32;
    }
}

/// The handle access mode from the low `O_ACCMODE` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl HandleFlags {
    pub fn access_mode(self) -> LxResult<AccessMode> {
        match self.bits() & libc::O_ACCMODE as u32 {
            0 => Ok(AccessMode::ReadOnly),
            x if x == libc::O_WRONLY as u32 => Ok(AccessMode::WriteOnly),
            x if x == libc::O_RDWR as u32 => Ok(AccessMode::ReadWrite),
            _ => Err(LxError::INVAL),
        }
    }

    pub fn readable(self) -> bool {
        !matches!(self.access_mode(), Ok(AccessMode::WriteOnly))
    }

    pub fn writable(self) -> bool {
        matches!(
            self.access_mode(),
            Ok(AccessMode::WriteOnly) | Ok(AccessMode::ReadWrite)
        )
    }
}

/// Base contract implemented by every node.
pub trait NodeOps: Send + Sync {
    fn filesystem_id(&self) -> FilesystemId;

    fn metadata(&self) -> &NodeMetadata;

    /// Flushes node data and metadata to backing storage.
    fn sync(&self, mount: &Mount) -> LxResult<()>;

    /// Flushes node data, not metadata.
    fn sync_data(&self, mount: &Mount) -> LxResult<()>;
}

/// One entry produced by directory enumeration.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryEntry<'a> {
    pub name: &'a str,
    pub index: NodeIndex,
    pub node_type: NodeType,
}

/// Directory capability.
pub trait DirectoryNode: NodeOps {
    fn create_directory(
        &self,
        mount: &Mount,
        name: &str,
        mode: Mode,
        uid: Uid,
        gid: Gid,
    ) -> LxResult<Node>;

    fn create_file(&self, mount: &Mount, name: &str, mode: Mode, uid: Uid, gid: Gid)
    -> LxResult<Node>;

    fn create_symlink(
        &self,
        mount: &Mount,
        name: &str,
        target: &str,
        uid: Uid,
        gid: Gid,
    ) -> LxResult<Node>;

    /// Links an existing node into this directory under a new name.
    fn link(&self, mount: &Mount, node: &Node, name: &str) -> LxResult<()>;

    fn unlink(&self, mount: &Mount, name: &str) -> LxResult<()>;

    fn lookup(&self, mount: &Mount, name: &str) -> LxResult<Node>;

    /// Visits each entry until the visitor returns false.
    fn enumerate(
        &self,
        mount: &Mount,
        visitor: &mut dyn FnMut(DirectoryEntry<'_>) -> bool,
    ) -> LxResult<()>;

    /// Create-or-open. Honours `O_CREAT`/`O_EXCL`/`O_TRUNC`/`O_DIRECTORY`/
    /// `O_PATH`; the default implementation composes lookup and create.
    fn open_node(
        &self,
        mount: &Mount,
        name: &str,
        flags: HandleFlags,
        mode: Mode,
        uid: Uid,
        gid: Gid,
    ) -> LxResult<Node> {
        match self.lookup(mount, name) {
            Ok(node) => {
                if flags.contains(HandleFlags::CREAT | HandleFlags::EXCL) {
                    return Err(LxError::EXIST);
                }
                if flags.contains(HandleFlags::DIRECTORY)
                    && node.node_type() != NodeType::Directory
                {
                    return Err(LxError::NOTDIR);
                }
                if flags.contains(HandleFlags::TRUNC) && !flags.contains(HandleFlags::PATH) {
                    if let Node::File(file) = &node {
                        check_mount_writable(mount)?;
                        file.set_length(mount, 0)?;
                    }
                }
                Ok(node)
            }
            Err(err) if err == LxError::NOENT && flags.contains(HandleFlags::CREAT) => {
                if flags.contains(HandleFlags::DIRECTORY) {
                    // open(2) cannot create directories.
                    return Err(LxError::INVAL);
                }
                self.create_file(mount, name, mode, uid, gid)
            }
            Err(err) => Err(err),
        }
    }
}

/// Regular-file capability. Offsets are explicit; cursor state lives in the
/// handle layer.
pub trait FileNode: NodeOps {
    fn read_at(&self, mount: &Mount, offset: u64, buffer: &mut [u8]) -> LxResult<usize>;

    fn write_at(&self, mount: &Mount, offset: u64, buffer: &[u8]) -> LxResult<usize>;

    fn length(&self, mount: &Mount) -> LxResult<u64>;

    fn set_length(&self, mount: &Mount, length: u64) -> LxResult<u64>;
}

/// Symbolic-link capability.
pub trait SymlinkNode: NodeOps {
    fn target(&self, mount: &Mount) -> LxResult<String>;
}

/// A file system node, tagged by capability.
#[derive(Clone)]
pub enum Node {
    Directory(Arc<dyn DirectoryNode>),
    File(Arc<dyn FileNode>),
    SymbolicLink(Arc<dyn SymlinkNode>),
    CharacterDevice(Arc<dyn NodeOps>),
    BlockDevice(Arc<dyn NodeOps>),
    Pipe(Arc<dyn NodeOps>),
    Socket(Arc<dyn NodeOps>),
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match self {
            Node::Directory(_) => NodeType::Directory,
            Node::File(_) => NodeType::File,
            Node::SymbolicLink(_) => NodeType::SymbolicLink,
            Node::CharacterDevice(_) => NodeType::CharacterDevice,
            Node::BlockDevice(_) => NodeType::BlockDevice,
            Node::Pipe(_) => NodeType::Pipe,
            Node::Socket(_) => NodeType::Socket,
        }
    }

    pub fn metadata(&self) -> &NodeMetadata {
        match self {
            Node::Directory(n) => n.metadata(),
            Node::File(n) => n.metadata(),
            Node::SymbolicLink(n) => n.metadata(),
            Node::CharacterDevice(n) => n.metadata(),
            Node::BlockDevice(n) => n.metadata(),
            Node::Pipe(n) => n.metadata(),
            Node::Socket(n) => n.metadata(),
        }
    }

    pub fn filesystem_id(&self) -> FilesystemId {
        match self {
            Node::Directory(n) => n.filesystem_id(),
            Node::File(n) => n.filesystem_id(),
            Node::SymbolicLink(n) => n.filesystem_id(),
            Node::CharacterDevice(n) => n.filesystem_id(),
            Node::BlockDevice(n) => n.filesystem_id(),
            Node::Pipe(n) => n.filesystem_id(),
            Node::Socket(n) => n.filesystem_id(),
        }
    }

    pub fn sync(&self, mount: &Mount) -> LxResult<()> {
        match self {
            Node::Directory(n) => n.sync(mount),
            Node::File(n) => n.sync(mount),
            Node::SymbolicLink(n) => n.sync(mount),
            Node::CharacterDevice(n) => n.sync(mount),
            Node::BlockDevice(n) => n.sync(mount),
            Node::Pipe(n) => n.sync(mount),
            Node::Socket(n) => n.sync(mount),
        }
    }

    pub fn as_directory(&self) -> LxResult<&Arc<dyn DirectoryNode>> {
        match self {
            Node::Directory(dir) => Ok(dir),
            _ => Err(LxError::NOTDIR),
        }
    }

    pub fn as_file(&self) -> LxResult<&Arc<dyn FileNode>> {
        match self {
            Node::File(file) => Ok(file),
            Node::Directory(_) => Err(LxError::ISDIR),
            _ => Err(LxError::INVAL),
        }
    }

    pub fn as_symlink(&self) -> Option<&Arc<dyn SymlinkNode>> {
        match self {
            Node::SymbolicLink(link) => Some(link),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("type", &self.node_type())
            .field("index", &self.metadata().index())
            .finish()
    }
}

/// A binding of a file system into a namespace.
///
/// The root node reference is immutable; the per-mount flags are atomic.
/// Duplication shares the file system while giving the copy its own flag
/// word.
pub struct Mount {
    fs: Arc<dyn Filesystem>,
    root: Node,
    flags: AtomicU32,
}

impl Mount {
    pub fn new(fs: Arc<dyn Filesystem>, root: Node, flags: MountFlags) -> Mount {
        Mount {
            fs,
            root,
            flags: AtomicU32::new((flags & MountFlags::PERMOUNT_MASK).bits()),
        }
    }

    pub fn filesystem(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// The effective flag word: per-mount bits plus the file system's own.
    pub fn flags(&self) -> MountFlags {
        MountFlags::from_bits_retain(self.flags.load(Ordering::Relaxed)) | self.fs.flags()
    }

    pub fn is_read_only(&self) -> bool {
        self.flags().contains(MountFlags::RDONLY)
    }

    /// Re-validates flags through the driver and applies the result.
    pub fn remount(&self, flags: MountFlags, data: &[u8]) -> LxResult<()> {
        let validated = self.fs.remount(flags, data)?;
        self.flags.store(
            (validated & MountFlags::PERMOUNT_MASK).bits(),
            Ordering::Relaxed,
        );
        Ok(())
    }

    pub fn duplicate(&self) -> Mount {
        Mount {
            fs: self.fs.clone(),
            root: self.root.clone(),
            flags: AtomicU32::new(self.flags.load(Ordering::Relaxed)),
        }
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("fs", &self.fs.id())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Fails with `E_XDEV` when the mount does not belong to the node's file
/// system.
pub fn check_mount(mount: &Mount, node_fs: FilesystemId) -> LxResult<()> {
    if mount.fs.id() != node_fs {
        return Err(LxError::XDEV);
    }
    Ok(())
}

/// Fails with `E_ROFS` when the mount or its file system is read-only.
pub fn check_mount_writable(mount: &Mount) -> LxResult<()> {
    if mount.is_read_only() {
        return Err(LxError::ROFS);
    }
    Ok(())
}
