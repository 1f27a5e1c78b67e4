//! End-to-end VFS behavior through the public API: mounts, path lookup,
//! open semantics and the access-time policy.

use std::sync::Arc;

use lxuser::mount_options::MountFlags;
use lxuser::ns::MountNamespace;
use lxuser::vfs::path::{ResolveFlags, open, resolve};
use lxuser::vfs::{Credentials, HandleFlags, NodeType, Whence, tempfs};
use lxuser::LxError;

fn rooted_namespace() -> MountNamespace {
    let ns = MountNamespace::new();
    let fs = tempfs::create("tmpfs", MountFlags::empty(), b"").unwrap();
    ns.mount("/", fs, MountFlags::empty(), b"").unwrap();
    ns
}

fn root_credentials() -> Credentials {
    Credentials::root()
}

fn mkdir(ns: &MountNamespace, at: &str) {
    let credentials = root_credentials();
    let (parent, name) = at.rsplit_once('/').unwrap();
    let parent = if parent.is_empty() { "/" } else { parent };
    let resolved = resolve(ns, &credentials, None, parent, ResolveFlags::empty()).unwrap();
    resolved
        .node
        .as_directory()
        .unwrap()
        .create_directory(&resolved.mount, name, 0o755, 0, 0)
        .unwrap();
}

fn write_file(ns: &MountNamespace, at: &str, contents: &[u8]) {
    let credentials = root_credentials();
    let flags = HandleFlags::from_bits_retain(
        (libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY) as u32,
    );
    let handle = open(ns, &credentials, None, at, flags, 0o644).unwrap();
    handle.write(contents).unwrap();
}

fn symlink(ns: &MountNamespace, at: &str, target: &str) {
    let credentials = root_credentials();
    let (parent, name) = at.rsplit_once('/').unwrap();
    let parent = if parent.is_empty() { "/" } else { parent };
    let resolved = resolve(ns, &credentials, None, parent, ResolveFlags::empty()).unwrap();
    resolved
        .node
        .as_directory()
        .unwrap()
        .create_symlink(&resolved.mount, name, target, 0, 0)
        .unwrap();
}

#[test]
fn dot_and_dotdot() {
    let ns = rooted_namespace();
    let credentials = root_credentials();
    mkdir(&ns, "/dir");

    // "." is a no-op and ".." never climbs above the root.
    let root = resolve(&ns, &credentials, None, "/", ResolveFlags::empty()).unwrap();
    let via_dots = resolve(&ns, &credentials, None, "/../../.", ResolveFlags::empty()).unwrap();
    assert_eq!(
        root.node.metadata().index(),
        via_dots.node.metadata().index()
    );

    let dir = resolve(&ns, &credentials, None, "/dir/.", ResolveFlags::empty()).unwrap();
    assert_eq!(dir.canonical_path(), "/dir");
    let back = resolve(&ns, &credentials, None, "/dir/..", ResolveFlags::empty()).unwrap();
    assert_eq!(back.canonical_path(), "/");
}

#[test]
fn symlink_resolution_and_loops() {
    let ns = rooted_namespace();
    let credentials = root_credentials();

    write_file(&ns, "/target", b"found me");
    symlink(&ns, "/level1", "target");
    symlink(&ns, "/level2", "/level1");

    let resolved = resolve(&ns, &credentials, None, "/level2", ResolveFlags::empty()).unwrap();
    assert_eq!(resolved.node.node_type(), NodeType::File);
    assert_eq!(resolved.canonical_path(), "/target");

    // A two-link cycle exhausts the 40-link recursion cap.
    symlink(&ns, "/ouro", "/boros");
    symlink(&ns, "/boros", "/ouro");
    assert_eq!(
        resolve(&ns, &credentials, None, "/ouro", ResolveFlags::empty()).unwrap_err(),
        LxError::LOOP
    );
}

#[test]
fn no_follow_keeps_the_link() {
    let ns = rooted_namespace();
    let credentials = root_credentials();
    write_file(&ns, "/real", b"x");
    symlink(&ns, "/alias", "real");

    let resolved = resolve(&ns, &credentials, None, "/alias", ResolveFlags::NO_FOLLOW).unwrap();
    assert_eq!(resolved.node.node_type(), NodeType::SymbolicLink);

    // A symlink mid-path is always followed.
    mkdir(&ns, "/sub");
    write_file(&ns, "/sub/leaf", b"y");
    symlink(&ns, "/subline", "sub");
    let resolved = resolve(
        &ns,
        &credentials,
        None,
        "/subline/leaf",
        ResolveFlags::NO_FOLLOW,
    )
    .unwrap();
    assert_eq!(resolved.node.node_type(), NodeType::File);
}

#[test]
fn mount_crossing() {
    let ns = rooted_namespace();
    let credentials = root_credentials();
    mkdir(&ns, "/mnt");

    let inner = tempfs::create("tmpfs", MountFlags::empty(), b"").unwrap();
    ns.mount("/mnt", inner, MountFlags::empty(), b"").unwrap();

    // Files created under the mount point land in the inner file system.
    write_file(&ns, "/mnt/inside", b"inner data");
    let inside = resolve(&ns, &credentials, None, "/mnt/inside", ResolveFlags::empty()).unwrap();
    let root = resolve(&ns, &credentials, None, "/", ResolveFlags::empty()).unwrap();
    assert_ne!(
        Arc::as_ptr(inside.mount.filesystem()) as *const (),
        Arc::as_ptr(root.mount.filesystem()) as *const ()
    );

    // ".." from inside the mount walks back into the outer file system.
    let outer = resolve(&ns, &credentials, None, "/mnt/..", ResolveFlags::empty()).unwrap();
    assert_eq!(outer.canonical_path(), "/");

    let (mount, relative) = ns.mount_for_path("/mnt/some/deep/path").unwrap();
    assert_eq!(relative, "some/deep/path");
    assert!(Arc::ptr_eq(&mount, &inside.mount));
}

#[test]
fn open_flag_semantics() {
    let ns = rooted_namespace();
    let credentials = root_credentials();
    write_file(&ns, "/existing", b"contents");

    // O_CREAT|O_EXCL refuses an existing name.
    let excl = HandleFlags::from_bits_retain((libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY) as u32);
    assert_eq!(
        open(&ns, &credentials, None, "/existing", excl, 0o644).unwrap_err(),
        LxError::EXIST
    );

    // O_DIRECTORY insists on a directory.
    let dir_only = HandleFlags::from_bits_retain(libc::O_DIRECTORY as u32);
    assert_eq!(
        open(&ns, &credentials, None, "/existing", dir_only, 0).unwrap_err(),
        LxError::NOTDIR
    );

    // O_PATH handles traverse and stat but refuse data transfer.
    let path_only = HandleFlags::from_bits_retain(libc::O_PATH as u32);
    let handle = open(&ns, &credentials, None, "/existing", path_only, 0).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(handle.read(&mut buf).unwrap_err(), LxError::ACCES);

    // O_NOFOLLOW on a symlink terminal refuses with ELOOP.
    symlink(&ns, "/ln", "existing");
    let no_follow = HandleFlags::from_bits_retain(libc::O_NOFOLLOW as u32);
    assert_eq!(
        open(&ns, &credentials, None, "/ln", no_follow, 0).unwrap_err(),
        LxError::LOOP
    );

    // O_TRUNC empties the file.
    let trunc = HandleFlags::from_bits_retain((libc::O_TRUNC | libc::O_RDWR) as u32);
    let handle = open(&ns, &credentials, None, "/existing", trunc, 0).unwrap();
    assert_eq!(handle.length().unwrap(), 0);
}

#[test]
fn append_and_seek() {
    let ns = rooted_namespace();
    let credentials = root_credentials();
    write_file(&ns, "/log", b"one");

    let append = HandleFlags::from_bits_retain((libc::O_WRONLY | libc::O_APPEND) as u32);
    let handle = open(&ns, &credentials, None, "/log", append, 0).unwrap();
    handle.write(b"+two").unwrap();

    let read = open(&ns, &credentials, None, "/log", HandleFlags::empty(), 0).unwrap();
    let mut buf = [0u8; 7];
    read.read(&mut buf).unwrap();
    assert_eq!(&buf, b"one+two");

    // Write-only handles cannot read; read-only handles cannot write.
    assert_eq!(handle.read(&mut buf).unwrap_err(), LxError::ACCES);
    assert_eq!(read.write(b"nope").unwrap_err(), LxError::ACCES);

    assert_eq!(read.seek(-3, Whence::End).unwrap(), 4);
    let mut tail = [0u8; 3];
    read.read(&mut tail).unwrap();
    assert_eq!(&tail, b"two");
}

#[test]
fn relatime_end_to_end() {
    let ns = MountNamespace::new();
    let fs = tempfs::create("tmpfs", MountFlags::RELATIME, b"").unwrap();
    ns.mount("/", fs, MountFlags::RELATIME, b"").unwrap();
    let credentials = root_credentials();

    write_file(&ns, "/file", b"watched");
    let handle = open(&ns, &credentials, None, "/file", HandleFlags::empty(), 0).unwrap();

    let mut buf = [0u8; 7];
    handle.read(&mut buf).unwrap();
    let after_first = handle.node().metadata().atime();

    std::thread::sleep(std::time::Duration::from_millis(5));
    handle.read_at(0, Whence::Set, &mut buf).unwrap();
    let after_second = handle.node().metadata().atime();

    // atime moved past ctime/mtime on the first read; the second read
    // leaves it alone under relatime.
    assert_eq!(after_first, after_second);
}

#[test]
fn noatime_handle_flag() {
    let ns = rooted_namespace();
    let credentials = root_credentials();
    write_file(&ns, "/quiet", b"data");

    let noatime = HandleFlags::from_bits_retain(libc::O_NOATIME as u32);
    let handle = open(&ns, &credentials, None, "/quiet", noatime, 0).unwrap();
    let before = handle.node().metadata().atime();

    std::thread::sleep(std::time::Duration::from_millis(5));
    let mut buf = [0u8; 4];
    handle.read(&mut buf).unwrap();
    assert_eq!(handle.node().metadata().atime(), before);
}

#[test]
fn remove_files_and_directories() {
    let ns = rooted_namespace();
    let credentials = root_credentials();
    mkdir(&ns, "/dir");
    write_file(&ns, "/dir/file", b"x");

    let dir = resolve(&ns, &credentials, None, "/dir", ResolveFlags::empty()).unwrap();
    let parent = resolve(&ns, &credentials, None, "/", ResolveFlags::empty()).unwrap();
    let parent_dir = parent.node.as_directory().unwrap();

    assert_eq!(
        parent_dir.unlink(&parent.mount, "dir").unwrap_err(),
        LxError::NOTEMPTY
    );

    dir.node
        .as_directory()
        .unwrap()
        .unlink(&dir.mount, "file")
        .unwrap();
    parent_dir.unlink(&parent.mount, "dir").unwrap();

    assert_eq!(
        resolve(&ns, &credentials, None, "/dir", ResolveFlags::empty()).unwrap_err(),
        LxError::NOENT
    );
}
