//! Initial RAM file system loading.
//!
//! Pipes a (possibly compressed) `newc` CPIO archive through the stream
//! layer and materializes its entries into whatever is mounted at the
//! root of the namespace.

use std::path::Path;

use log::{debug, warn};

use crate::cpio::{self, CpioEntry, CpioEntryData};
use crate::error::{LxError, LxResult};
use crate::ns::MountNamespace;
use crate::stream::{CompressedFileReader, StreamReader};
use crate::vfs::path::{ResolveFlags, resolve};
use crate::vfs::{Credentials, Timestamp};

/// What a load pass created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InitramfsStats {
    pub directories: usize,
    pub files: usize,
    pub symlinks: usize,
    pub skipped: usize,
}

/// Loads the archive at `archive` into the namespace root, detecting the
/// compression codec from the file's magic bytes.
pub fn load(
    ns: &MountNamespace,
    archive: &Path,
    credentials: &Credentials,
) -> LxResult<InitramfsStats> {
    let mut reader = CompressedFileReader::open(archive)?;
    debug!("initramfs: {} via {:?}", archive.display(), reader.codec());
    load_from(ns, &mut reader, credentials)
}

/// Loads a CPIO archive from an already-open stream.
pub fn load_from<R: StreamReader>(
    ns: &MountNamespace,
    reader: &mut R,
    credentials: &Credentials,
) -> LxResult<InitramfsStats> {
    let mut stats = InitramfsStats::default();

    cpio::enumerate(reader, |entry, data| {
        if !materialize(ns, credentials, entry, data)? {
            stats.skipped += 1;
        } else if entry.is_directory() {
            stats.directories += 1;
        } else if entry.is_file() {
            stats.files += 1;
        } else {
            stats.symlinks += 1;
        }
        Ok(())
    })?;

    Ok(stats)
}

/// Creates one archive entry in the VFS. Returns false when the entry was
/// skipped rather than created.
fn materialize<R: StreamReader>(
    ns: &MountNamespace,
    credentials: &Credentials,
    entry: &CpioEntry,
    data: &mut CpioEntryData<'_, R>,
) -> LxResult<bool> {
    let path = entry.path.trim_start_matches('/').trim_end_matches('/');
    if path.is_empty() || path == "." {
        return Ok(false);
    }

    let (parent, name) = match path.rfind('/') {
        Some(split) => (format!("/{}", &path[..split]), &path[split + 1..]),
        None => ("/".to_string(), path),
    };

    let resolved = resolve(ns, credentials, None, &parent, ResolveFlags::empty())?;
    let directory = resolved.node.as_directory()?;
    let mount = &resolved.mount;
    let mode = entry.mode & 0o7777;

    let node = if entry.is_directory() {
        match directory.create_directory(mount, name, mode, entry.uid, entry.gid) {
            Ok(node) => node,
            Err(err) if err == LxError::EXIST => directory.lookup(mount, name)?,
            Err(err) => return Err(err),
        }
    } else if entry.is_file() {
        let node = match directory.create_file(mount, name, mode, entry.uid, entry.gid) {
            Ok(node) => node,
            Err(err) if err == LxError::EXIST => {
                debug!("initramfs: {} already exists, skipped", entry.path);
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        let file = node.as_file()?;
        let mut offset = 0u64;
        let mut chunk = [0u8; 8192];
        loop {
            let count = data.read(&mut chunk)?;
            if count == 0 {
                break;
            }
            file.write_at(mount, offset, &chunk[..count])?;
            offset += count as u64;
        }
        node
    } else if entry.is_symlink() {
        let mut target = vec![0u8; data.len() as usize];
        data.read(&mut target)?;
        let target = String::from_utf8_lossy(&target).into_owned();
        directory.create_symlink(mount, name, &target, entry.uid, entry.gid)?
    } else {
        // Device nodes, pipes and sockets are not materialized.
        warn!(
            "initramfs: skipping {} (mode {:o})",
            entry.path, entry.mode
        );
        return Ok(false);
    };

    node.metadata()
        .set_mtime(Timestamp(entry.mtime as i64 * 1_000_000_000));
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::mount_options::MountFlags;
    use crate::stream::MemoryStreamReader;
    use crate::vfs::path;
    use crate::vfs::{HandleFlags, tempfs};

    fn push_entry(archive: &mut Vec<u8>, path: &str, mode: u32, data: &[u8]) {
        archive.extend_from_slice(b"070701");
        for value in [
            1u32,
            mode,
            0,
            0,
            1,
            1_600_000_000,
            data.len() as u32,
            0,
            0,
            0,
            0,
            path.len() as u32 + 1,
            0,
        ] {
            archive.extend_from_slice(format!("{value:08X}").as_bytes());
        }
        archive.extend_from_slice(path.as_bytes());
        archive.push(0);
        while archive.len() % 4 != 0 {
            archive.push(0);
        }
        archive.extend_from_slice(data);
        while archive.len() % 4 != 0 {
            archive.push(0);
        }
    }

    fn build_archive(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
        let mut archive = Vec::new();
        for (path, mode, data) in entries {
            push_entry(&mut archive, path, *mode, data);
        }
        push_entry(&mut archive, "TRAILER!!!", 0, b"");
        archive
    }

    fn rootful_namespace() -> MountNamespace {
        let ns = MountNamespace::new();
        let fs = tempfs::create("tmpfs", MountFlags::empty(), b"").unwrap();
        ns.mount("/", fs, MountFlags::empty(), b"").unwrap();
        ns
    }

    fn read_all(ns: &MountNamespace, at: &str) -> Vec<u8> {
        let credentials = Credentials::root();
        let handle = path::open(ns, &credentials, None, at, HandleFlags::empty(), 0).unwrap();
        let mut out = vec![0u8; handle.length().unwrap() as usize];
        handle.read(&mut out).unwrap();
        out
    }

    #[test]
    fn populates_the_root_mount() {
        let ns = rootful_namespace();
        let archive = build_archive(&[
            ("a", 0o100644, b"hello"),
            ("b", 0o040755, b""),
            ("b/c", 0o100644, b"world"),
            ("link", 0o120777, b"b/c"),
        ]);

        let mut reader = MemoryStreamReader::new(&archive[..]);
        let stats = load_from(&ns, &mut reader, &Credentials::root()).unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.directories, 1);
        assert_eq!(stats.symlinks, 1);
        assert_eq!(stats.skipped, 0);

        assert_eq!(read_all(&ns, "/a"), b"hello");
        assert_eq!(read_all(&ns, "/b/c"), b"world");
        // The symlink resolves through to its target.
        assert_eq!(read_all(&ns, "/link"), b"world");
    }

    #[test]
    fn loads_through_gzip() {
        let ns = rootful_namespace();
        let archive = build_archive(&[("compressed.txt", 0o100644, b"squeezed")]);

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&archive).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&compressed).unwrap();
        file.flush().unwrap();

        let stats = load(&ns, file.path(), &Credentials::root()).unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(read_all(&ns, "/compressed.txt"), b"squeezed");
    }

    #[test]
    fn skips_device_nodes() {
        let ns = rootful_namespace();
        let archive = build_archive(&[
            ("dev", 0o040755, b""),
            ("dev/null", 0o020666, b""),
        ]);

        let mut reader = MemoryStreamReader::new(&archive[..]);
        let stats = load_from(&ns, &mut reader, &Credentials::root()).unwrap();
        assert_eq!(stats.directories, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn entry_modes_and_times_survive() {
        let ns = rootful_namespace();
        let archive = build_archive(&[("strict", 0o100600, b"private")]);

        let mut reader = MemoryStreamReader::new(&archive[..]);
        load_from(&ns, &mut reader, &Credentials::root()).unwrap();

        let credentials = Credentials::root();
        let resolved = path::resolve(&ns, &credentials, None, "/strict", ResolveFlags::empty())
            .unwrap();
        let meta = resolved.node.metadata();
        assert_eq!(meta.mode() & 0o7777, 0o600);
        assert_eq!(meta.mtime().0, 1_600_000_000i64 * 1_000_000_000);
    }

    #[test]
    fn mounted_subtree_receives_entries() {
        // Entries under a nested mount land in that mount's file system.
        let ns = rootful_namespace();
        let credentials = Credentials::root();
        {
            let root = path::resolve(&ns, &credentials, None, "/", ResolveFlags::empty()).unwrap();
            let dir = root.node.as_directory().unwrap().clone();
            dir.create_directory(&root.mount, "nested", 0o755, 0, 0)
                .unwrap();
        }
        let sub = tempfs::create("tmpfs", MountFlags::empty(), b"").unwrap();
        ns.mount("/nested", sub, MountFlags::empty(), b"").unwrap();

        let archive = build_archive(&[("nested/inside", 0o100644, b"deep")]);
        let mut reader = MemoryStreamReader::new(&archive[..]);
        load_from(&ns, &mut reader, &credentials).unwrap();

        assert_eq!(read_all(&ns, "/nested/inside"), b"deep");
    }
}
