//! Streaming enumeration of Linux `newc` CPIO archives.
//!
//! This is the archive format used by the kernel's initramfs: 110-byte
//! ASCII-hex headers (`070701`, or `070702` with checksums), pathname,
//! file data, everything realigned to 32 bits between records, terminated
//! by an entry named `TRAILER!!!`.

use memchr::memchr;
use smallvec::SmallVec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{LxError, LxResult};
use crate::stream::StreamReader;

/// The archive entry terminating enumeration.
const TRAILER: &str = "TRAILER!!!";

/// On-disk `newc` header: six magic characters followed by thirteen
/// 8-digit ASCII hexadecimal fields.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawHeader {
    magic: [u8; 6],
    ino: [u8; 8],
    mode: [u8; 8],
    uid: [u8; 8],
    gid: [u8; 8],
    nlink: [u8; 8],
    mtime: [u8; 8],
    filesize: [u8; 8],
    dev_major: [u8; 8],
    dev_minor: [u8; 8],
    rdev_major: [u8; 8],
    rdev_minor: [u8; 8],
    namesize: [u8; 8],
    checksum: [u8; 8],
}

const HEADER_LEN: usize = std::mem::size_of::<RawHeader>();

/// Parses an ASCII big-endian hex field, stopping at the first character
/// that is not a hexadecimal digit.
fn parse_hex(field: &[u8]) -> u32 {
    let mut accumulator = 0u32;
    for &ch in field {
        let digit = match ch {
            b'0'..=b'9' => ch - b'0',
            b'a'..=b'f' => ch - b'a' + 10,
            b'A'..=b'F' => ch - b'A' + 10,
            _ => break,
        };
        accumulator = (accumulator << 4) + digit as u32;
    }
    accumulator
}

fn align4(position: u64) -> u64 {
    (position + 3) & !3
}

/// Metadata of a single archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpioEntry {
    pub path: String,
    pub inode: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
}

impl CpioEntry {
    pub fn is_directory(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// The bounded data sub-stream handed to the per-entry callback.
///
/// Reads are capped at the length declared in the entry header; seeking is
/// not supported.
pub struct CpioEntryData<'a, R: StreamReader> {
    reader: &'a mut R,
    length: u64,
    position: u64,
}

impl<R: StreamReader> std::fmt::Debug for CpioEntryData<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpioEntryData")
            .field("length", &self.length)
            .field("position", &self.position)
            .finish()
    }
}

impl<R: StreamReader> CpioEntryData<'_, R> {
    /// Declared length of the entry data.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl<R: StreamReader> StreamReader for CpioEntryData<'_, R> {
    fn read(&mut self, buffer: &mut [u8]) -> LxResult<usize> {
        let remaining = (self.length - self.position) as usize;
        let count = buffer.len().min(remaining);
        if count == 0 {
            return Ok(0);
        }
        let produced = self.reader.read(&mut buffer[..count])?;
        self.position += produced as u64;
        Ok(produced)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, _position: u64) -> LxResult<()> {
        Err(LxError::OPNOTSUPP)
    }
}

/// Enumerates every entry of a CPIO archive read from `reader`.
///
/// The callback receives the entry metadata and its bounded data stream;
/// whatever it leaves unread is consumed before the next header.
/// Enumeration stops at the trailer entry, on a short header read, or at
/// the first record whose magic does not match.
pub fn enumerate<R, F>(reader: &mut R, mut func: F) -> LxResult<()>
where
    R: StreamReader,
    F: FnMut(&CpioEntry, &mut CpioEntryData<'_, R>) -> LxResult<()>,
{
    loop {
        let mut raw = [0u8; HEADER_LEN];
        if reader.read(&mut raw)? != HEADER_LEN {
            return Ok(());
        }
        // Infallible: the slice length equals the header size.
        let Ok(header) = RawHeader::ref_from_bytes(&raw) else {
            return Ok(());
        };

        // "070701", or "070702" when data checksums are present. The
        // checksums cannot verify anything useful; they are not inspected.
        if &header.magic[..5] != b"07070" || !matches!(header.magic[5], b'1' | b'2') {
            return Ok(());
        }

        let namesize = parse_hex(&header.namesize) as usize;
        let mut name: SmallVec<[u8; 128]> = SmallVec::new();
        name.resize(namesize, 0);
        if reader.read(&mut name)? != namesize {
            return Ok(());
        }
        let name_len = memchr(0, &name).unwrap_or(name.len());
        let path = String::from_utf8_lossy(&name[..name_len]).into_owned();

        if path == TRAILER {
            return Ok(());
        }

        // The file data starts at the next 32-bit boundary.
        reader.seek(align4(reader.position()))?;

        let data_length = parse_hex(&header.filesize) as u64;
        let entry = CpioEntry {
            path,
            inode: parse_hex(&header.ino),
            mode: parse_hex(&header.mode),
            uid: parse_hex(&header.uid),
            gid: parse_hex(&header.gid),
            nlink: parse_hex(&header.nlink),
            mtime: parse_hex(&header.mtime),
            dev_major: parse_hex(&header.dev_major),
            dev_minor: parse_hex(&header.dev_minor),
            rdev_major: parse_hex(&header.rdev_major),
            rdev_minor: parse_hex(&header.rdev_minor),
        };

        let mut data = CpioEntryData {
            reader: &mut *reader,
            length: data_length,
            position: 0,
        };
        func(&entry, &mut data)?;
        let consumed = data.position;

        // Skip whatever the callback left unread and realign.
        reader.seek(align4(reader.position() + (data_length - consumed)))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStreamReader;

    fn push_entry(archive: &mut Vec<u8>, path: &str, mode: u32, data: &[u8]) {
        let name_len = path.len() + 1;
        archive.extend_from_slice(b"070701");
        for value in [
            1u32,
            mode,
            0,
            0,
            1,
            0,
            data.len() as u32,
            0,
            0,
            0,
            0,
            name_len as u32,
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
        push_entry(&mut archive, TRAILER, 0, b"");
        archive
    }

    #[test]
    fn hex_parsing_stops_at_non_hex() {
        assert_eq!(parse_hex(b"000000FF"), 0xFF);
        assert_eq!(parse_hex(b"0000001c"), 0x1C);
        assert_eq!(parse_hex(b"12ZZ0000"), 0x12);
        assert_eq!(parse_hex(b""), 0);
    }

    #[test]
    fn enumerates_entries_in_order() {
        let archive = build_archive(&[
            ("a", 0o100644, b"hello"),
            ("b/c", 0o100644, b"world"),
        ]);
        let mut reader = MemoryStreamReader::new(&archive[..]);

        let mut seen = Vec::new();
        enumerate(&mut reader, |entry, data| {
            let mut contents = vec![0u8; data.len() as usize];
            data.read(&mut contents)?;
            seen.push((entry.path.clone(), entry.mode, contents));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![
                ("a".to_string(), 0o100644, b"hello".to_vec()),
                ("b/c".to_string(), 0o100644, b"world".to_vec()),
            ]
        );
    }

    #[test]
    fn data_stream_is_bounded() {
        let archive = build_archive(&[("file", 0o100644, b"bounded")]);
        let mut reader = MemoryStreamReader::new(&archive[..]);

        enumerate(&mut reader, |_, data| {
            // Ask for more than the entry holds; only the declared length
            // comes back.
            let mut contents = vec![0u8; data.len() as usize + 3];
            assert_eq!(data.read(&mut contents)?, 7);
            assert_eq!(&contents[..7], b"bounded");
            assert_eq!(data.read(&mut contents)?, 0);
            assert_eq!(data.seek(0), Err(LxError::OPNOTSUPP));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn unread_data_is_skipped() {
        let archive = build_archive(&[
            ("first", 0o100644, b"some longer payload"),
            ("second", 0o100644, b"next"),
        ]);
        let mut reader = MemoryStreamReader::new(&archive[..]);

        let mut paths = Vec::new();
        enumerate(&mut reader, |entry, data| {
            // Touch a single byte of the first entry only.
            let mut one = [0u8; 1];
            data.read(&mut one)?;
            paths.push(entry.path.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(paths, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn stops_on_bad_magic() {
        let mut archive = build_archive(&[("a", 0o100644, b"data")]);
        // Corrupt the magic of the trailer record; enumeration ends quietly
        // after the first entry.
        let trailer_at = archive.windows(6).rposition(|w| w == b"070701").unwrap();
        archive[trailer_at] = b'X';

        let mut reader = MemoryStreamReader::new(&archive[..]);
        let mut count = 0;
        enumerate(&mut reader, |_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut reader = MemoryStreamReader::new(&[][..]);
        enumerate(&mut reader, |_, _| panic!("no entries expected")).unwrap();
    }

    #[test]
    fn node_type_helpers() {
        let entry = CpioEntry {
            path: "d".into(),
            inode: 1,
            mode: 0o040755,
            uid: 0,
            gid: 0,
            nlink: 2,
            mtime: 0,
            dev_major: 0,
            dev_minor: 0,
            rdev_major: 0,
            rdev_minor: 0,
        };
        assert!(entry.is_directory());
        assert!(!entry.is_file());
        assert!(!entry.is_symlink());
    }
}
