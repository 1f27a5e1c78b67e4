//! Codec auto-detection over memory-mapped files.

use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{LxError, LxResult};
use crate::stream::codec::{
    Bzip2StreamReader, GzipStreamReader, Lz4StreamReader, LzmaStreamReader, LzopStreamReader,
    XzStreamReader, bzip2, gzip, lz4, lzma, lzop, xz,
};
use crate::stream::memory::MemoryStreamReader;
use crate::stream::StreamReader;

/// A window into a shared memory mapping.
#[derive(Debug, Clone)]
pub struct SharedSlice {
    map: Arc<Mmap>,
    offset: usize,
    length: usize,
}

impl AsRef<[u8]> for SharedSlice {
    fn as_ref(&self) -> &[u8] {
        &self.map[self.offset..self.offset + self.length]
    }
}

/// Which codec the magic bytes selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Memory,
    Gzip,
    Xz,
    Bzip2,
    Lzma,
    Lzop,
    Lz4,
}

/// Sniffs the compression format from the leading magic bytes; the first
/// matching rule wins, anything unknown is treated as uncompressed.
fn detect(data: &[u8]) -> CodecKind {
    const GZIP: &[u8] = &[0x1F, 0x8B, 0x08, 0x00];
    const XZ: &[u8] = &[0xFD, b'7', b'z', b'X', b'Z', 0x00];
    const BZIP2: &[u8] = b"BZh";
    const LZMA: &[u8] = &[0x5D, 0x00, 0x00, 0x00];
    const LZOP: &[u8] = &[0x89, b'L', b'Z', b'O', 0x00, 0x0D, 0x0A, 0x1A, 0x0A];
    const LZ4: &[u8] = &[0x02, 0x21, 0x4C, 0x18];

    if data.starts_with(GZIP) {
        CodecKind::Gzip
    } else if data.starts_with(XZ) {
        CodecKind::Xz
    } else if data.starts_with(BZIP2) {
        CodecKind::Bzip2
    } else if data.starts_with(LZMA) {
        CodecKind::Lzma
    } else if data.starts_with(LZOP) {
        CodecKind::Lzop
    } else if data.starts_with(LZ4) {
        CodecKind::Lz4
    } else {
        CodecKind::Memory
    }
}

enum Inner {
    Memory(MemoryStreamReader<SharedSlice>),
    Gzip(GzipStreamReader<Cursor<SharedSlice>>),
    Xz(XzStreamReader<Cursor<SharedSlice>>),
    Bzip2(Bzip2StreamReader<Cursor<SharedSlice>>),
    Lzma(LzmaStreamReader<Cursor<SharedSlice>>),
    Lzop(LzopStreamReader<Cursor<SharedSlice>>),
    Lz4(Lz4StreamReader<Cursor<SharedSlice>>),
}

/// Opens a file, memory-maps it, and reads it through whichever codec its
/// magic bytes call for.
pub struct CompressedFileReader {
    kind: CodecKind,
    inner: Inner,
}

impl CompressedFileReader {
    /// Opens the whole file.
    pub fn open<P: AsRef<Path>>(path: P) -> LxResult<Self> {
        Self::open_at(path, 0, 0)
    }

    /// Opens a window of the file. A `length` of zero means the remainder
    /// of the file.
    pub fn open_at<P: AsRef<Path>>(path: P, offset: u64, length: u64) -> LxResult<Self> {
        let file = File::open(path).map_err(LxError::from_host)?;
        let file_len = file.metadata().map_err(LxError::from_host)?.len();
        if offset > file_len {
            return Err(LxError::INVAL);
        }

        let map = unsafe { Mmap::map(&file) }.map_err(LxError::from_host)?;
        let available = file_len - offset;
        let length = if length == 0 {
            available
        } else {
            length.min(available)
        };

        let slice = SharedSlice {
            map: Arc::new(map),
            offset: offset as usize,
            length: length as usize,
        };

        let kind = detect(slice.as_ref());
        let inner = match kind {
            CodecKind::Memory => Inner::Memory(MemoryStreamReader::new(slice)),
            CodecKind::Gzip => Inner::Gzip(gzip(Cursor::new(slice))),
            CodecKind::Xz => Inner::Xz(xz(Cursor::new(slice))),
            CodecKind::Bzip2 => Inner::Bzip2(bzip2(Cursor::new(slice))),
            CodecKind::Lzma => Inner::Lzma(lzma(Cursor::new(slice))?),
            CodecKind::Lzop => Inner::Lzop(lzop(Cursor::new(slice))),
            CodecKind::Lz4 => Inner::Lz4(lz4(Cursor::new(slice))),
        };

        Ok(CompressedFileReader { kind, inner })
    }

    /// The codec selected by the magic bytes.
    pub fn codec(&self) -> CodecKind {
        self.kind
    }
}

impl std::fmt::Debug for CompressedFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedFileReader")
            .field("codec", &self.kind)
            .field("position", &self.position())
            .finish()
    }
}

impl StreamReader for CompressedFileReader {
    fn read(&mut self, buffer: &mut [u8]) -> LxResult<usize> {
        match &mut self.inner {
            Inner::Memory(r) => r.read(buffer),
            Inner::Gzip(r) => r.read(buffer),
            Inner::Xz(r) => r.read(buffer),
            Inner::Bzip2(r) => r.read(buffer),
            Inner::Lzma(r) => r.read(buffer),
            Inner::Lzop(r) => r.read(buffer),
            Inner::Lz4(r) => r.read(buffer),
        }
    }

    fn discard(&mut self, count: usize) -> LxResult<usize> {
        match &mut self.inner {
            Inner::Memory(r) => r.discard(count),
            Inner::Gzip(r) => r.discard(count),
            Inner::Xz(r) => r.discard(count),
            Inner::Bzip2(r) => r.discard(count),
            Inner::Lzma(r) => r.discard(count),
            Inner::Lzop(r) => r.discard(count),
            Inner::Lz4(r) => r.discard(count),
        }
    }

    fn position(&self) -> u64 {
        match &self.inner {
            Inner::Memory(r) => r.position(),
            Inner::Gzip(r) => r.position(),
            Inner::Xz(r) => r.position(),
            Inner::Bzip2(r) => r.position(),
            Inner::Lzma(r) => r.position(),
            Inner::Lzop(r) => r.position(),
            Inner::Lz4(r) => r.position(),
        }
    }
}
