//! Forward-only byte streams with pluggable decompression codecs.
//!
//! Everything that feeds the initramfs pipeline reads through the
//! [`StreamReader`] contract: a forward-only stream that can be read,
//! discarded from, and advanced to an absolute position. Codec
//! implementations wrap third-party decoders; [`CompressedFileReader`]
//! memory-maps a file and picks the codec from its magic bytes.

mod codec;
mod file;
mod lz4;
mod lzop;
mod memory;

pub use codec::{
    Bzip2StreamReader, CodecReader, GzipStreamReader, Lz4StreamReader, LzmaStreamReader,
    LzopStreamReader, XzStreamReader, bzip2, gzip, lz4, lzma, lzop, xz,
};
pub use file::{CodecKind, CompressedFileReader};
pub use lz4::Lz4LegacyDecoder;
pub use lzop::LzopDecoder;
pub use memory::MemoryStreamReader;

use crate::error::{LxError, LxResult};

/// A forward-only byte stream.
pub trait StreamReader {
    /// Reads up to `buffer.len()` bytes, filling as much of the buffer as
    /// the stream can produce. A short count means end of stream.
    fn read(&mut self, buffer: &mut [u8]) -> LxResult<usize>;

    /// Decompresses and throws away up to `count` bytes, returning how many
    /// were actually consumed.
    fn discard(&mut self, count: usize) -> LxResult<usize> {
        let mut scratch = [0u8; 4096];
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(scratch.len());
            let produced = self.read(&mut scratch[..chunk])?;
            if produced == 0 {
                break;
            }
            remaining -= produced;
        }
        Ok(count - remaining)
    }

    /// The number of bytes produced so far.
    fn position(&self) -> u64;

    /// Advances the stream to an absolute position. Seeking backward fails
    /// with `E_INVAL`; running out of stream first fails with `E_IO`.
    fn seek(&mut self, position: u64) -> LxResult<()> {
        let current = self.position();
        if position < current {
            return Err(LxError::INVAL);
        }
        self.discard((position - current) as usize)?;
        if self.position() != position {
            return Err(LxError::IO);
        }
        Ok(())
    }
}
