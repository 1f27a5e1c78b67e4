//! lz4 legacy-frame decoder.
//!
//! The legacy frame format (magic `02 21 4C 18`) is what the kernel's
//! initramfs loader understands: a magic word followed by a sequence of
//! independently compressed blocks, each at most 8 MiB uncompressed and
//! prefixed with its little-endian compressed length. Block decompression
//! is delegated to `lz4_flex`; this type only walks the container.

use std::io;
use std::io::Read;

const LEGACY_MAGIC: u32 = 0x184C2102;
const LEGACY_BLOCK_SIZE: usize = 8 << 20;

/// Streaming decoder for lz4 legacy frames.
#[derive(Debug)]
pub struct Lz4LegacyDecoder<R: Read> {
    inner: R,
    block: Vec<u8>,
    offset: usize,
    started: bool,
    done: bool,
}

impl<R: Read> Lz4LegacyDecoder<R> {
    pub fn new(inner: R) -> Self {
        Lz4LegacyDecoder {
            inner,
            block: Vec::new(),
            offset: 0,
            started: false,
            done: false,
        }
    }

    fn read_word(&mut self) -> io::Result<Option<u32>> {
        let mut word = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            match self.inner.read(&mut word[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "lz4: truncated block length",
                    ));
                }
                n => filled += n,
            }
        }
        Ok(Some(u32::from_le_bytes(word)))
    }

    /// Loads and decompresses the next block, returning false at end of
    /// input. Concatenated frames (another magic word between blocks) are
    /// decoded transparently.
    fn fill_block(&mut self) -> io::Result<bool> {
        if !self.started {
            match self.read_word()? {
                Some(LEGACY_MAGIC) => self.started = true,
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "lz4: bad legacy frame magic",
                    ));
                }
            }
        }

        let block_len = loop {
            match self.read_word()? {
                None => return Ok(false),
                Some(LEGACY_MAGIC) => continue,
                Some(len) => break len as usize,
            }
        };

        if block_len == 0 || block_len > lz4_flex::block::get_maximum_output_size(LEGACY_BLOCK_SIZE)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "lz4: implausible block length",
            ));
        }

        let mut compressed = vec![0u8; block_len];
        self.inner.read_exact(&mut compressed)?;

        self.block.resize(LEGACY_BLOCK_SIZE, 0);
        let produced = lz4_flex::block::decompress_into(&compressed, &mut self.block)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.block.truncate(produced);
        self.offset = 0;
        Ok(produced > 0)
    }
}

impl<R: Read> Read for Lz4LegacyDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.done {
            return Ok(0);
        }

        while self.offset == self.block.len() {
            if !self.fill_block()? {
                self.done = true;
                return Ok(0);
            }
        }

        let available = self.block.len() - self.offset;
        let count = buf.len().min(available);
        buf[..count].copy_from_slice(&self.block[self.offset..self.offset + count]);
        self.offset += count;
        Ok(count)
    }
}
