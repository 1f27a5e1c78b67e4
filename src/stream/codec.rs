//! Adapters that turn third-party decompressors into stream readers.

use std::io;
use std::io::Read;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use xz2::read::XzDecoder;
use xz2::stream::Stream;

use crate::error::{LxError, LxResult};
use crate::stream::lz4::Lz4LegacyDecoder;
use crate::stream::lzop::LzopDecoder;
use crate::stream::StreamReader;

pub type GzipStreamReader<R> = CodecReader<GzDecoder<R>>;
pub type Bzip2StreamReader<R> = CodecReader<BzDecoder<R>>;
pub type XzStreamReader<R> = CodecReader<XzDecoder<R>>;
pub type LzmaStreamReader<R> = CodecReader<XzDecoder<R>>;
pub type LzopStreamReader<R> = CodecReader<LzopDecoder<R>>;
pub type Lz4StreamReader<R> = CodecReader<Lz4LegacyDecoder<R>>;

/// Wraps any `io::Read` decoder as a [`StreamReader`].
///
/// Decoders are allowed to return short chunks mid-stream; the adapter keeps
/// pulling until the caller's buffer is full or the stream ends, so a short
/// count from [`StreamReader::read`] always means end of stream.
#[derive(Debug)]
pub struct CodecReader<R: Read> {
    inner: R,
    position: u64,
    finished: bool,
}

impl<R: Read> CodecReader<R> {
    pub fn new(inner: R) -> Self {
        CodecReader {
            inner,
            position: 0,
            finished: false,
        }
    }
}

impl<R: Read> StreamReader for CodecReader<R> {
    fn read(&mut self, buffer: &mut [u8]) -> LxResult<usize> {
        if buffer.is_empty() || self.finished {
            return Ok(0);
        }

        let mut total = 0;
        while total < buffer.len() {
            match self.inner.read(&mut buffer[total..]) {
                Ok(0) => {
                    self.finished = true;
                    break;
                }
                Ok(n) => total += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(LxError::from_host(err)),
            }
        }

        self.position += total as u64;
        Ok(total)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// A gzip stream reader over the given input.
pub fn gzip<R: Read>(input: R) -> GzipStreamReader<R> {
    CodecReader::new(GzDecoder::new(input))
}

/// A bzip2 stream reader over the given input.
pub fn bzip2<R: Read>(input: R) -> Bzip2StreamReader<R> {
    CodecReader::new(BzDecoder::new(input))
}

/// An xz stream reader over the given input.
pub fn xz<R: Read>(input: R) -> XzStreamReader<R> {
    CodecReader::new(XzDecoder::new(input))
}

/// A raw lzma-alone stream reader over the given input.
pub fn lzma<R: Read>(input: R) -> LxResult<LzmaStreamReader<R>> {
    let stream = Stream::new_lzma_decoder(u64::MAX).map_err(|_| LxError::INVAL)?;
    Ok(CodecReader::new(XzDecoder::new_stream(input, stream)))
}

/// An lzop stream reader over the given input.
pub fn lzop<R: Read>(input: R) -> LzopStreamReader<R> {
    CodecReader::new(LzopDecoder::new(input))
}

/// An lz4 legacy-frame stream reader over the given input.
pub fn lz4<R: Read>(input: R) -> Lz4StreamReader<R> {
    CodecReader::new(Lz4LegacyDecoder::new(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gzip_round_trip() {
        let original: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let compressed = gzip_bytes(&original);

        let mut reader = gzip(&compressed[..]);
        let mut out = vec![0u8; original.len()];
        assert_eq!(reader.read(&mut out).unwrap(), original.len());
        assert_eq!(out, original);
        assert_eq!(reader.read(&mut [0u8; 8]).unwrap(), 0);
        assert_eq!(reader.position(), original.len() as u64);
    }

    #[test]
    fn gzip_chunked_reads_concatenate() {
        let original: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        let compressed = gzip_bytes(&original);

        let mut reader = gzip(&compressed[..]);
        let mut out = Vec::new();
        let mut chunk = [0u8; 97];
        loop {
            let n = reader.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, original);
    }

    #[test]
    fn xz_round_trip() {
        let original = b"xz round trip payload, repeated enough to compress".repeat(32);
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(&original).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut reader = xz(&compressed[..]);
        let mut out = vec![0u8; original.len()];
        assert_eq!(reader.read(&mut out).unwrap(), original.len());
        assert_eq!(out, original);
    }

    #[test]
    fn bzip2_round_trip() {
        let original = b"bzip2 payload ".repeat(100);
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(&original).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut reader = bzip2(&compressed[..]);
        let mut out = vec![0u8; original.len()];
        assert_eq!(reader.read(&mut out).unwrap(), original.len());
        assert_eq!(out, original);
    }

    #[test]
    fn discard_advances_position() {
        let original: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        let compressed = gzip_bytes(&original);

        let mut reader = gzip(&compressed[..]);
        assert_eq!(reader.discard(100).unwrap(), 100);
        assert_eq!(reader.position(), 100);

        let mut out = [0u8; 4];
        reader.read(&mut out).unwrap();
        assert_eq!(&out, &original[100..104]);
    }

    #[test]
    fn seek_is_forward_only() {
        let compressed = gzip_bytes(&[0u8; 256]);
        let mut reader = gzip(&compressed[..]);
        reader.seek(128).unwrap();
        assert_eq!(reader.seek(64), Err(LxError::INVAL));
        // Past the end of the decompressed stream.
        assert_eq!(reader.seek(1024), Err(LxError::IO));
    }

    #[test]
    fn corrupt_stream_is_an_io_error() {
        let mut compressed = gzip_bytes(b"some payload to damage");
        let mid = compressed.len() / 2;
        compressed[mid] ^= 0xFF;
        compressed[mid + 1] ^= 0xFF;

        let mut reader = gzip(&compressed[..]);
        let mut out = [0u8; 64];
        assert!(reader.read(&mut out).is_err());
    }
}
