//! lzop container decoder.
//!
//! Walks the lzop file format (magic `89 "LZO" 00 0D 0A 1A 0A`): a header
//! with optional fields gated by version and flag bits, then a sequence of
//! blocks carrying big-endian uncompressed/compressed lengths, optional
//! checksums, and LZO1X data. Blocks whose compressed length equals the
//! uncompressed length are stored verbatim. Checksums are skipped, not
//! verified; they cannot authenticate the archive anyway.
//!
//! No crate in the ecosystem this project draws from provides LZO, so the
//! LZO1X-1 block decoder lives here as well.

use std::io;
use std::io::Read;

const LZOP_MAGIC: [u8; 9] = [0x89, b'L', b'Z', b'O', 0x00, 0x0D, 0x0A, 0x1A, 0x0A];

const F_ADLER32_D: u32 = 0x0000_0001;
const F_ADLER32_C: u32 = 0x0000_0002;
const F_H_EXTRA_FIELD: u32 = 0x0000_0040;
const F_CRC32_D: u32 = 0x0000_0100;
const F_CRC32_C: u32 = 0x0000_0200;
const F_H_FILTER: u32 = 0x0000_0800;

// Upper bound on a declared block size; lzop itself never writes blocks
// larger than 64 MiB.
const MAX_BLOCK: usize = 64 << 20;

fn corrupt(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Streaming decoder for lzop archives.
#[derive(Debug)]
pub struct LzopDecoder<R: Read> {
    inner: R,
    flags: Option<u32>,
    block: Vec<u8>,
    offset: usize,
    done: bool,
}

impl<R: Read> LzopDecoder<R> {
    pub fn new(inner: R) -> Self {
        LzopDecoder {
            inner,
            flags: None,
            block: Vec::new(),
            offset: 0,
            done: false,
        }
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_u16(&mut self) -> io::Result<u16> {
        let mut b = [0u8; 2];
        self.inner.read_exact(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn skip(&mut self, mut count: usize) -> io::Result<()> {
        let mut scratch = [0u8; 256];
        while count > 0 {
            let chunk = count.min(scratch.len());
            self.inner.read_exact(&mut scratch[..chunk])?;
            count -= chunk;
        }
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<u32> {
        let mut magic = [0u8; 9];
        self.inner.read_exact(&mut magic)?;
        if magic != LZOP_MAGIC {
            return Err(corrupt("lzop: bad magic"));
        }

        let version = self.read_u16()?;
        let _lib_version = self.read_u16()?;
        if version >= 0x0940 {
            let _version_needed = self.read_u16()?;
        }

        let method = self.read_u8()?;
        if !(1..=3).contains(&method) {
            return Err(corrupt("lzop: unsupported compression method"));
        }
        if version >= 0x0940 {
            let _level = self.read_u8()?;
        }

        let flags = self.read_u32()?;
        if flags & F_H_FILTER != 0 {
            let _filter = self.read_u32()?;
        }

        let _mode = self.read_u32()?;
        let _mtime = self.read_u32()?;
        if version >= 0x0034 {
            let _gmtdiff = self.read_u32()?;
        }

        let name_len = self.read_u8()? as usize;
        self.skip(name_len)?;
        let _header_checksum = self.read_u32()?;

        if flags & F_H_EXTRA_FIELD != 0 {
            let extra_len = self.read_u32()? as usize;
            self.skip(extra_len)?;
            let _extra_checksum = self.read_u32()?;
        }

        Ok(flags)
    }

    /// Loads and decompresses the next block, returning false on the
    /// zero-length end-of-archive block.
    fn fill_block(&mut self) -> io::Result<bool> {
        let flags = match self.flags {
            Some(flags) => flags,
            None => {
                let flags = self.read_header()?;
                self.flags = Some(flags);
                flags
            }
        };

        let dst_len = self.read_u32()? as usize;
        if dst_len == 0 {
            return Ok(false);
        }
        if dst_len > MAX_BLOCK {
            return Err(corrupt("lzop: implausible block length"));
        }

        let src_len = self.read_u32()? as usize;
        if src_len == 0 || src_len > dst_len {
            return Err(corrupt("lzop: implausible compressed length"));
        }

        if flags & (F_ADLER32_D | F_CRC32_D) != 0 {
            let _data_checksum = self.read_u32()?;
        }
        if flags & (F_ADLER32_C | F_CRC32_C) != 0 && src_len < dst_len {
            let _compressed_checksum = self.read_u32()?;
        }

        let mut data = vec![0u8; src_len];
        self.inner.read_exact(&mut data)?;

        self.block = if src_len == dst_len {
            data
        } else {
            lzo1x_decompress(&data, dst_len)?
        };
        self.offset = 0;
        Ok(true)
    }
}

impl<R: Read> Read for LzopDecoder<R> {
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

/// Decompresses one LZO1X block.
///
/// Opcode interpretation depends on `state`: 0 after a run of literals was
/// consumed by a match's low bits, 1-3 after that many trailing literals,
/// 4 after an explicit literal run.
fn lzo1x_decompress(input: &[u8], expected: usize) -> io::Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::with_capacity(expected);
    let mut ip = 0usize;

    fn byte(input: &[u8], ip: &mut usize) -> io::Result<usize> {
        let b = *input.get(*ip).ok_or_else(|| corrupt("lzo: input overrun"))?;
        *ip += 1;
        Ok(b as usize)
    }

    fn extended_length(input: &[u8], ip: &mut usize, base: usize) -> io::Result<usize> {
        let mut len = 0usize;
        loop {
            let b = byte(input, ip)?;
            if b != 0 {
                return Ok(len + base + b);
            }
            len += 255;
            if len > MAX_BLOCK {
                return Err(corrupt("lzo: runaway length"));
            }
        }
    }

    fn copy_literals(
        input: &[u8],
        ip: &mut usize,
        out: &mut Vec<u8>,
        count: usize,
    ) -> io::Result<()> {
        if *ip + count > input.len() {
            return Err(corrupt("lzo: input overrun"));
        }
        out.extend_from_slice(&input[*ip..*ip + count]);
        *ip += count;
        Ok(())
    }

    fn copy_match(out: &mut Vec<u8>, distance: usize, length: usize) -> io::Result<()> {
        let start = out
            .len()
            .checked_sub(distance)
            .ok_or_else(|| corrupt("lzo: match before output start"))?;
        // Matches may overlap their own output; copy bytewise.
        for i in 0..length {
            let b = out[start + i];
            out.push(b);
        }
        Ok(())
    }

    let mut state;

    // The first byte optionally encodes an initial literal run.
    let first = byte(input, &mut ip)?;
    if first > 17 {
        let run = first - 17;
        copy_literals(input, &mut ip, &mut out, run)?;
        state = if run < 4 { run } else { 4 };
    } else {
        ip = 0;
        state = 0;
    }

    loop {
        let t = byte(input, &mut ip)?;

        let next = if t >= 64 {
            // 3..8 byte match, distance 1..2048.
            let d = byte(input, &mut ip)?;
            let distance = 1 + ((t >> 2) & 7) + (d << 3);
            copy_match(&mut out, distance, (t >> 5) + 1)?;
            t & 3
        } else if t >= 32 {
            // Arbitrary-length match, distance 1..16384.
            let len = match t & 31 {
                0 => extended_length(input, &mut ip, 31)?,
                len => len,
            };
            let d = byte(input, &mut ip)? | (byte(input, &mut ip)? << 8);
            copy_match(&mut out, 1 + (d >> 2), len + 2)?;
            d & 3
        } else if t >= 16 {
            // Long-distance match, 16384..49151, and the end marker.
            let high = (t & 8) << 11;
            let len = match t & 7 {
                0 => extended_length(input, &mut ip, 7)?,
                len => len,
            };
            let d = byte(input, &mut ip)? | (byte(input, &mut ip)? << 8);
            let distance = high + (d >> 2);
            if distance == 0 {
                break;
            }
            copy_match(&mut out, distance + 0x4000, len + 2)?;
            d & 3
        } else if state == 0 {
            // Literal run.
            let len = match t {
                0 => extended_length(input, &mut ip, 15)?,
                len => len,
            };
            copy_literals(input, &mut ip, &mut out, len + 3)?;
            state = 4;
            continue;
        } else if state == 4 {
            // Three-byte match following a literal run, distance 2049..3072.
            let d = byte(input, &mut ip)?;
            copy_match(&mut out, 0x801 + (t >> 2) + (d << 2), 3)?;
            t & 3
        } else {
            // Two-byte match following 1-3 trailing literals, distance 1..1024.
            let d = byte(input, &mut ip)?;
            copy_match(&mut out, 1 + (t >> 2) + (d << 2), 2)?;
            t & 3
        };

        copy_literals(input, &mut ip, &mut out, next)?;
        state = next;
    }

    if out.len() != expected {
        return Err(corrupt("lzo: length mismatch"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let mut decoder = LzopDecoder::new(&[0u8; 64][..]);
        let mut out = Vec::new();
        assert!(decoder.read_to_end(&mut out).is_err());
    }

    #[test]
    fn decodes_stored_blocks() {
        // Minimal version-0x1030 header, no optional fields, no checksums,
        // followed by one stored block and the end-of-archive block.
        let mut archive = LZOP_MAGIC.to_vec();
        archive.extend_from_slice(&0x1030u16.to_be_bytes()); // version
        archive.extend_from_slice(&0x2080u16.to_be_bytes()); // library version
        archive.push(1); // method: lzo1x_1
        archive.extend_from_slice(&0u32.to_be_bytes()); // flags
        archive.extend_from_slice(&0o644u32.to_be_bytes()); // mode
        archive.extend_from_slice(&0u32.to_be_bytes()); // mtime
        archive.extend_from_slice(&0u32.to_be_bytes()); // gmtdiff
        archive.push(0); // no name
        archive.extend_from_slice(&0u32.to_be_bytes()); // header checksum

        let payload = b"stored, not compressed";
        archive.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        archive.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        archive.extend_from_slice(payload);
        archive.extend_from_slice(&0u32.to_be_bytes()); // end of archive

        let mut decoder = LzopDecoder::new(&archive[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn lzo1x_literal_run_and_match() {
        // Hand-assembled block: initial literal run of 4 ("abcd"), an
        // M1 match after the run copying 3 bytes at distance 2049 is out of
        // range here, so use an M2 match instead: opcode 0x6C copies four
        // bytes from distance 4 ("abcd"), then the end marker.
        //
        // 0x15 = 17 + 4 initial literals.
        let block = [
            0x15, b'a', b'b', b'c', b'd', // literals
            0x6C, 0x00, // M2: len (0x6C>>5)+1 = 4, distance 1+((0x6C>>2)&7)+0 = 4
            0x11, 0x00, 0x00, // end marker
        ];
        let out = lzo1x_decompress(&block, 8).unwrap();
        assert_eq!(&out, b"abcdabcd");
    }

    #[test]
    fn lzo1x_rejects_truncation() {
        let block = [0x15, b'a', b'b'];
        assert!(lzo1x_decompress(&block, 8).is_err());
    }
}
