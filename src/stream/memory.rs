//! In-memory stream reader.

use crate::error::LxResult;
use crate::stream::StreamReader;

/// Reads from a borrowed or owned byte buffer. Reads past the end of the
/// buffer truncate rather than fail.
#[derive(Debug)]
pub struct MemoryStreamReader<B: AsRef<[u8]>> {
    data: B,
    position: usize,
}

impl<B: AsRef<[u8]>> MemoryStreamReader<B> {
    pub fn new(data: B) -> Self {
        MemoryStreamReader { data, position: 0 }
    }

    /// Total length of the underlying buffer.
    pub fn len(&self) -> usize {
        self.data.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.as_ref().is_empty()
    }
}

impl<B: AsRef<[u8]>> StreamReader for MemoryStreamReader<B> {
    fn read(&mut self, buffer: &mut [u8]) -> LxResult<usize> {
        let data = self.data.as_ref();
        let available = data.len().saturating_sub(self.position);
        let count = buffer.len().min(available);
        buffer[..count].copy_from_slice(&data[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }

    fn discard(&mut self, count: usize) -> LxResult<usize> {
        let available = self.data.as_ref().len().saturating_sub(self.position);
        let count = count.min(available);
        self.position += count;
        Ok(count)
    }

    fn position(&self) -> u64 {
        self.position as u64
    }
}
