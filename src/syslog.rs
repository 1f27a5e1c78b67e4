//! The system log: a bounded ring of kernel-style log entries.
//!
//! Modeled on the Linux printk ring buffer. The buffer is not a circular
//! byte stream; it holds whole, self-delimiting entries between a linear
//! tail (oldest) and head (write position). When an entry would cross the
//! high end of the buffer the remaining bytes are stamped with a wrap
//! sentinel and the head returns to the top. Writers evict entries from the
//! tail until the new entry fits.
//!
//! Invariants:
//! - `head == tail` means the buffer is empty; an entry never ends exactly
//!   at the tail position.
//! - Both pointers always rest where a full entry header fits, or get
//!   wrapped to the top before the next access.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicI8, Ordering};
use std::time::Instant;

use num_enum::TryFromPrimitive;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Log entry severity, matching the Linux klog levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(i8)]
pub enum LogLevel {
    /// Resolve against the current default level.
    Default = -1,
    /// System is unusable.
    Emergency = 0,
    /// Action must be taken immediately.
    Alert = 1,
    /// Critical conditions.
    Critical = 2,
    /// Error conditions.
    Error = 3,
    /// Warning conditions.
    Warning = 4,
    /// Normal but significant condition.
    Notice = 5,
    /// Informational.
    Informational = 6,
    /// Debug-level messages.
    Debug = 7,
}

/// Default ring buffer size.
pub const DEFAULT_BUFFER: usize = 2 << 20;

/// Lower clamp on the ring buffer size.
pub const MIN_BUFFER: usize = 128 << 10;

/// Upper clamp on the ring buffer size.
pub const MAX_BUFFER: usize = 8 << 20;

// Entries are padded out to pointer alignment.
const ENTRY_ALIGN: usize = std::mem::align_of::<usize>();

// An aligned entry must stay below the u16 wrap sentinel.
const MAX_MESSAGE: usize = (u16::MAX as usize + 1) - ENTRY_ALIGN - HEADER_LEN;

const HEADER_LEN: usize = std::mem::size_of::<EntryHeader>();

/// In-buffer layout of a single entry header, followed by the message bytes
/// and padding up to `entry_len`.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct EntryHeader {
    timestamp: i64,
    entry_len: u16,
    message_len: u16,
    facility_level: u8, // facility in the low five bits, level in the top three
    reserved: [u8; 3],
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

struct LogBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl LogBuffer {
    /// Advances the tail past the entry it points at. No-op when empty.
    fn increment_tail(&mut self) {
        if self.tail == self.head {
            return;
        }

        // A tail resting where no header fits, or on sentinel bytes, belongs
        // back at the top of the buffer.
        if self.tail + HEADER_LEN > self.buf.len() {
            self.tail = 0;
            return;
        }
        let entry_len = u16::from_ne_bytes([self.buf[self.tail + 8], self.buf[self.tail + 9]]);
        if entry_len == u16::MAX {
            self.tail = 0;
            return;
        }

        // A zero-length entry would stall the scan; treat the buffer as drained.
        if (entry_len as usize) < HEADER_LEN {
            self.tail = self.head;
            return;
        }

        self.tail += entry_len as usize;
        if self.tail != self.head && self.tail + HEADER_LEN > self.buf.len() {
            self.tail = 0;
        }
    }
}

/// The system log ring buffer.
///
/// Writers take the write lock for the brief materialization section;
/// readers hold the read lock for the lifetime of a [`LogReader`] and
/// observe a consistent snapshot.
pub struct SystemLog {
    inner: RwLock<LogBuffer>,
    default_level: AtomicI8,
    origin: Instant,
    console: Mutex<Option<Box<dyn Write + Send>>>,
}

impl SystemLog {
    /// Creates a log with the requested capacity, clamped to
    /// [`MIN_BUFFER`]..=[`MAX_BUFFER`] and rounded up to the page size.
    pub fn new(size: usize) -> SystemLog {
        let size = align_up(size.clamp(MIN_BUFFER, MAX_BUFFER), page_size::get());
        Self::with_buffer(size)
    }

    fn with_buffer(size: usize) -> SystemLog {
        SystemLog {
            inner: RwLock::new(LogBuffer {
                buf: vec![0u8; size].into_boxed_slice(),
                head: 0,
                tail: 0,
            }),
            default_level: AtomicI8::new(LogLevel::Warning as i8),
            origin: Instant::now(),
            console: Mutex::new(None),
        }
    }

    /// The capacity of the ring buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.read().buf.len()
    }

    /// The current default level applied to `LogLevel::Default` writes.
    pub fn default_level(&self) -> LogLevel {
        LogLevel::try_from(self.default_level.load(Ordering::Relaxed)).unwrap_or(LogLevel::Warning)
    }

    /// Changes the default level. `LogLevel::Default` is rejected as a no-op.
    pub fn set_default_level(&self, level: LogLevel) {
        if level != LogLevel::Default {
            self.default_level.store(level as i8, Ordering::Relaxed);
        }
    }

    /// Attaches or detaches the console sink mirrored by every write.
    pub fn set_console(&self, sink: Option<Box<dyn Write + Send>>) {
        *self.console.lock() = sink;
    }

    /// Appends an entry. Messages longer than the maximum payload are
    /// truncated, never rejected. The facility is masked to five bits.
    pub fn write(&self, facility: u8, level: LogLevel, message: &[u8]) {
        let level = match level {
            LogLevel::Default => self.default_level(),
            level => level,
        };
        let message = &message[..message.len().min(MAX_MESSAGE)];
        let entry_len = align_up(HEADER_LEN + message.len(), ENTRY_ALIGN);

        {
            let mut inner = self.inner.write();
            let buf_len = inner.buf.len();

            // Wrap: stamp the remaining tail region with the sentinel and
            // restart the head at the top of the buffer.
            if inner.head + entry_len > buf_len {
                if inner.tail == 0 {
                    inner.increment_tail();
                }
                let head = inner.head;
                inner.buf[head..].fill(0xFF);
                inner.head = 0;
            }

            // Push the tail out of the way of the incoming entry. Once the
            // tail wraps back below the head it can no longer overlap.
            while inner.head < inner.tail && inner.head + entry_len >= inner.tail {
                inner.increment_tail();
            }

            let header = EntryHeader {
                timestamp: self.origin.elapsed().as_nanos() as i64,
                entry_len: entry_len as u16,
                message_len: message.len() as u16,
                facility_level: (facility & 0x1F) | ((level as u8 & 0x07) << 5),
                reserved: [0; 3],
            };

            let head = inner.head;
            inner.buf[head..head + HEADER_LEN].copy_from_slice(header.as_bytes());
            inner.buf[head + HEADER_LEN..head + HEADER_LEN + message.len()].copy_from_slice(message);
            inner.head = head + entry_len;
        }

        // Console mirroring happens outside the buffer lock and is
        // best-effort; failures are silent.
        if let Some(sink) = self.console.lock().as_mut() {
            let _ = sink.write_all(message);
            let _ = sink.write_all(b"\n");
            let _ = sink.flush();
        }
    }

    /// Takes a read lock on the buffer for iteration.
    pub fn reader(&self) -> LogReader<'_> {
        LogReader {
            inner: self.inner.read(),
        }
    }
}

impl fmt::Debug for SystemLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemLog")
            .field("capacity", &self.capacity())
            .field("default_level", &self.default_level())
            .finish_non_exhaustive()
    }
}

/// A consistent snapshot of the log, held under the read lock.
pub struct LogReader<'a> {
    inner: RwLockReadGuard<'a, LogBuffer>,
}

impl std::fmt::Debug for LogReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogReader").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for LogEntries<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEntries")
            .field("pos", &self.pos)
            .field("head", &self.head)
            .finish()
    }
}

impl LogReader<'_> {
    /// Iterates the live entries from oldest to newest.
    pub fn iter(&self) -> LogEntries<'_> {
        LogEntries {
            buf: &self.inner.buf,
            head: self.inner.head,
            pos: self.inner.tail,
        }
    }
}

/// Iterator over live log entries.
pub struct LogEntries<'a> {
    buf: &'a [u8],
    head: usize,
    pos: usize,
}

/// A borrowed view of one log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry<'a> {
    /// Monotonic timestamp in nanoseconds since the log was created.
    pub timestamp: i64,
    /// Caller-supplied facility code (five bits).
    pub facility: u8,
    /// Entry severity.
    pub level: LogLevel,
    /// The message bytes.
    pub message: &'a [u8],
}

impl<'a> Iterator for LogEntries<'a> {
    type Item = LogEntry<'a>;

    fn next(&mut self) -> Option<LogEntry<'a>> {
        loop {
            if self.pos == self.head {
                return None;
            }
            if self.pos + HEADER_LEN > self.buf.len() {
                self.pos = 0;
                continue;
            }

            let Ok(header) = EntryHeader::read_from_bytes(&self.buf[self.pos..self.pos + HEADER_LEN])
            else {
                return None;
            };
            if header.entry_len == u16::MAX {
                self.pos = 0;
                continue;
            }
            if (header.entry_len as usize) < HEADER_LEN {
                return None;
            }

            let message_start = self.pos + HEADER_LEN;
            let message = &self.buf[message_start..message_start + header.message_len as usize];

            let next = self.pos + header.entry_len as usize;
            self.pos = if next != self.head && next + HEADER_LEN > self.buf.len() {
                0
            } else {
                next
            };

            return Some(LogEntry {
                timestamp: header.timestamp,
                facility: header.facility_level & 0x1F,
                level: LogLevel::try_from((header.facility_level >> 5) as i8)
                    .unwrap_or(LogLevel::Emergency),
                message,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(log: &SystemLog) -> Vec<Vec<u8>> {
        let reader = log.reader();
        let out = reader.iter().map(|e| e.message.to_vec()).collect();
        out
    }

    #[test]
    fn header_layout() {
        assert_eq!(HEADER_LEN, 16);
        assert_eq!(HEADER_LEN % ENTRY_ALIGN, 0);
    }

    #[test]
    fn size_clamping() {
        assert!(SystemLog::new(1).capacity() >= MIN_BUFFER);
        assert!(SystemLog::new(usize::MAX / 2).capacity() <= MAX_BUFFER + page_size::get());
        assert_eq!(SystemLog::new(DEFAULT_BUFFER).capacity() % page_size::get(), 0);
    }

    #[test]
    fn simple_writes_in_order() {
        let log = SystemLog::with_buffer(4096);
        log.write(0, LogLevel::Informational, b"first");
        log.write(3, LogLevel::Error, b"second");

        let reader = log.reader();
        let entries: Vec<_> = reader.iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, b"first");
        assert_eq!(entries[0].facility, 0);
        assert_eq!(entries[0].level, LogLevel::Informational);
        assert_eq!(entries[1].message, b"second");
        assert_eq!(entries[1].facility, 3);
        assert_eq!(entries[1].level, LogLevel::Error);
        assert!(entries[0].timestamp <= entries[1].timestamp);
    }

    #[test]
    fn default_level_resolution() {
        let log = SystemLog::with_buffer(4096);
        log.set_default_level(LogLevel::Notice);
        // Default as an argument to set_default_level is a no-op.
        log.set_default_level(LogLevel::Default);
        assert_eq!(log.default_level(), LogLevel::Notice);

        log.write(0, LogLevel::Default, b"resolved");
        let reader = log.reader();
        assert_eq!(reader.iter().next().unwrap().level, LogLevel::Notice);
    }

    #[test]
    fn truncates_oversized_messages() {
        let log = SystemLog::new(MIN_BUFFER);
        let big = vec![b'x'; MAX_MESSAGE + 4096];
        log.write(0, LogLevel::Warning, &big);

        let reader = log.reader();
        let entry = reader.iter().next().unwrap();
        assert_eq!(entry.message.len(), MAX_MESSAGE);
    }

    #[test]
    fn wraps_and_keeps_a_suffix() {
        let log = SystemLog::with_buffer(1024);
        let mut written = Vec::new();
        for i in 0..20u8 {
            let msg = vec![b'a' + (i % 26); 200];
            log.write(0, LogLevel::Informational, &msg);
            written.push(msg);
        }

        let live = messages(&log);
        // 16-byte header + 200-byte message, aligned: 216 bytes per entry.
        // Four whole entries plus the wrap sentinel fill the 1024-byte ring.
        assert_eq!(live.len(), 4);
        assert_eq!(&written[written.len() - live.len()..], &live[..]);

        let reader = log.reader();
        let total: usize = reader.iter().map(|e| align_up(HEADER_LEN + e.message.len(), ENTRY_ALIGN)).sum();
        assert!(total <= 1024);
    }

    #[test]
    fn wrapped_timestamps_stay_monotonic() {
        let log = SystemLog::with_buffer(1024);
        for _ in 0..50 {
            log.write(0, LogLevel::Informational, &[b'm'; 100]);
        }
        let reader = log.reader();
        let stamps: Vec<i64> = reader.iter().map(|e| e.timestamp).collect();
        assert!(!stamps.is_empty());
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn empty_log_has_no_entries() {
        let log = SystemLog::with_buffer(4096);
        assert_eq!(log.reader().iter().count(), 0);
    }
}
