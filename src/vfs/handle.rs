//! Open file handles.
//!
//! A handle pairs shared state (the resolved path and the cursor) with
//! per-descriptor flags. Duplicated handles observe each other's seeks
//! because the cursor lives in the shared half; flags are copied, and
//! duplication clears `O_CLOEXEC` as `dup(2)` does.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{LxError, LxResult};

use super::path::PathNode;
use super::{FileNode, HandleFlags, Mount, Node, NodeType};

/// Where a seek offset is applied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

impl Whence {
    pub fn from_raw(whence: i32) -> LxResult<Whence> {
        match whence {
            libc::SEEK_SET => Ok(Whence::Set),
            libc::SEEK_CUR => Ok(Whence::Current),
            libc::SEEK_END => Ok(Whence::End),
            _ => Err(LxError::INVAL),
        }
    }
}

struct Shared {
    path: Arc<PathNode>,
    position: AtomicU64,
}

/// An open reference to a node.
pub struct Handle {
    shared: Arc<Shared>,
    flags: HandleFlags,
}

impl Handle {
    /// Opens a handle against an already-resolved path.
    pub fn open(path: Arc<PathNode>, flags: HandleFlags) -> LxResult<Handle> {
        flags.access_mode()?;

        if flags.contains(HandleFlags::DIRECTORY) && path.node.node_type() != NodeType::Directory {
            return Err(LxError::NOTDIR);
        }
        if !flags.contains(HandleFlags::PATH)
            && path.node.node_type() == NodeType::Directory
            && flags.writable()
        {
            return Err(LxError::ISDIR);
        }

        Ok(Handle {
            shared: Arc::new(Shared {
                path,
                position: AtomicU64::new(0),
            }),
            flags,
        })
    }

    pub fn flags(&self) -> HandleFlags {
        self.flags
    }

    pub fn path(&self) -> &Arc<PathNode> {
        &self.shared.path
    }

    pub fn node(&self) -> &Node {
        &self.shared.path.node
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.shared.path.mount
    }

    pub fn position(&self) -> u64 {
        self.shared.position.load(Ordering::Relaxed)
    }

    /// Duplicates the handle: the cursor is shared, the flags are copied,
    /// and `O_CLOEXEC` is cleared on the copy.
    pub fn duplicate(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
            flags: self.flags - HandleFlags::CLOEXEC,
        }
    }

    fn file(&self) -> LxResult<&Arc<dyn FileNode>> {
        // A path-only handle can hold and traverse, never transfer data.
        if self.flags.contains(HandleFlags::PATH) {
            return Err(LxError::ACCES);
        }
        self.node().as_file()
    }

    fn maybe_update_atime(&self) {
        if !self.flags.contains(HandleFlags::NOATIME) {
            self.node()
                .metadata()
                .update_atime(self.mount().flags());
        }
    }

    /// `O_SYNC`/`O_DSYNC`/`O_DIRECT` request write-through semantics.
    fn write_through(&self, file: &Arc<dyn FileNode>) -> LxResult<()> {
        if self
            .flags
            .intersects(HandleFlags::SYNC | HandleFlags::DSYNC | HandleFlags::DIRECT)
        {
            file.sync_data(self.mount())?;
        }
        Ok(())
    }

    /// Reads at the cursor and advances it.
    pub fn read(&self, buffer: &mut [u8]) -> LxResult<usize> {
        if !self.flags.readable() {
            return Err(LxError::ACCES);
        }
        let file = self.file()?;

        let position = self.position();
        let count = file.read_at(self.mount(), position, buffer)?;
        self.shared
            .position
            .store(position + count as u64, Ordering::Relaxed);

        self.maybe_update_atime();
        Ok(count)
    }

    /// Reads at an explicit position without moving the cursor.
    pub fn read_at(&self, offset: i64, whence: Whence, buffer: &mut [u8]) -> LxResult<usize> {
        if !self.flags.readable() {
            return Err(LxError::ACCES);
        }
        let file = self.file()?;

        let position = self.adjust_position(offset, whence)?;
        let count = file.read_at(self.mount(), position, buffer)?;

        self.maybe_update_atime();
        Ok(count)
    }

    /// Writes at the cursor (or the end of the file with `O_APPEND`) and
    /// advances it.
    pub fn write(&self, buffer: &[u8]) -> LxResult<usize> {
        if !self.flags.writable() {
            return Err(LxError::ACCES);
        }
        let file = self.file()?;

        let position = if self.flags.contains(HandleFlags::APPEND) {
            file.length(self.mount())?
        } else {
            self.position()
        };
        let count = file.write_at(self.mount(), position, buffer)?;
        self.shared
            .position
            .store(position + count as u64, Ordering::Relaxed);

        self.node().metadata().touch_modified();
        self.write_through(file)?;
        Ok(count)
    }

    /// Writes at an explicit position without moving the cursor.
    pub fn write_at(&self, offset: i64, whence: Whence, buffer: &[u8]) -> LxResult<usize> {
        if !self.flags.writable() {
            return Err(LxError::ACCES);
        }
        let file = self.file()?;

        let position = self.adjust_position(offset, whence)?;
        let count = file.write_at(self.mount(), position, buffer)?;

        self.node().metadata().touch_modified();
        self.write_through(file)?;
        Ok(count)
    }

    /// Moves the cursor and returns the new position.
    pub fn seek(&self, offset: i64, whence: Whence) -> LxResult<u64> {
        let position = self.adjust_position(offset, whence)?;
        self.shared.position.store(position, Ordering::Relaxed);
        Ok(position)
    }

    fn adjust_position(&self, offset: i64, whence: Whence) -> LxResult<u64> {
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Current => self.position() as i64,
            Whence::End => self.node().as_file()?.length(self.mount())? as i64,
        };
        let position = base.checked_add(offset).ok_or(LxError::INVAL)?;
        if position < 0 {
            return Err(LxError::INVAL);
        }
        Ok(position as u64)
    }

    pub fn length(&self) -> LxResult<u64> {
        self.node().as_file()?.length(self.mount())
    }

    pub fn set_length(&self, length: u64) -> LxResult<u64> {
        if !self.flags.writable() {
            return Err(LxError::ACCES);
        }
        let file = self.file()?;
        let length = file.set_length(self.mount(), length)?;
        self.node().metadata().touch_modified();
        Ok(length)
    }

    pub fn sync(&self) -> LxResult<()> {
        self.node().sync(self.mount())
    }

    pub fn sync_data(&self) -> LxResult<()> {
        match self.node() {
            Node::File(file) => file.sync_data(self.mount()),
            node => node.sync(self.mount()),
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("node", self.node())
            .field("flags", &self.flags)
            .field("position", &self.position())
            .finish()
    }
}
