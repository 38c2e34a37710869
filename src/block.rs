//! Block handles: the writer-side and reader-side views of a single block.

use std::fmt::Display;
use std::fs::File;
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::container::Container;
use crate::error::{Error, Result};
use crate::index::LogBlock;
use crate::manager::Core;

/// An opaque 64-bit block identifier, unique across the engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    pub fn new(raw: u64) -> Self {
        BlockId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Writer-side lifecycle. Appends are only legal before finalize; closing an
/// unfinalized block finalizes it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableBlockState {
    Clean,
    Dirty,
    Finalized,
    Closed,
}

/// A block being written into a checked-out container.
///
/// The handle owns the container checkout until finalize (or until commit,
/// when the manager is configured to hold containers through commit).
/// Dropping the handle before it is committed aborts the block: the ID is
/// unclaimed, nothing is published, and any bytes already written become
/// garbage for the next startup to reclaim.
pub struct WritableBlock {
    core: Arc<Core>,
    id: BlockId,
    container: Arc<Container>,
    holds_checkout: bool,
    state: WritableBlockState,
    block_offset: u64,
    bytes_appended: u64,
}

impl WritableBlock {
    pub(crate) fn new(core: Arc<Core>, id: BlockId, container: Arc<Container>) -> Self {
        let block_offset = container.next_block_offset();
        Self {
            core,
            id,
            container,
            holds_checkout: true,
            state: WritableBlockState::Clean,
            block_offset,
            bytes_appended: 0,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn state(&self) -> WritableBlockState {
        self.state
    }

    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }

    /// Streams more bytes into the block.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            WritableBlockState::Clean | WritableBlockState::Dirty => {}
            other => {
                return Err(Error::IO(format!(
                    "block {}: append in state {other:?}",
                    self.id
                )))
            }
        }
        self.container
            .write_data(self.block_offset + self.bytes_appended, data)?;
        self.bytes_appended += data.len() as u64;
        self.state = WritableBlockState::Dirty;
        Ok(())
    }

    /// Declares the block's bytes complete: fixes its length, advances the
    /// container's cursor past it, and (by default) releases the container
    /// so the next writer can start before this block commits.
    pub fn finalize(&mut self) -> Result<()> {
        match self.state {
            WritableBlockState::Clean | WritableBlockState::Dirty => {}
            WritableBlockState::Finalized => return Ok(()),
            WritableBlockState::Closed => {
                return Err(Error::IO(format!("block {}: finalize after close", self.id)))
            }
        }
        let offset = self.container.allocate(self.bytes_appended)?;
        debug_assert_eq!(offset, self.block_offset);
        self.state = WritableBlockState::Finalized;
        if self.core.config().release_container_on_finalize {
            self.release_checkout();
        }
        Ok(())
    }

    /// Commits the block on its own: an inline single-block creation
    /// transaction (data sync, CREATE record, metadata and directory sync,
    /// index publication).
    pub fn close(self) -> Result<()> {
        let core = self.core.clone();
        crate::manager::transaction::commit_creation(&core, vec![self])
    }

    /// Drops the block without publishing it.
    pub fn abort(mut self) -> Result<()> {
        self.cleanup();
        Ok(())
    }

    pub(crate) fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub(crate) fn offset(&self) -> u64 {
        self.block_offset
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.state == WritableBlockState::Finalized
    }

    /// Marks the block committed so drop performs no abort cleanup.
    pub(crate) fn mark_committed(&mut self) {
        self.state = WritableBlockState::Closed;
        self.holds_checkout = false;
    }

    /// Releases the container checkout back to the pool, if still held.
    pub(crate) fn release_checkout(&mut self) {
        if self.holds_checkout {
            self.holds_checkout = false;
            self.core.make_container_available(&self.container);
        }
    }

    fn cleanup(&mut self) {
        if self.state != WritableBlockState::Closed {
            self.state = WritableBlockState::Closed;
            self.release_checkout();
            self.core.release_block_id(self.id);
        }
    }
}

impl Drop for WritableBlock {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for WritableBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableBlock")
            .field("id", &self.id)
            .field("container", &self.container.name())
            .field("state", &self.state)
            .field("bytes_appended", &self.bytes_appended)
            .finish()
    }
}

/// A published block opened for random-access reads. The descriptor comes
/// from the shared file cache and closes when the last reader drops it.
pub struct ReadableBlock {
    block: Arc<LogBlock>,
    file: Arc<File>,
}

impl ReadableBlock {
    pub(crate) fn new(block: Arc<LogBlock>, file: Arc<File>) -> Self {
        Self { block, file }
    }

    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    pub fn length(&self) -> u64 {
        self.block.length()
    }

    /// Reads `buf.len()` bytes starting at `offset` within the block.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Error::IO(format!("block {}: read range overflow", self.id())))?;
        if end > self.block.length() {
            return Err(Error::IO(format!(
                "block {}: read [{offset}, {end}) past length {}",
                self.id(),
                self.block.length()
            )));
        }
        self.file
            .read_exact_at(buf, self.block.offset() + offset)?;
        Ok(())
    }

    /// Reads the whole block.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block.length() as usize];
        self.read_at(0, &mut buf)?;
        Ok(buf)
    }
}

impl std::fmt::Debug for ReadableBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableBlock")
            .field("id", &self.id())
            .field("length", &self.length())
            .finish()
    }
}
