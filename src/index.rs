//! The in-memory block index: the authoritative map from block ID to
//! on-disk location, plus the set of IDs currently being written.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::block::BlockId;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::memory::MemTracker;

/// Estimated heap footprint of one index entry, charged to the memory
/// tracker per live block.
pub const BLOCK_ENTRY_FOOTPRINT: u64 = 64;

/// A live block's index entry. Holds shared ownership of its container so a
/// container outlives every block that points into it.
pub struct LogBlock {
    container: Arc<Container>,
    id: BlockId,
    offset: u64,
    length: u64,
}

impl LogBlock {
    pub fn new(container: Arc<Container>, id: BlockId, offset: u64, length: u64) -> Self {
        Self {
            container,
            id,
            offset,
            length,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }
}

impl std::fmt::Debug for LogBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBlock")
            .field("id", &self.id)
            .field("container", &self.container.name())
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

/// Index state. Callers hold the manager's lock around every method; the
/// index itself is single-threaded data.
pub struct BlockIndex {
    blocks: HashMap<BlockId, Arc<LogBlock>>,
    open_ids: HashSet<BlockId>,
    mem_tracker: Arc<MemTracker>,
}

impl BlockIndex {
    pub fn new(mem_tracker: Arc<MemTracker>) -> Self {
        Self {
            blocks: HashMap::new(),
            open_ids: HashSet::new(),
            mem_tracker,
        }
    }

    /// Reserves `id` for a new writer. False if the ID is live or already
    /// being written.
    pub fn try_claim(&mut self, id: BlockId) -> bool {
        if self.blocks.contains_key(&id) {
            return false;
        }
        self.open_ids.insert(id)
    }

    /// Returns a writer's claim without publishing (abort path).
    pub fn release_claim(&mut self, id: BlockId) {
        self.open_ids.remove(&id);
    }

    /// Publishes a committed block, consuming its claim.
    pub fn publish(&mut self, block: Arc<LogBlock>) -> Result<()> {
        let id = block.id();
        if self.blocks.contains_key(&id) {
            return Err(Error::AlreadyPresent(format!("block {id}")));
        }
        self.open_ids.remove(&id);
        self.blocks.insert(id, block);
        self.mem_tracker.consume(BLOCK_ENTRY_FOOTPRINT);
        Ok(())
    }

    /// Publishes a block replayed at startup; there is no claim to consume.
    pub fn publish_recovered(&mut self, block: Arc<LogBlock>) -> Result<()> {
        let id = block.id();
        if self.blocks.insert(id, block).is_some() {
            return Err(Error::AlreadyPresent(format!(
                "block {id} recovered from two containers"
            )));
        }
        self.mem_tracker.consume(BLOCK_ENTRY_FOOTPRINT);
        Ok(())
    }

    /// Removes a block, e.g. when a deletion commits.
    pub fn remove(&mut self, id: BlockId) -> Option<Arc<LogBlock>> {
        let removed = self.blocks.remove(&id);
        if removed.is_some() {
            self.mem_tracker.release(BLOCK_ENTRY_FOOTPRINT);
        }
        removed
    }

    pub fn get(&self, id: BlockId) -> Option<Arc<LogBlock>> {
        self.blocks.get(&id).cloned()
    }

    /// Snapshot of all live block IDs.
    pub fn all_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn open_id_count(&self) -> usize {
        self.open_ids.len()
    }
}
