//! Creation and deletion transactions.
//!
//! A creation transaction orders its IO so that a crash at any point leaves
//! either a published block or reclaimable garbage, never a visible
//! half-block: data bytes are synced before their CREATE records are
//! appended, records are synced (along with any dirty parent directories)
//! before anything is published, and publication is one critical section.
//!
//! Deletion inverts the order: the block leaves the index first, the DELETE
//! record is made durable next, and the data hole is punched last. A crash
//! after the record sync leaves an invisible block whose hole startup will
//! punch again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::block::{BlockId, WritableBlock};
use crate::container::Container;
use crate::error::Result;
use crate::index::LogBlock;
use crate::record::{timestamp_micros, BlockRecord};

use super::Core;

/// Groups the creation of several blocks into one commit: the batch shares
/// sync barriers and becomes visible atomically.
pub struct CreationTransaction {
    core: Arc<Core>,
    blocks: Vec<WritableBlock>,
}

impl CreationTransaction {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            blocks: Vec::new(),
        }
    }

    /// Takes ownership of a block to be committed with this transaction.
    pub fn add_block(&mut self, block: WritableBlock) {
        self.blocks.push(block);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Commits every block in the batch. On failure nothing is published,
    /// and every container the transaction touched is retired to read-only:
    /// interleaved writers may have bytes in those containers whose
    /// durability this commit can no longer vouch for.
    pub fn commit(mut self) -> Result<()> {
        let blocks = std::mem::take(&mut self.blocks);
        commit_creation(&self.core, blocks)
    }
}

pub(crate) fn commit_creation(core: &Arc<Core>, mut blocks: Vec<WritableBlock>) -> Result<()> {
    if blocks.is_empty() {
        return Ok(());
    }

    match run_commit(core, &mut blocks) {
        Ok(()) => {
            for block in &mut blocks {
                block.release_checkout();
                block.mark_committed();
            }
            Ok(())
        }
        Err(e) => {
            let containers = distinct_containers(&blocks);
            core.poison_containers(&containers);
            // Dropping the blocks releases their ID claims and checkouts;
            // the pool refuses the now read-only containers.
            Err(e)
        }
    }
}

fn run_commit(core: &Arc<Core>, blocks: &mut [WritableBlock]) -> Result<()> {
    // Data first: every block finalized, every touched container's data
    // durable before a single record refers to it.
    for block in blocks.iter_mut() {
        if !block.is_finalized() {
            block.finalize()?;
        }
    }
    let containers = distinct_containers(blocks);
    for container in &containers {
        container.sync_data()?;
    }

    for block in blocks.iter() {
        block.container().append_create(&BlockRecord::Create {
            id: block.id(),
            offset: block.offset(),
            length: block.bytes_appended(),
            timestamp_micros: timestamp_micros(),
        })?;
    }

    core.sync_metadata_and_dirs(&containers)?;

    let published: Vec<(Arc<Container>, BlockId, u64, u64)> = blocks
        .iter()
        .map(|b| {
            (
                b.container().clone(),
                b.id(),
                b.offset(),
                b.bytes_appended(),
            )
        })
        .collect();
    core.publish_blocks(&published)
}

fn distinct_containers(blocks: &[WritableBlock]) -> Vec<Arc<Container>> {
    let mut seen = HashSet::new();
    blocks
        .iter()
        .map(|b| b.container())
        .filter(|c| seen.insert(c.name().to_string()))
        .cloned()
        .collect()
}

/// The outcome of a deletion transaction.
#[derive(Debug, Default)]
pub struct DeletionResult {
    /// IDs removed, durably recorded, and (if enabled) hole punched.
    pub deleted: Vec<BlockId>,
    /// IDs that were not live when the transaction committed.
    pub not_found: Vec<BlockId>,
}

/// Groups block deletions: one index critical section, one metadata sync
/// per container, then the hole punches.
pub struct DeletionTransaction {
    core: Arc<Core>,
    ids: Vec<BlockId>,
}

impl DeletionTransaction {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            ids: Vec::new(),
        }
    }

    pub fn add_block(&mut self, id: BlockId) {
        self.ids.push(id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn commit(self) -> Result<DeletionResult> {
        let mut seen = HashSet::new();
        let ids: Vec<BlockId> = self
            .ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();

        let (removed, not_found) = self.core.remove_blocks(&ids)?;

        // DELETE records become durable before any data is released, so a
        // crash in between leaves only a re-punchable hole.
        let mut by_container: HashMap<String, (Arc<Container>, Vec<Arc<LogBlock>>)> =
            HashMap::new();
        for log_block in &removed {
            by_container
                .entry(log_block.container().name().to_string())
                .or_insert_with(|| (log_block.container().clone(), Vec::new()))
                .1
                .push(log_block.clone());
        }
        for (container, log_blocks) in by_container.values() {
            for log_block in log_blocks {
                container.append_delete(&BlockRecord::Delete {
                    id: log_block.id(),
                    timestamp_micros: timestamp_micros(),
                })?;
            }
            container.sync_metadata()?;
        }

        for log_block in &removed {
            if let Err(e) = log_block
                .container()
                .punch_hole(log_block.offset(), log_block.length())
            {
                // Startup re-punches ranges that are still allocated.
                tracing::warn!(
                    container = log_block.container().name(),
                    block = %log_block.id(),
                    error = %e,
                    "hole punch failed; range left for startup reclamation"
                );
            }
        }

        Ok(DeletionResult {
            deleted: removed.iter().map(|lb| lb.id()).collect(),
            not_found,
        })
    }
}
