use std::path::PathBuf;

use itertools::Itertools;

use crate::block::BlockId;

/// A container judged unusable at startup.
#[derive(Debug, Clone)]
pub struct CorruptContainer {
    pub name: String,
    pub reason: String,
}

/// A live record referencing bytes past its data file's end.
#[derive(Debug, Clone)]
pub struct OutOfRangeRecord {
    pub container: String,
    pub id: BlockId,
}

/// The result of startup consistency checking and repair, one per `open`.
///
/// Everything listed here has already been repaired or discarded by the time
/// the report is returned; it is an account, not a to-do list.
#[derive(Debug, Default)]
pub struct FsReport {
    pub data_dirs: Vec<PathBuf>,
    /// Containers surviving startup.
    pub container_count: usize,
    pub live_block_count: u64,
    pub live_byte_count: u64,

    /// Containers with a data file but no metadata file; never durably
    /// created, data file deleted.
    pub incomplete_containers: Vec<String>,
    /// Containers with a metadata file but no data file; unusable, metadata
    /// file deleted.
    pub orphaned_metadata: Vec<String>,
    /// Containers with irrecoverable metadata damage; files unlinked.
    pub corrupt_containers: Vec<CorruptContainer>,
    /// Metadata files ending in a torn frame; truncated to the last valid
    /// frame boundary.
    pub truncated_metadata: Vec<String>,
    /// Live records dropped because they pointed past their data file.
    pub out_of_range_records: Vec<OutOfRangeRecord>,
    /// Full containers with no remaining live blocks; files unlinked.
    pub dead_containers: Vec<String>,
    /// Deleted ranges that still held data and were punched again.
    pub repunched_holes: u64,
    /// Bytes of orphaned data (no committed CREATE) reclaimed.
    pub orphan_bytes_reclaimed: u64,
    /// Metadata files rewritten because too few of their records were live.
    pub compacted_metadata: Vec<String>,
}

impl FsReport {
    /// Folds a per-directory report into this one.
    pub fn merge(&mut self, other: FsReport) {
        self.data_dirs.extend(other.data_dirs);
        self.container_count += other.container_count;
        self.live_block_count += other.live_block_count;
        self.live_byte_count += other.live_byte_count;
        self.incomplete_containers.extend(other.incomplete_containers);
        self.orphaned_metadata.extend(other.orphaned_metadata);
        self.corrupt_containers.extend(other.corrupt_containers);
        self.truncated_metadata.extend(other.truncated_metadata);
        self.out_of_range_records.extend(other.out_of_range_records);
        self.dead_containers.extend(other.dead_containers);
        self.repunched_holes += other.repunched_holes;
        self.orphan_bytes_reclaimed += other.orphan_bytes_reclaimed;
        self.compacted_metadata.extend(other.compacted_metadata);
    }

    /// Whether startup found anything out of the ordinary.
    pub fn has_anomalies(&self) -> bool {
        !self.incomplete_containers.is_empty()
            || !self.orphaned_metadata.is_empty()
            || !self.corrupt_containers.is_empty()
            || !self.truncated_metadata.is_empty()
            || !self.out_of_range_records.is_empty()
            || !self.dead_containers.is_empty()
            || self.repunched_holes > 0
            || self.orphan_bytes_reclaimed > 0
            || !self.compacted_metadata.is_empty()
    }

    /// One-line summary for logging.
    pub fn summary(&self) -> String {
        let mut parts = vec![format!(
            "{} containers, {} live blocks, {} live bytes",
            self.container_count, self.live_block_count, self.live_byte_count
        )];
        if !self.incomplete_containers.is_empty() {
            parts.push(format!(
                "{} incomplete containers deleted",
                self.incomplete_containers.len()
            ));
        }
        if !self.orphaned_metadata.is_empty() {
            parts.push(format!(
                "{} orphaned metadata files deleted",
                self.orphaned_metadata.len()
            ));
        }
        if !self.corrupt_containers.is_empty() {
            parts.push(format!(
                "{} corrupt containers unlinked ({})",
                self.corrupt_containers.len(),
                self.corrupt_containers.iter().map(|c| &c.name).join(", ")
            ));
        }
        if !self.truncated_metadata.is_empty() {
            parts.push(format!(
                "{} metadata files truncated",
                self.truncated_metadata.len()
            ));
        }
        if !self.out_of_range_records.is_empty() {
            parts.push(format!(
                "{} out-of-range records dropped",
                self.out_of_range_records.len()
            ));
        }
        if !self.dead_containers.is_empty() {
            parts.push(format!(
                "{} dead containers unlinked",
                self.dead_containers.len()
            ));
        }
        if self.repunched_holes > 0 {
            parts.push(format!("{} holes re-punched", self.repunched_holes));
        }
        if self.orphan_bytes_reclaimed > 0 {
            parts.push(format!(
                "{} orphan bytes reclaimed",
                self.orphan_bytes_reclaimed
            ));
        }
        if !self.compacted_metadata.is_empty() {
            parts.push(format!(
                "{} metadata files compacted",
                self.compacted_metadata.len()
            ));
        }
        parts.join("; ")
    }
}
