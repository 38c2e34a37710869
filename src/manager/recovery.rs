//! Startup: replay every container's metadata, reconcile it with the data
//! files, repair what a crash left behind, and hand back the live state.
//!
//! Repair is best-effort per container. A torn trailing record is truncated
//! away; a record pointing past its data file is dropped; a container with
//! interior corruption is unlinked; a sparse metadata file is rewritten.
//! Only a directory that cannot be scanned at all fails the open.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::block::BlockId;
use crate::container::{
    data_file_path, metadata_file_path, Container, DATA_FILE_SUFFIX, METADATA_FILE_SUFFIX,
};
use crate::error::{Error, Result};
use crate::index::LogBlock;
use crate::record::{decode_record, BlockRecord, Decoded};
use crate::report::{CorruptContainer, FsReport, OutOfRangeRecord};
use crate::sys;

pub(crate) struct RecoveryOptions {
    pub dir_index: usize,
    pub fs_block_size: u64,
    pub block_limit: Option<u64>,
    pub hole_punching: bool,
    pub compaction_live_ratio: f64,
}

/// Everything one data directory contributes to the opened engine.
pub(crate) struct DirLoad {
    pub containers: Vec<Arc<Container>>,
    pub blocks: Vec<Arc<LogBlock>>,
    pub report: FsReport,
    pub max_block_id: u64,
    /// True when repair created or renamed files whose directory entry still
    /// needs a sync barrier.
    pub needs_dir_sync: bool,
}

#[derive(Debug, Clone)]
struct LiveRecord {
    id: BlockId,
    offset: u64,
    length: u64,
    timestamp_micros: u64,
}

#[derive(Debug, Clone)]
struct DeletedRange {
    offset: u64,
    length: u64,
}

/// The result of replaying one metadata file.
#[derive(Debug)]
struct Replay {
    live: Vec<LiveRecord>,
    deleted: Vec<DeletedRange>,
    create_count: u64,
    total_records: u64,
    /// Offset of the last complete frame.
    valid_end: u64,
    /// Whether the file ended inside a frame.
    truncated: bool,
}

/// Replays records front to back. A CREATE for an already-live ID or a
/// DELETE for an ID that is not live contradicts the log's own history and
/// is corruption; a short tail is a torn append and ends the replay cleanly.
fn replay_metadata(buf: &[u8]) -> Result<Replay> {
    let mut live: HashMap<BlockId, LiveRecord> = HashMap::new();
    let mut deleted = Vec::new();
    let mut create_count = 0u64;
    let mut total_records = 0u64;
    let mut offset = 0usize;
    let mut truncated = false;

    loop {
        match decode_record(buf, offset)? {
            Decoded::Record { record, next } => {
                total_records += 1;
                match record {
                    BlockRecord::Create {
                        id,
                        offset: block_offset,
                        length,
                        timestamp_micros,
                    } => {
                        create_count += 1;
                        let entry = LiveRecord {
                            id,
                            offset: block_offset,
                            length,
                            timestamp_micros,
                        };
                        if live.insert(id, entry).is_some() {
                            return Err(Error::Corruption(format!(
                                "duplicate create record for live block {id}"
                            )));
                        }
                    }
                    BlockRecord::Delete { id, .. } => match live.remove(&id) {
                        Some(entry) => deleted.push(DeletedRange {
                            offset: entry.offset,
                            length: entry.length,
                        }),
                        None => {
                            return Err(Error::Corruption(format!(
                                "delete record for block {id} which is not live"
                            )))
                        }
                    },
                }
                offset = next;
            }
            Decoded::Eof => break,
            Decoded::Truncated => {
                truncated = true;
                break;
            }
        }
    }

    let mut live: Vec<LiveRecord> = live.into_values().collect();
    live.sort_by_key(|r| r.offset);
    Ok(Replay {
        live,
        deleted,
        create_count,
        total_records,
        valid_end: offset as u64,
        truncated,
    })
}

/// Opens one data directory: pairs container files, replays and repairs each
/// container, and returns the survivors.
pub(crate) fn load_data_dir(dir: &Path, opts: &RecoveryOptions) -> Result<DirLoad> {
    let mut stems: BTreeMap<String, (bool, bool)> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        // A temp file from a compaction that never renamed.
        if name.ends_with(&format!(".{METADATA_FILE_SUFFIX}.tmp")) {
            tracing::warn!(file = name, "removing leftover metadata rewrite");
            fs::remove_file(entry.path())?;
            continue;
        }
        if let Some(stem) = name.strip_suffix(&format!(".{DATA_FILE_SUFFIX}")) {
            stems.entry(stem.to_string()).or_insert((false, false)).0 = true;
        } else if let Some(stem) = name.strip_suffix(&format!(".{METADATA_FILE_SUFFIX}")) {
            stems.entry(stem.to_string()).or_insert((false, false)).1 = true;
        }
    }

    let mut load = DirLoad {
        containers: Vec::new(),
        blocks: Vec::new(),
        report: FsReport::default(),
        max_block_id: 0,
        needs_dir_sync: false,
    };

    for (stem, (has_data, has_metadata)) in stems {
        match (has_data, has_metadata) {
            (true, false) => {
                // Data without metadata: the container was never durably
                // created.
                fs::remove_file(data_file_path(dir, &stem))?;
                load.report.incomplete_containers.push(stem);
            }
            (false, true) => {
                // Metadata without data: nothing the records point at can
                // exist.
                fs::remove_file(metadata_file_path(dir, &stem))?;
                load.report.orphaned_metadata.push(stem);
            }
            (true, true) => process_container(dir, stem, opts, &mut load)?,
            (false, false) => unreachable!(),
        }
    }

    Ok(load)
}

fn process_container(
    dir: &Path,
    stem: String,
    opts: &RecoveryOptions,
    load: &mut DirLoad,
) -> Result<()> {
    let metadata_path = metadata_file_path(dir, &stem);
    let data_path = data_file_path(dir, &stem);

    let buf = fs::read(&metadata_path)?;
    let replay = match replay_metadata(&buf) {
        Ok(replay) => replay,
        Err(Error::Corruption(reason)) => {
            tracing::error!(container = %stem, reason = %reason, "unlinking corrupt container");
            fs::remove_file(&metadata_path)?;
            fs::remove_file(&data_path)?;
            load.report
                .corrupt_containers
                .push(CorruptContainer { name: stem, reason });
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if replay.truncated {
        let file = OpenOptions::new().write(true).open(&metadata_path)?;
        file.set_len(replay.valid_end)?;
        file.sync_all()?;
        tracing::warn!(
            container = %stem,
            valid_bytes = replay.valid_end,
            "truncated torn metadata record"
        );
        load.report.truncated_metadata.push(stem.clone());
    }

    let data_len = fs::metadata(&data_path)?.len();

    // Records referring past the data file describe writes whose data sync
    // never completed. Zero-length blocks occupy no range and always pass.
    let mut live = Vec::with_capacity(replay.live.len());
    for record in replay.live {
        let end = record.offset.checked_add(record.length);
        if record.length > 0 && end.map_or(true, |end| end > data_len) {
            load.report.out_of_range_records.push(OutOfRangeRecord {
                container: stem.clone(),
                id: record.id,
            });
        } else {
            live.push(record);
        }
    }

    let live_count = live.len() as u64;
    let live_bytes: u64 = live.iter().map(|r| r.length).sum();
    let max_live_end = live
        .iter()
        .map(|r| r.offset + r.length)
        .max()
        .unwrap_or(0);
    let full = opts
        .block_limit
        .map_or(false, |limit| replay.create_count >= limit);

    // A full container with nothing live will never be read or written
    // again.
    if full && live.is_empty() {
        fs::remove_file(&metadata_path)?;
        fs::remove_file(&data_path)?;
        load.report.dead_containers.push(stem);
        return Ok(());
    }

    if opts.hole_punching {
        let data_file = OpenOptions::new().read(true).write(true).open(&data_path)?;

        // Deletions whose hole punch never happened (or never completed).
        for range in &replay.deleted {
            if range.length == 0 {
                continue;
            }
            let start = sys::align_down(range.offset, opts.fs_block_size);
            let end = sys::align_up(range.offset + range.length, opts.fs_block_size);
            if sys::range_has_data(&data_file, start, end)? {
                sys::punch_hole(&data_file, start, end - start)?;
                load.report.repunched_holes += 1;
            }
        }

        // Bytes past the last live block belong to writes that never
        // committed.
        let tail_start = sys::align_up(max_live_end, opts.fs_block_size);
        if data_len > tail_start {
            let tail_end = sys::align_up(data_len, opts.fs_block_size);
            if sys::range_has_data(&data_file, tail_start, tail_end)? {
                sys::punch_hole(&data_file, tail_start, tail_end - tail_start)?;
                load.report.orphan_bytes_reclaimed += data_len - tail_start;
            }
        }
    }

    // Rewrite metadata when most of its records are dead weight.
    if replay.total_records > 0
        && (live_count as f64) < opts.compaction_live_ratio * replay.total_records as f64
    {
        rewrite_metadata_file(dir, &stem, &live)?;
        load.report.compacted_metadata.push(stem.clone());
        load.needs_dir_sync = true;
    }

    let container = Arc::new(Container::open_existing(
        dir,
        opts.dir_index,
        stem,
        opts.fs_block_size,
        opts.block_limit,
        opts.hole_punching,
        replay.create_count,
        live_count,
        live_bytes,
    )?);

    for record in &live {
        load.max_block_id = load.max_block_id.max(record.id.raw());
        load.blocks.push(Arc::new(LogBlock::new(
            container.clone(),
            record.id,
            record.offset,
            record.length,
        )));
    }
    load.report.container_count += 1;
    load.report.live_block_count += live_count;
    load.report.live_byte_count += live_bytes;
    load.containers.push(container);
    Ok(())
}

/// Projects the live records into a fresh metadata file: write to a temp
/// file, sync it, rename it over the original. The parent directory's sync
/// is deferred to the manager's dirty-directory barrier.
fn rewrite_metadata_file(dir: &Path, stem: &str, live: &[LiveRecord]) -> Result<()> {
    let final_path = metadata_file_path(dir, stem);
    let tmp_path = dir.join(format!("{stem}.{METADATA_FILE_SUFFIX}.tmp"));

    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;
        for record in live {
            let frame = BlockRecord::Create {
                id: record.id,
                offset: record.offset,
                length: record.length,
                timestamp_micros: record.timestamp_micros,
            }
            .encode();
            file.write_all(&frame)?;
        }
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
