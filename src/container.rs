//! Containers: the on-disk unit that packs many blocks into two files.
//!
//! A container is a pair of append-only files sharing a name stem:
//!
//! ```text
//! <stem>.data       block bytes, each block starting on a filesystem
//!                   block boundary; holes where blocks were deleted
//! <stem>.metadata   log of CREATE / DELETE record frames
//! ```
//!
//! Writers take exclusive ownership of the append cursor through the
//! checkout pool, stream a block's bytes, and advance the cursor at
//! finalize. Once a container's commit sync fails it is retired to
//! read-only; once it has written its block-limit quota it is retired as
//! full. Neither state ever reverts.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::error::{Error, Result};
use crate::record::BlockRecord;
use crate::sys;

pub const DATA_FILE_SUFFIX: &str = "data";
pub const METADATA_FILE_SUFFIX: &str = "metadata";

/// Append-side state, guarded by the container's write mutex. The mutex is
/// held across cursor moves and data writes, never across syncs.
struct WriteState {
    /// Offset at which the next block starts. Always a multiple of the
    /// filesystem block size.
    next_block_offset: u64,
}

struct MetadataLog {
    writer: BufWriter<File>,
    sync_handle: File,
    cursor: u64,
}

pub struct Container {
    name: String,
    dir: PathBuf,
    dir_index: usize,
    data_file: File,
    write_state: Mutex<WriteState>,
    metadata: Mutex<MetadataLog>,
    fs_block_size: u64,
    block_limit: Option<u64>,
    hole_punching: bool,
    total_blocks_written: AtomicU64,
    live_blocks: AtomicU64,
    live_bytes: AtomicU64,
    full: AtomicBool,
    read_only: AtomicBool,
    dead: AtomicBool,
}

impl Container {
    /// Creates a fresh container in `dir`. The caller is responsible for
    /// syncing `dir` before the container's contents are considered durable.
    pub fn create(
        dir: &Path,
        dir_index: usize,
        name: String,
        fs_block_size: u64,
        block_limit: Option<u64>,
        hole_punching: bool,
    ) -> Result<Self> {
        let data_file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(data_file_path(dir, &name))?;
        let metadata_handle = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(metadata_file_path(dir, &name))?;
        let writer = BufWriter::new(metadata_handle.try_clone()?);

        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            dir_index,
            data_file,
            write_state: Mutex::new(WriteState {
                next_block_offset: 0,
            }),
            metadata: Mutex::new(MetadataLog {
                writer,
                sync_handle: metadata_handle,
                cursor: 0,
            }),
            fs_block_size,
            block_limit,
            hole_punching,
            total_blocks_written: AtomicU64::new(0),
            live_blocks: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
            full: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        })
    }

    /// Opens a container whose files already exist, seeding cursors and
    /// counters from replayed state. Used by startup.
    #[allow(clippy::too_many_arguments)]
    pub fn open_existing(
        dir: &Path,
        dir_index: usize,
        name: String,
        fs_block_size: u64,
        block_limit: Option<u64>,
        hole_punching: bool,
        total_blocks_written: u64,
        live_blocks: u64,
        live_bytes: u64,
    ) -> Result<Self> {
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(data_file_path(dir, &name))?;
        let data_len = data_file.metadata()?.len();

        let metadata_handle = OpenOptions::new()
            .read(true)
            .write(true)
            .open(metadata_file_path(dir, &name))?;
        let metadata_len = metadata_handle.metadata()?.len();
        let mut append_handle = metadata_handle.try_clone()?;
        use std::io::{Seek, SeekFrom};
        append_handle.seek(SeekFrom::Start(metadata_len))?;
        let writer = BufWriter::new(append_handle);

        let container = Self {
            name,
            dir: dir.to_path_buf(),
            dir_index,
            data_file,
            write_state: Mutex::new(WriteState {
                next_block_offset: sys::align_up(data_len, fs_block_size),
            }),
            metadata: Mutex::new(MetadataLog {
                writer,
                sync_handle: metadata_handle,
                cursor: metadata_len,
            }),
            fs_block_size,
            block_limit,
            hole_punching,
            total_blocks_written: AtomicU64::new(total_blocks_written),
            live_blocks: AtomicU64::new(live_blocks),
            live_bytes: AtomicU64::new(live_bytes),
            full: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        };
        if let Some(limit) = block_limit {
            if total_blocks_written >= limit {
                container.full.store(true, Ordering::SeqCst);
            }
        }
        Ok(container)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_dir(&self) -> &Path {
        &self.dir
    }

    pub fn dir_index(&self) -> usize {
        self.dir_index
    }

    pub fn fs_block_size(&self) -> u64 {
        self.fs_block_size
    }

    pub fn data_path(&self) -> PathBuf {
        data_file_path(&self.dir, &self.name)
    }

    pub fn metadata_path(&self) -> PathBuf {
        metadata_file_path(&self.dir, &self.name)
    }

    /// Offset at which the next block will be placed.
    pub fn next_block_offset(&self) -> u64 {
        self.write_state.lock().unwrap().next_block_offset
    }

    /// Appends `data` at `offset`. Offsets below the append cursor are
    /// rejected: committed bytes are immutable.
    pub fn write_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let state = self.write_state.lock()?;
        if offset < state.next_block_offset {
            return Err(Error::IO(format!(
                "container {}: write at {} below append cursor {}",
                self.name, offset, state.next_block_offset
            )));
        }
        self.data_file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Reserves `length` bytes for a finalized block, returning the block's
    /// starting offset and advancing the cursor to the next filesystem block
    /// boundary. Counts the block against the container's limit.
    pub fn allocate(&self, length: u64) -> Result<u64> {
        self.check_writable()?;
        let mut state = self.write_state.lock()?;
        let offset = state.next_block_offset;
        state.next_block_offset = sys::align_up(offset + length, self.fs_block_size);

        let written = self.total_blocks_written.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.block_limit {
            if written >= limit {
                self.full.store(true, Ordering::SeqCst);
            }
        }
        Ok(offset)
    }

    /// Durability barrier for the data file.
    pub fn sync_data(&self) -> Result<()> {
        self.check_writable()?;
        self.data_file.sync_data()?;
        Ok(())
    }

    /// Appends a CREATE record. Rejected once the container is read-only.
    pub fn append_create(&self, record: &BlockRecord) -> Result<()> {
        debug_assert!(matches!(record, BlockRecord::Create { .. }));
        self.check_writable()?;
        self.append_record(record)
    }

    /// Appends a DELETE record. Allowed on read-only containers: deletions
    /// must stay recordable so previously committed blocks cannot resurrect
    /// after a restart.
    pub fn append_delete(&self, record: &BlockRecord) -> Result<()> {
        debug_assert!(matches!(record, BlockRecord::Delete { .. }));
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::DiskFailure(self.name.clone()));
        }
        self.append_record(record)
    }

    fn append_record(&self, record: &BlockRecord) -> Result<()> {
        let frame = record.encode();
        let mut metadata = self.metadata.lock()?;
        metadata.writer.write_all(&frame)?;
        metadata.cursor += frame.len() as u64;
        Ok(())
    }

    /// Durability barrier for the metadata file.
    pub fn sync_metadata(&self) -> Result<()> {
        let mut metadata = self.metadata.lock()?;
        metadata.writer.flush()?;
        metadata.sync_handle.sync_all()?;
        Ok(())
    }

    pub fn metadata_cursor(&self) -> u64 {
        self.metadata.lock().unwrap().cursor
    }

    /// Deallocates a deleted block's byte range, rounded outward to
    /// filesystem block boundaries. The data file's length is unchanged.
    pub fn punch_hole(&self, offset: u64, length: u64) -> Result<()> {
        if !self.hole_punching || length == 0 {
            return Ok(());
        }
        let start = sys::align_down(offset, self.fs_block_size);
        let end = sys::align_up(offset + length, self.fs_block_size);
        sys::punch_hole(&self.data_file, start, end - start)?;
        Ok(())
    }

    pub fn data_file_size(&self) -> Result<u64> {
        Ok(self.data_file.metadata()?.len())
    }

    fn check_writable(&self) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::DiskFailure(self.name.clone()));
        }
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly(self.name.clone()));
        }
        Ok(())
    }

    pub fn block_created(&self, length: u64) {
        self.live_blocks.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_add(length, Ordering::SeqCst);
    }

    pub fn block_deleted(&self, length: u64) {
        self.live_blocks.fetch_sub(1, Ordering::SeqCst);
        self.live_bytes.fetch_sub(length, Ordering::SeqCst);
    }

    pub fn live_blocks(&self) -> u64 {
        self.live_blocks.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub fn total_blocks_written(&self) -> u64 {
        self.total_blocks_written.load(Ordering::SeqCst)
    }

    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::SeqCst)
    }

    /// Retires the container from all future data writes. Sticky.
    pub fn mark_read_only(&self) {
        self.read_only.store(true, Ordering::SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Whether the checkout pool may hand this container to a writer.
    pub fn is_available_for_writes(&self) -> bool {
        !self.is_full() && !self.is_read_only() && !self.is_dead()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("live_blocks", &self.live_blocks())
            .field("full", &self.is_full())
            .field("read_only", &self.is_read_only())
            .field("dead", &self.is_dead())
            .finish()
    }
}

pub fn data_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{DATA_FILE_SUFFIX}"))
}

pub fn metadata_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{METADATA_FILE_SUFFIX}"))
}
