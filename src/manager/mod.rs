//! The log-structured block manager: container registry, checkout pool, and
//! the public block lifecycle operations.
//!
//! All shared state sits behind one short-critical-section mutex (the block
//! index, the open-ID set, the container registry, the per-directory
//! checkout deques, and the dirty-directory set). The lock is never held
//! across file IO; long operations (data writes, syncs, hole punches) run
//! against per-container state instead.

pub(crate) mod recovery;
pub mod transaction;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::block::{BlockId, ReadableBlock, WritableBlock};
use crate::cache::FileCache;
use crate::config::Config;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::index::{BlockIndex, LogBlock};
use crate::latch::CountDownLatch;
use crate::memory::MemTracker;
use crate::oid::ObjectIdGenerator;
use crate::report::FsReport;
use crate::sys;
use self::recovery::{load_data_dir, DirLoad, RecoveryOptions};
use self::transaction::{CreationTransaction, DeletionTransaction};

const LOCK_FILE: &str = "logpack.lock";

/// How long open waits for the per-directory recovery threads before giving
/// up on a wedged filesystem.
const OPEN_DEADLINE: Duration = Duration::from_secs(600);

/// Placement hints for a new block.
#[derive(Debug, Default, Clone)]
pub struct CreateBlockOptions {
    /// Index into the configured data directories. Without a hint the
    /// manager rotates across directories.
    pub dir_hint: Option<usize>,
}

/// A data directory as resolved at open time.
struct DataDir {
    path: PathBuf,
    fs_block_size: u64,
    block_limit: Option<u64>,
}

/// State guarded by the manager mutex.
pub(crate) struct Inner {
    pub(crate) index: BlockIndex,
    containers: HashMap<String, Arc<Container>>,
    /// Writable containers per directory, most recently released first.
    available: Vec<VecDeque<Arc<Container>>>,
    /// Directories with file creations or renames not yet synced.
    dirty_dirs: HashSet<PathBuf>,
    failed_dirs: HashSet<usize>,
    next_dir: usize,
}

/// Shared engine state. Block handles keep the core alive through an `Arc`.
pub(crate) struct Core {
    config: Config,
    dirs: Vec<DataDir>,
    mem_tracker: Arc<MemTracker>,
    file_cache: Arc<FileCache>,
    oid_generator: ObjectIdGenerator,
    next_block_id: AtomicU64,
    pub(crate) inner: Mutex<Inner>,
}

impl Core {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Reserves a fresh block ID, skipping any in use.
    fn claim_block_id(&self) -> Result<BlockId> {
        loop {
            let id = BlockId::new(self.next_block_id.fetch_add(1, Ordering::SeqCst));
            let mut inner = self.inner.lock()?;
            if inner.index.try_claim(id) {
                return Ok(id);
            }
        }
    }

    pub(crate) fn release_block_id(&self, id: BlockId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.index.release_claim(id);
        }
    }

    /// Hands out a writable container from the chosen data directory: the
    /// most recently released one, or a freshly created one if the
    /// directory's pool is empty. The caller owns the container's write
    /// cursor until it calls `make_container_available`.
    ///
    /// Directory choice is the hint if given, otherwise a rotation across
    /// the configured directories; a directory is only skipped once it has
    /// failed.
    fn get_or_create_container(&self, hint: Option<usize>) -> Result<Arc<Container>> {
        let ndirs = self.dirs.len();
        let start = {
            let mut inner = self.inner.lock()?;
            match hint {
                Some(h) => h % ndirs,
                None => {
                    let s = inner.next_dir;
                    inner.next_dir = (inner.next_dir + 1) % ndirs;
                    s
                }
            }
        };

        let mut last_err: Option<Error> = None;
        for i in 0..ndirs {
            let idx = (start + i) % ndirs;
            {
                let mut inner = self.inner.lock()?;
                if inner.failed_dirs.contains(&idx) {
                    continue;
                }
                if let Some(container) = inner.available[idx].pop_front() {
                    return Ok(container);
                }
            }

            // Nothing pooled here: create a container. File creation happens
            // outside the manager lock.
            let dir = &self.dirs[idx];
            let name = self.oid_generator.next_id();
            match Container::create(
                &dir.path,
                idx,
                name.clone(),
                dir.fs_block_size,
                dir.block_limit,
                self.config.enable_hole_punching,
            ) {
                Ok(container) => {
                    let container = Arc::new(container);
                    let mut inner = self.inner.lock()?;
                    inner.containers.insert(name, container.clone());
                    inner.dirty_dirs.insert(dir.path.clone());
                    return Ok(container);
                }
                Err(e) => {
                    tracing::error!(
                        dir = %dir.path.display(),
                        error = %e,
                        "failed to create container; excluding data directory"
                    );
                    self.fail_data_dir(idx)?;
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(Error::DiskFailure(format!(
                "no data directory could create a container: {e}"
            ))),
            None => Err(Error::ResourceExhausted(
                "no writable data directories".to_string(),
            )),
        }
    }

    /// Returns a container to its directory's pool unless it has been
    /// retired (full, read-only, or dead).
    pub(crate) fn make_container_available(&self, container: &Arc<Container>) {
        if !container.is_available_for_writes() {
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            inner.available[container.dir_index()].push_front(container.clone());
        }
    }

    /// Marks every container a failed transaction touched as read-only and
    /// purges them from the checkout pool.
    pub(crate) fn poison_containers(&self, containers: &[Arc<Container>]) {
        for container in containers {
            container.mark_read_only();
            tracing::error!(
                container = container.name(),
                "commit failed; container retired to read-only"
            );
        }
        if let Ok(mut inner) = self.inner.lock() {
            let poisoned: HashSet<&str> = containers.iter().map(|c| c.name()).collect();
            for deque in &mut inner.available {
                deque.retain(|c| !poisoned.contains(c.name()));
            }
        }
    }

    /// Excludes a directory from checkouts and marks its containers dead so
    /// in-flight writers surface errors instead of silently losing data.
    fn fail_data_dir(&self, idx: usize) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if !inner.failed_dirs.insert(idx) {
            return Ok(());
        }
        inner.available[idx].clear();
        for container in inner.containers.values() {
            if container.dir_index() == idx {
                container.mark_dead();
            }
        }
        Ok(())
    }

    /// Syncs the metadata of every container in the batch, then syncs any of
    /// their parent directories that still have pending entries.
    pub(crate) fn sync_metadata_and_dirs(&self, containers: &[Arc<Container>]) -> Result<()> {
        for container in containers {
            container.sync_metadata()?;
        }

        let parents: HashSet<PathBuf> = containers
            .iter()
            .map(|c| c.parent_dir().to_path_buf())
            .collect();
        let to_sync: Vec<PathBuf> = {
            let mut inner = self.inner.lock()?;
            parents
                .into_iter()
                .filter(|p| inner.dirty_dirs.remove(p))
                .collect()
        };
        for dir in &to_sync {
            if let Err(e) = sys::sync_dir(dir) {
                // Put the barrier back so a retry covers this directory.
                if let Ok(mut inner) = self.inner.lock() {
                    inner.dirty_dirs.insert(dir.clone());
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Publishes a committed batch in one critical section.
    pub(crate) fn publish_blocks(
        &self,
        blocks: &[(Arc<Container>, BlockId, u64, u64)],
    ) -> Result<()> {
        let mut inner = self.inner.lock()?;
        for (container, id, offset, length) in blocks {
            let log_block = Arc::new(LogBlock::new(container.clone(), *id, *offset, *length));
            inner.index.publish(log_block)?;
            container.block_created(*length);
        }
        Ok(())
    }

    /// Removes a deletion batch from the index in one critical section,
    /// returning the entries removed and the IDs that were not live.
    pub(crate) fn remove_blocks(
        &self,
        ids: &[BlockId],
    ) -> Result<(Vec<Arc<LogBlock>>, Vec<BlockId>)> {
        let mut removed = Vec::new();
        let mut not_found = Vec::new();
        let mut inner = self.inner.lock()?;
        for id in ids {
            match inner.index.remove(*id) {
                Some(log_block) => {
                    log_block
                        .container()
                        .block_deleted(log_block.length());
                    removed.push(log_block);
                }
                None => not_found.push(*id),
            }
        }
        Ok((removed, not_found))
    }
}

/// The public engine handle.
pub struct LogBlockManager {
    core: Arc<Core>,
    _locks: Vec<FileLock>,
}

impl LogBlockManager {
    /// Opens the block manager: locks each data directory, replays and
    /// repairs every container, and returns the populated engine together
    /// with the startup report.
    pub fn open(config: Config) -> Result<(Self, FsReport)> {
        if config.data_dirs.is_empty() {
            return Err(Error::ResourceExhausted(
                "no data directories configured".to_string(),
            ));
        }

        let buggy_kernel = sys::kernel_release()
            .map(|release| sys::is_buggy_el6_kernel(&release))
            .unwrap_or(false);
        if buggy_kernel {
            tracing::warn!(
                "running on a kernel whose hole punching corrupts large containers; \
                 capping blocks per container"
            );
        }

        let mut locks = Vec::with_capacity(config.data_dirs.len());
        let mut dirs = Vec::with_capacity(config.data_dirs.len());
        for path in &config.data_dirs {
            std::fs::create_dir_all(path)?;
            locks.push(FileLock::lock(path.join(LOCK_FILE))?);

            let fs_block_size = match config.fs_block_size_override {
                Some(size) => size,
                None => sys::fs_block_size(path)?,
            };
            let block_limit = config
                .max_blocks_per_container_override
                .or_else(|| buggy_kernel.then(|| sys::lookup_block_limit(fs_block_size)));
            dirs.push(DataDir {
                path: path.clone(),
                fs_block_size,
                block_limit,
            });
        }

        let loads = Self::load_dirs(&config, &dirs)?;

        let mem_tracker = Arc::new(MemTracker::new());
        let mut inner = Inner {
            index: BlockIndex::new(mem_tracker.clone()),
            containers: HashMap::new(),
            available: dirs.iter().map(|_| VecDeque::new()).collect(),
            dirty_dirs: HashSet::new(),
            failed_dirs: HashSet::new(),
            next_dir: 0,
        };

        let mut report = FsReport::default();
        let mut max_block_id = 0u64;
        for (idx, load) in loads.into_iter().enumerate() {
            for container in &load.containers {
                if container.is_available_for_writes() {
                    inner.available[idx].push_front(container.clone());
                }
                inner
                    .containers
                    .insert(container.name().to_string(), container.clone());
            }
            for block in load.blocks {
                inner.index.publish_recovered(block)?;
            }
            if load.needs_dir_sync {
                inner.dirty_dirs.insert(dirs[idx].path.clone());
            }
            max_block_id = max_block_id.max(load.max_block_id);
            report.merge(load.report);
        }
        report.data_dirs = config.data_dirs.clone();

        if report.has_anomalies() {
            tracing::warn!(summary = %report.summary(), "block manager opened with repairs");
        } else {
            tracing::info!(summary = %report.summary(), "block manager opened");
        }

        let core = Arc::new(Core {
            file_cache: Arc::new(FileCache::new(config.file_cache_capacity)),
            config,
            dirs,
            mem_tracker,
            oid_generator: ObjectIdGenerator::new(),
            next_block_id: AtomicU64::new(max_block_id + 1),
            inner: Mutex::new(inner),
        });

        Ok((Self { core, _locks: locks }, report))
    }

    fn load_dirs(config: &Config, dirs: &[DataDir]) -> Result<Vec<DirLoad>> {
        let latch = Arc::new(CountDownLatch::new(dirs.len() as u64));
        let results: Arc<Mutex<Vec<Option<Result<DirLoad>>>>> =
            Arc::new(Mutex::new((0..dirs.len()).map(|_| None).collect()));

        let mut handles = Vec::with_capacity(dirs.len());
        for (idx, dir) in dirs.iter().enumerate() {
            let opts = RecoveryOptions {
                dir_index: idx,
                fs_block_size: dir.fs_block_size,
                block_limit: dir.block_limit,
                hole_punching: config.enable_hole_punching,
                compaction_live_ratio: config.metadata_compaction_live_ratio,
            };
            let path = dir.path.clone();
            let latch = latch.clone();
            let results = results.clone();
            handles.push(std::thread::spawn(move || {
                let load = load_data_dir(&path, &opts);
                if let Ok(mut slots) = results.lock() {
                    slots[idx] = Some(load);
                }
                latch.count_down();
            }));
        }

        let finished = latch.wait_until(Instant::now() + OPEN_DEADLINE);
        if !finished {
            return Err(Error::IO(
                "timed out waiting for data directory recovery".to_string(),
            ));
        }
        for handle in handles {
            let _ = handle.join();
        }

        let mut slots = results.lock()?;
        let mut loads = Vec::with_capacity(dirs.len());
        for (idx, slot) in slots.iter_mut().enumerate() {
            match slot.take() {
                Some(Ok(load)) => loads.push(load),
                Some(Err(e)) => {
                    return Err(Error::DiskFailure(format!(
                        "data directory {} failed to open: {e}",
                        dirs[idx].path.display()
                    )))
                }
                None => {
                    return Err(Error::IO(format!(
                        "data directory {} recovery produced no result",
                        dirs[idx].path.display()
                    )))
                }
            }
        }
        Ok(loads)
    }

    /// Starts a new block. The returned handle owns a container checkout;
    /// dropping it unfinalized aborts the block.
    pub fn create_block(&self) -> Result<WritableBlock> {
        self.create_block_with_opts(&CreateBlockOptions::default())
    }

    pub fn create_block_with_opts(&self, opts: &CreateBlockOptions) -> Result<WritableBlock> {
        let id = self.core.claim_block_id()?;
        match self.core.get_or_create_container(opts.dir_hint) {
            Ok(container) => Ok(WritableBlock::new(self.core.clone(), id, container)),
            Err(e) => {
                self.core.release_block_id(id);
                Err(e)
            }
        }
    }

    /// Opens a published block for reading.
    pub fn open_block(&self, id: BlockId) -> Result<ReadableBlock> {
        let log_block = {
            let inner = self.core.inner.lock()?;
            inner
                .index
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("block {id}")))?
        };
        let file = self.core.file_cache.open(&log_block.container().data_path())?;
        Ok(ReadableBlock::new(log_block, file))
    }

    pub fn new_creation_transaction(&self) -> CreationTransaction {
        CreationTransaction::new(self.core.clone())
    }

    pub fn new_deletion_transaction(&self) -> DeletionTransaction {
        DeletionTransaction::new(self.core.clone())
    }

    /// Deletes a single block, failing if it does not exist.
    pub fn delete_block(&self, id: BlockId) -> Result<()> {
        let mut txn = self.new_deletion_transaction();
        txn.add_block(id);
        let result = txn.commit()?;
        if result.deleted.is_empty() {
            return Err(Error::NotFound(format!("block {id}")));
        }
        Ok(())
    }

    /// Snapshot of every live block ID.
    pub fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        Ok(self.core.inner.lock()?.index.all_ids())
    }

    /// Raises the ID counter floor so future blocks never collide with an
    /// externally chosen ID.
    pub fn notify_block_id(&self, id: BlockId) {
        self.core
            .next_block_id
            .fetch_max(id.raw() + 1, Ordering::SeqCst);
    }

    /// Bytes of index metadata currently resident.
    pub fn memory_consumption(&self) -> u64 {
        self.core.mem_tracker.consumption()
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }
}

impl std::fmt::Debug for LogBlockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBlockManager")
            .field("data_dirs", &self.core.config.data_dirs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_manager(dir: &std::path::Path) -> (LogBlockManager, FsReport) {
        LogBlockManager::open(Config::new(dir).fs_block_size(4096)).expect("open")
    }

    #[test]
    fn test_open_empty_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, report) = open_manager(dir.path());
        assert_eq!(report.container_count, 0);
        assert!(!report.has_anomalies());
        assert!(manager.all_block_ids().expect("ids").is_empty());
    }

    #[test]
    fn test_open_requires_data_dir() {
        let err = LogBlockManager::open(Config::default()).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn test_second_open_fails_while_locked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_manager, _) = open_manager(dir.path());
        assert!(LogBlockManager::open(Config::new(dir.path())).is_err());
    }

    #[test]
    fn test_create_close_open_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = open_manager(dir.path());

        let mut block = manager.create_block().expect("create");
        let id = block.id();
        block.append(b"hello, container").expect("append");
        block.close().expect("close");

        let readable = manager.open_block(id).expect("open block");
        assert_eq!(readable.length(), 16);
        assert_eq!(readable.read_all().expect("read"), b"hello, container");

        let mut prefix = [0u8; 5];
        readable.read_at(0, &mut prefix).expect("read_at");
        assert_eq!(&prefix, b"hello");
        assert!(readable.read_at(10, &mut [0u8; 7]).is_err());
    }

    #[test]
    fn test_open_block_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = open_manager(dir.path());
        let err = manager.open_block(BlockId::new(12345)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_lifo_container_reuse() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = open_manager(dir.path());

        // Sequential single-block commits should keep reusing one container.
        for i in 0..5u8 {
            let mut block = manager.create_block().expect("create");
            block.append(&[i; 10]).expect("append");
            block.close().expect("close");
        }
        let inner = manager.core().inner.lock().unwrap();
        assert_eq!(inner.containers.len(), 1);
        assert_eq!(inner.available[0].len(), 1);
    }

    #[test]
    fn test_concurrent_writers_use_distinct_containers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = open_manager(dir.path());

        // Both handles hold a checkout, so a second container is created.
        let b1 = manager.create_block().expect("create");
        let b2 = manager.create_block().expect("create");
        {
            let inner = manager.core().inner.lock().unwrap();
            assert_eq!(inner.containers.len(), 2);
        }
        drop(b1);
        drop(b2);

        // Aborted blocks return their containers to the pool.
        let inner = manager.core().inner.lock().unwrap();
        assert_eq!(inner.available[0].len(), 2);
        assert_eq!(inner.index.open_id_count(), 0);
    }

    #[test]
    fn test_abort_reclaims_id_claim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = open_manager(dir.path());

        let mut block = manager.create_block().expect("create");
        block.append(b"doomed").expect("append");
        let id = block.id();
        block.abort().expect("abort");

        assert!(manager.open_block(id).is_err());
        assert!(manager.all_block_ids().expect("ids").is_empty());
    }

    #[test]
    fn test_notify_block_id_bumps_floor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = open_manager(dir.path());

        manager.notify_block_id(BlockId::new(1000));
        let block = manager.create_block().expect("create");
        assert!(block.id().raw() > 1000);
        block.close().expect("close");
    }

    #[test]
    fn test_commit_failure_poisons_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = open_manager(dir.path());

        let mut block = manager.create_block().expect("create");
        block.append(b"payload").expect("append");
        let id = block.id();

        // Simulate a failed sync by retiring the container first; the
        // commit must fail and publish nothing.
        block.finalize().expect("finalize");
        let container = {
            let inner = manager.core().inner.lock().unwrap();
            inner.containers.values().next().expect("container").clone()
        };
        container.mark_read_only();

        assert!(block.close().is_err());
        assert!(manager.open_block(id).is_err());

        // The poisoned container is not handed out again.
        let inner = manager.core().inner.lock().unwrap();
        assert!(inner.available[0].is_empty());
    }

    #[test]
    fn test_dir_hint_targets_directory() {
        let root = tempfile::tempdir().expect("tempdir");
        let dirs: Vec<PathBuf> = (0..2).map(|i| root.path().join(format!("dd{i}"))).collect();
        let (manager, _) =
            LogBlockManager::open(Config::with_dirs(dirs.clone()).fs_block_size(4096))
                .expect("open");

        let opts = CreateBlockOptions { dir_hint: Some(1) };
        for _ in 0..3 {
            let mut block = manager.create_block_with_opts(&opts).expect("create");
            block.append(b"hinted").expect("append");
            block.close().expect("close");
        }

        let containers_in = |dir: &std::path::Path| {
            std::fs::read_dir(dir)
                .expect("read_dir")
                .filter(|e| {
                    e.as_ref()
                        .expect("entry")
                        .path()
                        .extension()
                        .map_or(false, |ext| ext == "metadata")
                })
                .count()
        };
        assert_eq!(containers_in(&dirs[0]), 0);
        assert_eq!(containers_in(&dirs[1]), 1);
    }

    #[test]
    fn test_memory_accounting_tracks_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = open_manager(dir.path());

        assert_eq!(manager.memory_consumption(), 0);
        let mut block = manager.create_block().expect("create");
        block.append(b"x").expect("append");
        let id = block.id();
        block.close().expect("close");
        assert_eq!(manager.memory_consumption(), 64);

        manager.delete_block(id).expect("delete");
        assert_eq!(manager.memory_consumption(), 0);
    }
}
