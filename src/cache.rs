use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// A bounded cache of open read-only descriptors, keyed by path.
///
/// Handles are reference counted: eviction drops the cache's reference, and
/// the descriptor closes when the last reader releases its `Arc`. Eviction
/// is LRU over the cached keys.
pub struct FileCache {
    capacity: usize,
    inner: Mutex<Inner>,
    stats: Stats,
}

struct Inner {
    entries: HashMap<PathBuf, Arc<File>>,
    /// Keys ordered most-recently-used first.
    lru: Vec<PathBuf>,
}

impl FileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: Vec::new(),
            }),
            stats: Stats::new(),
        }
    }

    /// Returns an open descriptor for `path`, opening the file on a miss.
    pub fn open(&self, path: &Path) -> Result<Arc<File>> {
        {
            let mut inner = self.inner.lock()?;
            if let Some(file) = inner.entries.get(path).cloned() {
                self.stats.hit();
                promote(&mut inner.lru, path);
                return Ok(file);
            }
        }
        self.stats.miss();

        // Open outside the lock; a concurrent opener for the same path may
        // win the race, in which case its handle is kept.
        let file = Arc::new(File::open(path)?);

        let mut inner = self.inner.lock()?;
        if let Some(existing) = inner.entries.get(path).cloned() {
            promote(&mut inner.lru, path);
            return Ok(existing);
        }
        inner.entries.insert(path.to_path_buf(), file.clone());
        inner.lru.insert(0, path.to_path_buf());
        while inner.entries.len() > self.capacity {
            if let Some(evicted) = inner.lru.pop() {
                inner.entries.remove(&evicted);
            }
        }
        Ok(file)
    }

    /// Drops any cached descriptor for `path`, e.g. before unlinking it.
    pub fn invalidate(&self, path: &Path) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.entries.remove(path).is_some() {
                inner.lru.retain(|p| p != path);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) counters.
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }
}

fn promote(lru: &mut Vec<PathBuf>, path: &Path) {
    if let Some(pos) = lru.iter().position(|p| p == path) {
        let key = lru.remove(pos);
        lru.insert(0, key);
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::SeqCst),
            self.misses.load(Ordering::SeqCst),
        )
    }
}
