use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks memory consumed by in-memory block metadata. The add/sub hot path
/// is a single atomic op; peak tracking tolerates small races between
/// concurrent consumers.
#[derive(Debug, Default)]
pub struct MemTracker {
    consumed: AtomicU64,
    peak: AtomicU64,
}

impl MemTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consume(&self, bytes: u64) {
        let now = self.consumed.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: u64) {
        self.consumed.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn consumption(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn peak_consumption(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}
