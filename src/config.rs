use std::path::PathBuf;

/// Configuration for the block manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directories that hold container files. At least one is required.
    pub data_dirs: Vec<PathBuf>,

    /// Hard cap on the number of blocks written to a single container,
    /// overriding the kernel-derived limit (default: none).
    pub max_blocks_per_container_override: Option<u64>,

    /// Metadata files whose live fraction of records falls below this ratio
    /// are rewritten at startup (default: 0.50).
    pub metadata_compaction_live_ratio: f64,

    /// Maximum number of descriptors the read cache keeps open (default: 512).
    pub file_cache_capacity: usize,

    /// Overrides the filesystem block size used for alignment and hole
    /// punching. Intended for tests (default: none, probe the filesystem).
    pub fs_block_size_override: Option<u64>,

    /// When false, deleted block ranges are left in place and reclaimed by
    /// the next startup instead of being punched out (default: true).
    pub enable_hole_punching: bool,

    /// When true, a container returns to the checkout pool as soon as its
    /// writer finalizes, letting later writers interleave before the earlier
    /// commit syncs. When false, the container is held until commit, so a
    /// failed sync can only poison a single writer's work (default: true).
    pub release_container_on_finalize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dirs: Vec::new(),
            max_blocks_per_container_override: None,
            metadata_compaction_live_ratio: 0.50,
            file_cache_capacity: 512,
            fs_block_size_override: None,
            enable_hole_punching: true,
            release_container_on_finalize: true,
        }
    }
}

impl Config {
    /// Create a new config with a single data directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dirs: vec![dir.into()],
            ..Default::default()
        }
    }

    /// Create a new config spanning several data directories.
    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            data_dirs: dirs,
            ..Default::default()
        }
    }

    /// Cap the number of blocks written per container.
    pub fn max_blocks_per_container(mut self, limit: u64) -> Self {
        self.max_blocks_per_container_override = Some(limit);
        self
    }

    /// Set the live-record ratio below which startup compacts metadata.
    pub fn metadata_compaction_live_ratio(mut self, ratio: f64) -> Self {
        self.metadata_compaction_live_ratio = ratio;
        self
    }

    /// Set the open-descriptor budget for the read cache.
    pub fn file_cache_capacity(mut self, capacity: usize) -> Self {
        self.file_cache_capacity = capacity;
        self
    }

    /// Force a filesystem block size instead of probing.
    pub fn fs_block_size(mut self, size: u64) -> Self {
        self.fs_block_size_override = Some(size);
        self
    }

    /// Enable or disable hole punching on deletion.
    pub fn enable_hole_punching(mut self, enabled: bool) -> Self {
        self.enable_hole_punching = enabled;
        self
    }

    /// Choose when a container becomes available to the next writer.
    pub fn release_container_on_finalize(mut self, on_finalize: bool) -> Self {
        self.release_container_on_finalize = on_finalize;
        self
    }
}
