//! Engine configuration.
//!
//! [`EngineConfig`] gathers every tunable of a [`CaptureEngine`]. The two
//! inputs owned by the session lifecycle (experiment directory and size
//! limit) can also be read from the environment with
//! [`EngineConfig::from_env`].
//!
//! [`CaptureEngine`]: crate::engine::CaptureEngine

use crate::defaults::{
    block_size_for, ARENA_CHUNK_SIZE, CHUNK_SLOTS, FALLBACK_LANES, MAX_HANDLES,
    MAX_TEXT_BUFFERS, TEXT_BUFFERS, TEXT_BUFFER_SIZE,
};
use crate::error::{Error, Result};
use crate::memory::mapping::page_size;
use crate::retry::RetryPolicy;
use std::path::PathBuf;

/// Environment variable naming the active experiment directory.
pub const ENV_EXPERIMENT_DIR: &str = "COLLECTOR_EXPERIMENT_DIR";

/// Environment variable holding the size limit in megabytes.
pub const ENV_SIZE_LIMIT_MB: &str = "COLLECTOR_SIZE_LIMIT_MB";

/// Configuration of a capture engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory stream files are created in.
    pub experiment_dir: PathBuf,
    /// Experiment size limit in megabytes (0 = unlimited).
    pub size_limit_mb: u64,
    /// Registry capacity.
    pub max_handles: usize,
    /// Block size in bytes; a power of two and a multiple of the page size.
    pub block_size: usize,
    /// Producer lanes of block-discipline handles.
    pub lanes: usize,
    /// Block slots per lane.
    pub chunk_slots: usize,
    /// Text buffer size in bytes; a multiple of the block size.
    pub text_buffer_size: usize,
    /// Buffers per text handle.
    pub text_buffers: usize,
    /// Arena chunk size in bytes.
    pub arena_chunk_size: usize,
    /// Policy for every bounded wait.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let block_size = block_size_for(page_size());
        let lanes = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_LANES);
        Self {
            experiment_dir: PathBuf::from("."),
            size_limit_mb: 0,
            max_handles: MAX_HANDLES,
            block_size,
            lanes,
            chunk_slots: CHUNK_SLOTS,
            text_buffer_size: TEXT_BUFFER_SIZE.max(block_size),
            text_buffers: TEXT_BUFFERS,
            arena_chunk_size: ARENA_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults with the given experiment directory.
    pub fn new(experiment_dir: impl Into<PathBuf>) -> Self {
        Self {
            experiment_dir: experiment_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `COLLECTOR_EXPERIMENT_DIR` and
    /// `COLLECTOR_SIZE_LIMIT_MB`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(ENV_EXPERIMENT_DIR) {
            config.experiment_dir = PathBuf::from(dir);
        }
        if let Ok(limit) = std::env::var(ENV_SIZE_LIMIT_MB) {
            config.size_limit_mb = limit.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("{ENV_SIZE_LIMIT_MB}={limit:?} is not a number"))
            })?;
        }
        Ok(config)
    }

    /// Set the experiment directory.
    pub fn with_experiment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.experiment_dir = dir.into();
        self
    }

    /// Set the size limit in megabytes.
    pub fn with_size_limit_mb(mut self, megabytes: u64) -> Self {
        self.size_limit_mb = megabytes;
        self
    }

    /// Set the registry capacity.
    pub fn with_max_handles(mut self, max_handles: usize) -> Self {
        self.max_handles = max_handles;
        self
    }

    /// Set the block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the lane count of block-discipline handles.
    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    /// Set the block slots per lane.
    pub fn with_chunk_slots(mut self, chunk_slots: usize) -> Self {
        self.chunk_slots = chunk_slots;
        self
    }

    /// Set the text buffer size and count.
    pub fn with_text_buffers(mut self, size: usize, count: usize) -> Self {
        self.text_buffer_size = size;
        self.text_buffers = count;
        self
    }

    /// Set the arena chunk size.
    pub fn with_arena_chunk_size(mut self, size: usize) -> Self {
        self.arena_chunk_size = size;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let page = page_size();
        if !self.block_size.is_power_of_two() || self.block_size % page != 0 {
            return Err(Error::InvalidConfig(format!(
                "block size {} must be a power of two and a multiple of the page size {page}",
                self.block_size
            )));
        }
        if self.block_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "block size {} does not fit a packet size field",
                self.block_size
            )));
        }
        if self.max_handles == 0 {
            return Err(Error::InvalidConfig("max_handles must be at least 1".into()));
        }
        if self.lanes == 0 || self.chunk_slots == 0 {
            return Err(Error::InvalidConfig(
                "lanes and chunk_slots must be at least 1".into(),
            ));
        }
        if self.text_buffer_size == 0 || self.text_buffer_size % self.block_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "text buffer size {} must be a non-zero multiple of the block size {}",
                self.text_buffer_size, self.block_size
            )));
        }
        if self.text_buffers < 2 || self.text_buffers > MAX_TEXT_BUFFERS {
            return Err(Error::InvalidConfig(format!(
                "text buffer count {} must be between 2 and {MAX_TEXT_BUFFERS}",
                self.text_buffers
            )));
        }
        if self.arena_chunk_size < page || self.arena_chunk_size % page != 0 {
            return Err(Error::InvalidConfig(format!(
                "arena chunk size {} must be a multiple of the page size {page}",
                self.arena_chunk_size
            )));
        }
        Ok(())
    }
}
