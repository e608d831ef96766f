//! Configuration for the registry and for individual mounts

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default size of one producer read
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Minimum ring capacity, in read chunks
pub const MIN_CHUNKS_PER_BUFFER: usize = 4;

/// Default ring capacity
pub const DEFAULT_BUFFER_SIZE: usize = MIN_CHUNKS_PER_BUFFER * DEFAULT_READ_CHUNK_SIZE;

/// Default number of archive slots
pub const DEFAULT_MAX_ARCHIVES: usize = 16;

/// Default number of pooled cursors shared by all archives
pub const DEFAULT_MAX_OPEN_FILES: usize = 8;

/// Default pause between media-fault retries
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// How a media fault is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Pause after closing the device handle, before notifying and reopening
    pub backoff: Duration,
    /// Failures tolerated before `MediaFault` surfaces; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_RETRY_BACKOFF,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Set the backoff interval
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Give up after `attempts` consecutive failures
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Retry until the media comes back
    #[must_use]
    pub const fn unbounded(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Whether another attempt is allowed after `failures` failures
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_attempts.is_none_or(|max| failures < max)
    }
}

/// Registry-wide limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Archives that can be mounted at once
    pub max_archives: usize,
    /// Cursors that can be open at once across all archives
    pub max_open_files: usize,
    /// Media-fault retry policy applied to every archive
    pub retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_archives: DEFAULT_MAX_ARCHIVES,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            retry: RetryPolicy::default(),
        }
    }
}

impl RegistryConfig {
    /// Set the number of archive slots
    #[must_use]
    pub const fn with_max_archives(mut self, max_archives: usize) -> Self {
        self.max_archives = max_archives;
        self
    }

    /// Set the cursor pool size
    #[must_use]
    pub const fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reject limits the registry cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_archives == 0 {
            return Err(StorageError::InvalidConfig(
                "max_archives must be at least 1".to_string(),
            ));
        }
        if self.max_open_files == 0 {
            return Err(StorageError::InvalidConfig(
                "max_open_files must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-mount options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Keep the ring filled from a dedicated thread
    pub use_background_thread: bool,
    /// Load the preload section into memory at mount
    pub use_preload: bool,
    /// Requested ring capacity in bytes
    pub buffer_size: usize,
    /// Size of one device read
    pub read_chunk_size: usize,
    /// Bytes below the consume mark the producer must not overwrite;
    /// defaults to one read chunk
    pub safety_margin: Option<usize>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            use_background_thread: true,
            use_preload: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            safety_margin: None,
        }
    }
}

impl MountOptions {
    /// Options with explicit buffer and chunk sizes
    pub fn new(buffer_size: usize, read_chunk_size: usize) -> Self {
        Self {
            buffer_size,
            read_chunk_size,
            ..Default::default()
        }
    }

    /// Enable or disable the background producer
    #[must_use]
    pub const fn with_background_thread(mut self, enabled: bool) -> Self {
        self.use_background_thread = enabled;
        self
    }

    /// Enable or disable the preload section
    #[must_use]
    pub const fn with_preload(mut self, enabled: bool) -> Self {
        self.use_preload = enabled;
        self
    }

    /// Set the requested ring capacity
    #[must_use]
    pub const fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the device read size
    #[must_use]
    pub const fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    /// Set the protected distance below the consume mark
    #[must_use]
    pub const fn with_safety_margin(mut self, safety_margin: usize) -> Self {
        self.safety_margin = Some(safety_margin);
        self
    }

    /// Resolve the options against a device's block size.
    ///
    /// The chunk is rounded up to whole blocks, the capacity to at least
    /// [`MIN_CHUNKS_PER_BUFFER`] chunks and a whole number of chunks, and
    /// the safety margin so the producer can always make progress once the
    /// consumer catches up.
    pub fn geometry(&self, block_size: u64) -> Result<RingGeometry> {
        if self.read_chunk_size == 0 {
            return Err(StorageError::InvalidConfig(
                "read_chunk_size must be non-zero".to_string(),
            ));
        }
        let block = usize::try_from(block_size.max(1))
            .map_err(|_| StorageError::InvalidConfig(format!("block size {block_size}")))?;
        let chunk = self.read_chunk_size.div_ceil(block) * block;
        let capacity = self
            .buffer_size
            .max(MIN_CHUNKS_PER_BUFFER * chunk)
            .div_ceil(chunk)
            * chunk;
        let safety_margin = self.safety_margin.unwrap_or(chunk).min(capacity - 2 * chunk);
        Ok(RingGeometry {
            capacity,
            chunk,
            safety_margin,
            block_size: block as u64,
        })
    }
}

/// Resolved ring sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingGeometry {
    /// Ring capacity in bytes, a multiple of `chunk`
    pub capacity: usize,
    /// Bytes per device read, a multiple of `block_size`
    pub chunk: usize,
    /// Protected distance below the consume mark
    pub safety_margin: usize,
    /// Device alignment granularity
    pub block_size: u64,
}
