//! Streaming read engine for packed spindle archives.
//!
//! Archives are large packed files living on slow, seek-expensive and
//! possibly removable media. This crate mounts them, resolves entry names
//! through a hashed directory and streams entry bytes through a per-archive
//! ring buffer that a background thread keeps filled ahead of the reader.
//!
//! - **Registry**: bounded set of mounted archives, round-robin lookup cache
//! - **Directory**: hash-bucket index with an adjacent-entry fast path
//! - **Ring buffer**: read-ahead window refilled by a producer thread
//! - **Cursors**: pooled per-open-file state, inline zlib decoding
//! - **Recovery**: transparent retry of media faults with an injected notifier
//!
//! # Example
//!
//! ```rust,ignore
//! use spindle_storage::{ArchiveRegistry, FsDevice, MountOptions, NoopNotifier, RegistryConfig};
//! use std::io::Read;
//! use std::sync::Arc;
//!
//! let registry = ArchiveRegistry::new(
//!     RegistryConfig::default(),
//!     Arc::new(FsDevice::default()),
//!     Arc::new(NoopNotifier),
//! )?;
//! registry.mount("/media/disc/level01.spk", MountOptions::default())?;
//!
//! let mut cursor = registry.open("maps/town.bsp")?;
//! let mut bytes = Vec::new();
//! cursor.read_to_end(&mut bytes)?;
//! cursor.close();
//! ```

#![warn(missing_docs)]

use std::path::PathBuf;
use thiserror::Error;

// Configuration
pub mod config;

// Backing device contract and media-fault recovery
pub mod device;
pub mod recovery;

// Archive internals
pub mod directory;
pub mod ring;
mod codec;

// Archive lifecycle and lookup
pub mod handle;
pub mod registry;

// Open files
pub mod cursor;
mod pool;

pub use config::{MountOptions, RegistryConfig, RetryPolicy, RingGeometry};
pub use cursor::FileCursor;
pub use device::{BlockDevice, DEFAULT_BLOCK_SIZE, DeviceError, DeviceFile, FsDevice, MemoryDevice};
pub use directory::ArchiveDirectory;
pub use handle::{ArchiveInfo, EntryMetadata};
pub use recovery::{NoopNotifier, RecoveryNotifier};
pub use registry::{ArchiveId, ArchiveRegistry};
pub use ring::RingStatsSnapshot;
pub use spindle_formats::{DirectoryEntry, DirectoryFormat, NameHash};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Device I/O failed with something other than missing media.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive could not be mounted; its slot was released.
    #[error("failed to mount {}: {reason}", path.display())]
    MountFailed {
        /// Archive path
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// No free archive slot or pooled cursor.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Name absent from every searched directory.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// Compressed stream failed to decode.
    #[error("corrupt data in entry {name_hash}: {reason}")]
    CorruptData {
        /// Hash of the entry being decoded
        name_hash: NameHash,
        /// Decoder diagnostic
        reason: String,
    },

    /// Media stayed unavailable for the whole retry budget.
    #[error("media unavailable for {} after {attempts} attempts", path.display())]
    MediaFault {
        /// Archive path
        path: PathBuf,
        /// Failed attempts before giving up
        attempts: u32,
    },

    /// Archive id does not name a mounted archive.
    #[error("unknown archive {0}")]
    UnknownArchive(ArchiveId),

    /// Seek target before the start of the entry.
    #[error("invalid seek to {0}")]
    InvalidSeek(i64),

    /// Configuration rejected.
    #[error("configuration error: {0}")]
    InvalidConfig(String),
}

impl StorageError {
    /// Recover a storage error that was tunneled through `std::io::Error`.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<Self>()) {
            return Self::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Self>()) {
            Some(Ok(storage)) => *storage,
            Some(Err(inner)) => Self::Io(std::io::Error::new(kind, inner)),
            None => Self::Io(kind.into()),
        }
    }
}

impl From<StorageError> for std::io::Error {
    fn from(err: StorageError) -> Self {
        use std::io::ErrorKind;
        match err {
            StorageError::Io(io) => io,
            StorageError::NotFound(_) => Self::new(ErrorKind::NotFound, err),
            StorageError::InvalidSeek(_) | StorageError::InvalidConfig(_) => {
                Self::new(ErrorKind::InvalidInput, err)
            }
            StorageError::CorruptData { .. } => Self::new(ErrorKind::InvalidData, err),
            other => Self::other(other),
        }
    }
}
