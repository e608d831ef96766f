//! Mounted archive state and its lifecycle
//!
//! A handle owns everything one mounted archive needs: the directory, the
//! ring and its producer, and the optional preload blob. Handles are shared
//! with open cursors through `Arc`. Unmounting an archive with open files
//! only flags it; the last cursor to close performs the teardown.

use crate::config::{MountOptions, RetryPolicy};
use crate::device::BlockDevice;
use crate::directory::ArchiveDirectory;
use crate::recovery::{MediaSession, RecoveryNotifier, SessionReader};
use crate::registry::ArchiveId;
use crate::ring::{RingReadBuffer, RingStatsSnapshot};
use crate::{Result, StorageError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spindle_formats::{DirectoryEntry, DirectoryFormat, DirectoryTable, FormatError, NameHash};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary of a mounted archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// Registry id
    pub id: ArchiveId,
    /// Path the archive was mounted from
    pub path: PathBuf,
    /// Directory record encoding
    pub format: DirectoryFormat,
    /// Directory entries
    pub entry_count: usize,
    /// Entries served from memory
    pub preload_entries: usize,
    /// Size of the archive file
    pub archive_size: u64,
    /// Offset of the data section
    pub data_offset: u64,
    /// Whether a producer thread fills the ring
    pub background: bool,
    /// Ring capacity in bytes
    pub buffer_capacity: usize,
    /// Device read size
    pub read_chunk_size: usize,
    /// Cursors currently open on the archive
    pub open_files: usize,
    /// Unmounted, waiting for the last cursor to close
    pub pending_unmount: bool,
}

/// What a lookup found, without opening it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Archive holding the entry
    pub archive: ArchiveId,
    /// Hash of the entry name
    pub name_hash: NameHash,
    /// Decoded length
    pub length: u64,
    /// Stored length when compressed, zero when stored verbatim
    pub compressed_length: u64,
    /// Served from the preload blob
    pub preloaded: bool,
}

impl EntryMetadata {
    /// Whether the entry is a zlib stream
    pub const fn is_compressed(&self) -> bool {
        self.compressed_length != 0
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    open_files: usize,
    flagged_for_deletion: bool,
    torn_down: bool,
}

pub(crate) struct ArchiveHandle {
    id: ArchiveId,
    path: PathBuf,
    format: DirectoryFormat,
    directory: ArchiveDirectory,
    ring: RingReadBuffer,
    preload: Option<Box<[u8]>>,
    data_start: u64,
    archive_size: u64,
    lifecycle: Mutex<Lifecycle>,
}

impl ArchiveHandle {
    /// Read the directory and preload section and set up the ring.
    ///
    /// The producer is not started; see [`ArchiveHandle::start`].
    pub(crate) fn populate(
        id: ArchiveId,
        path: &Path,
        options: &MountOptions,
        device: Arc<dyn BlockDevice>,
        notifier: Arc<dyn RecoveryNotifier>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let mut session = MediaSession::new(path.to_path_buf(), device, notifier, policy);
        let archive_size = session.archive_size()?;

        let table = {
            let mut reader = BufReader::new(SessionReader::new(&mut session, archive_size));
            DirectoryTable::read(&mut reader).map_err(|e| mount_error(path, e))?
        };
        let data_start = table.data_offset();
        let data_len = archive_size.checked_sub(data_start).ok_or_else(|| {
            StorageError::MountFailed {
                path: path.to_path_buf(),
                reason: format!("directory runs past end of file ({archive_size} bytes)"),
            }
        })?;
        table
            .validate_extents(data_len)
            .map_err(|e| mount_error(path, e))?;

        let mut preload_entries = 0;
        let mut preload = None;
        if options.use_preload && table.preload_entry_count() > 0 {
            let span = table.preload_span();
            let mut blob = vec![0u8; span as usize];
            let read = session.read_at(data_start, &mut blob)?;
            if read as u64 == span {
                preload_entries = table.preload_entry_count();
                preload = Some(blob.into_boxed_slice());
            } else {
                warn!(
                    "short preload read on {} ({read} of {span} bytes), streaming instead",
                    path.display()
                );
            }
        }
        let stream_start = if preload.is_some() {
            data_start + table.preload_span()
        } else {
            data_start
        };

        let geometry = options.geometry(session.block_size())?;
        let ring = RingReadBuffer::new(
            session,
            geometry,
            stream_start,
            archive_size,
            options.use_background_thread,
        );

        debug!(
            "populated {}: {} entries, {preload_entries} preloaded, data at {data_start}",
            path.display(),
            table.entries.len()
        );
        Ok(Self {
            id,
            path: path.to_path_buf(),
            format: table.format,
            directory: ArchiveDirectory::new(table.entries, preload_entries),
            ring,
            preload,
            data_start,
            archive_size,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Start the producer thread, if the archive has one.
    pub(crate) fn start(&self) -> Result<()> {
        self.ring
            .start_producer(format!("spindle-fill-{}", self.id.slot()))
    }

    pub(crate) fn id(&self) -> ArchiveId {
        self.id
    }

    pub(crate) fn ring(&self) -> &RingReadBuffer {
        &self.ring
    }

    /// Absolute offset of the data section
    pub(crate) fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Stored bytes of a preloaded entry
    pub(crate) fn preloaded_bytes(&self, entry: &DirectoryEntry) -> Option<&[u8]> {
        let blob = self.preload.as_deref()?;
        let start = usize::try_from(entry.offset).ok()?;
        let end = usize::try_from(entry.stored_end()).ok()?;
        blob.get(start..end)
    }

    pub(crate) fn find(&self, hash: NameHash) -> Option<usize> {
        self.directory.find(hash)
    }

    pub(crate) fn entry(&self, index: usize) -> Option<DirectoryEntry> {
        self.directory.entry(index).copied()
    }

    pub(crate) fn metadata(&self, index: usize) -> Option<EntryMetadata> {
        let entry = self.directory.entry(index)?;
        Some(EntryMetadata {
            archive: self.id,
            name_hash: entry.name_hash,
            length: entry.length,
            compressed_length: entry.compressed_length,
            preloaded: self.directory.is_preloaded(index),
        })
    }

    pub(crate) fn stats(&self) -> RingStatsSnapshot {
        self.ring.stats()
    }

    pub(crate) fn info(&self) -> ArchiveInfo {
        let geometry = self.ring.geometry();
        let lifecycle = self.lifecycle.lock();
        ArchiveInfo {
            id: self.id,
            path: self.path.clone(),
            format: self.format,
            entry_count: self.directory.len(),
            preload_entries: self.directory.preload_entries(),
            archive_size: self.archive_size,
            data_offset: self.data_start,
            background: self.ring.is_background(),
            buffer_capacity: geometry.capacity,
            read_chunk_size: geometry.chunk,
            open_files: lifecycle.open_files,
            pending_unmount: lifecycle.flagged_for_deletion,
        }
    }

    /// Whether lookups should skip this archive
    pub(crate) fn is_flagged(&self) -> bool {
        self.lifecycle.lock().flagged_for_deletion
    }

    /// Count a newly opened cursor.
    pub(crate) fn retain(&self) {
        self.lifecycle.lock().open_files += 1;
    }

    /// Count a closed cursor; `true` if the caller must now tear down.
    pub(crate) fn release(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.open_files = lifecycle.open_files.saturating_sub(1);
        lifecycle.open_files == 0 && lifecycle.flagged_for_deletion
    }

    /// Flag for deletion; `true` if no cursor is open and the caller must
    /// tear down now.
    pub(crate) fn flag_for_deletion(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.flagged_for_deletion = true;
        lifecycle.open_files == 0
    }

    /// Stop the producer and release ring storage and the device handle.
    ///
    /// Runs at most once; later calls do nothing.
    pub(crate) fn teardown(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.torn_down {
                return;
            }
            lifecycle.torn_down = true;
        }
        self.ring.shutdown();
        info!("archive {} ({}) torn down", self.id, self.path.display());
    }

    #[cfg(test)]
    pub(crate) fn is_torn_down(&self) -> bool {
        self.lifecycle.lock().torn_down
    }
}

fn mount_error(path: &Path, err: FormatError) -> StorageError {
    let reason = match err {
        FormatError::Io(io) => match StorageError::from_io(io) {
            fault @ StorageError::MediaFault { .. } => return fault,
            other => other.to_string(),
        },
        other => other.to_string(),
    };
    StorageError::MountFailed {
        path: path.to_path_buf(),
        reason,
    }
}
