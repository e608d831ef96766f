//! Open-file cursors
//!
//! A [`FileCursor`] reads one directory entry. Stored entries copy straight
//! out of the ring (or the preload blob); compressed entries inflate inline
//! from whatever compressed bytes are resident, so no entry is ever
//! materialized whole. The last decoded block stays in the cursor's pooled
//! scratch, which makes short backward seeks and small sequential reads
//! cheap. Any other backward seek inside a compressed entry restarts the
//! decoder from the entry's first byte.

use crate::handle::{ArchiveHandle, EntryMetadata};
use crate::pool::{CursorScratch, PoolLease};
use crate::registry::RegistryInner;
use crate::{Result, StorageError};
use spindle_formats::DirectoryEntry;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use tracing::{trace, warn};

/// Reader over one archive entry
///
/// Closing (or dropping) the cursor returns its pool slot and, when its
/// archive was unmounted while open and this was the last cursor, tears
/// the archive down.
pub struct FileCursor {
    registry: Arc<RegistryInner>,
    handle: Arc<ArchiveHandle>,
    entry: DirectoryEntry,
    preloaded: bool,
    lease: Option<(PoolLease, Box<CursorScratch>)>,
    /// Logical position reported to the caller
    seek_pos: u64,
    /// Decoded bytes produced so far
    actual_pos: u64,
    /// Compressed bytes fed to the decoder so far
    compressed_pos: u64,
    /// Valid bytes of the scratch block, which ends at `actual_pos`
    block_len: usize,
    stream_finished: bool,
    eof: bool,
    poisoned: Option<String>,
}

impl FileCursor {
    pub(crate) fn new(
        registry: Arc<RegistryInner>,
        handle: Arc<ArchiveHandle>,
        entry: DirectoryEntry,
        preloaded: bool,
        lease: PoolLease,
        scratch: Box<CursorScratch>,
    ) -> Self {
        Self {
            registry,
            handle,
            entry,
            preloaded,
            lease: Some((lease, scratch)),
            seek_pos: 0,
            actual_pos: 0,
            compressed_pos: 0,
            block_len: 0,
            stream_finished: false,
            eof: false,
            poisoned: None,
        }
    }

    /// Read up to `buf.len()` bytes at the current position.
    ///
    /// Asking for more than remains reads the rest and sets end-of-file.
    /// After a decode failure every read fails with
    /// [`StorageError::CorruptData`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(reason) = &self.poisoned {
            return Err(self.corrupt(reason.clone()));
        }
        let remaining = self.entry.length.saturating_sub(self.seek_pos);
        let mut want = buf.len();
        if want as u64 > remaining {
            want = remaining as usize;
            self.eof = true;
        }
        if want == 0 {
            return Ok(0);
        }

        let read = if self.entry.is_compressed() {
            self.read_compressed(&mut buf[..want])
        } else {
            self.read_stored(&mut buf[..want])
        };
        match read {
            Ok(n) => {
                self.seek_pos += n as u64;
                Ok(n)
            }
            Err(StorageError::CorruptData { name_hash, reason }) => {
                warn!("entry {name_hash} in archive {} is unreadable: {reason}", self.handle.id());
                self.poisoned = Some(reason.clone());
                Err(StorageError::CorruptData { name_hash, reason })
            }
            Err(e) => Err(e),
        }
    }

    /// Move the position; targets past the end clamp to the end and set
    /// end-of-file, targets before the start are rejected.
    pub fn seek(&mut self, target: SeekFrom) -> Result<u64> {
        let requested = match target {
            SeekFrom::Start(pos) => i128::from(pos),
            SeekFrom::Current(delta) => i128::from(self.seek_pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.entry.length) + i128::from(delta),
        };
        if requested < 0 {
            return Err(StorageError::InvalidSeek(requested as i64));
        }
        if requested > i128::from(self.entry.length) {
            self.seek_pos = self.entry.length;
            self.eof = true;
        } else {
            self.seek_pos = requested as u64;
            self.eof = false;
        }
        Ok(self.seek_pos)
    }

    /// Current position
    pub fn tell(&self) -> u64 {
        self.seek_pos
    }

    /// Whether a read or seek ran into the end of the entry
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Decoded length of the entry
    pub fn len(&self) -> u64 {
        self.entry.length
    }

    /// Whether the entry is empty
    pub fn is_empty(&self) -> bool {
        self.entry.length == 0
    }

    /// Whether the entry is a zlib stream
    pub fn is_compressed(&self) -> bool {
        self.entry.is_compressed()
    }

    /// Whether the entry is served from the preload blob
    pub fn is_preloaded(&self) -> bool {
        self.preloaded
    }

    /// Lookup details of the entry
    pub fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            archive: self.handle.id(),
            name_hash: self.entry.name_hash,
            length: self.entry.length,
            compressed_length: self.entry.compressed_length,
            preloaded: self.preloaded,
        }
    }

    /// Close the cursor. Same as dropping it.
    pub fn close(self) {
        drop(self);
    }

    fn corrupt(&self, reason: String) -> StorageError {
        StorageError::CorruptData {
            name_hash: self.entry.name_hash,
            reason,
        }
    }

    fn read_stored(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.preloaded {
            let stored = self
                .handle
                .preloaded_bytes(&self.entry)
                .ok_or_else(|| self.corrupt("preloaded entry outside preload blob".into()))?;
            let start = self.seek_pos as usize;
            buf.copy_from_slice(&stored[start..start + buf.len()]);
            return Ok(buf.len());
        }

        let base = self.handle.data_start() + self.entry.offset + self.seek_pos;
        let mut consumer = self.handle.ring().consumer();
        let mut filled = 0;
        while filled < buf.len() {
            let pos = base + filled as u64;
            let dest = &mut buf[filled..];
            let copied = consumer.with_window(pos, dest.len(), |window| {
                dest[..window.len()].copy_from_slice(window);
                window.len()
            })?;
            filled += copied;
            consumer.advance(pos + copied as u64);
        }
        Ok(filled)
    }

    fn read_compressed(&mut self, buf: &mut [u8]) -> Result<usize> {
        let target = self.seek_pos;
        let block_start = self.actual_pos - self.block_len as u64;
        if target < block_start {
            trace!(
                "rewinding {} from {} to {target}",
                self.entry.name_hash, self.actual_pos
            );
            self.rewind();
        }

        let handle = Arc::clone(&self.handle);
        let Some((_, scratch)) = self.lease.as_mut() else {
            return Err(StorageError::Io(io::Error::other("cursor is closed")));
        };
        let CursorScratch { decoder, output } = &mut **scratch;

        // Serve what the retained block already holds.
        let mut written = 0;
        if target < self.actual_pos {
            let block_start = self.actual_pos - self.block_len as u64;
            let from = (target - block_start) as usize;
            let n = buf.len().min(self.block_len - from);
            buf[..n].copy_from_slice(&output[from..from + n]);
            written = n;
        }
        let mut skip = (target + written as u64).saturating_sub(self.actual_pos);

        let base = handle.data_start() + self.entry.offset;
        let mut consumer = (!self.preloaded).then(|| handle.ring().consumer());
        while written < buf.len() {
            if self.stream_finished {
                return Err(StorageError::CorruptData {
                    name_hash: self.entry.name_hash,
                    reason: format!(
                        "stream ended after {} of {} bytes",
                        self.actual_pos, self.entry.length
                    ),
                });
            }
            let input_left = self.entry.compressed_length - self.compressed_pos;
            let max_input = usize::try_from(input_left).unwrap_or(usize::MAX);

            // With all input consumed the decoder may still hold output
            // that did not fit the scratch buffer; drain it without
            // touching the ring.
            let step = match consumer.as_mut() {
                _ if input_left == 0 => decoder.decode(&[], output),
                Some(consumer) => consumer.with_window(
                    base + self.compressed_pos,
                    max_input,
                    |window| decoder.decode(window, output),
                )?,
                None => {
                    let stored = handle.preloaded_bytes(&self.entry).ok_or_else(|| {
                        StorageError::CorruptData {
                            name_hash: self.entry.name_hash,
                            reason: "preloaded entry outside preload blob".into(),
                        }
                    })?;
                    decoder.decode(&stored[self.compressed_pos as usize..], output)
                }
            }
            .map_err(|e| StorageError::CorruptData {
                name_hash: self.entry.name_hash,
                reason: e.to_string(),
            })?;

            if step.consumed == 0 && step.produced == 0 && !step.finished {
                let reason = if input_left == 0 {
                    "compressed bytes exhausted before end of stream".to_string()
                } else {
                    format!("decoder stalled at compressed offset {}", self.compressed_pos)
                };
                return Err(StorageError::CorruptData {
                    name_hash: self.entry.name_hash,
                    reason,
                });
            }
            self.compressed_pos += step.consumed as u64;
            if let Some(consumer) = consumer.as_mut() {
                consumer.advance(base + self.compressed_pos);
            }
            self.actual_pos += step.produced as u64;
            self.block_len = step.produced;
            self.stream_finished = step.finished;

            if skip >= step.produced as u64 {
                skip -= step.produced as u64;
                continue;
            }
            let from = skip as usize;
            skip = 0;
            let n = (step.produced - from).min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&output[from..from + n]);
            written += n;
        }
        Ok(written)
    }

    fn rewind(&mut self) {
        if let Some((_, scratch)) = self.lease.as_mut() {
            scratch.decoder.reset();
        }
        self.actual_pos = 0;
        self.compressed_pos = 0;
        self.block_len = 0;
        self.stream_finished = false;
    }
}

impl Drop for FileCursor {
    fn drop(&mut self) {
        if let Some((lease, scratch)) = self.lease.take() {
            self.registry.release_cursor(lease, scratch, &self.handle);
        }
    }
}

impl io::Read for FileCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Self::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Seek for FileCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Self::seek(self, pos).map_err(io::Error::from)
    }
}

impl std::fmt::Debug for FileCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCursor")
            .field("archive", &self.handle.id())
            .field("name_hash", &self.entry.name_hash)
            .field("length", &self.entry.length)
            .field("position", &self.seek_pos)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}
