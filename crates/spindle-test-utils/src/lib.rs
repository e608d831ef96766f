//! Test utilities for spindle-rs
//!
//! Builds archives in both directory formats, wraps devices with scripted
//! media faults and locates optional real archives for tests and examples.

use binrw::BinWrite;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use parking_lot::Mutex;
use spindle_formats::{ArchiveHeader, DirectoryEntry, DirectoryFormat, LegacyEntryRecord, NameHash};
use spindle_storage::{BlockDevice, DeviceError, DeviceFile, MemoryDevice, RecoveryNotifier};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Environment variable naming a real archive to exercise
pub const ARCHIVE_ENV_VAR: &str = "SPINDLE_TEST_ARCHIVE";

/// Path of a real archive from [`ARCHIVE_ENV_VAR`], if it exists
pub fn find_test_archive() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var(ARCHIVE_ENV_VAR).ok()?);
    path.is_file().then_some(path)
}

/// Deterministic, moderately compressible test payload
pub fn patterned_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let word = (i / 7) as u8;
            word.wrapping_mul(31).wrapping_add(seed) ^ (i % 5) as u8
        })
        .collect()
}

/// Compress `data` as a zlib stream
pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

#[derive(Debug, Clone)]
struct PendingEntry {
    name: String,
    data: Vec<u8>,
    compress: bool,
}

/// Builder for archive images
///
/// Entries are laid out in the order they are added; the first
/// `preload` entries form the preload section.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    format: DirectoryFormat,
    entries: Vec<PendingEntry>,
    preload: u32,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    /// Current-format archive
    pub fn new() -> Self {
        Self {
            format: DirectoryFormat::Current,
            entries: Vec::new(),
            preload: 0,
        }
    }

    /// Legacy-format archive storing names instead of hashes
    pub fn legacy() -> Self {
        Self {
            format: DirectoryFormat::Legacy,
            ..Self::new()
        }
    }

    /// Add an entry stored verbatim
    #[must_use]
    pub fn stored(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.entries.push(PendingEntry {
            name: name.to_string(),
            data: data.into(),
            compress: false,
        });
        self
    }

    /// Add a zlib-compressed entry
    #[must_use]
    pub fn compressed(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.entries.push(PendingEntry {
            name: name.to_string(),
            data: data.into(),
            compress: true,
        });
        self
    }

    /// Serve the first `count` entries from the preload section
    #[must_use]
    pub const fn preload(mut self, count: u32) -> Self {
        self.preload = count;
        self
    }

    /// Encode the archive image
    pub fn build(&self) -> Vec<u8> {
        let payloads: Vec<Vec<u8>> = self
            .entries
            .iter()
            .map(|entry| {
                if entry.compress {
                    zlib(&entry.data)
                } else {
                    entry.data.clone()
                }
            })
            .collect();

        let mut out = Cursor::new(Vec::new());
        let header = ArchiveHeader::new(self.format, self.entries.len() as u32, self.preload);
        // Writes into a Cursor<Vec<u8>> cannot fail.
        let _ = header.write(&mut out);

        let mut offset = 0u64;
        for (entry, payload) in self.entries.iter().zip(&payloads) {
            let length = entry.data.len() as u64;
            let compressed_length = if entry.compress {
                payload.len() as u64
            } else {
                0
            };
            let _ = match self.format {
                DirectoryFormat::Current => DirectoryEntry {
                    name_hash: NameHash::of(&entry.name),
                    offset,
                    length,
                    compressed_length,
                }
                .write(&mut out),
                DirectoryFormat::Legacy => {
                    LegacyEntryRecord::new(&entry.name, offset, length, compressed_length)
                        .write(&mut out)
                }
            };
            offset += payload.len() as u64;
        }

        let mut bytes = out.into_inner();
        for payload in payloads {
            bytes.extend_from_slice(&payload);
        }
        bytes
    }

    /// Write the archive into `dir` and return its path
    pub fn write_to(&self, dir: &Path, file_name: &str) -> io::Result<PathBuf> {
        let path = dir.join(file_name);
        std::fs::write(&path, self.build())?;
        Ok(path)
    }

    /// Write the archive to a fresh temporary file
    pub fn temp_file(&self) -> io::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&self.build())?;
        file.flush()?;
        Ok(file)
    }
}

#[derive(Debug)]
struct FaultState {
    failures_left: AtomicU32,
    /// Reads at or past this offset fail until media is restored
    ejected_from: AtomicU64,
    injected: AtomicU32,
    reads: AtomicU64,
}

impl Default for FaultState {
    fn default() -> Self {
        Self {
            failures_left: AtomicU32::new(0),
            ejected_from: AtomicU64::new(u64::MAX),
            injected: AtomicU32::new(0),
            reads: AtomicU64::new(0),
        }
    }
}

impl FaultState {
    fn check(&self, pos: Option<u64>) -> Result<(), DeviceError> {
        let ejected = pos.is_some_and(|pos| pos >= self.ejected_from.load(Ordering::Acquire));
        let took = ejected
            || self
                .failures_left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
                .is_ok();
        if took {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(DeviceError::MediaUnavailable("media ejected".to_string()));
        }
        Ok(())
    }
}

/// Memory device that reports missing media on demand
///
/// Each of the next `n` opens or reads after [`FaultyDevice::fail_next`]
/// fails with [`DeviceError::MediaUnavailable`], as does every read at or
/// past the offset given to [`FaultyDevice::eject_from`] until
/// [`FaultyDevice::restore_media`].
#[derive(Debug, Clone)]
pub struct FaultyDevice {
    inner: MemoryDevice,
    state: Arc<FaultState>,
}

impl FaultyDevice {
    /// Wrap a memory device
    pub fn new(inner: MemoryDevice) -> Self {
        Self {
            inner,
            state: Arc::default(),
        }
    }

    /// The wrapped device
    pub const fn inner(&self) -> &MemoryDevice {
        &self.inner
    }

    /// Fail the next `n` device operations
    pub fn fail_next(&self, n: u32) {
        self.state.failures_left.store(n, Ordering::Release);
    }

    /// Fail every read starting at or past `offset`
    pub fn eject_from(&self, offset: u64) {
        self.state.ejected_from.store(offset, Ordering::Release);
    }

    /// Undo [`FaultyDevice::eject_from`]
    pub fn restore_media(&self) {
        self.state.ejected_from.store(u64::MAX, Ordering::Release);
    }

    /// Faults injected so far
    pub fn injected(&self) -> u32 {
        self.state.injected.load(Ordering::Acquire)
    }

    /// Successful reads so far
    pub fn reads(&self) -> u64 {
        self.state.reads.load(Ordering::Acquire)
    }
}

impl BlockDevice for FaultyDevice {
    fn stat(&self, path: &Path) -> Result<u64, DeviceError> {
        self.inner.stat(path)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn DeviceFile>, DeviceError> {
        self.state.check(None)?;
        Ok(Box::new(FaultyFile {
            inner: self.inner.open(path)?,
            state: Arc::clone(&self.state),
            pos: 0,
        }))
    }

    fn block_size(&self) -> u64 {
        self.inner.block_size()
    }
}

struct FaultyFile {
    inner: Box<dyn DeviceFile>,
    state: Arc<FaultState>,
    pos: u64,
}

impl DeviceFile for FaultyFile {
    fn seek(&mut self, pos: u64) -> Result<(), DeviceError> {
        self.inner.seek(pos)?;
        self.pos = pos;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        self.state.check(Some(self.pos))?;
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        self.state.reads.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }
}

/// Notifier recording every callback
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    unavailable: Mutex<Vec<(PathBuf, u32)>>,
    restored: Mutex<Vec<(PathBuf, u32)>>,
}

impl RecordingNotifier {
    /// Attempt numbers passed to `media_unavailable`, in order
    pub fn attempts(&self) -> Vec<u32> {
        self.unavailable.lock().iter().map(|(_, n)| *n).collect()
    }

    /// Failure counts passed to `media_restored`, in order
    pub fn restorations(&self) -> Vec<u32> {
        self.restored.lock().iter().map(|(_, n)| *n).collect()
    }

    /// Paths reported unavailable
    pub fn paths(&self) -> Vec<PathBuf> {
        self.unavailable.lock().iter().map(|(p, _)| p.clone()).collect()
    }
}

impl RecoveryNotifier for RecordingNotifier {
    fn media_unavailable(&self, path: &Path, attempt: u32) {
        self.unavailable.lock().push((path.to_path_buf(), attempt));
    }

    fn media_restored(&self, path: &Path, failed_attempts: u32) {
        self.restored.lock().push((path.to_path_buf(), failed_attempts));
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use spindle_formats::DirectoryTable;

    #[test]
    fn test_builder_layout() {
        let image = ArchiveBuilder::new()
            .stored("a.txt", b"hello".to_vec())
            .compressed("b.bin", patterned_bytes(4096, 1))
            .preload(1)
            .build();
        let table = DirectoryTable::read(&mut Cursor::new(&image)).expect("directory");
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.preload_span(), 5);
        let data = table.data_offset() as usize;
        assert_eq!(&image[data..data + 5], b"hello");
        assert!(table.entries[1].is_compressed());
        table
            .validate_extents((image.len() - data) as u64)
            .expect("extents");
    }

    #[test]
    fn test_faults_are_consumed() {
        let memory = MemoryDevice::default();
        memory.insert("x", vec![1u8; 8]);
        let device = FaultyDevice::new(memory);
        device.fail_next(2);
        assert!(device.open(Path::new("x")).is_err());
        assert!(device.open(Path::new("x")).is_err());
        let mut file = device.open(Path::new("x")).expect("recovered");
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).expect("read"), 8);
        assert_eq!(device.injected(), 2);

        device.eject_from(4);
        file.seek(5).expect("seek");
        assert!(file.read(&mut buf).is_err());
        device.restore_media();
        assert_eq!(file.read(&mut buf).expect("read after restore"), 3);
    }
}
