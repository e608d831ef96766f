//! Backing block-device contract
//!
//! The engine never talks to the OS directly. It opens archives through a
//! [`BlockDevice`], which reports a distinguished
//! [`DeviceError::MediaUnavailable`] condition when removable media is
//! missing; that condition is retried by the recovery loop in
//! [`crate::recovery`], everything else surfaces to the caller.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Sector size of optical media, used as the default alignment
pub const DEFAULT_BLOCK_SIZE: u64 = 2048;

/// Result type for device calls
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Failure reported by a device
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Removable media is missing or unreadable; retrying may succeed
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    /// Any other I/O failure
    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// Whether the recovery loop should retry this failure
    pub const fn is_media_unavailable(&self) -> bool {
        matches!(self, Self::MediaUnavailable(_))
    }
}

/// An open, read-only device file. Dropping it closes it.
pub trait DeviceFile: Send {
    /// Move to an absolute byte position
    fn seek(&mut self, pos: u64) -> DeviceResult<()>;

    /// Fill `buf` from the current position.
    ///
    /// Returns fewer bytes than requested only at end of file.
    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize>;
}

/// Source of archive files
pub trait BlockDevice: Send + Sync {
    /// Size of the file at `path`
    fn stat(&self, path: &Path) -> DeviceResult<u64>;

    /// Open `path` read-only
    fn open(&self, path: &Path) -> DeviceResult<Box<dyn DeviceFile>>;

    /// Alignment granularity reads should be rounded to
    fn block_size(&self) -> u64;
}

/// Device backed by the local filesystem
#[derive(Debug, Clone, Copy)]
pub struct FsDevice {
    block_size: u64,
}

impl Default for FsDevice {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl FsDevice {
    /// Filesystem device with the given alignment
    pub const fn new(block_size: u64) -> Self {
        Self { block_size }
    }
}

impl BlockDevice for FsDevice {
    fn stat(&self, path: &Path) -> DeviceResult<u64> {
        std::fs::metadata(path).map(|meta| meta.len()).map_err(classify)
    }

    fn open(&self, path: &Path) -> DeviceResult<Box<dyn DeviceFile>> {
        let file = File::open(path).map_err(classify)?;
        Ok(Box::new(FsFile { file }))
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }
}

struct FsFile {
    file: File,
}

impl DeviceFile for FsFile {
    fn seek(&mut self, pos: u64) -> DeviceResult<()> {
        self.file.seek(SeekFrom::Start(pos)).map_err(classify)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(filled)
    }
}

/// Device serving archives held in memory
///
/// Useful for archives embedded in a binary and for tests.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    files: Arc<RwLock<HashMap<PathBuf, Arc<[u8]>>>>,
    block_size: u64,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryDevice {
    /// Empty device with the given alignment
    pub fn new(block_size: u64) -> Self {
        Self {
            files: Arc::new(RwLock::new(HashMap::new())),
            block_size,
        }
    }

    /// Add or replace a file
    pub fn insert<P: AsRef<Path>>(&self, path: P, bytes: impl Into<Arc<[u8]>>) {
        self.files
            .write()
            .insert(path.as_ref().to_path_buf(), bytes.into());
    }

    /// Remove a file; open handles keep their bytes
    pub fn remove<P: AsRef<Path>>(&self, path: P) -> bool {
        self.files.write().remove(path.as_ref()).is_some()
    }

    fn get(&self, path: &Path) -> DeviceResult<Arc<[u8]>> {
        self.files.read().get(path).cloned().ok_or_else(|| {
            DeviceError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not on device", path.display()),
            ))
        })
    }
}

impl BlockDevice for MemoryDevice {
    fn stat(&self, path: &Path) -> DeviceResult<u64> {
        Ok(self.get(path)?.len() as u64)
    }

    fn open(&self, path: &Path) -> DeviceResult<Box<dyn DeviceFile>> {
        Ok(Box::new(MemoryFile {
            data: self.get(path)?,
            pos: 0,
        }))
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }
}

struct MemoryFile {
    data: Arc<[u8]>,
    pos: usize,
}

impl DeviceFile for MemoryFile {
    fn seek(&mut self, pos: u64) -> DeviceResult<()> {
        self.pos = usize::try_from(pos).unwrap_or(usize::MAX);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let start = self.pos.min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos = start + n;
        Ok(n)
    }
}

fn classify(err: io::Error) -> DeviceError {
    match err.raw_os_error() {
        Some(code) if is_media_errno(code) => DeviceError::MediaUnavailable(err.to_string()),
        _ => DeviceError::Io(err),
    }
}

#[cfg(unix)]
fn is_media_errno(code: i32) -> bool {
    #[cfg(target_os = "linux")]
    let no_medium = code == libc::ENOMEDIUM;
    #[cfg(not(target_os = "linux"))]
    let no_medium = false;
    no_medium || matches!(code, libc::EIO | libc::ENXIO | libc::ENODEV)
}

#[cfg(not(unix))]
fn is_media_errno(_code: i32) -> bool {
    false
}
