//! Media-fault recovery
//!
//! Every device access for an archive goes through a [`MediaSession`].
//! When the device reports missing media the session closes its handle,
//! sleeps the configured backoff, tells the injected [`RecoveryNotifier`]
//! (which typically asks the user to reinsert the disc), reopens, re-seeks
//! and tries again. Only the policy's attempt bound, or teardown of the
//! archive, turns the fault into a [`StorageError::MediaFault`].

use crate::config::RetryPolicy;
use crate::device::{BlockDevice, DeviceError, DeviceFile, DeviceResult};
use crate::{Result, StorageError};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Receives media-fault notifications
pub trait RecoveryNotifier: Send + Sync {
    /// A device access failed because media is unavailable.
    ///
    /// Called once per failed attempt, after the backoff and before the
    /// device is reopened.
    fn media_unavailable(&self, path: &Path, attempt: u32);

    /// An access succeeded after `failed_attempts` failures
    fn media_restored(&self, _path: &Path, _failed_attempts: u32) {}
}

/// Notifier that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl RecoveryNotifier for NoopNotifier {
    fn media_unavailable(&self, _path: &Path, _attempt: u32) {}
}

/// Open device file of one archive plus its retry policy
pub(crate) struct MediaSession {
    path: PathBuf,
    device: Arc<dyn BlockDevice>,
    notifier: Arc<dyn RecoveryNotifier>,
    policy: RetryPolicy,
    file: Option<Box<dyn DeviceFile>>,
    cancelled: Arc<AtomicBool>,
}

impl MediaSession {
    pub(crate) fn new(
        path: PathBuf,
        device: Arc<dyn BlockDevice>,
        notifier: Arc<dyn RecoveryNotifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            path,
            device,
            notifier,
            policy,
            file: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn block_size(&self) -> u64 {
        self.device.block_size().max(1)
    }

    /// Flag shared with whoever may abort an in-progress retry loop
    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Size of the archive file
    pub(crate) fn archive_size(&mut self) -> Result<u64> {
        self.with_recovery(|session| session.device.stat(&session.path))
    }

    /// Read at an absolute position; short only at end of file
    pub(crate) fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.with_recovery(|session| {
            let file = session.ensure_open()?;
            file.seek(pos)?;
            file.read(buf)
        })
    }

    /// Release the device handle
    pub(crate) fn close(&mut self) {
        self.file = None;
    }

    fn ensure_open(&mut self) -> DeviceResult<&mut (dyn DeviceFile + 'static)> {
        if self.file.is_none() {
            self.file = Some(self.device.open(&self.path)?);
        }
        self.file
            .as_deref_mut()
            .ok_or_else(|| DeviceError::Io(io::Error::other("device file closed")))
    }

    fn with_recovery<T>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> DeviceResult<T>,
    ) -> Result<T> {
        let mut failures = 0u32;
        loop {
            match op(self) {
                Ok(value) => {
                    if failures > 0 {
                        info!(
                            "media restored for {} after {failures} failed attempts",
                            self.path.display()
                        );
                        self.notifier.media_restored(&self.path, failures);
                    }
                    return Ok(value);
                }
                Err(DeviceError::MediaUnavailable(reason)) => {
                    failures += 1;
                    warn!(
                        "media unavailable for {} (attempt {failures}): {reason}",
                        self.path.display()
                    );
                    self.file = None;
                    if self.cancelled.load(Ordering::Acquire) {
                        return Err(self.fault(failures));
                    }
                    std::thread::sleep(self.policy.backoff);
                    self.notifier.media_unavailable(&self.path, failures);
                    if !self.policy.allows_retry(failures) {
                        return Err(self.fault(failures));
                    }
                }
                Err(DeviceError::Io(e)) => return Err(StorageError::Io(e)),
            }
        }
    }

    fn fault(&self, attempts: u32) -> StorageError {
        StorageError::MediaFault {
            path: self.path.clone(),
            attempts,
        }
    }
}

/// `Read + Seek` view of a session, used to decode the directory
pub(crate) struct SessionReader<'a> {
    session: &'a mut MediaSession,
    pos: u64,
    len: u64,
}

impl<'a> SessionReader<'a> {
    pub(crate) fn new(session: &'a mut MediaSession, len: u64) -> Self {
        Self {
            session,
            pos: 0,
            len,
        }
    }
}

impl Read for SessionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.session.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SessionReader<'_> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let next = match target {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
        };
        match next {
            Some(pos) => {
                self.pos = pos;
                Ok(pos)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of archive",
            )),
        }
    }
}
