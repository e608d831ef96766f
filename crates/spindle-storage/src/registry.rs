//! Bounded registry of mounted archives
//!
//! The registry owns a fixed number of archive slots and the open-file
//! pool. Name lookups walk the slots round-robin, starting at the archive
//! that satisfied the previous lookup, and skip archives waiting for their
//! last cursor to close.
//!
//! Lock order: registry, then an archive's lifecycle, then its ring.

use crate::config::{MountOptions, RegistryConfig};
use crate::cursor::FileCursor;
use crate::device::BlockDevice;
use crate::handle::{ArchiveHandle, ArchiveInfo, EntryMetadata};
use crate::pool::{CursorScratch, OpenFilePool, PoolLease};
use crate::recovery::RecoveryNotifier;
use crate::ring::RingStatsSnapshot;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spindle_formats::NameHash;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identifies one mount of one registry slot
///
/// The generation changes every time the slot is reused, so an id held
/// after an unmount never names a later archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveId {
    slot: u32,
    generation: u32,
}

impl ArchiveId {
    /// Registry slot index
    pub const fn slot(&self) -> usize {
        self.slot as usize
    }

    /// Mount generation of the slot
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

#[derive(Default)]
enum SlotState {
    #[default]
    Free,
    /// Reserved while the archive is populated outside the registry lock
    Mounting,
    Mounted(Arc<ArchiveHandle>),
}

#[derive(Default)]
struct ArchiveSlot {
    generation: u32,
    state: SlotState,
}

impl ArchiveSlot {
    fn handle(&self) -> Option<&Arc<ArchiveHandle>> {
        match &self.state {
            SlotState::Mounted(handle) => Some(handle),
            SlotState::Free | SlotState::Mounting => None,
        }
    }
}

struct RegistryState {
    slots: Vec<ArchiveSlot>,
    /// Slot that satisfied the last lookup; searches start here
    current: usize,
    most_recent: Option<ArchiveId>,
    pool: OpenFilePool,
}

impl RegistryState {
    /// Live handle for `id`, skipping archives pending unmount.
    fn live(&self, id: ArchiveId) -> Result<&Arc<ArchiveHandle>> {
        self.slots
            .get(id.slot())
            .and_then(ArchiveSlot::handle)
            .filter(|handle| handle.id() == id && !handle.is_flagged())
            .ok_or(StorageError::UnknownArchive(id))
    }

    /// Round-robin search from the current slot.
    fn search(&self, hash: NameHash) -> Option<(usize, Arc<ArchiveHandle>, usize)> {
        let count = self.slots.len();
        (0..count)
            .map(|step| (self.current + step) % count)
            .find_map(|slot| {
                let handle = self.slots[slot].handle()?;
                if handle.is_flagged() {
                    return None;
                }
                let index = handle.find(hash)?;
                Some((slot, Arc::clone(handle), index))
            })
    }

    /// Forget cache entries that point at `id`.
    fn forget(&mut self, id: ArchiveId) {
        if self.current == id.slot() {
            self.current = 0;
        }
        if self.most_recent == Some(id) {
            self.most_recent = None;
        }
    }
}

pub(crate) struct RegistryInner {
    config: RegistryConfig,
    device: Arc<dyn BlockDevice>,
    notifier: Arc<dyn RecoveryNotifier>,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    /// Return a closing cursor's pool slot; finish a deferred unmount if it
    /// was the archive's last open file.
    pub(crate) fn release_cursor(
        &self,
        lease: PoolLease,
        scratch: Box<CursorScratch>,
        handle: &Arc<ArchiveHandle>,
    ) {
        let mut state = self.state.lock();
        if !state.pool.release(lease, scratch) {
            warn!("cursor on archive {} released a stale pool lease", handle.id());
        }
        if !handle.release() {
            return;
        }
        let id = handle.id();
        if let Some(slot) = state.slots.get_mut(id.slot()) {
            if slot.handle().is_some_and(|h| Arc::ptr_eq(h, handle)) {
                slot.state = SlotState::Free;
            }
        }
        drop(state);
        handle.teardown();
        info!("deferred unmount of archive {id} completed");
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for slot in &mut self.state.get_mut().slots {
            if let SlotState::Mounted(handle) = std::mem::take(&mut slot.state) {
                handle.teardown();
            }
        }
    }
}

/// Mounted archives, name lookup and file opening
///
/// Cheap to clone; clones share the same archives. Open cursors keep the
/// registry's internals alive until they close.
#[derive(Clone)]
pub struct ArchiveRegistry {
    inner: Arc<RegistryInner>,
}

impl ArchiveRegistry {
    /// Create an empty registry reading through `device`.
    pub fn new(
        config: RegistryConfig,
        device: Arc<dyn BlockDevice>,
        notifier: Arc<dyn RecoveryNotifier>,
    ) -> Result<Self> {
        config.validate()?;
        let state = RegistryState {
            slots: (0..config.max_archives).map(|_| ArchiveSlot::default()).collect(),
            current: 0,
            most_recent: None,
            pool: OpenFilePool::new(config.max_open_files),
        };
        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                device,
                notifier,
                state: Mutex::new(state),
            }),
        })
    }

    /// Registry limits
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Mount the archive at `path` into the first free slot.
    ///
    /// On any failure the slot is released again. The mounted archive
    /// becomes the first one searched by the next lookup.
    pub fn mount<P: AsRef<Path>>(&self, path: P, options: MountOptions) -> Result<ArchiveId> {
        let path = path.as_ref();
        let id = {
            let mut state = self.inner.state.lock();
            let (index, slot) = state
                .slots
                .iter_mut()
                .enumerate()
                .find(|(_, slot)| matches!(slot.state, SlotState::Free))
                .ok_or_else(|| {
                    StorageError::CapacityExceeded(format!(
                        "all {} archive slots are in use",
                        self.inner.config.max_archives
                    ))
                })?;
            slot.generation = slot.generation.wrapping_add(1);
            slot.state = SlotState::Mounting;
            ArchiveId {
                slot: index as u32,
                generation: slot.generation,
            }
        };

        let mounted = ArchiveHandle::populate(
            id,
            path,
            &options,
            Arc::clone(&self.inner.device),
            Arc::clone(&self.inner.notifier),
            self.inner.config.retry,
        )
        .and_then(|handle| match handle.start() {
            Ok(()) => Ok(handle),
            Err(e) => {
                handle.teardown();
                Err(e)
            }
        });

        let mut state = self.inner.state.lock();
        match mounted {
            Ok(handle) => {
                info!(
                    "mounted {} as archive {id} ({} entries)",
                    path.display(),
                    handle.info().entry_count
                );
                state.slots[id.slot()].state = SlotState::Mounted(Arc::new(handle));
                state.current = id.slot();
                state.most_recent = Some(id);
                Ok(id)
            }
            Err(e) => {
                warn!("mount of {} failed: {e}", path.display());
                state.slots[id.slot()].state = SlotState::Free;
                Err(e)
            }
        }
    }

    /// Unmount an archive.
    ///
    /// With cursors still open the archive is only flagged: lookups skip it
    /// and the last cursor to close tears it down and frees the slot.
    pub fn unmount(&self, id: ArchiveId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let handle = Arc::clone(state.live(id)?);
        state.forget(id);

        if !handle.flag_for_deletion() {
            debug!(
                "archive {id} has {} open files, deferring unmount",
                handle.info().open_files
            );
            return Ok(());
        }
        state.slots[id.slot()].state = SlotState::Free;
        drop(state);
        handle.teardown();
        info!("unmounted archive {id}");
        Ok(())
    }

    /// Unmount the archive mounted last, if it is still mounted.
    pub fn unmount_most_recent(&self) -> Result<Option<ArchiveId>> {
        let most_recent = self.inner.state.lock().most_recent;
        match most_recent {
            Some(id) => self.unmount(id).map(|()| Some(id)),
            None => Ok(None),
        }
    }

    /// Open `name` in the first archive that has it.
    pub fn open(&self, name: &str) -> Result<FileCursor> {
        self.open_hash(NameHash::of(name)).map_err(|e| match e {
            StorageError::NotFound(_) => StorageError::NotFound(name.to_string()),
            other => other,
        })
    }

    /// Open the entry with `hash` in the first archive that has it.
    pub fn open_hash(&self, hash: NameHash) -> Result<FileCursor> {
        let mut state = self.inner.state.lock();
        let (slot, handle, index) = state
            .search(hash)
            .ok_or_else(|| StorageError::NotFound(hash.to_string()))?;
        state.current = slot;
        self.checkout(&mut state, handle, index)
    }

    /// Open `name` in one specific archive.
    pub fn open_in(&self, id: ArchiveId, name: &str) -> Result<FileCursor> {
        let mut state = self.inner.state.lock();
        let handle = Arc::clone(state.live(id)?);
        let index = handle
            .find(NameHash::of(name))
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        self.checkout(&mut state, handle, index)
    }

    fn checkout(
        &self,
        state: &mut RegistryState,
        handle: Arc<ArchiveHandle>,
        index: usize,
    ) -> Result<FileCursor> {
        let entry = handle
            .entry(index)
            .ok_or_else(|| StorageError::NotFound(format!("entry {index}")))?;
        let preloaded = handle
            .metadata(index)
            .is_some_and(|metadata| metadata.preloaded);
        let (lease, scratch) = state.pool.acquire().ok_or_else(|| {
            StorageError::CapacityExceeded(format!(
                "all {} open-file slots are in use",
                state.pool.capacity()
            ))
        })?;
        handle.retain();
        debug!(
            "opened {} in archive {} ({} of {} cursors)",
            entry.name_hash,
            handle.id(),
            state.pool.in_use(),
            state.pool.capacity()
        );
        Ok(FileCursor::new(
            Arc::clone(&self.inner),
            handle,
            entry,
            preloaded,
            lease,
            scratch,
        ))
    }

    /// Look up `name` without opening it.
    pub fn stat(&self, name: &str) -> Result<EntryMetadata> {
        let state = self.inner.state.lock();
        state
            .search(NameHash::of(name))
            .and_then(|(_, handle, index)| handle.metadata(index))
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    /// Look up `name` in one specific archive.
    pub fn stat_in(&self, id: ArchiveId, name: &str) -> Result<EntryMetadata> {
        let state = self.inner.state.lock();
        let handle = state.live(id)?;
        handle
            .find(NameHash::of(name))
            .and_then(|index| handle.metadata(index))
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    /// Summary of a mounted archive
    pub fn info(&self, id: ArchiveId) -> Result<ArchiveInfo> {
        let state = self.inner.state.lock();
        state.live(id).map(|handle| handle.info())
    }

    /// Ring counters of a mounted archive
    pub fn stats(&self, id: ArchiveId) -> Result<RingStatsSnapshot> {
        let state = self.inner.state.lock();
        state.live(id).map(|handle| handle.stats())
    }

    /// Every mounted archive, including those pending unmount, in slot order
    pub fn mounted(&self) -> Vec<ArchiveInfo> {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .filter_map(ArchiveSlot::handle)
            .map(|handle| handle.info())
            .collect()
    }

    /// Archive mounted last, while it stays mounted
    pub fn most_recent(&self) -> Option<ArchiveId> {
        self.inner.state.lock().most_recent
    }

    /// Cursors currently open across all archives
    pub fn open_files(&self) -> usize {
        self.inner.state.lock().pool.in_use()
    }
}

impl fmt::Debug for ArchiveRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ArchiveRegistry")
            .field("config", &self.inner.config)
            .field(
                "mounted",
                &state.slots.iter().filter(|s| s.handle().is_some()).count(),
            )
            .field("open_files", &state.pool.in_use())
            .finish()
    }
}
