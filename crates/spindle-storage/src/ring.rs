//! Read-ahead ring buffer
//!
//! Every archive streams through one fixed-capacity ring. Positions are
//! absolute archive offsets. The ring holds the valid window
//! `[valid_start, current_pos)`: before the first wrap of a fill epoch that
//! is `[buffer_start_pos, current_pos)`, afterwards it is the last
//! `capacity` bytes. `buffer_end_pos` records where the previous lap
//! stopped, so a position maps to a physical offset in either lap.
//!
//! # Locks
//!
//! - the content lock guards the bytes, the write cursor and the device
//!   session; every fill happens under it, and readers copy or decode
//!   from the ring while holding it
//! - the consume lock serializes consumers' read-and-advance; the mark it
//!   protects is atomic so the producer can read it without the lock
//! - the control lock is a leaf paired with the producer's condvar
//!
//! Order: consume, content, control. The wrap-boundary positions are
//! atomics written only under the content lock.
//!
//! # Producer invariant
//!
//! Writing `n` bytes at `current_pos` destroys the bytes one capacity
//! earlier. The producer writes only if all of them lie below
//! `max(valid_start, next_consume_pos - safety_margin)` (see
//! [`RingShared::has_room`]), so the protected window
//! `[next_consume_pos - safety_margin, current_pos)` is never overwritten.

use crate::config::RingGeometry;
use crate::recovery::MediaSession;
use crate::{Result, StorageError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Producer thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerPhase {
    /// Not started, or synchronous archive
    Idle,
    /// Reading chunks ahead of the consumers
    Filling,
    /// Parked until a consumer frees room or repositions the ring
    AwaitingConsumer,
    /// Archive torn down; the thread exits
    Deleted,
}

/// Result of one fill attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillOutcome {
    Filled(usize),
    NoRoom,
    EndOfData,
}

/// Counters for one ring
#[derive(Debug, Default)]
struct RingStats {
    device_reads: AtomicU64,
    bytes_filled: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    repositions: AtomicU64,
    wraps: AtomicU64,
    producer_wakes: AtomicU64,
}

/// Point-in-time copy of a ring's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingStatsSnapshot {
    /// Device reads issued by producer and consumers
    pub device_reads: u64,
    /// Bytes read from the device
    pub bytes_filled: u64,
    /// Consumer windows served from resident bytes
    pub hits: u64,
    /// Consumer windows that needed a synchronous fill
    pub misses: u64,
    /// Synchronous fills that moved the window elsewhere
    pub repositions: u64,
    /// Times the write cursor wrapped to the start of the storage
    pub wraps: u64,
    /// Times a consumer woke the parked producer
    pub producer_wakes: u64,
}

impl RingStats {
    fn snapshot(&self) -> RingStatsSnapshot {
        RingStatsSnapshot {
            device_reads: self.device_reads.load(Ordering::Relaxed),
            bytes_filled: self.bytes_filled.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            repositions: self.repositions.load(Ordering::Relaxed),
            wraps: self.wraps.load(Ordering::Relaxed),
            producer_wakes: self.producer_wakes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct RingPositions {
    buffer_start: AtomicU64,
    buffer_end: AtomicU64,
    current: AtomicU64,
    next_consume: AtomicU64,
}

struct RingContent {
    storage: Box<[u8]>,
    write_offset: usize,
    session: MediaSession,
}

struct RingShared {
    geometry: RingGeometry,
    data_end: u64,
    background: bool,
    content: Mutex<RingContent>,
    // Serializes read-and-advance; the mark itself lives in `positions`.
    consume: Mutex<()>,
    positions: RingPositions,
    control: Mutex<ProducerPhase>,
    wake: Condvar,
    // Set after a failed or short read; cleared by a successful consumer fill.
    stalled: AtomicBool,
    cancelled: Arc<AtomicBool>,
    stats: RingStats,
}

impl RingShared {
    fn capacity(&self) -> u64 {
        self.geometry.capacity as u64
    }

    fn valid_start(&self) -> u64 {
        let current = self.positions.current.load(Ordering::Acquire);
        if self.positions.buffer_end.load(Ordering::Acquire) > 0 {
            current.saturating_sub(self.capacity())
        } else {
            self.positions.buffer_start.load(Ordering::Acquire)
        }
    }

    /// Physical offset and contiguous resident length at `pos`.
    ///
    /// Callers hold the content lock.
    fn locate(&self, pos: u64) -> Option<(usize, usize)> {
        let current = self.positions.current.load(Ordering::Acquire);
        if pos < self.valid_start() || pos >= current {
            return None;
        }
        let end = self.positions.buffer_end.load(Ordering::Acquire);
        if end > 0 && pos < end {
            let back = (end - pos) as usize;
            Some((self.geometry.capacity - back, back))
        } else {
            let start = self.positions.buffer_start.load(Ordering::Acquire);
            Some(((pos - start) as usize, (current - pos) as usize))
        }
    }

    /// Whether `len` bytes can be written at `current_pos` without touching
    /// the protected window.
    fn has_room(&self, len: usize) -> bool {
        let current = self.positions.current.load(Ordering::Acquire);
        let mark = self.positions.next_consume.load(Ordering::Acquire);
        let floor = self
            .valid_start()
            .max(mark.saturating_sub(self.geometry.safety_margin as u64));
        current + len as u64 <= floor + self.capacity()
    }

    fn next_fill_len(&self) -> usize {
        let current = self.positions.current.load(Ordering::Acquire);
        let remaining = self.data_end.saturating_sub(current);
        usize::try_from(remaining).map_or(self.geometry.chunk, |r| r.min(self.geometry.chunk))
    }

    fn producer_can_progress(&self) -> bool {
        let len = self.next_fill_len();
        len > 0 && !self.stalled.load(Ordering::Acquire) && self.has_room(len)
    }

    /// Read the next chunk at `current_pos` into the write cursor.
    fn append_chunk(&self, content: &mut RingContent) -> Result<FillOutcome> {
        let current = self.positions.current.load(Ordering::Acquire);
        let len = self
            .next_fill_len()
            .min(self.geometry.capacity - content.write_offset);
        if len == 0 {
            return Ok(FillOutcome::EndOfData);
        }
        if !self.has_room(len) {
            return Ok(FillOutcome::NoRoom);
        }

        let offset = content.write_offset;
        let RingContent {
            storage, session, ..
        } = content;
        let read = session.read_at(current, &mut storage[offset..offset + len])?;
        self.stats.device_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_filled
            .fetch_add(read as u64, Ordering::Relaxed);

        let new_current = current + read as u64;
        content.write_offset += read;
        self.positions.current.store(new_current, Ordering::Release);
        if content.write_offset == self.geometry.capacity {
            content.write_offset = 0;
            self.positions.buffer_end.store(new_current, Ordering::Release);
            self.positions
                .buffer_start
                .store(new_current, Ordering::Release);
            self.stats.wraps.fetch_add(1, Ordering::Relaxed);
        }
        trace!("filled {read} bytes at {current}");

        if read < len {
            self.stalled.store(true, Ordering::Release);
            return Ok(FillOutcome::EndOfData);
        }
        Ok(FillOutcome::Filled(read))
    }

    /// Move the window to the block containing `pos` and fill one chunk.
    ///
    /// Starts a new fill epoch: the consume mark restarts at `pos`.
    fn reposition(&self, content: &mut RingContent, pos: u64) -> Result<()> {
        let aligned = pos - pos % self.geometry.block_size;
        let remaining = self.data_end.saturating_sub(aligned);
        let len = usize::try_from(remaining)
            .map_or(self.geometry.chunk, |r| r.min(self.geometry.chunk));
        debug!("repositioning ring to {aligned} for {pos}");

        let read = content
            .session
            .read_at(aligned, &mut content.storage[..len])?;
        self.stats.device_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_filled
            .fetch_add(read as u64, Ordering::Relaxed);
        self.stats.repositions.fetch_add(1, Ordering::Relaxed);

        content.write_offset = read;
        self.positions.buffer_end.store(0, Ordering::Release);
        self.positions.buffer_start.store(aligned, Ordering::Release);
        self.positions
            .current
            .store(aligned + read as u64, Ordering::Release);
        self.positions.next_consume.store(pos, Ordering::Release);
        self.stalled.store(read < len, Ordering::Release);
        Ok(())
    }

    /// Wake the producer if it is parked and has work to do.
    fn signal_producer(&self) {
        if !self.background {
            return;
        }
        let mut phase = self.control.lock();
        if *phase == ProducerPhase::AwaitingConsumer && self.producer_can_progress() {
            *phase = ProducerPhase::Filling;
            self.stats.producer_wakes.fetch_add(1, Ordering::Relaxed);
            self.wake.notify_one();
        }
    }
}

fn run_producer(shared: &RingShared) {
    loop {
        {
            let mut phase = shared.control.lock();
            loop {
                match *phase {
                    ProducerPhase::Deleted => return,
                    ProducerPhase::Filling => break,
                    ProducerPhase::Idle | ProducerPhase::AwaitingConsumer => {
                        shared.wake.wait(&mut phase);
                    }
                }
            }
        }

        let outcome = {
            let mut content = shared.content.lock();
            shared.append_chunk(&mut content)
        };
        match outcome {
            Ok(FillOutcome::Filled(_)) => continue,
            Ok(FillOutcome::NoRoom | FillOutcome::EndOfData) => {}
            Err(e) => {
                warn!("producer read failed, waiting for a consumer fill: {e}");
                shared.stalled.store(true, Ordering::Release);
            }
        }

        // Re-check under the control lock so a wake between the fill and
        // here is not lost.
        let mut phase = shared.control.lock();
        if *phase == ProducerPhase::Filling && !shared.producer_can_progress() {
            debug!("producer parked");
            *phase = ProducerPhase::AwaitingConsumer;
        }
    }
}

/// Ring buffer plus its optional producer thread
pub(crate) struct RingReadBuffer {
    shared: Arc<RingShared>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl RingReadBuffer {
    /// Ring over `[stream_start, data_end)` of the session's archive.
    pub(crate) fn new(
        session: MediaSession,
        geometry: RingGeometry,
        stream_start: u64,
        data_end: u64,
        background: bool,
    ) -> Self {
        let cancelled = session.cancel_flag();
        let positions = RingPositions::default();
        positions.buffer_start.store(stream_start, Ordering::Relaxed);
        positions.current.store(stream_start, Ordering::Relaxed);
        positions.next_consume.store(stream_start, Ordering::Relaxed);

        Self {
            shared: Arc::new(RingShared {
                geometry,
                data_end,
                background,
                content: Mutex::new(RingContent {
                    storage: vec![0u8; geometry.capacity].into_boxed_slice(),
                    write_offset: 0,
                    session,
                }),
                consume: Mutex::new(()),
                positions,
                control: Mutex::new(ProducerPhase::Idle),
                wake: Condvar::new(),
                stalled: AtomicBool::new(false),
                cancelled,
                stats: RingStats::default(),
            }),
            producer: Mutex::new(None),
        }
    }

    /// Spawn the producer thread for a background archive.
    pub(crate) fn start_producer(&self, name: String) -> Result<()> {
        if !self.shared.background {
            return Ok(());
        }
        *self.shared.control.lock() = ProducerPhase::Filling;
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || run_producer(&shared))
            .map_err(StorageError::Io)?;
        *self.producer.lock() = Some(handle);
        Ok(())
    }

    /// Take the consume lock for one read-and-advance operation.
    pub(crate) fn consumer(&self) -> ConsumerGuard<'_> {
        ConsumerGuard {
            ring: &self.shared,
            _consume: self.shared.consume.lock(),
        }
    }

    pub(crate) fn geometry(&self) -> RingGeometry {
        self.shared.geometry
    }

    pub(crate) fn is_background(&self) -> bool {
        self.shared.background
    }

    pub(crate) fn stats(&self) -> RingStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stop the producer, then release the storage and device handle.
    ///
    /// Cancels any media retry in progress so the join cannot hang.
    pub(crate) fn shutdown(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        {
            let mut phase = self.shared.control.lock();
            *phase = ProducerPhase::Deleted;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.producer.lock().take() {
            if handle.join().is_err() {
                warn!("producer thread panicked");
            }
        }
        let mut content = self.shared.content.lock();
        content.storage = Box::default();
        content.session.close();
    }
}

/// Holds the consume lock; all consumer access to the ring goes through it
pub(crate) struct ConsumerGuard<'a> {
    ring: &'a RingShared,
    _consume: MutexGuard<'a, ()>,
}

impl ConsumerGuard<'_> {
    /// Run `f` over the bytes resident contiguously at `pos`, at most `max`.
    ///
    /// A miss fills synchronously: sequential misses append at the write
    /// cursor, anything else repositions the window.
    pub(crate) fn with_window<R>(
        &mut self,
        pos: u64,
        max: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let ring = self.ring;
        let mut content = ring.content.lock();
        debug_assert!(!content.storage.is_empty(), "read from a torn-down archive");
        if content.storage.is_empty() {
            return Err(StorageError::Io(std::io::Error::other(
                "archive has been torn down",
            )));
        }

        let located = match ring.locate(pos) {
            Some(found) => {
                ring.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(found)
            }
            None => {
                ring.stats.misses.fetch_add(1, Ordering::Relaxed);
                let current = ring.positions.current.load(Ordering::Acquire);
                let appended = if pos == current {
                    Some(ring.append_chunk(&mut content)?)
                } else {
                    None
                };
                match appended {
                    Some(FillOutcome::Filled(_)) => ring.stalled.store(false, Ordering::Release),
                    Some(FillOutcome::EndOfData) => {}
                    Some(FillOutcome::NoRoom) | None => ring.reposition(&mut content, pos)?,
                }
                ring.locate(pos)
            }
        };

        let Some((offset, available)) = located else {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("archive ends before offset {pos}"),
            )));
        };
        let len = available.min(max);
        let result = f(&content.storage[offset..offset + len]);
        drop(content);
        ring.signal_producer();
        Ok(result)
    }

    /// Record that every byte before `pos` has been consumed.
    pub(crate) fn advance(&mut self, pos: u64) {
        let mark = &self.ring.positions.next_consume;
        if pos > mark.load(Ordering::Acquire) {
            mark.store(pos, Ordering::Release);
            self.ring.signal_producer();
        }
    }
}
