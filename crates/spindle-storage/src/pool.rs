//! Fixed arena of open-file slots
//!
//! Each slot owns the decode state a cursor needs (inflate context and an
//! output block), allocated on first use and reused by every later cursor
//! that lands in the slot. Free slots sit on an index stack, so acquire
//! and release are O(1). Callers serialize access under the registry lock.

use crate::codec::StreamDecoder;

/// Size of the decoded block a cursor retains for short backward seeks
pub(crate) const DECODE_SCRATCH_SIZE: usize = 16 * 1024;

/// Decode state lent to one open cursor
pub(crate) struct CursorScratch {
    pub(crate) decoder: StreamDecoder,
    pub(crate) output: Box<[u8]>,
}

impl CursorScratch {
    fn new() -> Self {
        Self {
            decoder: StreamDecoder::new(),
            output: vec![0u8; DECODE_SCRATCH_SIZE].into_boxed_slice(),
        }
    }
}

/// Proof of a slot checkout; stale once the slot is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolLease {
    slot: u32,
    generation: u32,
}

#[derive(Default)]
struct PoolSlot {
    generation: u32,
    in_use: bool,
    scratch: Option<Box<CursorScratch>>,
}

pub(crate) struct OpenFilePool {
    slots: Vec<PoolSlot>,
    free: Vec<u32>,
}

impl OpenFilePool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| PoolSlot::default()).collect(),
            free: (0..capacity as u32).rev().collect(),
        }
    }

    /// Check out a free slot and its reset decode state.
    pub(crate) fn acquire(&mut self) -> Option<(PoolLease, Box<CursorScratch>)> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.in_use = true;
        let mut scratch = slot
            .scratch
            .take()
            .unwrap_or_else(|| Box::new(CursorScratch::new()));
        scratch.decoder.reset();
        Some((
            PoolLease {
                slot: index,
                generation: slot.generation,
            },
            scratch,
        ))
    }

    /// Return a slot; `false` if the lease was already released.
    pub(crate) fn release(&mut self, lease: PoolLease, scratch: Box<CursorScratch>) -> bool {
        let Some(slot) = self.slots.get_mut(lease.slot as usize) else {
            return false;
        };
        if !slot.in_use || slot.generation != lease.generation {
            return false;
        }
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.scratch = Some(scratch);
        self.free.push(lease.slot);
        true
    }

    pub(crate) fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_and_release() {
        let mut pool = OpenFilePool::new(2);
        let a = pool.acquire().expect("first slot");
        let b = pool.acquire().expect("second slot");
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_use(), 2);

        assert!(pool.release(a.0, a.1));
        assert_eq!(pool.in_use(), 1);
        assert!(pool.acquire().is_some());
        assert!(pool.release(b.0, b.1));
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_stale_lease_is_rejected() {
        let mut pool = OpenFilePool::new(1);
        let (lease, scratch) = pool.acquire().expect("slot");
        assert!(pool.release(lease, scratch));

        let (fresh, scratch) = pool.acquire().expect("slot again");
        assert_ne!(lease, fresh);
        assert!(!pool.release(lease, Box::new(CursorScratch::new())));
        assert_eq!(pool.in_use(), 1);
        assert!(pool.release(fresh, scratch));
    }

    #[test]
    fn test_scratch_is_reused() {
        let mut pool = OpenFilePool::new(1);
        let (lease, scratch) = pool.acquire().expect("slot");
        let first = scratch.output.as_ptr();
        assert!(pool.release(lease, scratch));

        let (_, scratch) = pool.acquire().expect("slot again");
        assert_eq!(scratch.output.as_ptr(), first);
        assert_eq!(scratch.output.len(), DECODE_SCRATCH_SIZE);
    }
}
