// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::buffer::TupleBuffer;

/// Packed per-entry state:
/// `[0] has_tuple_delimiter | [1..33] aba generation | [33] used_leading |
/// [34] used_trailing | [35] claimed_spanning_tuple`.
///
/// The ABA generation distinguishes reuses of the same ring slot; every
/// transition is CAS-guarded so concurrent workers processing neighboring
/// chunks agree on who consumes which buffer half.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Bitmap(u64);

const HAS_DELIMITER: u64 = 1;
const ABA_SHIFT: u32 = 1;
const ABA_MASK: u64 = 0xffff_ffff << ABA_SHIFT;
const USED_LEADING: u64 = 1 << 33;
const USED_TRAILING: u64 = 1 << 34;
const CLAIMED_SPANNING: u64 = 1 << 35;

impl Bitmap {
    fn new(aba: u32, has_delimiter: bool) -> Self {
        let mut bits = (u64::from(aba)) << ABA_SHIFT;
        if has_delimiter {
            bits |= HAS_DELIMITER;
        }
        Self(bits)
    }

    fn aba(self) -> u32 {
        ((self.0 & ABA_MASK) >> ABA_SHIFT) as u32
    }

    fn has_delimiter(self) -> bool {
        self.0 & HAS_DELIMITER != 0
    }

    fn used_leading(self) -> bool {
        self.0 & USED_LEADING != 0
    }

    fn used_trailing(self) -> bool {
        self.0 & USED_TRAILING != 0
    }

    fn claimed_spanning(self) -> bool {
        self.0 & CLAIMED_SPANNING != 0
    }
}

struct AtomicBitmapState {
    state: AtomicU64,
}

impl AtomicBitmapState {
    fn new() -> Self {
        // Generation 0 starts fully consumed so generation 1 can be staged.
        Self {
            state: AtomicU64::new(Bitmap::new(0, false).0 | USED_LEADING | USED_TRAILING),
        }
    }

    fn load(&self) -> Bitmap {
        Bitmap(self.state.load(Ordering::Acquire))
    }

    /// The previous generation's entry is gone once both its halves were
    /// consumed.
    fn is_used_up(&self, aba: u32) -> bool {
        let current = self.load();
        current.aba() == aba.wrapping_sub(1) && current.used_leading() && current.used_trailing()
    }

    /// Replaces the slot with a fresh entry for `aba` if the previous
    /// generation has been fully consumed.
    fn try_set(&self, aba: u32, has_delimiter: bool) -> bool {
        let current = self.load();
        if !(current.aba() == aba.wrapping_sub(1)
            && current.used_leading()
            && current.used_trailing())
        {
            return false;
        }
        self.state
            .compare_exchange(
                current.0,
                Bitmap::new(aba, has_delimiter).0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claims the spanning tuple of this entry exactly once per generation.
    fn try_claim_spanning_tuple(&self, aba: u32) -> bool {
        let mut current = self.load();
        while current.aba() == aba && !current.claimed_spanning() {
            let desired = Bitmap(current.0 | CLAIMED_SPANNING);
            match self.state.compare_exchange_weak(
                current.0,
                desired.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = Bitmap(actual),
            }
        }
        false
    }

    fn set_used_leading(&self) {
        self.state.fetch_or(USED_LEADING, Ordering::AcqRel);
    }

    fn set_used_trailing(&self) {
        self.state.fetch_or(USED_TRAILING, Ordering::AcqRel);
    }
}

/// A buffer staged in the ring together with the offsets of its first and
/// last tuple delimiter. For record-aligned layouts the delimiters coincide
/// with the buffer borders and the spanning tuple is empty.
#[derive(Clone)]
pub struct StagedBuffer {
    pub buffer: TupleBuffer,
    pub first_delimiter_offset: u32,
    pub last_delimiter_offset: u32,
}

struct Slot {
    state: AtomicBitmapState,
    staged: Mutex<Option<StagedBuffer>>,
}

/// Tracks, per sequence, which leading/trailing buffer halves of its chunks
/// have been consumed, and hands out the spanning tuple between two
/// neighboring chunks exactly once. Slots are reused ring-style; the ABA
/// generation in the bitmap guards against stale claims.
pub struct SequenceRingBuffer {
    slots: Vec<Slot>,
}

impl SequenceRingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be greater than 0");
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    state: AtomicBitmapState::new(),
                    staged: Mutex::new(None),
                })
                .collect(),
        }
    }

    fn slot(&self, index: u64) -> &Slot {
        &self.slots[(index as usize) % self.slots.len()]
    }

    fn generation(&self, index: u64) -> u32 {
        (index / self.slots.len() as u64) as u32 + 1
    }

    /// Stages the chunk at `index` with a tuple delimiter. Fails while the
    /// slot still holds an unconsumed entry of the previous generation.
    pub fn try_stage_with_delimiter(&self, index: u64, staged: StagedBuffer) -> bool {
        let slot = self.slot(index);
        let aba = self.generation(index);
        if !slot.state.is_used_up(aba) {
            return false;
        }
        *slot.staged.lock() = Some(staged);
        slot.state.try_set(aba, true)
    }

    /// Stages the chunk at `index` without a delimiter: both halves belong
    /// to spanning tuples of its neighbors.
    pub fn try_stage_without_delimiter(&self, index: u64, staged: StagedBuffer) -> bool {
        let slot = self.slot(index);
        let aba = self.generation(index);
        if !slot.state.is_used_up(aba) {
            return false;
        }
        *slot.staged.lock() = Some(staged);
        slot.state.try_set(aba, false)
    }

    /// Claims the spanning tuple that starts in chunk `index`, returning the
    /// staged trailing buffer. Succeeds at most once per staged entry,
    /// regardless of how many workers race on it.
    pub fn try_claim_spanning_tuple(&self, index: u64) -> Option<StagedBuffer> {
        let slot = self.slot(index);
        let aba = self.generation(index);
        if !slot.state.try_claim_spanning_tuple(aba) {
            return None;
        }
        let staged = slot.staged.lock().clone();
        slot.state.set_used_trailing();
        staged
    }

    /// Marks the leading half of chunk `index` consumed, releasing the slot
    /// for reuse once the trailing half is consumed too.
    pub fn mark_leading_consumed(&self, index: u64) {
        self.slot(index).state.set_used_leading();
    }

    /// Whether the chunk staged at `index` carries a tuple delimiter.
    pub fn has_delimiter(&self, index: u64) -> Option<bool> {
        let slot = self.slot(index);
        let current = slot.state.load();
        (current.aba() == self.generation(index)).then(|| current.has_delimiter())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::buffer_pool::{BufferManager, BufferProvider};
    use crate::context::Context;

    fn staged(manager: &BufferManager) -> StagedBuffer {
        StagedBuffer {
            buffer: manager.get_buffer_blocking(),
            first_delimiter_offset: 0,
            last_delimiter_offset: 0,
        }
    }

    #[test]
    fn staging_and_claiming_one_chunk() {
        let manager = BufferManager::new(Context::new_for_test()).unwrap();
        let ring = SequenceRingBuffer::new(8);

        assert!(ring.try_stage_with_delimiter(0, staged(&manager)));
        assert_eq!(ring.has_delimiter(0), Some(true));

        assert!(ring.try_claim_spanning_tuple(0).is_some());
        // The spanning tuple can be claimed exactly once.
        assert!(ring.try_claim_spanning_tuple(0).is_none());
    }

    #[test]
    fn slot_reuse_requires_consumed_predecessor() {
        let manager = BufferManager::new(Context::new_for_test()).unwrap();
        let ring = SequenceRingBuffer::new(2);

        assert!(ring.try_stage_with_delimiter(0, staged(&manager)));
        // Index 2 maps to the same slot and must wait for index 0.
        assert!(!ring.try_stage_with_delimiter(2, staged(&manager)));

        assert!(ring.try_claim_spanning_tuple(0).is_some());
        ring.mark_leading_consumed(0);
        assert!(ring.try_stage_with_delimiter(2, staged(&manager)));
    }

    #[test]
    fn spanning_tuple_is_claimed_exactly_once_under_races() {
        let manager = BufferManager::new(Context::new_for_test()).unwrap();
        for _ in 0..50 {
            let ring = Arc::new(SequenceRingBuffer::new(16));
            assert!(ring.try_stage_with_delimiter(3, staged(&manager)));

            let mut handles = Vec::new();
            for _ in 0..4 {
                let ring = ring.clone();
                handles.push(thread::spawn(move || {
                    u32::from(ring.try_claim_spanning_tuple(3).is_some())
                }));
            }
            let claims: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(claims, 1);
        }
    }

    #[test]
    fn chunks_without_delimiter_are_flagged() {
        let manager = BufferManager::new(Context::new_for_test()).unwrap();
        let ring = SequenceRingBuffer::new(4);
        assert!(ring.try_stage_without_delimiter(1, staged(&manager)));
        assert_eq!(ring.has_delimiter(1), Some(false));
        assert_eq!(ring.has_delimiter(2), None);
    }
}
