// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use streaming_config::{ChunkNumber, OriginId, SequenceData, SequenceNumber, Timestamp};

use crate::error::{EngineError, EngineResult};

/// Receives a segment back once the last reference to it is released.
pub(crate) trait BufferRecycler: Send + Sync {
    fn recycle(&self, segment: &Arc<Segment>);
}

/// A fixed-size byte region plus its control block.
///
/// The control block lives next to the payload for the whole lifetime of the
/// pool, so handles can be recreated from a segment at any time. Payload
/// bytes sit in an `UnsafeCell` because worker threads write them without a
/// lock; exclusivity is guaranteed by the reference-count protocol below.
pub(crate) struct Segment {
    /// Payload bytes.
    data: UnsafeCell<Box<[u8]>>,
    /// Live `TupleBuffer` handles. 0 while the segment sits in a free list.
    ref_count: AtomicU32,
    /// Where the segment goes on final release. `current` is swapped when a
    /// local pool takes over a pooled segment; `home` always points at the
    /// owning manager and catches releases that outlive a local pool.
    recycler: Mutex<RecyclerSlot>,
    /// Index of this segment in its owning pool; `u32::MAX` for unpooled.
    pub(crate) index: u32,
    /// Buffers transported inside this one; released together with it.
    children: Mutex<Vec<TupleBuffer>>,

    number_of_tuples: AtomicU64,
    origin_id: AtomicU64,
    sequence_number: AtomicU64,
    chunk_number: AtomicU64,
    last_chunk: AtomicBool,
    watermark: AtomicU64,
    creation_timestamp: AtomicU64,
}

// SAFETY: the payload `UnsafeCell` is only written through `as_mut_slice`,
// which requires a `&mut TupleBuffer` whose segment refcount is 1. A reader
// necessarily holds another handle (refcount >= 2), so a writer can never
// exist concurrently with any other access.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

pub(crate) const UNPOOLED_SEGMENT_INDEX: u32 = u32::MAX;

impl Segment {
    pub(crate) fn new(size: usize, index: u32) -> EngineResult<Self> {
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(size)
            .map_err(|_| EngineError::CannotAllocateBuffer(format!("segment of {size} bytes")))?;
        payload.resize(size, 0u8);
        Ok(Self {
            data: UnsafeCell::new(payload.into_boxed_slice()),
            ref_count: AtomicU32::new(0),
            recycler: Mutex::new(RecyclerSlot::empty()),
            index,
            children: Mutex::new(Vec::new()),
            number_of_tuples: AtomicU64::new(0),
            origin_id: AtomicU64::new(0),
            sequence_number: AtomicU64::new(0),
            chunk_number: AtomicU64::new(0),
            last_chunk: AtomicBool::new(false),
            watermark: AtomicU64::new(0),
            creation_timestamp: AtomicU64::new(0),
        })
    }

    /// Sets the pool that currently owns the segment.
    pub(crate) fn set_recycler(&self, recycler: Weak<dyn BufferRecycler>) {
        self.recycler.lock().current = recycler;
    }

    /// Sets both the current and the fallback recycler; called once when the
    /// owning manager creates the segment.
    pub(crate) fn set_home_recycler(&self, recycler: Weak<dyn BufferRecycler>) {
        let mut slot = self.recycler.lock();
        slot.current = recycler.clone();
        slot.home = recycler;
    }

    /// Turns a free segment (refcount 0) into a live handle.
    pub(crate) fn into_handle(self: Arc<Self>) -> TupleBuffer {
        let _previous = self.ref_count.swap(1, Ordering::AcqRel);
        debug_assert_eq!(_previous, 0, "segment handed out while still referenced");
        TupleBuffer { segment: self }
    }

    fn clear_metadata(&self) {
        self.number_of_tuples.store(0, Ordering::Relaxed);
        self.origin_id.store(0, Ordering::Relaxed);
        self.sequence_number.store(0, Ordering::Relaxed);
        self.chunk_number.store(0, Ordering::Relaxed);
        self.last_chunk.store(false, Ordering::Relaxed);
        self.watermark.store(0, Ordering::Relaxed);
        self.creation_timestamp.store(0, Ordering::Relaxed);
    }

    /// Final-release path: drop children, reset the control block and hand
    /// the segment back to its recycler. Runs without external locks held.
    fn release(self: &Arc<Self>) {
        self.children.lock().clear();
        self.clear_metadata();
        let (current, home) = {
            let slot = self.recycler.lock();
            (slot.current.upgrade(), slot.home.upgrade())
        };
        // Only segments created in isolation (tests) lack a recycler.
        if let Some(recycler) = current.or(home) {
            recycler.recycle(self);
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        // SAFETY: the box itself is never reallocated, so reading its length
        // is race-free even while another thread writes payload bytes.
        unsafe { (&*self.data.get()).len() }
    }
}

struct RecyclerSlot {
    current: Weak<dyn BufferRecycler>,
    home: Weak<dyn BufferRecycler>,
}

impl RecyclerSlot {
    fn empty() -> Self {
        struct Detached;
        impl BufferRecycler for Detached {
            fn recycle(&self, _segment: &Arc<Segment>) {}
        }
        let detached: Weak<dyn BufferRecycler> = Weak::<Detached>::new();
        Self {
            current: detached.clone(),
            home: detached,
        }
    }
}

/// Reference-counted handle to a pooled or unpooled buffer segment.
///
/// Cloning shares the segment; the last handle to drop recycles it. Writes
/// to the payload are only legal while the handle is exclusive, which the
/// `&mut self` receiver together with a refcount of 1 guarantees.
pub struct TupleBuffer {
    segment: Arc<Segment>,
}

impl TupleBuffer {
    /// Number of payload bytes.
    pub fn capacity(&self) -> usize {
        self.segment.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: see the safety note on `Segment`; no exclusive writer can
        // coexist with this shared reference.
        unsafe { &*self.segment.data.get() }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert_eq!(
            self.segment.ref_count.load(Ordering::Acquire),
            1,
            "mutating a shared buffer"
        );
        // SAFETY: refcount 1 plus the `&mut self` receiver make this handle
        // the only path to the payload.
        unsafe { &mut *self.segment.data.get() }
    }

    /// Attaches `child` to this buffer; the child is kept alive until this
    /// buffer is fully released. Returns the index to load it back.
    pub fn attach_child(&self, child: TupleBuffer) -> u32 {
        debug_assert!(
            !child.contains_in_child_tree(&self.segment),
            "attaching a buffer to one of its descendants"
        );
        debug_assert!(
            !Arc::ptr_eq(&child.segment, &self.segment),
            "attaching a buffer to itself"
        );
        let mut children = self.segment.children.lock();
        children.push(child);
        (children.len() - 1) as u32
    }

    pub fn child_count(&self) -> usize {
        self.segment.children.lock().len()
    }

    pub fn load_child(&self, index: u32) -> EngineResult<TupleBuffer> {
        self.segment
            .children
            .lock()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| {
                EngineError::RuntimeFailure(format!("no child buffer at index {index}"))
            })
    }

    fn contains_in_child_tree(&self, needle: &Arc<Segment>) -> bool {
        if Arc::ptr_eq(&self.segment, needle) {
            return true;
        }
        let children = self.segment.children.lock();
        children
            .iter()
            .any(|child| child.contains_in_child_tree(needle))
    }

    pub fn number_of_tuples(&self) -> u64 {
        self.segment.number_of_tuples.load(Ordering::Relaxed)
    }

    pub fn set_number_of_tuples(&self, tuples: u64) {
        self.segment.number_of_tuples.store(tuples, Ordering::Relaxed);
    }

    pub fn origin_id(&self) -> OriginId {
        OriginId(self.segment.origin_id.load(Ordering::Relaxed))
    }

    pub fn set_origin_id(&self, origin: OriginId) {
        self.segment.origin_id.store(origin.0, Ordering::Relaxed);
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.segment.sequence_number.load(Ordering::Relaxed)
    }

    pub fn chunk_number(&self) -> ChunkNumber {
        self.segment.chunk_number.load(Ordering::Relaxed)
    }

    pub fn is_last_chunk(&self) -> bool {
        self.segment.last_chunk.load(Ordering::Relaxed)
    }

    pub fn sequence_data(&self) -> SequenceData {
        SequenceData::new(
            self.sequence_number(),
            self.chunk_number(),
            self.is_last_chunk(),
        )
    }

    pub fn set_sequence_data(&self, sequence_data: SequenceData) {
        self.segment
            .sequence_number
            .store(sequence_data.sequence_number, Ordering::Relaxed);
        self.segment
            .chunk_number
            .store(sequence_data.chunk_number, Ordering::Relaxed);
        self.segment
            .last_chunk
            .store(sequence_data.last_chunk, Ordering::Relaxed);
    }

    pub fn watermark(&self) -> Timestamp {
        self.segment.watermark.load(Ordering::Relaxed)
    }

    pub fn set_watermark(&self, watermark: Timestamp) {
        self.segment.watermark.store(watermark, Ordering::Relaxed);
    }

    pub fn creation_timestamp(&self) -> Timestamp {
        self.segment.creation_timestamp.load(Ordering::Relaxed)
    }

    pub fn set_creation_timestamp(&self, timestamp: Timestamp) {
        self.segment
            .creation_timestamp
            .store(timestamp, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn reference_count(&self) -> u32 {
        self.segment.ref_count.load(Ordering::Acquire)
    }
}

impl Clone for TupleBuffer {
    fn clone(&self) -> Self {
        let _previous = self.segment.ref_count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(_previous > 0, "cloning a released buffer");
        Self {
            segment: self.segment.clone(),
        }
    }
}

impl Drop for TupleBuffer {
    fn drop(&mut self) {
        if self.segment.ref_count.fetch_sub(1, Ordering::Release) == 1 {
            // Pair with the Release above so payload writes from other
            // threads are visible before the segment is reused.
            fence(Ordering::Acquire);
            self.segment.release();
        }
    }
}

impl fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("origin", &self.origin_id())
            .field("sequence", &self.sequence_number())
            .field("chunk", &self.chunk_number())
            .field("last_chunk", &self.is_last_chunk())
            .field("tuples", &self.number_of_tuples())
            .field("watermark", &self.watermark())
            .finish()
    }
}
