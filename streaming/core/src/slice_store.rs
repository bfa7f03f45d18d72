// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use streaming_config::{SequenceNumber, Timestamp, INITIAL_SEQUENCE_NUMBER};
use tracing::trace;

/// Window shape. Tumbling windows are sliding windows with `slide == size`.
///
/// Event time is 1-based (timestamp 0 is the minimum watermark), so slice
/// and window borders live on a grid anchored at 1: a window covers
/// `[k * slide + 1, k * slide + size + 1)`. A watermark `T` means every
/// record with `ts <= T` has been delivered, so a window is complete once
/// `window_end - 1 <= T`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowDefinition {
    size: u64,
    slide: u64,
}

impl WindowDefinition {
    pub fn tumbling(size: u64) -> Self {
        Self::sliding(size, size)
    }

    pub fn sliding(size: u64, slide: u64) -> Self {
        assert!(size > 0, "window size must be greater than 0");
        assert!(slide > 0, "window slide must be greater than 0");
        Self { size, slide }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn slide(&self) -> u64 {
        self.slide
    }

    /// Start of the unique slice covering `ts`: the closer of the previous
    /// slide border and the previous window border.
    pub fn slice_start_for(&self, ts: Timestamp) -> Timestamp {
        debug_assert!(ts >= 1, "event time is 1-based");
        let grid = ts - 1;
        let prev_slide_start = grid - grid % self.slide;
        let prev_window_start = if grid < self.size {
            prev_slide_start
        } else {
            grid - (grid - self.size) % self.slide
        };
        prev_slide_start.max(prev_window_start) + 1
    }

    /// End of the unique slice covering `ts`.
    pub fn slice_end_for(&self, ts: Timestamp) -> Timestamp {
        debug_assert!(ts >= 1, "event time is 1-based");
        let grid = ts - 1;
        let next_slide_end = grid + self.slide - grid % self.slide;
        let next_window_end = if grid < self.size {
            next_slide_end
        } else {
            grid + self.slide - (grid - self.size) % self.slide
        };
        next_slide_end.min(next_window_end) + 1
    }

    /// All windows containing the slice `[slice_start, slice_end)`, in
    /// ascending window-end order.
    pub fn windows_covering(
        &self,
        slice_start: Timestamp,
        slice_end: Timestamp,
    ) -> Vec<WindowInfo> {
        let start_grid = slice_start - 1;
        let end_grid = slice_end - 1;
        let first = end_grid.saturating_sub(self.size).div_ceil(self.slide);
        let last = start_grid / self.slide;
        (first..=last)
            .map(|k| WindowInfo {
                window_start: k * self.slide + 1,
                window_end: k * self.slide + self.size + 1,
            })
            .collect()
    }

    /// Whether every record belonging to the window has been delivered at
    /// watermark `watermark`.
    pub fn is_window_complete(&self, window_end: Timestamp, watermark: Timestamp) -> bool {
        window_end - 1 <= watermark
    }

    /// End of the last window referencing a slice that starts at
    /// `slice_start`; once that window triggered, the slice is dead.
    fn last_window_end_for_slice(&self, slice_start: Timestamp) -> Timestamp {
        ((slice_start - 1) / self.slide) * self.slide + self.size + 1
    }
}

/// A derived window `[window_start, window_end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WindowInfo {
    pub window_start: Timestamp,
    pub window_end: Timestamp,
}

/// State held per slice interval; aggregation and join slices implement it.
pub trait WindowSlice: Send + Sync {
    fn slice_start(&self) -> Timestamp;
    fn slice_end(&self) -> Timestamp;

    fn covers(&self, ts: Timestamp) -> bool {
        self.slice_start() <= ts && ts < self.slice_end()
    }
}

/// Ordered list of slices for one windowed operator instance, created on
/// demand by timestamp and evicted once every window referencing them has
/// been triggered. Lookups take the read lock; creating and evicting slices
/// takes the write lock.
pub struct SliceStore<S> {
    definition: WindowDefinition,
    slices: RwLock<VecDeque<Arc<S>>>,
    last_watermark: AtomicU64,
}

impl<S: WindowSlice> SliceStore<S> {
    pub fn new(definition: WindowDefinition) -> Self {
        Self {
            definition,
            slices: RwLock::new(VecDeque::new()),
            last_watermark: AtomicU64::new(Timestamp::MIN),
        }
    }

    pub fn definition(&self) -> &WindowDefinition {
        &self.definition
    }

    /// Returns the unique slice covering `ts`, creating it at the correct
    /// position (prepend, insert, or append) if absent. `ts` must not lie
    /// below the last watermark; out-of-order records below it are discarded
    /// upstream.
    pub fn find_slice_by_ts(
        &self,
        ts: Timestamp,
        create: impl FnOnce(Timestamp, Timestamp) -> S,
    ) -> Arc<S> {
        debug_assert!(
            ts > self.last_watermark.load(Ordering::Acquire)
                || self.last_watermark.load(Ordering::Acquire) == 0,
            "slice lookup below the watermark"
        );
        {
            let slices = self.slices.read();
            if let Some(slice) = Self::covering(&slices, ts) {
                return slice;
            }
        }
        let mut slices = self.slices.write();
        // Another thread may have created the slice while we upgraded.
        if let Some(slice) = Self::covering(&slices, ts) {
            return slice;
        }
        let start = self.definition.slice_start_for(ts);
        let end = self.definition.slice_end_for(ts);
        let slice = Arc::new(create(start, end));
        trace!("Created slice {start}-{end}");
        let position = slices.partition_point(|s| s.slice_start() < start);
        slices.insert(position, slice.clone());
        slice
    }

    fn covering(slices: &VecDeque<Arc<S>>, ts: Timestamp) -> Option<Arc<S>> {
        // Recent slices are the common case; scan from the back.
        slices
            .iter()
            .rev()
            .take_while(|slice| slice.slice_end() > ts)
            .find(|slice| slice.covers(ts))
            .cloned()
    }

    /// Slices fully contained in `[start, end)`, in ascending order.
    pub fn collect_range(&self, start: Timestamp, end: Timestamp) -> Vec<Arc<S>> {
        self.slices
            .read()
            .iter()
            .filter(|slice| slice.slice_start() >= start && slice.slice_end() <= end)
            .cloned()
            .collect()
    }

    /// Drops front slices whose interval ends at or before `ts`. Returns the
    /// number of slices removed.
    pub fn remove_slices_until_ts(&self, ts: Timestamp) -> usize {
        let mut slices = self.slices.write();
        let mut removed = 0;
        while slices
            .front()
            .is_some_and(|slice| slice.slice_end() <= ts)
        {
            slices.pop_front();
            removed += 1;
        }
        removed
    }

    /// Drops front slices once every window referencing them has been
    /// triggered (all their windows end at or before `triggered_end`).
    pub fn evict_probed(&self, triggered_end: Timestamp) -> usize {
        let mut slices = self.slices.write();
        let mut removed = 0;
        while slices.front().is_some_and(|slice| {
            self.definition
                .last_window_end_for_slice(slice.slice_start())
                <= triggered_end
        }) {
            slices.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn slice_count(&self) -> usize {
        self.slices.read().len()
    }

    pub fn all_slices(&self) -> Vec<Arc<S>> {
        self.slices.read().iter().cloned().collect()
    }

    pub fn last_watermark(&self) -> Timestamp {
        self.last_watermark.load(Ordering::Acquire)
    }

    pub fn set_last_watermark(&self, watermark: Timestamp) {
        self.last_watermark.fetch_max(watermark, Ordering::AcqRel);
    }
}

/// A window due for triggering, with its dense trigger sequence number and
/// the slices it aggregates over.
pub struct TriggerableWindow<S> {
    pub window: WindowInfo,
    pub sequence_number: SequenceNumber,
    pub slices: Vec<Arc<S>>,
}

/// Assigns dense trigger sequence numbers to completed windows, in ascending
/// window-end order, exactly once per window.
pub struct WindowTriggerManager {
    definition: WindowDefinition,
    state: Mutex<TriggerState>,
}

struct TriggerState {
    last_triggered_end: Timestamp,
    next_sequence: SequenceNumber,
}

impl WindowTriggerManager {
    pub fn new(definition: WindowDefinition) -> Self {
        Self {
            definition,
            state: Mutex::new(TriggerState {
                last_triggered_end: Timestamp::MIN,
                next_sequence: INITIAL_SEQUENCE_NUMBER,
            }),
        }
    }

    /// Collects every window that became complete at `watermark` and has not
    /// been triggered yet. Slices whose last window triggered are evicted
    /// from the store; the returned `Arc`s keep them alive for the probe.
    pub fn collect_triggerable<S: WindowSlice>(
        &self,
        store: &SliceStore<S>,
        watermark: Timestamp,
    ) -> Vec<TriggerableWindow<S>> {
        let mut state = self.state.lock();
        let slices = store.all_slices();

        let candidates: Vec<WindowInfo> = slices
            .iter()
            .flat_map(|slice| {
                self.definition
                    .windows_covering(slice.slice_start(), slice.slice_end())
            })
            .filter(|window| {
                window.window_end > state.last_triggered_end
                    && self
                        .definition
                        .is_window_complete(window.window_end, watermark)
            })
            .sorted_by_key(|window| window.window_end)
            .dedup()
            .collect();

        let mut triggerable = Vec::with_capacity(candidates.len());
        for window in candidates {
            let covering = store.collect_range(window.window_start, window.window_end);
            let sequence_number = state.next_sequence;
            state.next_sequence += 1;
            state.last_triggered_end = window.window_end;
            triggerable.push(TriggerableWindow {
                window,
                sequence_number,
                slices: covering,
            });
        }
        if !triggerable.is_empty() {
            store.evict_probed(state.last_triggered_end);
            store.set_last_watermark(watermark);
        }
        triggerable
    }
}
