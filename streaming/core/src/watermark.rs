// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use streaming_config::{OriginId, SequenceNumber, Timestamp, INITIAL_SEQUENCE_NUMBER};

/// Tracks one watermark per origin and derives the effective global
/// watermark as the minimum across all origins that have not reached their
/// end of stream.
///
/// Watermark updates carry the sequence number of the buffer they were
/// stamped on and are applied in sequence order per origin; updates for
/// not-yet-dense sequence numbers are parked until the gap closes. This is
/// what makes the global watermark non-decreasing even when buffers of one
/// origin are processed out of order by the worker pool.
pub struct MultiOriginWatermarkProcessor {
    origins: Mutex<BTreeMap<OriginId, OriginState>>,
    /// Cached global watermark for lock-free reads.
    global: AtomicU64,
}

struct OriginState {
    current_watermark: Timestamp,
    next_sequence: SequenceNumber,
    pending: BTreeMap<SequenceNumber, Timestamp>,
    terminated: bool,
}

impl OriginState {
    fn new() -> Self {
        Self {
            current_watermark: Timestamp::MIN,
            next_sequence: INITIAL_SEQUENCE_NUMBER,
            pending: BTreeMap::new(),
            terminated: false,
        }
    }
}

impl MultiOriginWatermarkProcessor {
    pub fn new(origins: impl IntoIterator<Item = OriginId>) -> Self {
        let origins: BTreeMap<_, _> = origins
            .into_iter()
            .map(|origin| (origin, OriginState::new()))
            .collect();
        assert!(!origins.is_empty(), "at least one origin is required");
        Self {
            origins: Mutex::new(origins),
            global: AtomicU64::new(Timestamp::MIN),
        }
    }

    /// Applies a watermark update for `(origin, sequence_number)` and returns
    /// the resulting global watermark.
    pub fn update_watermark(
        &self,
        origin: OriginId,
        sequence_number: SequenceNumber,
        watermark: Timestamp,
    ) -> Timestamp {
        let mut origins = self.origins.lock();
        let state = origins
            .get_mut(&origin)
            .unwrap_or_else(|| panic!("update for unknown origin {origin}"));
        state.pending.insert(sequence_number, watermark);
        while let Some(next) = state.pending.remove(&state.next_sequence) {
            state.current_watermark = state.current_watermark.max(next);
            state.next_sequence += 1;
        }
        self.refresh_global(&origins)
    }

    /// Retires an origin after its end of stream; the global watermark skips
    /// retired origins from then on.
    pub fn mark_origin_terminated(&self, origin: OriginId) -> Timestamp {
        let mut origins = self.origins.lock();
        if let Some(state) = origins.get_mut(&origin) {
            state.terminated = true;
        }
        self.refresh_global(&origins)
    }

    /// The effective global watermark; `Timestamp::MAX` once every origin is
    /// retired.
    pub fn current_watermark(&self) -> Timestamp {
        self.global.load(Ordering::Acquire)
    }

    /// Whether the global watermark has reached or passed `timestamp`.
    pub fn has_advanced_past(&self, timestamp: Timestamp) -> bool {
        self.current_watermark() >= timestamp
    }

    /// Whether every origin has been retired.
    pub fn all_terminated(&self) -> bool {
        self.origins.lock().values().all(|state| state.terminated)
    }

    /// Highest per-origin watermark observed, ignoring retirement. This is
    /// the flush boundary once all origins reached their end of stream:
    /// windows ending beyond it never received their full input.
    pub fn max_origin_watermark(&self) -> Timestamp {
        self.origins
            .lock()
            .values()
            .map(|state| state.current_watermark)
            .max()
            .unwrap_or(Timestamp::MIN)
    }

    fn refresh_global(&self, origins: &BTreeMap<OriginId, OriginState>) -> Timestamp {
        let global = origins
            .values()
            .filter(|state| !state.terminated)
            .map(|state| state.current_watermark)
            .min()
            .unwrap_or(Timestamp::MAX);
        // Never regress: a later retirement can only raise the minimum.
        self.global.fetch_max(global, Ordering::AcqRel);
        self.global.load(Ordering::Acquire)
    }
}
