// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// Event time in milliseconds since an arbitrary, per-deployment epoch.
pub type Timestamp = u64;

/// Sequence numbers are dense per origin and start at [`INITIAL_SEQUENCE_NUMBER`].
pub type SequenceNumber = u64;

/// Chunk numbers are dense per `(origin, sequence)` and start at [`INITIAL_CHUNK_NUMBER`].
pub type ChunkNumber = u64;

/// Index of a worker thread in the worker pool, between 0 (inclusive) and the
/// configured number of worker threads (exclusive).
pub type WorkerId = u32;

pub const INITIAL_SEQUENCE_NUMBER: SequenceNumber = 1;
pub const INITIAL_CHUNK_NUMBER: ChunkNumber = 1;

/// A logical data source identity carried with every buffer for ordering.
/// Origin 0 is reserved as invalid.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OriginId(pub u64);

impl OriginId {
    pub const INVALID: OriginId = OriginId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{}", self.0)
    }
}

/// Identifies a query registered with the engine.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.0)
    }
}

/// Identifies an executable pipeline within a query plan. Pipeline ids double
/// as output origin ids for buffers the pipeline emits.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PipelineId(pub u64);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// The sequence identity of one emitted unit, possibly split across buffers.
///
/// For each origin, sequence numbers start at 1 and are dense. For each
/// `(origin, sequence)`, chunk numbers are dense from 1 and exactly one chunk
/// carries `last_chunk = true`; its chunk number equals the total chunk count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceData {
    pub sequence_number: SequenceNumber,
    pub chunk_number: ChunkNumber,
    pub last_chunk: bool,
}

impl SequenceData {
    pub fn new(sequence_number: SequenceNumber, chunk_number: ChunkNumber, last_chunk: bool) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }

    /// Identity for a unit that is not split: a single chunk that is also the last.
    pub fn unchunked(sequence_number: SequenceNumber) -> Self {
        Self::new(sequence_number, INITIAL_CHUNK_NUMBER, true)
    }
}

impl fmt::Display for SequenceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq {} chunk {}{}",
            self.sequence_number,
            self.chunk_number,
            if self.last_chunk { " (last)" } else { "" }
        )
    }
}
