// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use streaming_config::{ChunkNumber, OriginId, SequenceNumber, INITIAL_SEQUENCE_NUMBER};
use tracing::debug;

use crate::buffer::TupleBuffer;
use crate::error::EngineResult;
use crate::memory_layout::{MemoryProvider, Record};
use crate::pipeline::{
    ExecutionResult, PipelineExecutionContext, PipelineStage, TerminationType,
};
use crate::worker::WorkerContext;

/// Terminal consumer of a pipeline chain.
pub trait Sink: Send + Sync {
    fn write_buffer(&self, buffer: &TupleBuffer) -> EngineResult<()>;

    fn flush(&self) -> EngineResult<()> {
        Ok(())
    }

    fn end_of_stream(&self, termination: TerminationType) -> EngineResult<()> {
        let _ = termination;
        Ok(())
    }
}

/// Pipeline stage adapter around a sink.
pub struct SinkStage {
    sink: Arc<dyn Sink>,
}

impl SinkStage {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }
}

impl PipelineStage for SinkStage {
    fn execute(
        &self,
        input: &TupleBuffer,
        _ctx: &mut WorkerContext,
        _pctx: &PipelineExecutionContext,
    ) -> ExecutionResult {
        match self.sink.write_buffer(input) {
            Ok(()) => ExecutionResult::Ok,
            Err(error) => {
                debug!("Sink write failed: {error}");
                ExecutionResult::Failed
            }
        }
    }

    fn stop(&self, termination: TerminationType, _pctx: &PipelineExecutionContext) -> EngineResult<()> {
        self.sink.flush()?;
        self.sink.end_of_stream(termination)
    }
}

/// Discards everything; used for measurement runs.
pub struct NullSink;

impl Sink for NullSink {
    fn write_buffer(&self, _buffer: &TupleBuffer) -> EngineResult<()> {
        Ok(())
    }
}

type ChunkedRecords = BTreeMap<ChunkNumber, (Vec<Record>, bool)>;

struct OriginReorderState {
    next_sequence: SequenceNumber,
    pending: BTreeMap<SequenceNumber, ChunkedRecords>,
}

impl OriginReorderState {
    fn new() -> Self {
        Self {
            next_sequence: INITIAL_SEQUENCE_NUMBER,
            pending: BTreeMap::new(),
        }
    }

    /// Whether all chunks of the front sequence have arrived: dense chunk
    /// numbers from 1 with exactly one last chunk at the end.
    fn front_sequence_complete(&self) -> Option<&ChunkedRecords> {
        let chunks = self.pending.get(&self.next_sequence)?;
        let last = chunks
            .iter()
            .find_map(|(chunk, (_, is_last))| is_last.then_some(*chunk))?;
        (chunks.len() as u64 == last).then_some(chunks)
    }
}

struct CollectingState {
    origins: BTreeMap<OriginId, OriginReorderState>,
    ordered: Vec<Record>,
    eos: bool,
}

/// Gathers records in memory, restoring global order per origin from the
/// `(sequence, chunk, last chunk)` identity before appending. Buffers may
/// arrive in any order from the worker pool; records are released only as
/// dense sequence prefixes complete.
pub struct CollectingSink {
    provider: MemoryProvider,
    state: Mutex<CollectingState>,
    finished: Condvar,
}

impl CollectingSink {
    pub fn new(provider: MemoryProvider) -> Arc<Self> {
        Arc::new(Self {
            provider,
            state: Mutex::new(CollectingState {
                origins: BTreeMap::new(),
                ordered: Vec::new(),
                eos: false,
            }),
            finished: Condvar::new(),
        })
    }

    /// Records released so far, in `(origin, sequence, chunk)` order.
    pub fn records(&self) -> Vec<Record> {
        self.state.lock().ordered.clone()
    }

    pub fn saw_end_of_stream(&self) -> bool {
        self.state.lock().eos
    }

    /// Blocks until the end of stream arrives or the timeout expires.
    pub fn wait_for_end_of_stream(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.eos {
            if self.finished.wait_until(&mut state, deadline).timed_out() {
                return state.eos;
            }
        }
        true
    }
}

impl Sink for CollectingSink {
    fn write_buffer(&self, buffer: &TupleBuffer) -> EngineResult<()> {
        let mut records = Vec::with_capacity(buffer.number_of_tuples() as usize);
        for index in 0..buffer.number_of_tuples() as usize {
            records.push(self.provider.read_record(buffer, index)?);
        }

        let mut state = self.state.lock();
        let origin_state = state
            .origins
            .entry(buffer.origin_id())
            .or_insert_with(OriginReorderState::new);
        origin_state
            .pending
            .entry(buffer.sequence_number())
            .or_default()
            .insert(buffer.chunk_number(), (records, buffer.is_last_chunk()));

        // Release every dense, fully-chunked sequence prefix.
        let origin = buffer.origin_id();
        loop {
            let origin_state = state.origins.get_mut(&origin).expect("inserted above");
            if origin_state.front_sequence_complete().is_none() {
                break;
            }
            let next = origin_state.next_sequence;
            let chunks = origin_state.pending.remove(&next).expect("checked above");
            origin_state.next_sequence += 1;
            for (_, (records, _)) in chunks {
                state.ordered.extend(records);
            }
        }
        Ok(())
    }

    fn end_of_stream(&self, termination: TerminationType) -> EngineResult<()> {
        debug!("Collecting sink observed end of stream ({termination})");
        let mut state = self.state.lock();
        state.eos = true;
        drop(state);
        self.finished.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use streaming_config::SequenceData;

    use super::*;
    use crate::buffer_pool::{BufferManager, BufferProvider};
    use crate::context::Context;
    use crate::memory_layout::{Field, PhysicalType, Schema, Value};

    fn provider() -> MemoryProvider {
        MemoryProvider::row(Arc::new(Schema::new(vec![Field::new(
            "id",
            PhysicalType::U64,
        )])))
    }

    fn buffer_with_ids(
        manager: &BufferManager,
        provider: &MemoryProvider,
        ids: &[u64],
        sequence: SequenceData,
    ) -> TupleBuffer {
        let mut buffer = manager.get_buffer_blocking();
        for (index, id) in ids.iter().enumerate() {
            let mut record = Record::new();
            record.write("id", Value::U64(*id));
            provider.write_record(&mut buffer, index, &record).unwrap();
        }
        buffer.set_number_of_tuples(ids.len() as u64);
        buffer.set_origin_id(OriginId(1));
        buffer.set_sequence_data(sequence);
        buffer
    }

    fn collected_ids(sink: &CollectingSink) -> Vec<u64> {
        sink.records()
            .iter()
            .map(|record| match record.read("id").unwrap() {
                Value::U64(id) => *id,
                other => panic!("unexpected value {other:?}"),
            })
            .collect()
    }

    #[test]
    fn out_of_order_sequences_are_released_in_order() {
        let manager = BufferManager::new(Context::new_for_test()).unwrap();
        let provider = provider();
        let sink = CollectingSink::new(provider.clone());

        let first = buffer_with_ids(&manager, &provider, &[1, 2], SequenceData::unchunked(1));
        let second = buffer_with_ids(&manager, &provider, &[3], SequenceData::unchunked(2));
        let third = buffer_with_ids(&manager, &provider, &[4], SequenceData::unchunked(3));

        sink.write_buffer(&third).unwrap();
        sink.write_buffer(&second).unwrap();
        assert!(collected_ids(&sink).is_empty());

        sink.write_buffer(&first).unwrap();
        assert_eq!(collected_ids(&sink), vec![1, 2, 3, 4]);
    }

    #[test]
    fn chunked_sequences_wait_for_all_chunks() {
        let manager = BufferManager::new(Context::new_for_test()).unwrap();
        let provider = provider();
        let sink = CollectingSink::new(provider.clone());

        let chunk2 = buffer_with_ids(&manager, &provider, &[2], SequenceData::new(1, 2, false));
        let chunk3 = buffer_with_ids(&manager, &provider, &[3], SequenceData::new(1, 3, true));
        let chunk1 = buffer_with_ids(&manager, &provider, &[1], SequenceData::new(1, 1, false));

        sink.write_buffer(&chunk2).unwrap();
        sink.write_buffer(&chunk3).unwrap();
        assert!(collected_ids(&sink).is_empty());
        sink.write_buffer(&chunk1).unwrap();
        assert_eq!(collected_ids(&sink), vec![1, 2, 3]);
    }
}
