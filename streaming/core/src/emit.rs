// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use dashmap::DashMap;
use streaming_config::{ChunkNumber, OriginId, SequenceData, SequenceNumber, INITIAL_CHUNK_NUMBER};
use tracing::trace;

use crate::buffer::TupleBuffer;
use crate::buffer_pool::BufferProvider;
use crate::error::{EngineError, EngineResult};
use crate::memory_layout::{MemoryProvider, Record};
use crate::pipeline::PipelineExecutionContext;
use crate::worker::WorkerContext;

/// How long an emit waits for an output buffer before failing the pipeline.
const EMIT_ALLOCATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-`(origin, sequence)` chunk bookkeeping for emit operators.
///
/// An input sequence may arrive in several chunks, and every chunk may
/// overflow into several output buffers, so the total output chunk count is
/// only known once the last input chunk has been processed. The handler
/// allocates output chunk numbers and decides which output buffer carries
/// the seal flag.
#[derive(Default)]
pub struct EmitOperatorHandler {
    state: DashMap<(OriginId, SequenceNumber), SequenceChunkState>,
}

#[derive(Default)]
struct SequenceChunkState {
    next_chunk: ChunkNumber,
    processed_input_chunks: u64,
    total_input_chunks: Option<u64>,
}

impl EmitOperatorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next output chunk number for the sequence.
    pub fn next_chunk_number(&self, origin: OriginId, sequence: SequenceNumber) -> ChunkNumber {
        let mut entry = self.state.entry((origin, sequence)).or_default();
        if entry.next_chunk == 0 {
            entry.next_chunk = INITIAL_CHUNK_NUMBER;
        }
        let chunk = entry.next_chunk;
        entry.next_chunk += 1;
        chunk
    }

    /// Records that one input chunk of the sequence has been fully processed
    /// and returns whether that completed the whole sequence, i.e. whether
    /// the output buffer emitted at close carries `last_chunk`.
    pub fn process_chunk_number(
        &self,
        origin: OriginId,
        sequence: SequenceNumber,
        input_chunk: ChunkNumber,
        input_last_chunk: bool,
    ) -> bool {
        let mut entry = self.state.entry((origin, sequence)).or_default();
        entry.processed_input_chunks += 1;
        if input_last_chunk {
            entry.total_input_chunks = Some(input_chunk);
        }
        matches!(entry.total_input_chunks, Some(total) if entry.processed_input_chunks == total)
    }

    /// Drops the per-sequence state once the sealed chunk went out.
    pub fn remove_sequence_state(&self, origin: OriginId, sequence: SequenceNumber) {
        self.state.remove(&(origin, sequence));
    }

    pub fn tracked_sequences(&self) -> usize {
        self.state.len()
    }
}

/// Buffer-filling sink operator of a pipeline stage: materializes records
/// into output buffers via a memory provider and chunks on overflow.
pub struct EmitOperator {
    memory_provider: MemoryProvider,
    handler_index: usize,
}

/// Per-invocation state: the buffer being filled and the write index.
pub struct EmitState {
    buffer: TupleBuffer,
    index: usize,
    capacity: usize,
}

impl EmitOperator {
    pub fn new(memory_provider: MemoryProvider, handler_index: usize) -> Self {
        Self {
            memory_provider,
            handler_index,
        }
    }

    pub fn memory_provider(&self) -> &MemoryProvider {
        &self.memory_provider
    }

    pub fn open(
        &self,
        ctx: &mut WorkerContext,
        pctx: &PipelineExecutionContext,
    ) -> EngineResult<EmitState> {
        let buffer = self.allocate(ctx, pctx)?;
        let capacity = self.memory_provider.capacity(buffer.capacity());
        Ok(EmitState {
            buffer,
            index: 0,
            capacity,
        })
    }

    /// Writes one record, emitting the current buffer first when it is full.
    /// The overflow check runs before the write so a buffer filled to the
    /// brim is not emitted here and again at close.
    pub fn execute(
        &self,
        state: &mut EmitState,
        record: &Record,
        input: &TupleBuffer,
        ctx: &mut WorkerContext,
        pctx: &PipelineExecutionContext,
    ) -> EngineResult<()> {
        if state.index >= state.capacity {
            let full = std::mem::replace(&mut state.buffer, self.allocate(ctx, pctx)?);
            self.emit(full, state.index, input, false, pctx);
            state.index = 0;
            state.capacity = self.memory_provider.capacity(state.buffer.capacity());
        }
        self.memory_provider
            .write_record(&mut state.buffer, state.index, record)?;
        state.index += 1;
        Ok(())
    }

    /// Emits the final (possibly partial) buffer for this invocation with
    /// the seal flag decided by the handler's per-sequence chunk state.
    pub fn close(
        &self,
        state: EmitState,
        input: &TupleBuffer,
        pctx: &PipelineExecutionContext,
    ) -> EngineResult<()> {
        let handler = pctx
            .operator_handler(self.handler_index)
            .as_emit()
            .expect("emit operator wired to a non-emit handler")
            .clone();
        let origin = pctx.output_origin();
        let sequence = input.sequence_number();
        let last_chunk = handler.process_chunk_number(
            origin,
            sequence,
            input.chunk_number(),
            input.is_last_chunk(),
        );
        self.emit(state.buffer, state.index, input, last_chunk, pctx);
        if last_chunk {
            handler.remove_sequence_state(origin, sequence);
        }
        Ok(())
    }

    fn emit(
        &self,
        buffer: TupleBuffer,
        records: usize,
        input: &TupleBuffer,
        last_chunk: bool,
        pctx: &PipelineExecutionContext,
    ) {
        let handler = pctx
            .operator_handler(self.handler_index)
            .as_emit()
            .expect("emit operator wired to a non-emit handler");
        let origin = pctx.output_origin();
        let sequence = input.sequence_number();
        let chunk = handler.next_chunk_number(origin, sequence);
        buffer.set_number_of_tuples(records as u64);
        buffer.set_origin_id(origin);
        buffer.set_sequence_data(SequenceData::new(sequence, chunk, last_chunk));
        buffer.set_watermark(input.watermark());
        buffer.set_creation_timestamp(input.creation_timestamp());
        trace!(
            "Emitting buffer {origin} seq {sequence} chunk {chunk} last {last_chunk} with {records} records"
        );
        pctx.emit_buffer(buffer);
    }

    fn allocate(
        &self,
        ctx: &mut WorkerContext,
        pctx: &PipelineExecutionContext,
    ) -> EngineResult<TupleBuffer> {
        if let Some(buffer) = ctx.local_pool().try_get_buffer() {
            return Ok(buffer);
        }
        pctx.buffer_manager()
            .get_buffer_with_timeout(EMIT_ALLOCATION_TIMEOUT)
            .ok_or_else(|| {
                EngineError::CannotAllocateBuffer("emit output buffer".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_numbers_are_dense_per_sequence() {
        let handler = EmitOperatorHandler::new();
        assert_eq!(handler.next_chunk_number(OriginId(1), 1), 1);
        assert_eq!(handler.next_chunk_number(OriginId(1), 1), 2);
        assert_eq!(handler.next_chunk_number(OriginId(1), 2), 1);
        assert_eq!(handler.next_chunk_number(OriginId(2), 1), 1);
    }

    #[test]
    fn unchunked_input_seals_at_first_close() {
        let handler = EmitOperatorHandler::new();
        assert!(handler.process_chunk_number(OriginId(1), 1, 1, true));
    }

    #[test]
    fn chunked_input_seals_only_after_all_chunks() {
        let handler = EmitOperatorHandler::new();
        // Input chunks arrive out of order: 2, 3 (last), 1.
        assert!(!handler.process_chunk_number(OriginId(1), 5, 2, false));
        assert!(!handler.process_chunk_number(OriginId(1), 5, 3, true));
        assert!(handler.process_chunk_number(OriginId(1), 5, 1, false));
    }

    #[test]
    fn sequence_state_is_removed_after_seal() {
        let handler = EmitOperatorHandler::new();
        handler.next_chunk_number(OriginId(1), 1);
        assert_eq!(handler.tracked_sequences(), 1);
        handler.remove_sequence_state(OriginId(1), 1);
        assert_eq!(handler.tracked_sequences(), 0);
    }
}
