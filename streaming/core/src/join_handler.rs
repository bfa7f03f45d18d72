// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use streaming_config::{OriginId, SequenceNumber, Timestamp, WorkerId};
use tracing::{debug, trace};

use crate::aggregation_handler::{read_window_header, write_window_header, EMITTED_WINDOW_HEADER};
use crate::buffer::TupleBuffer;
use crate::chunk_collector::ChunkCollector;
use crate::context::Context;
use crate::emit::EmitOperator;
use crate::error::{EngineError, EngineResult};
use crate::hash_map::{ChainedHashMap, PagePool};
use crate::memory_layout::{Field, KeyCodec, MemoryProvider, PhysicalType, Record, Schema, Value};
use crate::pipeline::{ExecutionResult, PipelineExecutionContext, PipelineStage, TerminationType};
use crate::sequence_ring::{SequenceRingBuffer, StagedBuffer};
use crate::slice_store::{SliceStore, WindowDefinition, WindowSlice, WindowTriggerManager};
use crate::watermark::MultiOriginWatermarkProcessor;
use crate::worker::WorkerContext;

/// Ring capacity for per-sequence spanning-chunk tracking.
const SPANNING_RING_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinSide {
    Left,
    Right,
}

/// Dual-side build state for one slice interval: `n` left-side and `n`
/// right-side hash maps, one per worker thread. Entries are one-per-record
/// (duplicate keys chain), so the probe sees the full multiset.
pub struct JoinSlice {
    start: Timestamp,
    end: Timestamp,
    left: Vec<Mutex<Option<Arc<ChainedHashMap>>>>,
    right: Vec<Mutex<Option<Arc<ChainedHashMap>>>>,
}

impl JoinSlice {
    pub fn new(start: Timestamp, end: Timestamp, workers: usize) -> Self {
        Self {
            start,
            end,
            left: (0..workers).map(|_| Mutex::new(None)).collect(),
            right: (0..workers).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn side(&self, side: JoinSide) -> &[Mutex<Option<Arc<ChainedHashMap>>>] {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    /// Returns false when the slice was already frozen by a trigger; the
    /// record is late in that case.
    fn update_map(
        &self,
        side: JoinSide,
        worker: WorkerId,
        make: impl FnOnce() -> ChainedHashMap,
        update: impl FnOnce(&mut ChainedHashMap),
    ) -> bool {
        let mut slot = self.side(side)[worker as usize].lock();
        let map = slot.get_or_insert_with(|| Arc::new(make()));
        match Arc::get_mut(map) {
            Some(map) => {
                update(map);
                true
            }
            None => false,
        }
    }

    fn frozen_maps(&self, side: JoinSide) -> Vec<Arc<ChainedHashMap>> {
        self.side(side)
            .iter()
            .filter_map(|slot| slot.lock().clone())
            .filter(|map| !map.is_empty())
            .collect()
    }
}

impl WindowSlice for JoinSlice {
    fn slice_start(&self) -> Timestamp {
        self.start
    }

    fn slice_end(&self) -> Timestamp {
        self.end
    }
}

struct TriggeredJoinWindow {
    left_maps: Vec<Arc<ChainedHashMap>>,
    right_maps: Vec<Arc<ChainedHashMap>>,
}

/// Configuration of one side of the join.
pub struct JoinSideConfig {
    pub origins: Vec<OriginId>,
    pub schema: Arc<Schema>,
    pub timestamp_field: String,
    pub key_fields: Vec<String>,
}

pub struct JoinConfig {
    pub left: JoinSideConfig,
    pub right: JoinSideConfig,
    pub output_origin: OriginId,
    pub window: WindowDefinition,
}

/// Stream-join operator handler: per-slice dual-side build maps, shared
/// watermark gating across both input sides, and a bucket-partitioned probe.
pub struct StreamJoinOperatorHandler {
    context: Arc<Context>,
    output_origin: OriginId,
    left_origins: Vec<OriginId>,
    right_origins: Vec<OriginId>,
    left_ts_field: String,
    right_ts_field: String,
    left_keys: KeyCodec,
    right_keys: KeyCodec,
    left_payload: KeyCodec,
    right_payload: KeyCodec,
    workers: usize,
    partitions: usize,
    page_pool: Arc<PagePool>,
    store: SliceStore<JoinSlice>,
    trigger: WindowTriggerManager,
    chunk_collectors: HashMap<OriginId, ChunkCollector>,
    watermark: MultiOriginWatermarkProcessor,
    triggered: Mutex<HashMap<SequenceNumber, TriggeredJoinWindow>>,
    /// Per-(origin, sequence) spanning-chunk tracking for sequences whose
    /// chunks land in different slices.
    spanning: DashMap<(OriginId, SequenceNumber), Arc<SequenceRingBuffer>>,
}

impl StreamJoinOperatorHandler {
    pub fn new(config: JoinConfig, context: Arc<Context>) -> EngineResult<Arc<Self>> {
        let left_keys = KeyCodec::new(&config.left.schema, &config.left.key_fields)?;
        let right_keys = KeyCodec::new(&config.right.schema, &config.right.key_fields)?;
        if left_keys.key_size() != right_keys.key_size() {
            return Err(EngineError::QueryInvalid(
                "join key widths differ between sides".to_string(),
            ));
        }
        let left_payload = Self::payload_codec(&config.left.schema)?;
        let right_payload = Self::payload_codec(&config.right.schema)?;

        let mut input_origins = config.left.origins.clone();
        input_origins.extend(config.right.origins.iter().copied());
        let workers = context.parameters.worker_threads.max(1);
        let page_pool = PagePool::new(context.parameters.hash_map_page_size);
        Ok(Arc::new(Self {
            output_origin: config.output_origin,
            left_origins: config.left.origins,
            right_origins: config.right.origins,
            left_ts_field: config.left.timestamp_field,
            right_ts_field: config.right.timestamp_field,
            left_keys,
            right_keys,
            left_payload,
            right_payload,
            workers,
            partitions: context.parameters.join_partitions,
            page_pool,
            store: SliceStore::new(config.window),
            trigger: WindowTriggerManager::new(config.window),
            chunk_collectors: input_origins
                .iter()
                .map(|origin| {
                    (
                        *origin,
                        ChunkCollector::new(context.parameters.chunk_collector_node_size),
                    )
                })
                .collect(),
            watermark: MultiOriginWatermarkProcessor::new(input_origins),
            triggered: Mutex::new(HashMap::new()),
            spanning: DashMap::new(),
            context,
        }))
    }

    pub fn left_origins(&self) -> &[OriginId] {
        &self.left_origins
    }

    pub fn right_origins(&self) -> &[OriginId] {
        &self.right_origins
    }

    pub fn window(&self) -> &WindowDefinition {
        self.store.definition()
    }

    fn payload_codec(schema: &Schema) -> EngineResult<KeyCodec> {
        let field_names: Vec<String> = schema
            .fields()
            .iter()
            .map(|field| field.name.clone())
            .collect();
        KeyCodec::new(schema, &field_names)
    }

    /// Output rows carry the window borders and both payloads, side-prefixed
    /// to keep colliding field names apart.
    pub fn output_schema(&self) -> Arc<Schema> {
        let mut fields = vec![
            Field::new("window_start", PhysicalType::U64),
            Field::new("window_end", PhysicalType::U64),
        ];
        for (name, physical_type) in self.left_payload.fields() {
            fields.push(Field::new(format!("left_{name}"), *physical_type));
        }
        for (name, physical_type) in self.right_payload.fields() {
            fields.push(Field::new(format!("right_{name}"), *physical_type));
        }
        Arc::new(Schema::new(fields))
    }

    fn side_of(&self, side: JoinSide) -> (&KeyCodec, &KeyCodec, &str) {
        match side {
            JoinSide::Left => (&self.left_keys, &self.left_payload, &self.left_ts_field),
            JoinSide::Right => (&self.right_keys, &self.right_payload, &self.right_ts_field),
        }
    }

    fn make_map(&self, side: JoinSide) -> ChainedHashMap {
        let (keys, payload, _) = self.side_of(side);
        ChainedHashMap::new(
            self.page_pool.clone(),
            self.partitions,
            keys.key_size(),
            payload.key_size(),
        )
    }

    /// Build path: insert `(key, flattened record)` into the worker's
    /// side-map of the covering slice.
    pub fn build_record(
        &self,
        side: JoinSide,
        worker: WorkerId,
        record: &Record,
    ) -> EngineResult<()> {
        let (keys, payload, ts_field) = self.side_of(side);
        let ts = record.read(ts_field)?.to_u64().ok_or_else(|| {
            EngineError::FormattingError(format!("non-integer event time in field '{ts_field}'"))
        })?;
        if ts == 0 || ts <= self.watermark.current_watermark() {
            self.context
                .metrics
                .node_metrics
                .records_below_watermark
                .inc();
            return Ok(());
        }
        let key = keys.encode(record)?;
        let value = payload.encode(record)?;
        let slice = self.store.find_slice_by_ts(ts, |start, end| {
            self.context.metrics.node_metrics.slices_created.inc();
            JoinSlice::new(start, end, self.workers)
        });
        let lifted = slice.update_map(
            side,
            worker,
            || self.make_map(side),
            |map| {
                map.insert(&key).copy_from_slice(&value);
            },
        );
        if !lifted {
            self.context
                .metrics
                .node_metrics
                .records_below_watermark
                .inc();
        }
        Ok(())
    }

    /// Tracks the chunks of a multi-chunk sequence in its spanning ring and
    /// claims the spanning tuple between this chunk and its predecessor.
    /// With record-aligned buffers the spanning tuple is empty; claiming it
    /// marks the staged trailing half consumed so the slot can be reused.
    fn track_spanning_chunks(&self, input: &TupleBuffer) {
        let sequence_data = input.sequence_data();
        if sequence_data.chunk_number == 1 && sequence_data.last_chunk {
            return;
        }
        let key = (input.origin_id(), sequence_data.sequence_number);
        let ring = self
            .spanning
            .entry(key)
            .or_insert_with(|| Arc::new(SequenceRingBuffer::new(SPANNING_RING_CAPACITY)))
            .clone();
        let staged = StagedBuffer {
            buffer: input.clone(),
            first_delimiter_offset: 0,
            last_delimiter_offset: input.capacity() as u32,
        };
        // Records never straddle buffers here, so every chunk delimits.
        if ring.try_stage_with_delimiter(sequence_data.chunk_number - 1, staged) {
            ring.mark_leading_consumed(sequence_data.chunk_number - 1);
        }
        if sequence_data.chunk_number > 1
            && ring
                .try_claim_spanning_tuple(sequence_data.chunk_number - 2)
                .is_some()
        {
            trace!(
                "Claimed spanning tuple between chunks {} and {} of {key:?}",
                sequence_data.chunk_number - 1,
                sequence_data.chunk_number
            );
        }
        if sequence_data.last_chunk {
            self.spanning.remove(&key);
        }
    }

    pub fn complete_buffer(
        &self,
        input: &TupleBuffer,
        pctx: &PipelineExecutionContext,
    ) -> EngineResult<()> {
        self.track_spanning_chunks(input);
        let origin = input.origin_id();
        let collector = self.chunk_collectors.get(&origin).ok_or_else(|| {
            EngineError::RuntimeFailure(format!("buffer from unknown origin {origin}"))
        })?;
        let Some((sequence, watermark)) =
            collector.collect(input.sequence_data(), input.watermark())
        else {
            return Ok(());
        };
        self.context.metrics.node_metrics.sequences_completed.inc();
        let global = self.watermark.update_watermark(origin, sequence, watermark);
        self.trigger_windows(global, pctx)
    }

    /// One side reaching its end of stream does not trigger anything by
    /// itself; the other side keeps producing until its own end of stream,
    /// then the remaining windows fire with the data they have.
    pub fn handle_origin_eos(
        &self,
        origin: OriginId,
        pctx: &PipelineExecutionContext,
    ) -> EngineResult<()> {
        let global = self.watermark.mark_origin_terminated(origin);
        debug!("Join input origin {origin} terminated");
        if self.watermark.all_terminated() {
            let flush = self.watermark.max_origin_watermark();
            self.trigger_windows(flush, pctx)?;
            let dropped = self.store.remove_slices_until_ts(Timestamp::MAX);
            if dropped > 0 {
                debug!("Dropped {dropped} incomplete tail join slices at end of stream");
            }
            Ok(())
        } else {
            self.trigger_windows(global, pctx)
        }
    }

    fn trigger_windows(
        &self,
        watermark: Timestamp,
        pctx: &PipelineExecutionContext,
    ) -> EngineResult<()> {
        for triggerable in self.trigger.collect_triggerable(&self.store, watermark) {
            let mut left_maps = Vec::new();
            let mut right_maps = Vec::new();
            let mut total_tuples = 0;
            for slice in &triggerable.slices {
                for map in slice.frozen_maps(JoinSide::Left) {
                    total_tuples += map.tuple_count();
                    left_maps.push(map);
                }
                for map in slice.frozen_maps(JoinSide::Right) {
                    total_tuples += map.tuple_count();
                    right_maps.push(map);
                }
            }
            let mut buffer = pctx
                .buffer_manager()
                .get_unpooled_buffer(EMITTED_WINDOW_HEADER)?;
            write_window_header(
                &mut buffer,
                triggerable.window,
                (left_maps.len() + right_maps.len()) as u64,
            );
            buffer.set_origin_id(self.output_origin);
            buffer.set_sequence_data(streaming_config::SequenceData::unchunked(
                triggerable.sequence_number,
            ));
            buffer.set_watermark(triggerable.window.window_start);
            buffer.set_number_of_tuples(total_tuples);

            self.triggered.lock().insert(
                triggerable.sequence_number,
                TriggeredJoinWindow {
                    left_maps,
                    right_maps,
                },
            );
            self.context.metrics.node_metrics.windows_triggered.inc();
            trace!(
                "Emitted join window {}-{} with sequence {}",
                triggerable.window.window_start,
                triggerable.window.window_end,
                triggerable.sequence_number
            );
            pctx.emit_buffer(buffer);
        }
        Ok(())
    }

    /// Probe path: for every partition and every right entry in it, join
    /// against all left entries with an equal key.
    pub fn probe_window(&self, input: &TupleBuffer) -> EngineResult<Vec<Record>> {
        let (window, _) = read_window_header(input);
        let sequence = input.sequence_number();
        let Some(entry) = self.triggered.lock().remove(&sequence) else {
            return Err(EngineError::RuntimeFailure(format!(
                "no triggered join window for sequence {sequence}"
            )));
        };

        let mut records = Vec::new();
        for bucket in 0..self.partitions {
            for right_map in &entry.right_maps {
                right_map.for_each_in_bucket(bucket, |right_key, right_payload| {
                    for left_map in &entry.left_maps {
                        left_map.for_each_in_bucket(bucket, |left_key, left_payload| {
                            if left_key != right_key {
                                return;
                            }
                            let mut record = Record::new();
                            record.write("window_start", Value::U64(window.window_start));
                            record.write("window_end", Value::U64(window.window_end));
                            let mut left_record = Record::new();
                            self.left_payload.decode_into(left_payload, &mut left_record);
                            for (name, _) in self.left_payload.fields() {
                                let value = left_record.read(name).expect("decoded above").clone();
                                record.write(format!("left_{name}"), value);
                            }
                            let mut right_record = Record::new();
                            self.right_payload
                                .decode_into(right_payload, &mut right_record);
                            for (name, _) in self.right_payload.fields() {
                                let value = right_record.read(name).expect("decoded above").clone();
                                record.write(format!("right_{name}"), value);
                            }
                            records.push(record);
                        });
                    }
                });
            }
        }
        Ok(records)
    }
}

/// Build-side stage for one side of the join.
pub struct JoinBuildStage {
    pub handler_index: usize,
    pub side: JoinSide,
    pub input_provider: MemoryProvider,
    pub input_origins: Vec<OriginId>,
}

impl PipelineStage for JoinBuildStage {
    fn execute(
        &self,
        input: &TupleBuffer,
        ctx: &mut WorkerContext,
        pctx: &PipelineExecutionContext,
    ) -> ExecutionResult {
        let handler = pctx
            .operator_handler(self.handler_index)
            .as_join()
            .expect("join build wired to a non-join handler")
            .clone();
        for index in 0..input.number_of_tuples() as usize {
            let record = match self.input_provider.read_record(input, index) {
                Ok(record) => record,
                Err(error) => {
                    debug!("Join build failed to read record: {error}");
                    return ExecutionResult::Failed;
                }
            };
            if let Err(error) = handler.build_record(self.side, ctx.worker_id(), &record) {
                debug!("Join build failed: {error}");
                return ExecutionResult::Failed;
            }
        }
        if let Err(error) = handler.complete_buffer(input, pctx) {
            debug!("Join trigger failed: {error}");
            return ExecutionResult::Failed;
        }
        ExecutionResult::Ok
    }

    fn stop(&self, termination: TerminationType, pctx: &PipelineExecutionContext) -> EngineResult<()> {
        if termination == TerminationType::Graceful {
            let handler = pctx
                .operator_handler(self.handler_index)
                .as_join()
                .expect("join build wired to a non-join handler")
                .clone();
            for origin in &self.input_origins {
                handler.handle_origin_eos(*origin, pctx)?;
            }
        }
        Ok(())
    }
}

/// Probe-side stage of the join.
pub struct JoinProbeStage {
    pub handler_index: usize,
    pub emit: EmitOperator,
}

impl PipelineStage for JoinProbeStage {
    fn execute(
        &self,
        input: &TupleBuffer,
        ctx: &mut WorkerContext,
        pctx: &PipelineExecutionContext,
    ) -> ExecutionResult {
        let handler = pctx
            .operator_handler(self.handler_index)
            .as_join()
            .expect("join probe wired to a non-join handler")
            .clone();
        let records = match handler.probe_window(input) {
            Ok(records) => records,
            Err(error) => {
                debug!("Join probe failed: {error}");
                return ExecutionResult::Failed;
            }
        };
        let mut state = match self.emit.open(ctx, pctx) {
            Ok(state) => state,
            Err(error) => {
                debug!("Join probe could not allocate output: {error}");
                return ExecutionResult::Failed;
            }
        };
        for record in &records {
            if let Err(error) = self.emit.execute(&mut state, record, input, ctx, pctx) {
                debug!("Join probe emit failed: {error}");
                return ExecutionResult::Failed;
            }
        }
        if let Err(error) = self.emit.close(state, input, pctx) {
            debug!("Join probe close failed: {error}");
            return ExecutionResult::Failed;
        }
        ExecutionResult::Ok
    }
}
