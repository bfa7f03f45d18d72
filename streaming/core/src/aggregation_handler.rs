// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use streaming_config::{OriginId, SequenceNumber, Timestamp, WorkerId};
use tracing::{debug, trace};

use crate::aggregation::AggregationFunction;
use crate::buffer::TupleBuffer;
use crate::chunk_collector::ChunkCollector;
use crate::context::Context;
use crate::emit::EmitOperator;
use crate::error::{EngineError, EngineResult};
use crate::hash_map::{ChainedHashMap, PagePool};
use crate::memory_layout::{Field, KeyCodec, MemoryProvider, PhysicalType, Record, Schema, Value};
use crate::pipeline::{ExecutionResult, PipelineExecutionContext, PipelineStage, TerminationType};
use crate::slice_store::{
    SliceStore, WindowDefinition, WindowInfo, WindowSlice, WindowTriggerManager,
};
use crate::watermark::MultiOriginWatermarkProcessor;
use crate::worker::WorkerContext;

/// Fixed header of an emitted window trigger buffer:
/// `[window_start: u64][window_end: u64][number_of_hash_maps: u64]`.
/// The hash maps themselves are parked in the handler's trigger registry
/// under the buffer's sequence number until the probe picks them up.
pub const EMITTED_WINDOW_HEADER: usize = 24;

pub fn write_window_header(buffer: &mut TupleBuffer, window: WindowInfo, hash_maps: u64) {
    let bytes = buffer.as_mut_slice();
    bytes[0..8].copy_from_slice(&window.window_start.to_le_bytes());
    bytes[8..16].copy_from_slice(&window.window_end.to_le_bytes());
    bytes[16..24].copy_from_slice(&hash_maps.to_le_bytes());
}

pub fn read_window_header(buffer: &TupleBuffer) -> (WindowInfo, u64) {
    let bytes = buffer.as_slice();
    let window = WindowInfo {
        window_start: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        window_end: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
    };
    let hash_maps = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    (window, hash_maps)
}

/// Per-thread hash maps for one slice interval. A map is created lazily on
/// the first lift by its worker; worker threads never share a map while
/// building. Triggering freezes the maps behind `Arc`s, after which they are
/// read-only.
pub struct AggregationSlice {
    start: Timestamp,
    end: Timestamp,
    maps: Vec<Mutex<Option<Arc<ChainedHashMap>>>>,
}

impl AggregationSlice {
    pub fn new(start: Timestamp, end: Timestamp, workers: usize) -> Self {
        Self {
            start,
            end,
            maps: (0..workers).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Runs `update` on the worker's map, creating it with `make` first if
    /// needed. Only the owning worker mutates its map while the slice is
    /// live. Returns false when the slice was already frozen by a trigger,
    /// which can only happen to records arriving at the watermark boundary.
    fn update_map(
        &self,
        worker: WorkerId,
        make: impl FnOnce() -> ChainedHashMap,
        update: impl FnOnce(&mut ChainedHashMap),
    ) -> bool {
        let mut slot = self.maps[worker as usize].lock();
        let map = slot.get_or_insert_with(|| Arc::new(make()));
        match Arc::get_mut(map) {
            Some(map) => {
                update(map);
                true
            }
            None => false,
        }
    }

    /// All non-empty per-thread maps, frozen for probing.
    pub fn frozen_maps(&self) -> Vec<Arc<ChainedHashMap>> {
        self.maps
            .iter()
            .filter_map(|slot| slot.lock().clone())
            .filter(|map| !map.is_empty())
            .collect()
    }
}

impl WindowSlice for AggregationSlice {
    fn slice_start(&self) -> Timestamp {
        self.start
    }

    fn slice_end(&self) -> Timestamp {
        self.end
    }
}

/// A triggered window parked until its probe task runs: the frozen source
/// maps plus the freshly allocated final map. No two windows ever share a
/// final map, and holding the source `Arc`s here guarantees the slices'
/// state survives until the probe finished.
struct TriggeredWindow {
    window: WindowInfo,
    source_maps: Vec<Arc<ChainedHashMap>>,
    final_map: ChainedHashMap,
}

/// Configuration of a keyed window aggregation.
pub struct AggregationConfig {
    pub input_origins: Vec<OriginId>,
    pub output_origin: OriginId,
    pub window: WindowDefinition,
    pub input_schema: Arc<Schema>,
    pub timestamp_field: String,
    pub key_fields: Vec<String>,
    pub functions: Vec<AggregationFunction>,
}

/// Keyed aggregation operator handler: thread-local chained hash maps per
/// slice on the lift path, watermark-driven window triggering, and the
/// combine/lower probe path.
pub struct AggregationOperatorHandler {
    context: Arc<Context>,
    output_origin: OriginId,
    timestamp_field: String,
    key_codec: KeyCodec,
    functions: Vec<AggregationFunction>,
    state_offsets: Vec<usize>,
    value_size: usize,
    workers: usize,
    page_pool: Arc<PagePool>,
    store: SliceStore<AggregationSlice>,
    trigger: WindowTriggerManager,
    /// Sequence numbers are dense per origin, so chunk completion is tracked
    /// per origin as well.
    chunk_collectors: HashMap<OriginId, ChunkCollector>,
    watermark: MultiOriginWatermarkProcessor,
    triggered: Mutex<HashMap<SequenceNumber, TriggeredWindow>>,
}

impl AggregationOperatorHandler {
    pub fn new(config: AggregationConfig, context: Arc<Context>) -> EngineResult<Arc<Self>> {
        if config.functions.is_empty() {
            return Err(EngineError::QueryInvalid(
                "aggregation without functions".to_string(),
            ));
        }
        let key_codec = KeyCodec::new(&config.input_schema, &config.key_fields)?;
        let mut state_offsets = Vec::with_capacity(config.functions.len());
        let mut value_size = 0;
        for function in &config.functions {
            state_offsets.push(value_size);
            value_size += function.state_size();
        }
        let workers = context.parameters.worker_threads.max(1);
        let page_pool = PagePool::new(context.parameters.hash_map_page_size);
        Ok(Arc::new(Self {
            output_origin: config.output_origin,
            timestamp_field: config.timestamp_field,
            key_codec,
            functions: config.functions,
            state_offsets,
            value_size,
            workers,
            page_pool,
            store: SliceStore::new(config.window),
            trigger: WindowTriggerManager::new(config.window),
            chunk_collectors: config
                .input_origins
                .iter()
                .map(|origin| {
                    (
                        *origin,
                        ChunkCollector::new(context.parameters.chunk_collector_node_size),
                    )
                })
                .collect(),
            watermark: MultiOriginWatermarkProcessor::new(config.input_origins.clone()),
            triggered: Mutex::new(HashMap::new()),
            context,
        }))
    }

    /// Schema of the probe output: window borders, group keys, aggregates.
    pub fn output_schema(&self) -> Arc<Schema> {
        let mut fields = vec![
            Field::new("window_start", PhysicalType::U64),
            Field::new("window_end", PhysicalType::U64),
        ];
        for (name, physical_type) in self.key_codec.fields() {
            fields.push(Field::new(name.clone(), *physical_type));
        }
        for function in &self.functions {
            let field = if function.result_nullable() {
                Field::nullable(function.result_field(), function.result_type())
            } else {
                Field::new(function.result_field(), function.result_type())
            };
            fields.push(field);
        }
        Arc::new(Schema::new(fields))
    }

    fn make_map(&self) -> ChainedHashMap {
        ChainedHashMap::new(
            self.page_pool.clone(),
            self.context.parameters.hash_map_buckets,
            self.key_codec.key_size(),
            self.value_size,
        )
    }

    /// Lift path: insert-or-update the record into the worker's map of the
    /// covering slice. Records at or below the watermark are discarded.
    pub fn lift_record(&self, worker: WorkerId, record: &Record) -> EngineResult<()> {
        let ts = record
            .read(&self.timestamp_field)?
            .to_u64()
            .ok_or_else(|| {
                EngineError::FormattingError(format!(
                    "non-integer event time in field '{}'",
                    self.timestamp_field
                ))
            })?;
        if ts == 0 || ts <= self.watermark.current_watermark() {
            self.context
                .metrics
                .node_metrics
                .records_below_watermark
                .inc();
            return Ok(());
        }
        let key = self.key_codec.encode(record)?;
        let slice = self.store.find_slice_by_ts(ts, |start, end| {
            self.context.metrics.node_metrics.slices_created.inc();
            AggregationSlice::new(start, end, self.workers)
        });
        let mut lift_error = None;
        let lifted = slice.update_map(
            worker,
            || self.make_map(),
            |map| {
                let (state, _) = map.insert_or_update(&key);
                for (function, offset) in self.functions.iter().zip(&self.state_offsets) {
                    let state = &mut state[*offset..*offset + function.state_size()];
                    if let Err(error) = function.lift(state, record) {
                        lift_error = Some(error);
                        return;
                    }
                }
            },
        );
        if !lifted {
            self.context
                .metrics
                .node_metrics
                .records_below_watermark
                .inc();
        }
        match lift_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Sequence bookkeeping after a buffer has been fully lifted: feed the
    /// chunk collector, advance the watermark when the sequence completed,
    /// and trigger any windows the new watermark seals.
    pub fn complete_buffer(
        &self,
        input: &TupleBuffer,
        pctx: &PipelineExecutionContext,
    ) -> EngineResult<()> {
        let sequence_data = input.sequence_data();
        let origin = input.origin_id();
        let collector = self.chunk_collectors.get(&origin).ok_or_else(|| {
            EngineError::RuntimeFailure(format!("buffer from unknown origin {origin}"))
        })?;
        let Some((sequence, watermark)) = collector.collect(sequence_data, input.watermark())
        else {
            return Ok(());
        };
        self.context.metrics.node_metrics.sequences_completed.inc();
        let global = self.watermark.update_watermark(origin, sequence, watermark);
        self.trigger_windows(global, pctx)
    }

    /// End of stream for one input origin. Once all origins finished, the
    /// remaining windows up to the highest watermark ever observed are
    /// flushed; tail windows past it never received their full input and
    /// are dropped with their slices.
    pub fn handle_origin_eos(
        &self,
        origin: OriginId,
        pctx: &PipelineExecutionContext,
    ) -> EngineResult<()> {
        let global = self.watermark.mark_origin_terminated(origin);
        debug!("Aggregation input origin {origin} terminated");
        if self.watermark.all_terminated() {
            let flush = self.watermark.max_origin_watermark();
            self.trigger_windows(flush, pctx)?;
            let dropped = self.store.remove_slices_until_ts(Timestamp::MAX);
            if dropped > 0 {
                debug!("Dropped {dropped} incomplete tail slices at end of stream");
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
            let mut source_maps = Vec::new();
            let mut total_tuples = 0;
            for slice in &triggerable.slices {
                for map in slice.frozen_maps() {
                    total_tuples += map.tuple_count();
                    source_maps.push(map);
                }
            }
            // Allocation failure on the trigger path fails the pipeline.
            let mut buffer = pctx
                .buffer_manager()
                .get_unpooled_buffer(EMITTED_WINDOW_HEADER)?;
            write_window_header(&mut buffer, triggerable.window, source_maps.len() as u64);
            buffer.set_origin_id(self.output_origin);
            buffer.set_sequence_data(streaming_config::SequenceData::unchunked(
                triggerable.sequence_number,
            ));
            buffer.set_watermark(triggerable.window.window_start);
            buffer.set_number_of_tuples(total_tuples);

            self.triggered.lock().insert(
                triggerable.sequence_number,
                TriggeredWindow {
                    window: triggerable.window,
                    source_maps,
                    final_map: self.make_map(),
                },
            );
            self.context.metrics.node_metrics.windows_triggered.inc();
            trace!(
                "Emitted window {}-{} with sequence {} origin {}",
                triggerable.window.window_start,
                triggerable.window.window_end,
                triggerable.sequence_number,
                self.output_origin
            );
            pctx.emit_buffer(buffer);
        }
        Ok(())
    }

    /// Probe path: combine all source maps into the window's final map, then
    /// lower every final entry into an output record.
    pub fn probe_window(&self, input: &TupleBuffer) -> EngineResult<Vec<Record>> {
        let (window, advertised_maps) = read_window_header(input);
        let sequence = input.sequence_number();
        let Some(entry) = self.triggered.lock().remove(&sequence) else {
            return Err(EngineError::RuntimeFailure(format!(
                "no triggered window for sequence {sequence}"
            )));
        };
        let TriggeredWindow {
            window: parked_window,
            source_maps,
            mut final_map,
        } = entry;
        debug_assert_eq!(parked_window, window);
        debug_assert_eq!(source_maps.len() as u64, advertised_maps);

        let final_map = &mut final_map;
        for source in &source_maps {
            source.for_each_entry(|key, value| {
                let (state, inserted) = final_map.insert_or_update(key);
                if inserted {
                    state.copy_from_slice(value);
                } else {
                    for (function, offset) in self.functions.iter().zip(&self.state_offsets) {
                        let range = *offset..*offset + function.state_size();
                        function.combine(&mut state[range.clone()], &value[range]);
                    }
                }
            });
        }

        let mut records = Vec::with_capacity(final_map.tuple_count() as usize);
        final_map.for_each_entry(|key, value| {
            let mut record = Record::new();
            record.write("window_start", Value::U64(window.window_start));
            record.write("window_end", Value::U64(window.window_end));
            self.key_codec.decode_into(key, &mut record);
            for (function, offset) in self.functions.iter().zip(&self.state_offsets) {
                let state = &value[*offset..*offset + function.state_size()];
                record.write(function.result_field(), function.lower(state));
            }
            records.push(record);
        });
        Ok(records)
    }
}

/// Build-side stage: lifts every record of the input buffer into the
/// handler's thread-local slice maps, then runs the sequence bookkeeping.
pub struct AggregationBuildStage {
    pub handler_index: usize,
    pub input_provider: MemoryProvider,
    pub input_origins: Vec<OriginId>,
}

impl PipelineStage for AggregationBuildStage {
    fn execute(
        &self,
        input: &TupleBuffer,
        ctx: &mut WorkerContext,
        pctx: &PipelineExecutionContext,
    ) -> ExecutionResult {
        let handler = pctx
            .operator_handler(self.handler_index)
            .as_aggregation()
            .expect("aggregation build wired to a non-aggregation handler")
            .clone();
        for index in 0..input.number_of_tuples() as usize {
            let record = match self.input_provider.read_record(input, index) {
                Ok(record) => record,
                Err(error) => {
                    debug!("Aggregation build failed to read record: {error}");
                    return ExecutionResult::Failed;
                }
            };
            if let Err(error) = handler.lift_record(ctx.worker_id(), &record) {
                debug!("Aggregation lift failed: {error}");
                return ExecutionResult::Failed;
            }
        }
        if let Err(error) = handler.complete_buffer(input, pctx) {
            debug!("Aggregation trigger failed: {error}");
            return ExecutionResult::Failed;
        }
        ExecutionResult::Ok
    }

    fn stop(&self, termination: TerminationType, pctx: &PipelineExecutionContext) -> EngineResult<()> {
        if termination == TerminationType::Graceful {
            let handler = pctx
                .operator_handler(self.handler_index)
                .as_aggregation()
                .expect("aggregation build wired to a non-aggregation handler")
                .clone();
            for origin in &self.input_origins {
                handler.handle_origin_eos(*origin, pctx)?;
            }
        }
        Ok(())
    }
}

/// Probe-side stage: walks the source maps of a triggered window, combines
/// them into the final map, and materializes the lowered records downstream.
pub struct AggregationProbeStage {
    pub handler_index: usize,
    pub emit: EmitOperator,
}

impl PipelineStage for AggregationProbeStage {
    fn execute(
        &self,
        input: &TupleBuffer,
        ctx: &mut WorkerContext,
        pctx: &PipelineExecutionContext,
    ) -> ExecutionResult {
        let handler = pctx
            .operator_handler(self.handler_index)
            .as_aggregation()
            .expect("aggregation probe wired to a non-aggregation handler")
            .clone();
        let records = match handler.probe_window(input) {
            Ok(records) => records,
            Err(error) => {
                debug!("Aggregation probe failed: {error}");
                return ExecutionResult::Failed;
            }
        };
        let mut state = match self.emit.open(ctx, pctx) {
            Ok(state) => state,
            Err(error) => {
                debug!("Aggregation probe could not allocate output: {error}");
                return ExecutionResult::Failed;
            }
        };
        for record in &records {
            if let Err(error) = self.emit.execute(&mut state, record, input, ctx, pctx) {
                debug!("Aggregation probe emit failed: {error}");
                return ExecutionResult::Failed;
            }
        }
        if let Err(error) = self.emit.close(state, input, pctx) {
            debug!("Aggregation probe close failed: {error}");
            return ExecutionResult::Failed;
        }
        ExecutionResult::Ok
    }
}
