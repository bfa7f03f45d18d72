// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use streaming_config::{OriginId, PipelineId, QueryId, Timestamp};

use crate::buffer::TupleBuffer;
use crate::chunk_collector::ChunkCollector;
use crate::emit::{EmitOperator, EmitOperatorHandler};
use crate::engine::{QueryStatus, StreamingEngine};
use crate::error::EngineResult;
use crate::memory_layout::{Field, MemoryProvider, PhysicalType, Record, Schema, Value};
use crate::operators::{RecordOperator, TransformStage};
use crate::pipeline::{ExecutablePipeline, OperatorHandler, PipelineStage};
use crate::sink::{CollectingSink, Sink, SinkStage};
use crate::source::{SourceConfig, WatermarkStrategy};
use crate::tests::common::{test_context, u64_of, EndlessSource, VecBatchSource};

fn transform_pipeline(
    engine: &StreamingEngine,
    id: u64,
    input_provider: MemoryProvider,
    operators: Vec<RecordOperator>,
    output_provider: MemoryProvider,
) -> Arc<ExecutablePipeline> {
    let stage = TransformStage::new(input_provider, operators, EmitOperator::new(output_provider, 0));
    ExecutablePipeline::new(
        PipelineId(id),
        engine.context().clone(),
        Box::new(stage),
        vec![OperatorHandler::Emit(Arc::new(EmitOperatorHandler::new()))],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    )
}

fn sink_pipeline(
    engine: &StreamingEngine,
    id: u64,
    stage: impl PipelineStage + 'static,
) -> Arc<ExecutablePipeline> {
    ExecutablePipeline::new(
        PipelineId(id),
        engine.context().clone(),
        Box::new(stage),
        vec![],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    )
}

fn id_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![Field::new("id", PhysicalType::U32)]))
}

/// Single-origin filter: ids 0..99 in 10 buffers of 10, `filter id < 50`,
/// expecting ids 0..49 in order at the sink plus a terminal end of stream.
#[test]
fn single_origin_filter_delivers_in_order() {
    let engine = StreamingEngine::new(test_context(4)).unwrap();
    let provider = MemoryProvider::row(id_schema());

    let batches: Vec<Vec<Record>> = (0..10)
        .map(|batch| {
            (0..10)
                .map(|offset| {
                    let mut record = Record::new();
                    record.write("id", Value::U32(batch * 10 + offset));
                    record
                })
                .collect()
        })
        .collect();

    let filter = transform_pipeline(
        &engine,
        10,
        provider.clone(),
        vec![RecordOperator::filter(|record| u64_of(record, "id") < 50)],
        provider.clone(),
    );
    let sink = CollectingSink::new(provider.clone());
    let sink_p = sink_pipeline(&engine, 11, SinkStage::new(sink.clone()));
    filter.connect_successor(&sink_p);
    filter.register_producer();

    let source = VecBatchSource::new(provider.clone(), batches);
    engine
        .start_query(
            QueryId(1),
            vec![filter.clone(), sink_p],
            vec![(
                source,
                SourceConfig {
                    origin: OriginId(1),
                    successors: vec![filter],
                    watermark_strategy: WatermarkStrategy::IngestionTime,
                },
            )],
        )
        .unwrap();

    assert!(engine.await_termination(QueryId(1), Duration::from_secs(10)));
    assert!(sink.wait_for_end_of_stream(Duration::from_secs(5)));
    assert_eq!(engine.query_status(QueryId(1)), Some(QueryStatus::Stopped));

    let ids: Vec<u64> = sink
        .records()
        .iter()
        .map(|record| u64_of(record, "id"))
        .collect();
    assert_eq!(ids, (0..50).collect::<Vec<u64>>());
}

/// Soft stop mid-stream: every buffer the source produced before the stop
/// reaches the sink, nothing is dropped, and the sink observes the terminal
/// end of stream within the grace period.
#[test]
fn soft_stop_drains_in_flight_buffers() {
    let engine = StreamingEngine::new(test_context(2)).unwrap();
    let provider = MemoryProvider::row(id_schema());

    let batch: Vec<Record> = (0..10u32)
        .map(|id| {
            let mut record = Record::new();
            record.write("id", Value::U32(id));
            record
        })
        .collect();
    let (source, produced_records) = EndlessSource::new(provider.clone(), batch);

    let forward = transform_pipeline(&engine, 20, provider.clone(), vec![], provider.clone());
    let sink = CollectingSink::new(provider.clone());
    let sink_p = sink_pipeline(&engine, 21, SinkStage::new(sink.clone()));
    forward.connect_successor(&sink_p);
    forward.register_producer();

    engine
        .start_query(
            QueryId(2),
            vec![forward.clone(), sink_p],
            vec![(
                source,
                SourceConfig {
                    origin: OriginId(1),
                    successors: vec![forward],
                    watermark_strategy: WatermarkStrategy::IngestionTime,
                },
            )],
        )
        .unwrap();

    thread::sleep(Duration::from_millis(100));
    engine.stop_query(QueryId(2)).unwrap();

    assert!(engine.await_termination(QueryId(2), Duration::from_secs(10)));
    assert!(sink.wait_for_end_of_stream(Duration::from_secs(5)));

    let produced = produced_records.load(std::sync::atomic::Ordering::Acquire);
    assert!(produced > 0, "source never produced");
    assert_eq!(sink.records().len() as u64, produced);
}

/// Captures buffer metadata at the sink and replays it through a chunk
/// collector, mirroring what a network sink does before reordering.
struct ChunkCapturingSink {
    collector: ChunkCollector,
    buffers: Mutex<Vec<(u64, u64, bool, u64)>>,
    completions: Mutex<Vec<(u64, Timestamp)>>,
}

impl ChunkCapturingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            collector: ChunkCollector::new(64),
            buffers: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
        })
    }
}

impl Sink for ChunkCapturingSink {
    fn write_buffer(&self, buffer: &TupleBuffer) -> EngineResult<()> {
        self.buffers.lock().push((
            buffer.sequence_number(),
            buffer.chunk_number(),
            buffer.is_last_chunk(),
            buffer.number_of_tuples(),
        ));
        if let Some(done) = self
            .collector
            .collect(buffer.sequence_data(), buffer.watermark())
        {
            self.completions.lock().push(done);
        }
        Ok(())
    }
}

/// Chunked emit: 2500 records into 1024-record output buffers must arrive
/// as chunks 1..3 of one sequence with the seal on chunk 3, and the chunk
/// collector must report the sequence exactly once.
#[test]
fn chunked_emit_seals_the_last_chunk() {
    let engine = StreamingEngine::new(test_context(2)).unwrap();
    let input_provider = MemoryProvider::row(id_schema());
    // 16 bytes per output tuple in a 16 KiB buffer: 1024 records per chunk.
    let output_schema = Arc::new(Schema::new(vec![
        Field::new("id", PhysicalType::U32),
        Field::new("checksum", PhysicalType::U64),
        Field::new("flags", PhysicalType::U32),
    ]));
    let output_provider = MemoryProvider::row(output_schema);

    let batch: Vec<Record> = (0..2500u32)
        .map(|id| {
            let mut record = Record::new();
            record.write("id", Value::U32(id));
            record
        })
        .collect();

    let widen = transform_pipeline(
        &engine,
        30,
        input_provider.clone(),
        vec![RecordOperator::map(|mut record| {
            let id = u64_of(&record, "id");
            record.write("checksum", Value::U64(id * 31));
            record.write("flags", Value::U32(0));
            record
        })],
        output_provider.clone(),
    );
    let sink = ChunkCapturingSink::new();
    let sink_p = sink_pipeline(&engine, 31, SinkStage::new(sink.clone()));
    widen.connect_successor(&sink_p);
    widen.register_producer();

    let source = VecBatchSource::new(input_provider.clone(), vec![batch]);
    engine
        .start_query(
            QueryId(3),
            vec![widen.clone(), sink_p],
            vec![(
                source,
                SourceConfig {
                    origin: OriginId(1),
                    successors: vec![widen],
                    watermark_strategy: WatermarkStrategy::IngestionTime,
                },
            )],
        )
        .unwrap();
    assert!(engine.await_termination(QueryId(3), Duration::from_secs(10)));

    let mut buffers = sink.buffers.lock().clone();
    buffers.sort_by_key(|(sequence, chunk, _, _)| (*sequence, *chunk));
    assert_eq!(buffers.len(), 3);
    assert_eq!(buffers[0], (1, 1, false, 1024));
    assert_eq!(buffers[1], (1, 2, false, 1024));
    assert_eq!(buffers[2], (1, 3, true, 452));

    let completions = sink.completions.lock();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0, 1);
}

/// Dropping a whole query hard mid-stream leaves the pool intact: every
/// buffer comes back once the queues drain.
#[test]
fn hard_stop_discards_and_recycles() {
    let context = test_context(2);
    let pool_size = context.parameters.global_pool_buffers;
    let engine = StreamingEngine::new(context).unwrap();
    let provider = MemoryProvider::row(id_schema());

    let batch: Vec<Record> = (0..10u32)
        .map(|id| {
            let mut record = Record::new();
            record.write("id", Value::U32(id));
            record
        })
        .collect();
    let (source, _produced) = EndlessSource::new(provider.clone(), batch);

    let forward = transform_pipeline(&engine, 40, provider.clone(), vec![], provider.clone());
    let sink = CollectingSink::new(provider.clone());
    let sink_p = sink_pipeline(&engine, 41, SinkStage::new(sink.clone()));
    forward.connect_successor(&sink_p);
    forward.register_producer();

    engine
        .start_query(
            QueryId(4),
            vec![forward.clone(), sink_p],
            vec![(
                source,
                SourceConfig {
                    origin: OriginId(1),
                    successors: vec![forward],
                    watermark_strategy: WatermarkStrategy::IngestionTime,
                },
            )],
        )
        .unwrap();

    thread::sleep(Duration::from_millis(50));
    engine.hard_stop_query(QueryId(4)).unwrap();
    assert!(engine.await_termination(QueryId(4), Duration::from_secs(10)));
    engine.shutdown();

    assert_eq!(engine.buffer_manager().available_buffers(), pool_size);
}
