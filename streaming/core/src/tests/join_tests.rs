// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use streaming_config::{OriginId, PipelineId, QueryId};

use crate::emit::{EmitOperator, EmitOperatorHandler};
use crate::engine::StreamingEngine;
use crate::join_handler::{
    JoinBuildStage, JoinConfig, JoinProbeStage, JoinSide, JoinSideConfig, StreamJoinOperatorHandler,
};
use crate::memory_layout::{Field, MemoryProvider, PhysicalType, Record, Schema, Value};
use crate::pipeline::{ExecutablePipeline, OperatorHandler};
use crate::sink::{CollectingSink, SinkStage};
use crate::slice_store::WindowDefinition;
use crate::source::{SourceConfig, WatermarkStrategy};
use crate::tests::common::{test_context, u64_of, VecBatchSource};

fn side_schema(value_field: &str) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("ts", PhysicalType::U64),
        Field::new("k", PhysicalType::U64),
        Field::new(value_field, PhysicalType::U64),
    ]))
}

fn side_record(value_field: &str, ts: u64, k: u64, value: u64) -> Record {
    let mut record = Record::new();
    record.write("ts", Value::U64(ts));
    record.write("k", Value::U64(k));
    record.write(value_field, Value::U64(value));
    record
}

/// Two-stream inner join on `k` within one tumbling window. The output is
/// the equi-join of both inputs and identical across worker pool sizes.
#[rstest]
#[case(1)]
#[case(4)]
#[case(8)]
fn two_stream_inner_join_on_key(#[case] workers: usize) {
    let context = test_context(workers);
    let engine = StreamingEngine::new(context.clone()).unwrap();
    let left_schema = side_schema("a");
    let right_schema = side_schema("b");
    let left_provider = MemoryProvider::row(left_schema.clone());
    let right_provider = MemoryProvider::row(right_schema.clone());
    let left_origin = OriginId(1);
    let right_origin = OriginId(2);

    let handler = StreamJoinOperatorHandler::new(
        JoinConfig {
            left: JoinSideConfig {
                origins: vec![left_origin],
                schema: left_schema,
                timestamp_field: "ts".to_string(),
                key_fields: vec!["k".to_string()],
            },
            right: JoinSideConfig {
                origins: vec![right_origin],
                schema: right_schema,
                timestamp_field: "ts".to_string(),
                key_fields: vec!["k".to_string()],
            },
            output_origin: OriginId(70),
            window: WindowDefinition::tumbling(4),
        },
        context,
    )
    .unwrap();

    let left_build = ExecutablePipeline::new(
        PipelineId(70),
        engine.context().clone(),
        Box::new(JoinBuildStage {
            handler_index: 0,
            side: JoinSide::Left,
            input_provider: left_provider.clone(),
            input_origins: vec![left_origin],
        }),
        vec![OperatorHandler::Join(handler.clone())],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );
    let right_build = ExecutablePipeline::new(
        PipelineId(71),
        engine.context().clone(),
        Box::new(JoinBuildStage {
            handler_index: 0,
            side: JoinSide::Right,
            input_provider: right_provider.clone(),
            input_origins: vec![right_origin],
        }),
        vec![OperatorHandler::Join(handler.clone())],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );

    let output_provider = MemoryProvider::row(handler.output_schema());
    let probe = ExecutablePipeline::new(
        PipelineId(72),
        engine.context().clone(),
        Box::new(JoinProbeStage {
            handler_index: 0,
            emit: EmitOperator::new(output_provider.clone(), 1),
        }),
        vec![
            OperatorHandler::Join(handler.clone()),
            OperatorHandler::Emit(Arc::new(EmitOperatorHandler::new())),
        ],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );
    let sink = CollectingSink::new(output_provider);
    let sink_p = ExecutablePipeline::new(
        PipelineId(73),
        engine.context().clone(),
        Box::new(SinkStage::new(sink.clone())),
        vec![],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );

    left_build.connect_successor(&probe);
    right_build.connect_successor(&probe);
    probe.connect_successor(&sink_p);
    left_build.register_producer();
    right_build.register_producer();

    let left_source = VecBatchSource::new(
        left_provider.clone(),
        vec![vec![
            side_record("a", 1, 1, 10),
            side_record("a", 2, 2, 20),
        ]],
    );
    let right_source = VecBatchSource::new(
        right_provider.clone(),
        vec![vec![
            side_record("b", 1, 1, 100),
            side_record("b", 2, 1, 200),
            side_record("b", 3, 2, 100),
            side_record("b", 4, 2, 200),
        ]],
    );

    engine
        .start_query(
            QueryId(1),
            vec![left_build.clone(), right_build.clone(), probe, sink_p],
            vec![
                (
                    left_source,
                    SourceConfig {
                        origin: left_origin,
                        successors: vec![left_build],
                        watermark_strategy: WatermarkStrategy::EventTime {
                            field: "ts".to_string(),
                            provider: left_provider,
                        },
                    },
                ),
                (
                    right_source,
                    SourceConfig {
                        origin: right_origin,
                        successors: vec![right_build],
                        watermark_strategy: WatermarkStrategy::EventTime {
                            field: "ts".to_string(),
                            provider: right_provider,
                        },
                    },
                ),
            ],
        )
        .unwrap();
    assert!(engine.await_termination(QueryId(1), Duration::from_secs(10)));
    assert!(sink.wait_for_end_of_stream(Duration::from_secs(5)));

    let mut rows: Vec<(u64, u64, u64, u64, u64)> = sink
        .records()
        .iter()
        .map(|record| {
            (
                u64_of(record, "window_start"),
                u64_of(record, "window_end"),
                u64_of(record, "left_k"),
                u64_of(record, "left_a"),
                u64_of(record, "right_b"),
            )
        })
        .collect();
    rows.sort_unstable();
    assert_eq!(
        rows,
        vec![
            (1, 5, 1, 10, 100),
            (1, 5, 1, 10, 200),
            (1, 5, 2, 20, 100),
            (1, 5, 2, 20, 200),
        ]
    );

    // Every join row matches keys across sides.
    for record in sink.records() {
        assert_eq!(u64_of(&record, "left_k"), u64_of(&record, "right_k"));
    }
}

/// A sequence whose chunks are split across slices: both chunks of the left
/// side land in different windows, and the spanning-chunk tracking claims
/// the boundary exactly once while both windows still join correctly.
#[test]
fn chunked_sequence_spanning_two_slices() {
    let context = test_context(2);
    let engine = StreamingEngine::new(context.clone()).unwrap();
    let left_schema = side_schema("a");
    let right_schema = side_schema("b");
    let left_provider = MemoryProvider::row(left_schema.clone());
    let right_provider = MemoryProvider::row(right_schema.clone());
    let left_origin = OriginId(1);
    let right_origin = OriginId(2);

    let handler = StreamJoinOperatorHandler::new(
        JoinConfig {
            left: JoinSideConfig {
                origins: vec![left_origin],
                schema: left_schema,
                timestamp_field: "ts".to_string(),
                key_fields: vec!["k".to_string()],
            },
            right: JoinSideConfig {
                origins: vec![right_origin],
                schema: right_schema,
                timestamp_field: "ts".to_string(),
                key_fields: vec!["k".to_string()],
            },
            output_origin: OriginId(80),
            window: WindowDefinition::tumbling(4),
        },
        context,
    )
    .unwrap();

    let left_build = ExecutablePipeline::new(
        PipelineId(80),
        engine.context().clone(),
        Box::new(JoinBuildStage {
            handler_index: 0,
            side: JoinSide::Left,
            input_provider: left_provider.clone(),
            input_origins: vec![left_origin],
        }),
        vec![OperatorHandler::Join(handler.clone())],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );
    let right_build = ExecutablePipeline::new(
        PipelineId(81),
        engine.context().clone(),
        Box::new(JoinBuildStage {
            handler_index: 0,
            side: JoinSide::Right,
            input_provider: right_provider.clone(),
            input_origins: vec![right_origin],
        }),
        vec![OperatorHandler::Join(handler.clone())],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );
    let output_provider = MemoryProvider::row(handler.output_schema());
    let probe = ExecutablePipeline::new(
        PipelineId(82),
        engine.context().clone(),
        Box::new(JoinProbeStage {
            handler_index: 0,
            emit: EmitOperator::new(output_provider.clone(), 1),
        }),
        vec![
            OperatorHandler::Join(handler.clone()),
            OperatorHandler::Emit(Arc::new(EmitOperatorHandler::new())),
        ],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );
    let sink = CollectingSink::new(output_provider);
    let sink_p = ExecutablePipeline::new(
        PipelineId(83),
        engine.context().clone(),
        Box::new(SinkStage::new(sink.clone())),
        vec![],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );
    left_build.connect_successor(&probe);
    right_build.connect_successor(&probe);
    probe.connect_successor(&sink_p);
    left_build.register_producer();
    right_build.register_producer();

    // The left source forwards pre-stamped buffers: sequence 1 arrives in
    // two chunks whose records fall into the windows [1, 5) and [5, 9).
    let left_source = ChunkedSource::new(
        left_provider.clone(),
        left_origin,
        vec![
            (vec![side_record("a", 1, 1, 10)], 1, 1, false, 1),
            (vec![side_record("a", 6, 1, 11)], 1, 2, true, 6),
        ],
    );
    let right_source = VecBatchSource::new(
        right_provider.clone(),
        vec![vec![
            side_record("b", 2, 1, 100),
            side_record("b", 7, 1, 200),
            side_record("b", 8, 2, 300),
        ]],
    );

    engine
        .start_query(
            QueryId(1),
            vec![left_build.clone(), right_build.clone(), probe, sink_p],
            vec![
                (
                    left_source,
                    SourceConfig {
                        origin: left_origin,
                        successors: vec![left_build],
                        watermark_strategy: WatermarkStrategy::IngestionTime,
                    },
                ),
                (
                    right_source,
                    SourceConfig {
                        origin: right_origin,
                        successors: vec![right_build],
                        watermark_strategy: WatermarkStrategy::EventTime {
                            field: "ts".to_string(),
                            provider: right_provider,
                        },
                    },
                ),
            ],
        )
        .unwrap();
    assert!(engine.await_termination(QueryId(1), Duration::from_secs(10)));
    assert!(sink.wait_for_end_of_stream(Duration::from_secs(5)));

    let mut rows: Vec<(u64, u64, u64)> = sink
        .records()
        .iter()
        .map(|record| {
            (
                u64_of(record, "window_start"),
                u64_of(record, "left_a"),
                u64_of(record, "right_b"),
            )
        })
        .collect();
    rows.sort_unstable();
    // Window [1, 5): left (k=1, a=10) x right (k=1, b=100).
    // Window [5, 9): left (k=1, a=11) x right (k=1, b=200).
    assert_eq!(rows, vec![(1, 10, 100), (5, 11, 200)]);
}

/// A source that stamps its own sequence metadata, emitting pre-chunked
/// buffers.
struct ChunkedSource {
    provider: MemoryProvider,
    origin: OriginId,
    batches: std::collections::VecDeque<(Vec<Record>, u64, u64, bool, u64)>,
}

impl ChunkedSource {
    fn new(
        provider: MemoryProvider,
        origin: OriginId,
        batches: Vec<(Vec<Record>, u64, u64, bool, u64)>,
    ) -> Box<dyn crate::source::Source> {
        Box::new(Self {
            provider,
            origin,
            batches: batches.into(),
        })
    }
}

impl crate::source::Source for ChunkedSource {
    fn fill_tuple_buffer(
        &mut self,
        buffer: &mut crate::buffer::TupleBuffer,
        stop_token: &crate::source::StopToken,
    ) -> crate::error::EngineResult<crate::source::FillResult> {
        if stop_token.is_stopped() {
            return Ok(crate::source::FillResult { tuples: 0 });
        }
        let Some((batch, sequence, chunk, last_chunk, watermark)) = self.batches.pop_front()
        else {
            return Ok(crate::source::FillResult { tuples: 0 });
        };
        for (index, record) in batch.iter().enumerate() {
            self.provider.write_record(buffer, index, record)?;
        }
        buffer.set_origin_id(self.origin);
        buffer.set_sequence_data(streaming_config::SequenceData::new(
            sequence, chunk, last_chunk,
        ));
        buffer.set_watermark(watermark);
        Ok(crate::source::FillResult {
            tuples: batch.len() as u64,
        })
    }

    fn adds_metadata(&self) -> bool {
        true
    }
}
