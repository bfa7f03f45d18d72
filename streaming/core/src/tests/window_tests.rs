// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use streaming_config::{OriginId, PipelineId, QueryId};

use crate::aggregation::{AggregationFunction, AggregationKind};
use crate::aggregation_handler::{
    AggregationBuildStage, AggregationConfig, AggregationOperatorHandler, AggregationProbeStage,
};
use crate::emit::{EmitOperator, EmitOperatorHandler};
use crate::engine::StreamingEngine;
use crate::memory_layout::{Field, MemoryProvider, PhysicalType, Record, Schema, Value};
use crate::pipeline::{ExecutablePipeline, OperatorHandler};
use crate::sink::{CollectingSink, SinkStage};
use crate::slice_store::WindowDefinition;
use crate::source::{SourceConfig, WatermarkStrategy};
use crate::tests::common::{f64_of, test_context, u64_of, VecBatchSource};

fn ts_value_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("ts", PhysicalType::U64),
        Field::new("v", PhysicalType::U64),
    ]))
}

fn ts_value_record(ts: u64, v: u64) -> Record {
    let mut record = Record::new();
    record.write("ts", Value::U64(ts));
    record.write("v", Value::U64(v));
    record
}

/// Wires source -> build -> probe -> sink for one aggregation and runs the
/// batches to completion. Returns the sink with the lowered window rows.
fn run_aggregation(
    workers: usize,
    window: WindowDefinition,
    key_fields: Vec<String>,
    functions: Vec<AggregationFunction>,
    batches: Vec<Vec<Record>>,
) -> Arc<CollectingSink> {
    let context = test_context(workers);
    let engine = StreamingEngine::new(context.clone()).unwrap();
    let input_provider = MemoryProvider::row(ts_value_schema());
    let origin = OriginId(1);

    let handler = AggregationOperatorHandler::new(
        AggregationConfig {
            input_origins: vec![origin],
            output_origin: OriginId(50),
            window,
            input_schema: ts_value_schema(),
            timestamp_field: "ts".to_string(),
            key_fields,
            functions,
        },
        context,
    )
    .unwrap();

    let build = ExecutablePipeline::new(
        PipelineId(50),
        engine.context().clone(),
        Box::new(AggregationBuildStage {
            handler_index: 0,
            input_provider: input_provider.clone(),
            input_origins: vec![origin],
        }),
        vec![OperatorHandler::Aggregation(handler.clone())],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );

    let output_provider = MemoryProvider::row(handler.output_schema());
    let probe = ExecutablePipeline::new(
        PipelineId(51),
        engine.context().clone(),
        Box::new(AggregationProbeStage {
            handler_index: 0,
            emit: EmitOperator::new(output_provider.clone(), 1),
        }),
        vec![
            OperatorHandler::Aggregation(handler.clone()),
            OperatorHandler::Emit(Arc::new(EmitOperatorHandler::new())),
        ],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );

    let sink = CollectingSink::new(output_provider);
    let sink_p = ExecutablePipeline::new(
        PipelineId(52),
        engine.context().clone(),
        Box::new(SinkStage::new(sink.clone())),
        vec![],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );

    build.connect_successor(&probe);
    probe.connect_successor(&sink_p);
    build.register_producer();

    let source = VecBatchSource::new(input_provider.clone(), batches);
    engine
        .start_query(
            QueryId(1),
            vec![build.clone(), probe, sink_p],
            vec![(
                source,
                SourceConfig {
                    origin,
                    successors: vec![build],
                    watermark_strategy: WatermarkStrategy::EventTime {
                        field: "ts".to_string(),
                        provider: input_provider,
                    },
                },
            )],
        )
        .unwrap();
    assert!(engine.await_termination(QueryId(1), Duration::from_secs(10)));
    assert!(sink.wait_for_end_of_stream(Duration::from_secs(5)));
    sink
}

/// Tumbling sum: `ts = 1..1000, v = 1`, window size 100. Exactly ten rows
/// with sum 100 and borders (1,101), (101,201), ..., (901,1001).
#[test]
fn tumbling_window_sum() {
    let batches: Vec<Vec<Record>> = (0..10)
        .map(|batch| {
            (1..=100)
                .map(|offset| ts_value_record(batch * 100 + offset, 1))
                .collect()
        })
        .collect();

    let sink = run_aggregation(
        4,
        WindowDefinition::tumbling(100),
        vec![],
        vec![AggregationFunction::new(
            AggregationKind::Sum,
            "v",
            "sum",
            PhysicalType::U64,
        )],
        batches,
    );

    let rows: Vec<(u64, u64, u64)> = sink
        .records()
        .iter()
        .map(|record| {
            (
                u64_of(record, "window_start"),
                u64_of(record, "window_end"),
                u64_of(record, "sum"),
            )
        })
        .collect();
    let expected: Vec<(u64, u64, u64)> = (0..10)
        .map(|window| (window * 100 + 1, window * 100 + 101, 100))
        .collect();
    assert_eq!(rows, expected);
}

/// Sliding average: `ts = 1..20, v = ts`, size 10, slide 5. Three complete
/// windows: (1,11) -> 5.5, (6,16) -> 10.5, (11,21) -> 15.5.
#[test]
fn sliding_window_avg() {
    let batches: Vec<Vec<Record>> = vec![
        (1..=10).map(|ts| ts_value_record(ts, ts)).collect(),
        (11..=20).map(|ts| ts_value_record(ts, ts)).collect(),
    ];

    let sink = run_aggregation(
        4,
        WindowDefinition::sliding(10, 5),
        vec![],
        vec![AggregationFunction::new(
            AggregationKind::Avg,
            "v",
            "avg",
            PhysicalType::U64,
        )],
        batches,
    );

    let rows: Vec<(u64, u64, f64)> = sink
        .records()
        .iter()
        .map(|record| {
            (
                u64_of(record, "window_start"),
                u64_of(record, "window_end"),
                f64_of(record, "avg"),
            )
        })
        .collect();
    assert_eq!(rows, vec![(1, 11, 5.5), (6, 16, 10.5), (11, 21, 15.5)]);
}

/// Keyed tumbling aggregation: per-key sums and counts stay separate and
/// every window row carries its group key.
#[test]
fn keyed_tumbling_window() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("ts", PhysicalType::U64),
        Field::new("v", PhysicalType::U64),
        Field::new("k", PhysicalType::U64),
    ]));
    let context = test_context(2);
    let engine = StreamingEngine::new(context.clone()).unwrap();
    let input_provider = MemoryProvider::row(schema.clone());
    let origin = OriginId(1);

    let handler = AggregationOperatorHandler::new(
        AggregationConfig {
            input_origins: vec![origin],
            output_origin: OriginId(60),
            window: WindowDefinition::tumbling(50),
            input_schema: schema,
            timestamp_field: "ts".to_string(),
            key_fields: vec!["k".to_string()],
            functions: vec![
                AggregationFunction::new(AggregationKind::Sum, "v", "sum", PhysicalType::U64),
                AggregationFunction::new(AggregationKind::Count, "v", "cnt", PhysicalType::U64),
            ],
        },
        context,
    )
    .unwrap();

    let build = ExecutablePipeline::new(
        PipelineId(60),
        engine.context().clone(),
        Box::new(AggregationBuildStage {
            handler_index: 0,
            input_provider: input_provider.clone(),
            input_origins: vec![origin],
        }),
        vec![OperatorHandler::Aggregation(handler.clone())],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );
    let output_provider = MemoryProvider::row(handler.output_schema());
    let probe = ExecutablePipeline::new(
        PipelineId(61),
        engine.context().clone(),
        Box::new(AggregationProbeStage {
            handler_index: 0,
            emit: EmitOperator::new(output_provider.clone(), 1),
        }),
        vec![
            OperatorHandler::Aggregation(handler.clone()),
            OperatorHandler::Emit(Arc::new(EmitOperatorHandler::new())),
        ],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );
    let sink = CollectingSink::new(output_provider);
    let sink_p = ExecutablePipeline::new(
        PipelineId(62),
        engine.context().clone(),
        Box::new(SinkStage::new(sink.clone())),
        vec![],
        engine.task_queue().clone(),
        engine.buffer_manager().clone(),
    );
    build.connect_successor(&probe);
    probe.connect_successor(&sink_p);
    build.register_producer();

    // 100 records, keys alternate 0/1, v = 1. Two tumbling windows of 50.
    let batch: Vec<Record> = (1..=100u64)
        .map(|ts| {
            let mut record = Record::new();
            record.write("ts", Value::U64(ts));
            record.write("v", Value::U64(1));
            record.write("k", Value::U64(ts % 2));
            record
        })
        .collect();
    let source = VecBatchSource::new(input_provider.clone(), vec![batch]);
    engine
        .start_query(
            QueryId(1),
            vec![build.clone(), probe, sink_p],
            vec![(
                source,
                SourceConfig {
                    origin,
                    successors: vec![build],
                    watermark_strategy: WatermarkStrategy::EventTime {
                        field: "ts".to_string(),
                        provider: input_provider,
                    },
                },
            )],
        )
        .unwrap();
    assert!(engine.await_termination(QueryId(1), Duration::from_secs(10)));
    assert!(sink.wait_for_end_of_stream(Duration::from_secs(5)));

    let mut rows: Vec<(u64, u64, u64, u64)> = sink
        .records()
        .iter()
        .map(|record| {
            (
                u64_of(record, "window_start"),
                u64_of(record, "k"),
                u64_of(record, "sum"),
                u64_of(record, "cnt"),
            )
        })
        .collect();
    rows.sort_unstable();
    assert_eq!(
        rows,
        vec![
            (1, 0, 25, 25),
            (1, 1, 25, 25),
            (51, 0, 25, 25),
            (51, 1, 25, 25),
        ]
    );
}
