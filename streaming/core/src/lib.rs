// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Single-node stream-processing execution core: pooled tuple buffers, a
//! worker pool draining a task queue of per-pipeline work, sequencing and
//! chunking primitives that restore global order, and the windowed keyed
//! aggregation and stream-join state machinery triggered by watermarks.

mod aggregation;
mod aggregation_handler;
mod buffer;
mod buffer_pool;
mod checkpoint;
mod chunk_collector;
mod context;
mod emit;
mod engine;
mod error;
mod hash_map;
mod join_handler;
mod memory_layout;
mod metrics;
mod operators;
mod pipeline;
mod reconfiguration;
mod sequence_ring;
mod sink;
mod slice_store;
mod source;
mod task_queue;
mod watermark;
mod worker;

#[cfg(test)]
mod tests;

pub use aggregation::{AggregationFunction, AggregationKind};
pub use aggregation_handler::{
    read_window_header, write_window_header, AggregationBuildStage, AggregationConfig,
    AggregationOperatorHandler, AggregationProbeStage, AggregationSlice, EMITTED_WINDOW_HEADER,
};
pub use buffer::TupleBuffer;
pub use buffer_pool::{BufferManager, BufferProvider, LocalBufferPool};
pub use checkpoint::{
    CheckpointManager, OperatorStateBlob, OperatorStateKind, OriginProgress, PipelineState,
    ProgressMetadata,
};
pub use chunk_collector::ChunkCollector;
pub use context::Context;
pub use emit::{EmitOperator, EmitOperatorHandler, EmitState};
pub use engine::{QueryStatus, StreamingEngine};
pub use error::{EngineError, EngineResult};
pub use hash_map::{ChainedHashMap, PagePool};
pub use join_handler::{
    JoinBuildStage, JoinConfig, JoinProbeStage, JoinSide, JoinSideConfig, JoinSlice,
    StreamJoinOperatorHandler,
};
pub use memory_layout::{
    Field, KeyCodec, MemoryLayoutKind, MemoryProvider, PhysicalType, Record, Schema, Value,
    VarSizedData,
};
pub use metrics::{test_metrics, Metrics, NodeMetrics};
pub use operators::{RecordOperator, TransformStage};
pub use pipeline::{
    ExecutablePipeline, ExecutionResult, OperatorHandler, PipelineExecutionContext, PipelineStage,
    PipelineStatus, TerminationType,
};
pub use reconfiguration::{ReconfigurationKind, ReconfigurationMessage};
pub use sequence_ring::{SequenceRingBuffer, StagedBuffer};
pub use sink::{CollectingSink, NullSink, Sink, SinkStage};
pub use slice_store::{
    SliceStore, TriggerableWindow, WindowDefinition, WindowInfo, WindowSlice, WindowTriggerManager,
};
pub use source::{FillResult, Source, SourceConfig, SourceThread, StopToken, WatermarkStrategy};
pub use task_queue::{Task, TaskQueue};
pub use watermark::MultiOriginWatermarkProcessor;
pub use worker::{WorkerContext, WorkerPool};
