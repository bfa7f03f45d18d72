// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use streaming_config::{OriginId, SequenceData, Timestamp, INITIAL_SEQUENCE_NUMBER};
use tracing::{debug, warn};

use crate::buffer::TupleBuffer;
use crate::buffer_pool::{BufferManager, BufferProvider, LocalBufferPool};
use crate::context::Context;
use crate::error::EngineResult;
use crate::memory_layout::MemoryProvider;
use crate::pipeline::ExecutablePipeline;
use crate::task_queue::{Task, TaskQueue};

/// Cooperative cancellation flag shared between a source thread and the
/// engine. Blocking I/O inside `fill_tuple_buffer` is expected to poll it
/// and return an empty fill instead of raising an error.
#[derive(Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

pub struct FillResult {
    pub tuples: u64,
}

/// A data source filling tuple buffers. An empty fill with an unset stop
/// token is the end of stream; an empty fill with a set stop token is a
/// cancellation.
pub trait Source: Send {
    fn open(&mut self, buffer_provider: &dyn BufferProvider) -> EngineResult<()> {
        let _ = buffer_provider;
        Ok(())
    }

    fn fill_tuple_buffer(
        &mut self,
        buffer: &mut TupleBuffer,
        stop_token: &StopToken,
    ) -> EngineResult<FillResult>;

    fn close(&mut self) -> EngineResult<()> {
        Ok(())
    }

    /// Whether the source stamps sequence metadata itself (network sources
    /// forwarding buffers from another node do).
    fn adds_metadata(&self) -> bool {
        false
    }
}

/// Per-source watermark assignment. Watermarks are monotonic per origin and
/// stamped per buffer.
pub enum WatermarkStrategy {
    /// Highest value of an event-time field seen so far.
    EventTime {
        field: String,
        provider: MemoryProvider,
    },
    /// Wall-clock time at buffer emission.
    IngestionTime,
}

impl WatermarkStrategy {
    fn watermark_for(
        &self,
        buffer: &TupleBuffer,
        tuples: u64,
        previous: Timestamp,
    ) -> EngineResult<Timestamp> {
        match self {
            WatermarkStrategy::EventTime { field, provider } => {
                let mut watermark = previous;
                for index in 0..tuples as usize {
                    let record = provider.read_record(buffer, index)?;
                    if let Some(ts) = record.read(field)?.to_u64() {
                        watermark = watermark.max(ts);
                    }
                }
                Ok(watermark)
            }
            WatermarkStrategy::IngestionTime => Ok(now_millis().max(previous)),
        }
    }
}

fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as Timestamp)
        .unwrap_or(0)
}

pub struct SourceConfig {
    pub origin: OriginId,
    pub successors: Vec<Arc<ExecutablePipeline>>,
    pub watermark_strategy: WatermarkStrategy,
}

/// One detached thread per data source: fill a local-pool buffer, stamp
/// `(origin, sequence, chunk 1, last chunk, watermark)`, enqueue for the
/// first pipeline, repeat until end of stream or stop. On exit the end of
/// stream is propagated to every successor.
pub struct SourceThread {
    origin: OriginId,
    stop_token: StopToken,
    handle: Option<thread::JoinHandle<()>>,
}

impl SourceThread {
    pub fn start(
        context: Arc<Context>,
        mut source: Box<dyn Source>,
        config: SourceConfig,
        buffer_manager: BufferManager,
        task_queue: TaskQueue,
    ) -> Self {
        let stop_token = StopToken::new();
        let thread_token = stop_token.clone();
        let origin = config.origin;
        let handle = thread::Builder::new()
            .name(format!("streaming-source-{}", origin.0))
            .spawn(move || {
                run_source(context, source.as_mut(), config, buffer_manager, task_queue, thread_token);
            })
            .expect("failed to spawn source thread");
        Self {
            origin,
            stop_token,
            handle: Some(handle),
        }
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    /// Requests a cooperative stop; already-produced buffers stay in flight.
    pub fn stop(&self) {
        self.stop_token.stop();
    }

    /// Waits for the source thread to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for SourceThread {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn run_source(
    context: Arc<Context>,
    source: &mut dyn Source,
    config: SourceConfig,
    buffer_manager: BufferManager,
    task_queue: TaskQueue,
    stop_token: StopToken,
) {
    let origin = config.origin;
    debug!("Source {origin} started");
    let local_pool = LocalBufferPool::new(&buffer_manager, context.parameters.local_pool_buffers);
    if let Err(error) = source.open(&local_pool) {
        warn!("Source {origin} failed to open: {error}");
        propagate_eos(&config);
        return;
    }

    let mut sequence = INITIAL_SEQUENCE_NUMBER;
    let mut watermark = Timestamp::MIN;
    loop {
        let mut buffer = local_pool.get_buffer_blocking();
        match source.fill_tuple_buffer(&mut buffer, &stop_token) {
            Ok(FillResult { tuples: 0 }) => {
                if stop_token.is_stopped() {
                    debug!("Source {origin} cancelled");
                } else {
                    debug!("Source {origin} reached end of stream");
                }
                break;
            }
            Ok(FillResult { tuples }) => {
                buffer.set_number_of_tuples(tuples);
                if !source.adds_metadata() {
                    watermark = match config
                        .watermark_strategy
                        .watermark_for(&buffer, tuples, watermark)
                    {
                        Ok(watermark) => watermark,
                        Err(error) => {
                            warn!("Source {origin} failed to assign a watermark: {error}");
                            break;
                        }
                    };
                    buffer.set_origin_id(origin);
                    buffer.set_sequence_data(SequenceData::unchunked(sequence));
                    buffer.set_watermark(watermark);
                    buffer.set_creation_timestamp(now_millis());
                    sequence += 1;
                }
                context
                    .metrics
                    .node_metrics
                    .source_buffers_emitted
                    .inc();
                for successor in &config.successors {
                    task_queue.push(Task::Execute {
                        pipeline: successor.clone(),
                        buffer: buffer.clone(),
                    });
                }
                drop(buffer);
            }
            Err(error) => {
                // A failing source retires its origin with a final EOS.
                warn!("Source {origin} failed: {error}");
                break;
            }
        }
    }

    if let Err(error) = source.close() {
        warn!("Source {origin} failed to close: {error}");
    }
    propagate_eos(&config);
    debug!("Source {origin} exited");
}

fn propagate_eos(config: &SourceConfig) {
    for successor in &config.successors {
        successor.on_predecessor_eos();
    }
}
