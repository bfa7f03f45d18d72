// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use streaming_config::PipelineId;
use strum_macros::Display;
use tracing::{debug, warn};

use crate::aggregation_handler::AggregationOperatorHandler;
use crate::buffer::TupleBuffer;
use crate::buffer_pool::BufferManager;
use crate::context::Context;
use crate::emit::EmitOperatorHandler;
use crate::error::EngineResult;
use crate::join_handler::StreamJoinOperatorHandler;
use crate::task_queue::{Task, TaskQueue};
use crate::worker::WorkerContext;

/// Outcome of one pipeline stage invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionResult {
    Ok,
    /// The stage will not produce further output for this pipeline.
    Finished,
    Failed,
}

/// How a pipeline (or the query) is being terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum TerminationType {
    Graceful,
    HardStop,
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum PipelineStatus {
    Created = 0,
    Running = 1,
    Stopped = 2,
    Failed = 3,
}

impl PipelineStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineStatus::Created,
            1 => PipelineStatus::Running,
            2 => PipelineStatus::Stopped,
            _ => PipelineStatus::Failed,
        }
    }
}

/// The compiled-stage contract: a callable over `(buffer, worker context,
/// pipeline context)`. The stage reads records from the input buffer via a
/// memory provider, may emit buffers through the pipeline context, and may
/// call into operator handlers referenced by index.
pub trait PipelineStage: Send + Sync {
    /// One-time initialization before the pipeline starts running.
    fn setup(&self, pctx: &PipelineExecutionContext) -> EngineResult<()> {
        let _ = pctx;
        Ok(())
    }

    fn execute(
        &self,
        input: &TupleBuffer,
        ctx: &mut WorkerContext,
        pctx: &PipelineExecutionContext,
    ) -> ExecutionResult;

    /// Called exactly once when the pipeline terminates. A graceful stop may
    /// still emit buffers (flushing windows, sealing chunks).
    fn stop(&self, termination: TerminationType, pctx: &PipelineExecutionContext) -> EngineResult<()> {
        let _ = (termination, pctx);
        Ok(())
    }
}

/// Tagged operator handler, referenced from stages by stable index into the
/// pipeline's handler array.
#[derive(Clone)]
pub enum OperatorHandler {
    Emit(Arc<EmitOperatorHandler>),
    Aggregation(Arc<AggregationOperatorHandler>),
    Join(Arc<StreamJoinOperatorHandler>),
}

impl OperatorHandler {
    pub fn as_emit(&self) -> Option<&Arc<EmitOperatorHandler>> {
        match self {
            OperatorHandler::Emit(handler) => Some(handler),
            _ => None,
        }
    }

    pub fn as_aggregation(&self) -> Option<&Arc<AggregationOperatorHandler>> {
        match self {
            OperatorHandler::Aggregation(handler) => Some(handler),
            _ => None,
        }
    }

    pub fn as_join(&self) -> Option<&Arc<StreamJoinOperatorHandler>> {
        match self {
            OperatorHandler::Join(handler) => Some(handler),
            _ => None,
        }
    }
}

type FailureListener = Arc<dyn Fn(PipelineId, &str) + Send + Sync>;

/// A pipeline with its compiled stage, operator handlers, successors, and
/// lifecycle state.
pub struct ExecutablePipeline {
    id: PipelineId,
    context: Arc<Context>,
    stage: Box<dyn PipelineStage>,
    handlers: Arc<Vec<OperatorHandler>>,
    successors: Mutex<Vec<Arc<ExecutablePipeline>>>,
    status: AtomicU8,
    /// Predecessors (sources or pipelines) that have not yet delivered their
    /// end of stream.
    active_producers: AtomicU32,
    /// Tasks enqueued or currently executing for this pipeline.
    pending_tasks: AtomicU64,
    /// Set once the last producer finished while tasks were still pending.
    draining: AtomicBool,
    fail_reason: Mutex<Option<String>>,
    failure_listener: Mutex<Option<FailureListener>>,
    task_queue: TaskQueue,
    buffer_manager: BufferManager,
}

impl ExecutablePipeline {
    pub fn new(
        id: PipelineId,
        context: Arc<Context>,
        stage: Box<dyn PipelineStage>,
        handlers: Vec<OperatorHandler>,
        task_queue: TaskQueue,
        buffer_manager: BufferManager,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            context,
            stage,
            handlers: Arc::new(handlers),
            successors: Mutex::new(Vec::new()),
            status: AtomicU8::new(PipelineStatus::Created as u8),
            active_producers: AtomicU32::new(0),
            pending_tasks: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            fail_reason: Mutex::new(None),
            failure_listener: Mutex::new(None),
            task_queue,
            buffer_manager,
        })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn fail_reason(&self) -> Option<String> {
        self.fail_reason.lock().clone()
    }

    pub fn set_failure_listener(&self, listener: FailureListener) {
        *self.failure_listener.lock() = Some(listener);
    }

    /// Wires `successor` downstream of this pipeline and accounts for this
    /// pipeline as one of its producers. Build-time only.
    pub fn connect_successor(self: &Arc<Self>, successor: &Arc<ExecutablePipeline>) {
        successor.register_producer();
        self.successors.lock().push(successor.clone());
    }

    /// Accounts for one additional producer (a source or a predecessor
    /// pipeline). Build-time only.
    pub fn register_producer(&self) {
        self.active_producers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn active_producers(&self) -> u32 {
        self.active_producers.load(Ordering::Acquire)
    }

    /// Runs operator setup and transitions `Created -> Running`.
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        let pctx = self.execution_context();
        self.stage.setup(&pctx)?;
        let _previous = self.status.compare_exchange(
            PipelineStatus::Created as u8,
            PipelineStatus::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug_assert!(_previous.is_ok(), "pipeline started twice");
        debug!("Pipeline {} started", self.id);
        Ok(())
    }

    pub(crate) fn task_enqueued(&self) {
        self.pending_tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn task_discarded(&self) {
        self.pending_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn execution_context(self: &Arc<Self>) -> PipelineExecutionContext {
        PipelineExecutionContext {
            pipeline_id: self.id,
            buffer_manager: self.buffer_manager.clone(),
            task_queue: self.task_queue.clone(),
            successors: self.successors.lock().clone(),
            handlers: self.handlers.clone(),
        }
    }

    /// Executes the stage over one input buffer. Buffers for pipelines that
    /// are no longer running are dropped (stopped) or ignored (failed).
    pub fn process(self: &Arc<Self>, buffer: TupleBuffer, ctx: &mut WorkerContext) {
        let metrics = &self.context.metrics.node_metrics;
        match self.status() {
            PipelineStatus::Running => {}
            status => {
                debug!("Dropping buffer for pipeline {} in state {status}", self.id);
                metrics.tasks_dropped.inc();
                drop(buffer);
                self.task_finished();
                return;
            }
        }

        let pctx = self.execution_context();
        let timer = metrics.task_execution_seconds.start_timer();
        let result = self.stage.execute(&buffer, ctx, &pctx);
        timer.observe_duration();
        metrics.tasks_executed.inc();
        drop(buffer);

        if result == ExecutionResult::Failed {
            self.fail("pipeline stage reported failure");
        }
        self.task_finished();
    }

    fn task_finished(self: &Arc<Self>) {
        let pending = self.pending_tasks.fetch_sub(1, Ordering::AcqRel) - 1;
        if pending == 0 && self.draining.load(Ordering::Acquire) {
            self.try_finalize(TerminationType::Graceful);
        }
    }

    /// Called when one producer delivered its end of stream. The pipeline
    /// transitions to `Stopped` once all producers finished and all pending
    /// tasks drained, then propagates the end of stream to its successors.
    pub fn on_predecessor_eos(self: &Arc<Self>) {
        let remaining = self.active_producers.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(
            "Pipeline {}: predecessor finished, {} producers remaining",
            self.id, remaining
        );
        if remaining > 0 {
            return;
        }
        self.draining.store(true, Ordering::Release);
        if self.pending_tasks.load(Ordering::Acquire) == 0 {
            self.try_finalize(TerminationType::Graceful);
        }
    }

    fn try_finalize(self: &Arc<Self>, termination: TerminationType) {
        if self
            .status
            .compare_exchange(
                PipelineStatus::Running as u8,
                PipelineStatus::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let pctx = self.execution_context();
        if let Err(error) = self.stage.stop(termination, &pctx) {
            warn!("Pipeline {} failed while stopping: {error}", self.id);
        }
        debug!("Pipeline {} stopped ({termination})", self.id);
        for successor in pctx.successors {
            successor.on_predecessor_eos();
        }
    }

    /// Immediate stop: no further execution, pending tasks for this pipeline
    /// are discarded from the queue.
    pub fn hard_stop(self: &Arc<Self>) {
        let swapped = self
            .status
            .compare_exchange(
                PipelineStatus::Running as u8,
                PipelineStatus::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .or_else(|_| {
                self.status.compare_exchange(
                    PipelineStatus::Created as u8,
                    PipelineStatus::Stopped as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
            });
        if swapped.is_err() {
            return;
        }
        self.task_queue.discard_pipeline_tasks(self.id);
        let pctx = self.execution_context();
        if let Err(error) = self.stage.stop(TerminationType::HardStop, &pctx) {
            warn!("Pipeline {} failed while hard-stopping: {error}", self.id);
        }
        debug!("Pipeline {} hard-stopped", self.id);
    }

    /// Terminal failure: records the reason, stops execution, and propagates
    /// downstream. The failure listener notifies upstream producers.
    pub fn fail(self: &Arc<Self>, reason: &str) {
        let from_running = self.status.compare_exchange(
            PipelineStatus::Running as u8,
            PipelineStatus::Failed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let swapped = from_running.or_else(|_| {
            self.status.compare_exchange(
                PipelineStatus::Created as u8,
                PipelineStatus::Failed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
        });
        if swapped.is_err() {
            return;
        }
        *self.fail_reason.lock() = Some(reason.to_string());
        self.context.metrics.node_metrics.pipeline_failures.inc();
        warn!("Pipeline {} failed: {reason}", self.id);
        self.task_queue.discard_pipeline_tasks(self.id);
        let pctx = self.execution_context();
        if let Err(error) = self.stage.stop(TerminationType::Failure, &pctx) {
            warn!("Pipeline {} failed while failing: {error}", self.id);
        }
        for successor in pctx.successors {
            successor.fail("upstream pipeline failed");
        }
        let listener = self.failure_listener.lock().clone();
        if let Some(listener) = listener {
            listener(self.id, reason);
        }
    }
}

/// Per-pipeline services handed to a stage invocation: buffer allocation,
/// successor dispatch, and the operator handler array.
pub struct PipelineExecutionContext {
    pipeline_id: PipelineId,
    buffer_manager: BufferManager,
    task_queue: TaskQueue,
    successors: Vec<Arc<ExecutablePipeline>>,
    handlers: Arc<Vec<OperatorHandler>>,
}

impl PipelineExecutionContext {
    /// The pipeline id, which doubles as the output origin for buffers this
    /// pipeline emits.
    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// Origin id stamped on buffers emitted by this pipeline.
    pub fn output_origin(&self) -> streaming_config::OriginId {
        streaming_config::OriginId(self.pipeline_id.0)
    }

    pub fn buffer_manager(&self) -> &BufferManager {
        &self.buffer_manager
    }

    pub fn operator_handler(&self, index: usize) -> &OperatorHandler {
        &self.handlers[index]
    }

    /// Dispatches an emitted buffer to all successor pipelines via the task
    /// queue.
    pub fn emit_buffer(&self, buffer: TupleBuffer) {
        for successor in &self.successors {
            self.task_queue.push(Task::Execute {
                pipeline: successor.clone(),
                buffer: buffer.clone(),
            });
        }
    }

    pub fn successor_count(&self) -> usize {
        self.successors.len()
    }
}
