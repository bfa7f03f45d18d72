// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use streaming_config::PipelineId;

use crate::buffer::TupleBuffer;
use crate::context::Context;
use crate::pipeline::ExecutablePipeline;
use crate::reconfiguration::ReconfigurationMessage;

/// One unit of work for the worker pool.
pub enum Task {
    /// Run the pipeline's compiled stage over the buffer.
    Execute {
        pipeline: Arc<ExecutablePipeline>,
        buffer: TupleBuffer,
    },
    /// Barrier-synchronized control-plane message; every worker observes it.
    Reconfigure(Arc<ReconfigurationMessage>),
    /// Ends the receiving worker's loop. Posted once per worker.
    Shutdown,
}

/// Blocking multi-producer multi-consumer task queue. FIFO per producer;
/// cross-producer ordering is recovered downstream from sequence identities.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<TaskQueueInner>,
}

struct TaskQueueInner {
    context: Arc<Context>,
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
}

impl TaskQueue {
    pub fn new(context: Arc<Context>) -> Self {
        Self {
            inner: Arc::new(TaskQueueInner {
                context,
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
            }),
        }
    }

    pub fn push(&self, task: Task) {
        if let Task::Execute { pipeline, .. } = &task {
            pipeline.task_enqueued();
        }
        let mut queue = self.inner.queue.lock();
        queue.push_back(task);
        self.inner
            .context
            .metrics
            .node_metrics
            .task_queue_depth
            .set(queue.len() as i64);
        drop(queue);
        self.inner.available.notify_one();
    }

    /// Blocks until a task arrives.
    pub fn pop(&self) -> Task {
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(task) = queue.pop_front() {
                self.inner
                    .context
                    .metrics
                    .node_metrics
                    .task_queue_depth
                    .set(queue.len() as i64);
                return task;
            }
            self.inner.available.wait(&mut queue);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all queued execute tasks for `pipeline_id`. Used by hard stop;
    /// the dropped buffers recycle through their refcounts.
    pub fn discard_pipeline_tasks(&self, pipeline_id: PipelineId) -> usize {
        let mut queue = self.inner.queue.lock();
        let before = queue.len();
        queue.retain(|task| match task {
            Task::Execute { pipeline, .. } if pipeline.id() == pipeline_id => {
                pipeline.task_discarded();
                false
            }
            _ => true,
        });
        let dropped = before - queue.len();
        self.inner
            .context
            .metrics
            .node_metrics
            .task_queue_depth
            .set(queue.len() as i64);
        self.inner
            .context
            .metrics
            .node_metrics
            .tasks_dropped
            .inc_by(dropped as u64);
        dropped
    }
}
