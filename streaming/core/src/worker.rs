// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use streaming_config::WorkerId;
use tracing::debug;

use crate::buffer_pool::{BufferManager, LocalBufferPool};
use crate::context::Context;
use crate::reconfiguration::ReconfigurationMessage;
use crate::task_queue::{Task, TaskQueue};

/// Thread-local execution state of one worker: its id and its reserved
/// buffer pool, so pipelines allocating output buffers cannot be starved by
/// other workers.
pub struct WorkerContext {
    worker_id: WorkerId,
    local_pool: LocalBufferPool,
}

impl WorkerContext {
    pub fn new(worker_id: WorkerId, local_pool: LocalBufferPool) -> Self {
        Self {
            worker_id,
            local_pool,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn local_pool(&self) -> &LocalBufferPool {
        &self.local_pool
    }

    pub(crate) fn on_reconfiguration(&mut self, _message: &ReconfigurationMessage) {
        debug!("Worker {} observed reconfiguration", self.worker_id);
    }
}

/// Pool of N worker threads draining the task queue.
pub struct WorkerPool {
    context: Arc<Context>,
    task_queue: TaskQueue,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    workers: usize,
}

impl WorkerPool {
    pub fn start(
        context: Arc<Context>,
        task_queue: TaskQueue,
        buffer_manager: &BufferManager,
    ) -> Self {
        let workers = context.parameters.worker_threads.max(1);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers as WorkerId {
            let local_pool =
                LocalBufferPool::new(buffer_manager, context.parameters.local_pool_buffers);
            let queue = task_queue.clone();
            let handle = thread::Builder::new()
                .name(format!("streaming-worker-{worker_id}"))
                .spawn(move || {
                    let mut ctx = WorkerContext::new(worker_id, local_pool);
                    worker_loop(&queue, &mut ctx);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        debug!("Worker pool started with {workers} threads");
        Self {
            context,
            task_queue,
            handles: Mutex::new(handles),
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Posts one shutdown task per worker and joins all threads.
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for _ in 0..handles.len() {
            self.task_queue.push(Task::Shutdown);
        }
        for handle in handles {
            handle.join().ok();
        }
        debug!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(task_queue: &TaskQueue, ctx: &mut WorkerContext) {
    debug!("Worker {} started", ctx.worker_id());
    loop {
        match task_queue.pop() {
            Task::Execute { pipeline, buffer } => pipeline.process(buffer, ctx),
            Task::Reconfigure(message) => message.run(ctx),
            Task::Shutdown => break,
        }
    }
    debug!("Worker {} exited", ctx.worker_id());
}
