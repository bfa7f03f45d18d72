// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Barrier};

use parking_lot::Mutex;
use strum_macros::Display;
use tracing::debug;

use crate::context::Context;
use crate::pipeline::ExecutablePipeline;
use crate::task_queue::{Task, TaskQueue};
use crate::worker::WorkerContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ReconfigurationKind {
    /// Drain producers and in-flight tuples, then stop.
    SoftStop,
    /// Stop immediately, discarding queued work for the targets.
    HardStop,
    /// Hard stop plus failure propagation; terminal for the query.
    Fail,
}

type PostReconfigurationCallback = Box<dyn FnOnce() + Send>;

/// A control-plane message routed through the task queue so that every
/// worker thread observes it: one copy per worker is enqueued, and a barrier
/// keeps any worker from consuming two. Each worker first reconfigures its
/// local context; the state transitions on the target pipelines and the
/// post-reconfiguration callback run exactly once.
pub struct ReconfigurationMessage {
    kind: ReconfigurationKind,
    targets: Vec<Arc<ExecutablePipeline>>,
    reason: String,
    barrier: Barrier,
    callback: Mutex<Option<PostReconfigurationCallback>>,
}

impl ReconfigurationMessage {
    pub fn new(
        kind: ReconfigurationKind,
        targets: Vec<Arc<ExecutablePipeline>>,
        reason: impl Into<String>,
        workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            targets,
            reason: reason.into(),
            barrier: Barrier::new(workers),
            callback: Mutex::new(None),
        })
    }

    /// Runs once on the worker that completes the reconfiguration.
    pub fn set_post_reconfiguration_callback(&self, callback: PostReconfigurationCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub fn kind(&self) -> ReconfigurationKind {
        self.kind
    }

    /// Enqueues one copy of `message` per worker.
    pub fn fan_out(message: &Arc<Self>, task_queue: &TaskQueue, context: &Context, workers: usize) {
        context.metrics.node_metrics.reconfigurations.inc();
        debug!(
            "Fanning out {} reconfiguration to {workers} workers",
            message.kind
        );
        for _ in 0..workers {
            task_queue.push(Task::Reconfigure(message.clone()));
        }
    }

    /// Executed by each worker that picks up a copy of this message.
    pub(crate) fn run(&self, ctx: &mut WorkerContext) {
        ctx.on_reconfiguration(self);
        // First rendezvous: all workers have stopped regular processing.
        if self.barrier.wait().is_leader() {
            match self.kind {
                ReconfigurationKind::SoftStop => {
                    // Producer draining is driven by the sources; nothing to
                    // force on the targets here.
                }
                ReconfigurationKind::HardStop => {
                    for target in &self.targets {
                        target.hard_stop();
                    }
                }
                ReconfigurationKind::Fail => {
                    for target in &self.targets {
                        target.fail(&self.reason);
                    }
                }
            }
        }
        // Second rendezvous: nobody resumes until the transitions applied.
        let leader = self.barrier.wait().is_leader();
        if leader {
            if let Some(callback) = self.callback.lock().take() {
                callback();
            }
        }
    }
}
