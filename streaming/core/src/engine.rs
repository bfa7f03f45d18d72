// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use streaming_config::QueryId;
use tracing::{debug, info, warn};

use crate::buffer_pool::BufferManager;
use crate::checkpoint::{CheckpointManager, PipelineState};
use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::{ExecutablePipeline, PipelineStatus};
use crate::reconfiguration::{ReconfigurationKind, ReconfigurationMessage};
use crate::source::{Source, SourceConfig, SourceThread};
use crate::task_queue::TaskQueue;
use crate::worker::WorkerPool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    Running,
    Stopped,
    Failed(String),
}

struct RunningQuery {
    pipelines: Vec<Arc<ExecutablePipeline>>,
    sources: Vec<SourceThread>,
    status: QueryStatus,
}

/// The single-node execution core: buffer manager, task queue, worker pool,
/// and the lifecycle of registered queries.
pub struct StreamingEngine {
    context: Arc<Context>,
    buffer_manager: BufferManager,
    task_queue: TaskQueue,
    worker_pool: WorkerPool,
    queries: Arc<Mutex<HashMap<QueryId, RunningQuery>>>,
}

impl StreamingEngine {
    pub fn new(context: Arc<Context>) -> EngineResult<Self> {
        let buffer_manager = BufferManager::new(context.clone())?;
        let task_queue = TaskQueue::new(context.clone());
        let worker_pool = WorkerPool::start(context.clone(), task_queue.clone(), &buffer_manager);
        Ok(Self {
            context,
            buffer_manager,
            task_queue,
            worker_pool,
            queries: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn buffer_manager(&self) -> &BufferManager {
        &self.buffer_manager
    }

    pub fn task_queue(&self) -> &TaskQueue {
        &self.task_queue
    }

    pub fn worker_count(&self) -> usize {
        self.worker_pool.worker_count()
    }

    /// Registers and starts a query: starts all pipelines (operators set
    /// up), installs failure propagation, then releases the sources.
    pub fn start_query(
        &self,
        query_id: QueryId,
        pipelines: Vec<Arc<ExecutablePipeline>>,
        sources: Vec<(Box<dyn Source>, SourceConfig)>,
    ) -> EngineResult<()> {
        if pipelines.is_empty() {
            return Err(EngineError::QueryInvalid("query without pipelines".to_string()));
        }
        {
            let queries = self.queries.lock();
            if queries.contains_key(&query_id) {
                return Err(EngineError::QueryInvalid(format!(
                    "query {query_id} already registered"
                )));
            }
        }

        for pipeline in &pipelines {
            let queries = self.queries.clone();
            pipeline.set_failure_listener(Arc::new(move |pipeline_id, reason| {
                let mut queries = queries.lock();
                if let Some(query) = queries.get_mut(&query_id) {
                    if query.status == QueryStatus::Running {
                        warn!("Query {query_id} failed in pipeline {pipeline_id}: {reason}");
                        query.status = QueryStatus::Failed(reason.to_string());
                        // Upstream producers observe the failure and stop.
                        for source in &query.sources {
                            source.stop();
                        }
                    }
                }
            }));
        }
        for pipeline in &pipelines {
            pipeline.start()?;
        }

        let source_threads: Vec<SourceThread> = sources
            .into_iter()
            .map(|(source, config)| {
                SourceThread::start(
                    self.context.clone(),
                    source,
                    config,
                    self.buffer_manager.clone(),
                    self.task_queue.clone(),
                )
            })
            .collect();

        info!(
            "Query {query_id} started with {} pipelines and {} sources",
            pipelines.len(),
            source_threads.len()
        );
        self.queries.lock().insert(
            query_id,
            RunningQuery {
                pipelines,
                sources: source_threads,
                status: QueryStatus::Running,
            },
        );
        Ok(())
    }

    pub fn query_status(&self, query_id: QueryId) -> Option<QueryStatus> {
        let queries = self.queries.lock();
        let query = queries.get(&query_id)?;
        if query.status != QueryStatus::Running {
            return Some(query.status.clone());
        }
        // A running query is stopped once every pipeline reached a terminal
        // state.
        let all_stopped = query
            .pipelines
            .iter()
            .all(|pipeline| pipeline.status() == PipelineStatus::Stopped);
        if all_stopped {
            Some(QueryStatus::Stopped)
        } else {
            Some(QueryStatus::Running)
        }
    }

    /// Writes a final pipeline-state snapshot per pipeline when a checkpoint
    /// directory is configured. I/O errors are reported but never terminate
    /// execution.
    fn checkpoint_pipelines(&self, query_id: QueryId, pipelines: &[Arc<ExecutablePipeline>]) {
        let Some(directory) = &self.context.parameters.checkpoint_dir else {
            return;
        };
        let manager = match CheckpointManager::new(directory) {
            Ok(manager) => manager,
            Err(error) => {
                warn!("Cannot open checkpoint directory: {error}");
                return;
            }
        };
        let created_timestamp_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0);
        for pipeline in pipelines {
            let state = PipelineState::new(query_id, pipeline.id(), created_timestamp_ns);
            // Failures are already logged by the manager.
            manager.checkpoint(&state, &self.context).ok();
        }
    }

    /// Soft stop: sources stop producing, every already-produced buffer
    /// drains to the sinks, emit flushes its last chunks, then the pipelines
    /// transition via their producer counts.
    pub fn stop_query(&self, query_id: QueryId) -> EngineResult<()> {
        let message = {
            let queries = self.queries.lock();
            let query = queries
                .get(&query_id)
                .ok_or_else(|| EngineError::QueryInvalid(format!("unknown query {query_id}")))?;
            for source in &query.sources {
                source.stop();
            }
            self.checkpoint_pipelines(query_id, &query.pipelines);
            ReconfigurationMessage::new(
                ReconfigurationKind::SoftStop,
                query.pipelines.clone(),
                "soft stop",
                self.worker_pool.worker_count(),
            )
        };
        message.set_post_reconfiguration_callback(Box::new(move || {
            debug!("Soft stop of query {query_id} acknowledged by all workers");
        }));
        ReconfigurationMessage::fan_out(
            &message,
            &self.task_queue,
            &self.context,
            self.worker_pool.worker_count(),
        );
        Ok(())
    }

    /// Hard stop: discards in-flight work of the query's pipelines.
    pub fn hard_stop_query(&self, query_id: QueryId) -> EngineResult<()> {
        let message = {
            let mut queries = self.queries.lock();
            let query = queries
                .get_mut(&query_id)
                .ok_or_else(|| EngineError::QueryInvalid(format!("unknown query {query_id}")))?;
            for source in &query.sources {
                source.stop();
            }
            if query.status == QueryStatus::Running {
                query.status = QueryStatus::Stopped;
            }
            ReconfigurationMessage::new(
                ReconfigurationKind::HardStop,
                query.pipelines.clone(),
                "hard stop",
                self.worker_pool.worker_count(),
            )
        };
        ReconfigurationMessage::fan_out(
            &message,
            &self.task_queue,
            &self.context,
            self.worker_pool.worker_count(),
        );
        Ok(())
    }

    /// Blocks until every pipeline of the query reached a terminal state and
    /// all source threads exited, or the timeout expired.
    pub fn await_termination(&self, query_id: QueryId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let terminal = {
                let queries = self.queries.lock();
                match queries.get(&query_id) {
                    Some(query) => query.pipelines.iter().all(|pipeline| {
                        matches!(
                            pipeline.status(),
                            PipelineStatus::Stopped | PipelineStatus::Failed
                        )
                    }),
                    None => return true,
                }
            };
            if terminal {
                let mut queries = self.queries.lock();
                if let Some(query) = queries.get_mut(&query_id) {
                    for source in &mut query.sources {
                        source.join();
                    }
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Stops all queries and joins the worker pool. Exit code policy for the
    /// node binary: clean shutdown maps to 0, unrecoverable failure to
    /// nonzero.
    pub fn shutdown(&self) {
        let query_ids: Vec<QueryId> = self.queries.lock().keys().copied().collect();
        for query_id in query_ids {
            self.hard_stop_query(query_id).ok();
            self.await_termination(query_id, Duration::from_secs(1));
        }
        self.worker_pool.shutdown();
        debug!("Engine shut down");
    }
}
