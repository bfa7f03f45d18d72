// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Histogram, IntCounter, IntGauge, Registry,
};

/// Metrics of the execution core, all registered against one registry so the
/// node can expose them through its scrape endpoint.
pub struct Metrics {
    pub node_metrics: NodeMetrics,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        Arc::new(Self {
            node_metrics: NodeMetrics::new(registry),
        })
    }
}

pub struct NodeMetrics {
    pub buffers_acquired: IntCounter,
    pub buffers_recycled: IntCounter,
    pub buffers_available: IntGauge,
    pub unpooled_buffers_live: IntGauge,
    pub tasks_executed: IntCounter,
    pub tasks_dropped: IntCounter,
    pub task_queue_depth: IntGauge,
    pub task_execution_seconds: Histogram,
    pub sequences_completed: IntCounter,
    pub records_below_watermark: IntCounter,
    pub windows_triggered: IntCounter,
    pub slices_created: IntCounter,
    pub slices_evicted: IntCounter,
    pub source_buffers_emitted: IntCounter,
    pub reconfigurations: IntCounter,
    pub pipeline_failures: IntCounter,
    pub checkpoints_written: IntCounter,
}

impl NodeMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            buffers_acquired: register_int_counter_with_registry!(
                "buffers_acquired",
                "Number of pooled buffers handed out by the buffer manager",
                registry,
            )
            .unwrap(),
            buffers_recycled: register_int_counter_with_registry!(
                "buffers_recycled",
                "Number of buffers returned to their pool on final release",
                registry,
            )
            .unwrap(),
            buffers_available: register_int_gauge_with_registry!(
                "buffers_available",
                "Buffers currently sitting in the global free list",
                registry,
            )
            .unwrap(),
            unpooled_buffers_live: register_int_gauge_with_registry!(
                "unpooled_buffers_live",
                "Unpooled buffers currently alive",
                registry,
            )
            .unwrap(),
            tasks_executed: register_int_counter_with_registry!(
                "tasks_executed",
                "Tasks executed by the worker pool",
                registry,
            )
            .unwrap(),
            tasks_dropped: register_int_counter_with_registry!(
                "tasks_dropped",
                "Tasks dropped because their pipeline was no longer running",
                registry,
            )
            .unwrap(),
            task_queue_depth: register_int_gauge_with_registry!(
                "task_queue_depth",
                "Tasks currently waiting in the task queue",
                registry,
            )
            .unwrap(),
            task_execution_seconds: register_histogram_with_registry!(
                "task_execution_seconds",
                "Latency of one pipeline stage invocation",
                registry,
            )
            .unwrap(),
            sequences_completed: register_int_counter_with_registry!(
                "sequences_completed",
                "Sequence numbers for which all chunks have been collected",
                registry,
            )
            .unwrap(),
            records_below_watermark: register_int_counter_with_registry!(
                "records_below_watermark",
                "Out-of-order records discarded below the watermark",
                registry,
            )
            .unwrap(),
            windows_triggered: register_int_counter_with_registry!(
                "windows_triggered",
                "Windows emitted to a probe pipeline",
                registry,
            )
            .unwrap(),
            slices_created: register_int_counter_with_registry!(
                "slices_created",
                "Slices created on demand by slice stores",
                registry,
            )
            .unwrap(),
            slices_evicted: register_int_counter_with_registry!(
                "slices_evicted",
                "Slices evicted after their last window was probed",
                registry,
            )
            .unwrap(),
            source_buffers_emitted: register_int_counter_with_registry!(
                "source_buffers_emitted",
                "Buffers stamped and enqueued by source threads",
                registry,
            )
            .unwrap(),
            reconfigurations: register_int_counter_with_registry!(
                "reconfigurations",
                "Reconfiguration messages fanned out through the worker pool",
                registry,
            )
            .unwrap(),
            pipeline_failures: register_int_counter_with_registry!(
                "pipeline_failures",
                "Pipelines that transitioned to the failed state",
                registry,
            )
            .unwrap(),
            checkpoints_written: register_int_counter_with_registry!(
                "checkpoints_written",
                "Pipeline-state checkpoints written successfully",
                registry,
            )
            .unwrap(),
        }
    }
}

/// Creates a new metrics instance against a throwaway registry.
pub fn test_metrics() -> Arc<Metrics> {
    Metrics::new(&Registry::new())
}
