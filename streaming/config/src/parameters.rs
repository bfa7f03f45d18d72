// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Operational configuration of a single-node streaming worker.
///
/// All fields only affect resource usage and scheduling behavior of the local
/// node; none of them change query semantics.
///
/// NOTE: default values should make sense, so most operators should not need to
/// specify any field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// Size in bytes of one pooled tuple buffer.
    #[serde(default = "Parameters::default_buffer_size_bytes")]
    pub buffer_size_bytes: usize,

    /// Number of fixed-size buffers pre-allocated in the global pool.
    #[serde(default = "Parameters::default_global_pool_buffers")]
    pub global_pool_buffers: usize,

    /// Number of buffers a source or worker reserves from the global pool for
    /// its local pool.
    #[serde(default = "Parameters::default_local_pool_buffers")]
    pub local_pool_buffers: usize,

    /// Number of worker threads draining the task queue. Defaults to the
    /// number of logical CPUs.
    #[serde(default = "Parameters::default_worker_threads")]
    pub worker_threads: usize,

    /// Sequence numbers tracked per chunk-collector node. Larger nodes trade
    /// memory for fewer list operations.
    #[serde(default = "Parameters::default_chunk_collector_node_size")]
    pub chunk_collector_node_size: usize,

    /// Number of buckets in each per-thread hash map.
    #[serde(default = "Parameters::default_hash_map_buckets")]
    pub hash_map_buckets: usize,

    /// Size in bytes of one hash-map entry page.
    #[serde(default = "Parameters::default_hash_map_page_size")]
    pub hash_map_page_size: usize,

    /// Number of probe partitions for the stream join.
    #[serde(default = "Parameters::default_join_partitions")]
    pub join_partitions: usize,

    /// How long a soft stop waits for in-flight work to drain before giving up.
    #[serde(default = "Parameters::default_soft_stop_grace_period")]
    pub soft_stop_grace_period: Duration,

    /// Directory for pipeline-state checkpoints. Checkpointing is disabled
    /// when unset.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Parameters {
    pub fn default_buffer_size_bytes() -> usize {
        4096
    }

    pub fn default_global_pool_buffers() -> usize {
        1024
    }

    pub fn default_local_pool_buffers() -> usize {
        64
    }

    pub fn default_worker_threads() -> usize {
        num_cpus::get()
    }

    pub fn default_chunk_collector_node_size() -> usize {
        1024
    }

    pub fn default_hash_map_buckets() -> usize {
        512
    }

    pub fn default_hash_map_page_size() -> usize {
        4096
    }

    pub fn default_join_partitions() -> usize {
        64
    }

    pub fn default_soft_stop_grace_period() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            buffer_size_bytes: Parameters::default_buffer_size_bytes(),
            global_pool_buffers: Parameters::default_global_pool_buffers(),
            local_pool_buffers: Parameters::default_local_pool_buffers(),
            worker_threads: Parameters::default_worker_threads(),
            chunk_collector_node_size: Parameters::default_chunk_collector_node_size(),
            hash_map_buckets: Parameters::default_hash_map_buckets(),
            hash_map_page_size: Parameters::default_hash_map_page_size(),
            join_partitions: Parameters::default_join_partitions(),
            soft_stop_grace_period: Parameters::default_soft_stop_grace_period(),
            checkpoint_dir: None,
        }
    }
}
