// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use streaming_config::Parameters;

use crate::metrics::Metrics;
#[cfg(test)]
use crate::metrics::test_metrics;

/// Context contains the node configuration and metrics shared by all
/// components of the execution core.
#[derive(Clone)]
pub struct Context {
    /// Parameters of this node.
    pub parameters: Parameters,
    /// Metrics of this node.
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(parameters: Parameters, metrics: Arc<Metrics>) -> Self {
        Self {
            parameters,
            metrics,
        }
    }

    /// Create a test context with a small buffer pool and deterministic sizes.
    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<Self> {
        let parameters = Parameters {
            buffer_size_bytes: 1024,
            global_pool_buffers: 128,
            local_pool_buffers: 16,
            worker_threads: 2,
            ..Default::default()
        };
        Arc::new(Context::new(parameters, test_metrics()))
    }

    #[cfg(test)]
    pub(crate) fn with_parameters(parameters: Parameters) -> Arc<Self> {
        Arc::new(Context::new(parameters, test_metrics()))
    }
}
