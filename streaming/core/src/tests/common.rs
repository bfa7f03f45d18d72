// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use streaming_config::Parameters;

use crate::buffer::TupleBuffer;
use crate::context::Context;
use crate::error::EngineResult;
use crate::memory_layout::{MemoryProvider, Record, Value};
use crate::source::{FillResult, Source, StopToken};

/// Context with a deterministic pool layout for scenario tests.
pub fn test_context(worker_threads: usize) -> Arc<Context> {
    Context::with_parameters(Parameters {
        buffer_size_bytes: 16384,
        global_pool_buffers: 256,
        local_pool_buffers: 16,
        worker_threads,
        ..Default::default()
    })
}

pub fn u64_of(record: &Record, field: &str) -> u64 {
    record
        .read(field)
        .unwrap()
        .to_u64()
        .unwrap_or_else(|| panic!("field '{field}' is not an integer"))
}

pub fn f64_of(record: &Record, field: &str) -> f64 {
    match record.read(field).unwrap() {
        Value::F64(value) => *value,
        other => panic!("field '{field}' is not a double: {other:?}"),
    }
}

/// Emits a fixed list of record batches, one buffer per batch, then reports
/// end of stream.
pub struct VecBatchSource {
    provider: MemoryProvider,
    batches: VecDeque<Vec<Record>>,
}

impl VecBatchSource {
    pub fn new(provider: MemoryProvider, batches: Vec<Vec<Record>>) -> Box<dyn Source> {
        Box::new(Self {
            provider,
            batches: batches.into(),
        })
    }
}

impl Source for VecBatchSource {
    fn fill_tuple_buffer(
        &mut self,
        buffer: &mut TupleBuffer,
        stop_token: &StopToken,
    ) -> EngineResult<FillResult> {
        if stop_token.is_stopped() {
            return Ok(FillResult { tuples: 0 });
        }
        let Some(batch) = self.batches.pop_front() else {
            return Ok(FillResult { tuples: 0 });
        };
        for (index, record) in batch.iter().enumerate() {
            self.provider.write_record(buffer, index, record)?;
        }
        Ok(FillResult {
            tuples: batch.len() as u64,
        })
    }
}

/// Produces identical batches until stopped; counts the records it emitted.
pub struct EndlessSource {
    provider: MemoryProvider,
    batch: Vec<Record>,
    produced_records: Arc<AtomicU64>,
}

impl EndlessSource {
    pub fn new(provider: MemoryProvider, batch: Vec<Record>) -> (Box<dyn Source>, Arc<AtomicU64>) {
        let produced_records = Arc::new(AtomicU64::new(0));
        (
            Box::new(Self {
                provider,
                batch,
                produced_records: produced_records.clone(),
            }),
            produced_records,
        )
    }
}

impl Source for EndlessSource {
    fn fill_tuple_buffer(
        &mut self,
        buffer: &mut TupleBuffer,
        stop_token: &StopToken,
    ) -> EngineResult<FillResult> {
        if stop_token.is_stopped() {
            return Ok(FillResult { tuples: 0 });
        }
        for (index, record) in self.batch.iter().enumerate() {
            self.provider.write_record(buffer, index, record)?;
        }
        self.produced_records
            .fetch_add(self.batch.len() as u64, Ordering::AcqRel);
        Ok(FillResult {
            tuples: self.batch.len() as u64,
        })
    }
}
