// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::debug;

use crate::buffer::TupleBuffer;
use crate::emit::EmitOperator;
use crate::memory_layout::{MemoryProvider, Record};
use crate::pipeline::{ExecutionResult, PipelineExecutionContext, PipelineStage};
use crate::worker::WorkerContext;

/// A record-at-a-time operator inside a transform stage.
#[derive(Clone)]
pub enum RecordOperator {
    /// Drops records failing the predicate.
    Filter(Arc<dyn Fn(&Record) -> bool + Send + Sync>),
    /// Rewrites the record.
    Map(Arc<dyn Fn(Record) -> Record + Send + Sync>),
}

impl RecordOperator {
    pub fn filter(predicate: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        RecordOperator::Filter(Arc::new(predicate))
    }

    pub fn map(projection: impl Fn(Record) -> Record + Send + Sync + 'static) -> Self {
        RecordOperator::Map(Arc::new(projection))
    }
}

/// An interpreted pipeline stage: scan the input buffer, run each record
/// through the operator chain, and materialize survivors via the emit
/// operator. The compiled stages produced by a code generator plug into the
/// same [`PipelineStage`] contract.
pub struct TransformStage {
    input_provider: MemoryProvider,
    operators: Vec<RecordOperator>,
    emit: EmitOperator,
}

impl TransformStage {
    pub fn new(
        input_provider: MemoryProvider,
        operators: Vec<RecordOperator>,
        emit: EmitOperator,
    ) -> Self {
        Self {
            input_provider,
            operators,
            emit,
        }
    }
}

impl PipelineStage for TransformStage {
    fn execute(
        &self,
        input: &TupleBuffer,
        ctx: &mut WorkerContext,
        pctx: &PipelineExecutionContext,
    ) -> ExecutionResult {
        let mut state = match self.emit.open(ctx, pctx) {
            Ok(state) => state,
            Err(error) => {
                debug!("Transform stage could not allocate output: {error}");
                return ExecutionResult::Failed;
            }
        };
        'records: for index in 0..input.number_of_tuples() as usize {
            let mut record = match self.input_provider.read_record(input, index) {
                Ok(record) => record,
                Err(error) => {
                    debug!("Transform stage failed to read record: {error}");
                    return ExecutionResult::Failed;
                }
            };
            for operator in &self.operators {
                match operator {
                    RecordOperator::Filter(predicate) => {
                        if !predicate(&record) {
                            continue 'records;
                        }
                    }
                    RecordOperator::Map(projection) => record = projection(record),
                }
            }
            if let Err(error) = self.emit.execute(&mut state, &record, input, ctx, pctx) {
                debug!("Transform stage emit failed: {error}");
                return ExecutionResult::Failed;
            }
        }
        if let Err(error) = self.emit.close(state, input, pctx) {
            debug!("Transform stage close failed: {error}");
            return ExecutionResult::Failed;
        }
        ExecutionResult::Ok
    }
}
