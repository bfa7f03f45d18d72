// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors that can occur in the execution core.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("cannot allocate buffer: {0}")]
    CannotAllocateBuffer(String),

    #[error("malformed input: {0}")]
    FormattingError(String),

    #[error("schema mismatch: {0}")]
    CannotInferSchema(String),

    #[error("invalid query: {0}")]
    QueryInvalid(String),

    #[error("operator failure: {0}")]
    RuntimeFailure(String),

    #[error("corrupted checkpoint: {0}")]
    CheckpointCorrupted(String),

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("shutting down")]
    Shutdown,
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        EngineError::Io(error.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
