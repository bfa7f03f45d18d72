// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use streaming_config::{OriginId, PipelineId, QueryId, Timestamp};
use tracing::warn;

use crate::context::Context;
use crate::error::{EngineError, EngineResult};

const MAGIC: &[u8; 4] = b"NESP";
const FORMAT_VERSION: u32 = 1;

/// Kind tag of one operator state blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OperatorStateKind {
    Emit = 0,
    Aggregation = 1,
    JoinLeft = 2,
    JoinRight = 3,
}

impl OperatorStateKind {
    fn from_u8(value: u8) -> EngineResult<Self> {
        match value {
            0 => Ok(OperatorStateKind::Emit),
            1 => Ok(OperatorStateKind::Aggregation),
            2 => Ok(OperatorStateKind::JoinLeft),
            3 => Ok(OperatorStateKind::JoinRight),
            other => Err(EngineError::CheckpointCorrupted(format!(
                "unknown operator state kind {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorStateBlob {
    pub kind: OperatorStateKind,
    pub operator_id: u64,
    pub state_version: u32,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OriginProgress {
    pub origin_id: OriginId,
    pub processed_records: u64,
    pub last_watermark: Timestamp,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressMetadata {
    pub version: u32,
    pub last_watermark: Timestamp,
    pub origins: Vec<OriginProgress>,
}

/// In-process snapshot of one pipeline's recoverable state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineState {
    pub version: u32,
    pub query_id: QueryId,
    pub pipeline_id: PipelineId,
    pub created_timestamp_ns: u64,
    pub operators: Vec<OperatorStateBlob>,
    pub progress: ProgressMetadata,
}

impl PipelineState {
    pub fn new(query_id: QueryId, pipeline_id: PipelineId, created_timestamp_ns: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            query_id,
            pipeline_id,
            created_timestamp_ns,
            operators: Vec::new(),
            progress: ProgressMetadata::default(),
        }
    }

    /// Little-endian framing:
    /// `magic "NESP" | u32 version | u64 queryId | u64 pipelineId |
    /// u64 createdTsNs | u32 opCount` then per operator
    /// `u8 kind | 3 bytes padding | u64 operatorId | u32 stateVersion |
    /// u32 blobSize | blob`, then
    /// `u32 progressVersion | u64 lastWatermark | u32 originCount` with one
    /// `u64 originId | u64 processedRecords | u64 lastWatermark` per origin.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.query_id.0.to_le_bytes());
        out.extend_from_slice(&self.pipeline_id.0.to_le_bytes());
        out.extend_from_slice(&self.created_timestamp_ns.to_le_bytes());
        out.extend_from_slice(&(self.operators.len() as u32).to_le_bytes());
        for operator in &self.operators {
            out.push(operator.kind as u8);
            out.extend_from_slice(&[0u8; 3]);
            out.extend_from_slice(&operator.operator_id.to_le_bytes());
            out.extend_from_slice(&operator.state_version.to_le_bytes());
            out.extend_from_slice(&(operator.bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&operator.bytes);
        }
        out.extend_from_slice(&self.progress.version.to_le_bytes());
        out.extend_from_slice(&self.progress.last_watermark.to_le_bytes());
        out.extend_from_slice(&(self.progress.origins.len() as u32).to_le_bytes());
        for origin in &self.progress.origins {
            out.extend_from_slice(&origin.origin_id.0.to_le_bytes());
            out.extend_from_slice(&origin.processed_records.to_le_bytes());
            out.extend_from_slice(&origin.last_watermark.to_le_bytes());
        }
        out
    }

    /// Rejects bad magic, truncated input, and trailing bytes.
    pub fn deserialize(bytes: &[u8]) -> EngineResult<Self> {
        let mut reader = Reader::new(bytes);
        if reader.take(4)? != MAGIC {
            return Err(EngineError::CheckpointCorrupted("bad magic".to_string()));
        }
        let version = reader.read_u32()?;
        let query_id = QueryId(reader.read_u64()?);
        let pipeline_id = PipelineId(reader.read_u64()?);
        let created_timestamp_ns = reader.read_u64()?;

        let operator_count = reader.read_u32()?;
        let mut operators = Vec::with_capacity(operator_count as usize);
        for _ in 0..operator_count {
            let kind = OperatorStateKind::from_u8(reader.take(1)?[0])?;
            reader.take(3)?;
            let operator_id = reader.read_u64()?;
            let state_version = reader.read_u32()?;
            let blob_size = reader.read_u32()?;
            let bytes = reader.take(blob_size as usize)?.to_vec();
            operators.push(OperatorStateBlob {
                kind,
                operator_id,
                state_version,
                bytes,
            });
        }

        let progress_version = reader.read_u32()?;
        let last_watermark = reader.read_u64()?;
        let origin_count = reader.read_u32()?;
        let mut origins = Vec::with_capacity(origin_count as usize);
        for _ in 0..origin_count {
            origins.push(OriginProgress {
                origin_id: OriginId(reader.read_u64()?),
                processed_records: reader.read_u64()?,
                last_watermark: reader.read_u64()?,
            });
        }
        reader.expect_exhausted()?;

        Ok(Self {
            version,
            query_id,
            pipeline_id,
            created_timestamp_ns,
            operators,
            progress: ProgressMetadata {
                version: progress_version,
                last_watermark,
                origins,
            },
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, count: usize) -> EngineResult<&'a [u8]> {
        if self.offset + count > self.bytes.len() {
            return Err(EngineError::CheckpointCorrupted(
                "truncated checkpoint".to_string(),
            ));
        }
        let slice = &self.bytes[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    fn read_u32(&mut self) -> EngineResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> EngineResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn expect_exhausted(&self) -> EngineResult<()> {
        if self.offset != self.bytes.len() {
            return Err(EngineError::CheckpointCorrupted(
                "trailing bytes in checkpoint".to_string(),
            ));
        }
        Ok(())
    }
}

/// Writes and recovers pipeline-state snapshots. Writes go to a temporary
/// file first and are renamed into place, so readers never observe a partial
/// checkpoint.
pub struct CheckpointManager {
    directory: PathBuf,
}

impl CheckpointManager {
    pub fn new(directory: impl Into<PathBuf>) -> EngineResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    fn path_for(&self, query_id: QueryId, pipeline_id: PipelineId) -> PathBuf {
        self.directory
            .join(format!("{query_id}-{pipeline_id}.state"))
    }

    pub fn write_atomic(path: &Path, bytes: &[u8]) -> EngineResult<()> {
        let tmp_path = path.with_extension("inprogress");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Persists a snapshot. I/O failures are reported but must not
    /// terminate execution; callers log and continue.
    pub fn checkpoint(&self, state: &PipelineState, context: &Context) -> EngineResult<()> {
        let path = self.path_for(state.query_id, state.pipeline_id);
        match Self::write_atomic(&path, &state.serialize()) {
            Ok(()) => {
                context.metrics.node_metrics.checkpoints_written.inc();
                Ok(())
            }
            Err(error) => {
                warn!(
                    "Failed to checkpoint {}/{}: {error}",
                    state.query_id, state.pipeline_id
                );
                Err(error)
            }
        }
    }

    pub fn recover(
        &self,
        query_id: QueryId,
        pipeline_id: PipelineId,
    ) -> EngineResult<PipelineState> {
        let bytes = fs::read(self.path_for(query_id, pipeline_id))?;
        PipelineState::deserialize(&bytes)
    }
}
