// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{EngineError, EngineResult};
use crate::memory_layout::{PhysicalType, Record, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationKind {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    First,
    Last,
}

/// Numeric domain an aggregation accumulates in; 8 bytes regardless of the
/// input width so narrow inputs cannot overflow their own type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Domain {
    Signed,
    Unsigned,
    Float,
}

fn domain_of(input_type: PhysicalType) -> Domain {
    match input_type {
        PhysicalType::I8 | PhysicalType::I16 | PhysicalType::I32 | PhysicalType::I64 => {
            Domain::Signed
        }
        PhysicalType::U8 | PhysicalType::U16 | PhysicalType::U32 | PhysicalType::U64 => {
            Domain::Unsigned
        }
        PhysicalType::F32 | PhysicalType::F64 => Domain::Float,
        other => panic!("aggregation over non-numeric type {other:?}"),
    }
}

/// One aggregation over one input field, with the three phases of its
/// contract: `lift` ingests a record into a state, `combine` merges two
/// states (associative), `lower` finalizes a state into an output value.
///
/// State layout: count is a bare `u64`; every other kind carries a presence
/// byte in front of its 8-byte accumulator (avg: sum plus count) so an empty
/// or all-null state lowers to null explicitly.
#[derive(Clone, Debug)]
pub struct AggregationFunction {
    kind: AggregationKind,
    input_type: PhysicalType,
    input_field: String,
    result_field: String,
}

impl AggregationFunction {
    pub fn new(
        kind: AggregationKind,
        input_field: impl Into<String>,
        result_field: impl Into<String>,
        input_type: PhysicalType,
    ) -> Self {
        // Validates the input type.
        if kind != AggregationKind::Count {
            domain_of(input_type);
        }
        Self {
            kind,
            input_type,
            input_field: input_field.into(),
            result_field: result_field.into(),
        }
    }

    pub fn kind(&self) -> AggregationKind {
        self.kind
    }

    pub fn result_field(&self) -> &str {
        &self.result_field
    }

    pub fn input_field(&self) -> &str {
        &self.input_field
    }

    /// Physical type of the lowered value.
    pub fn result_type(&self) -> PhysicalType {
        match self.kind {
            AggregationKind::Count => PhysicalType::U64,
            AggregationKind::Avg => PhysicalType::F64,
            AggregationKind::Sum => match domain_of(self.input_type) {
                Domain::Signed => PhysicalType::I64,
                Domain::Unsigned => PhysicalType::U64,
                Domain::Float => PhysicalType::F64,
            },
            AggregationKind::Min
            | AggregationKind::Max
            | AggregationKind::First
            | AggregationKind::Last => self.input_type,
        }
    }

    /// Lowered values of min/max/first/last/avg are null for empty states,
    /// so the result field is nullable regardless of the input.
    pub fn result_nullable(&self) -> bool {
        self.kind != AggregationKind::Count
    }

    pub fn state_size(&self) -> usize {
        match self.kind {
            AggregationKind::Count => 8,
            AggregationKind::Avg => 1 + 8 + 8,
            _ => 1 + 8,
        }
    }

    /// Ingests one record. Null inputs leave the state untouched.
    pub fn lift(&self, state: &mut [u8], record: &Record) -> EngineResult<()> {
        debug_assert_eq!(state.len(), self.state_size());
        if self.kind == AggregationKind::Count {
            let count = u64::from_le_bytes(state[..8].try_into().unwrap());
            state[..8].copy_from_slice(&(count + 1).to_le_bytes());
            return Ok(());
        }

        let value = record.read(&self.input_field)?;
        if value.is_null() {
            return Ok(());
        }
        let scalar = self.scalar_of(value)?;
        match self.kind {
            AggregationKind::Sum => {
                let present = state[0] != 0;
                let current = read_scalar(&state[1..9]);
                let updated = if present {
                    add_scalars(domain_of(self.input_type), current, scalar)
                } else {
                    scalar
                };
                state[0] = 1;
                state[1..9].copy_from_slice(&updated.to_le_bytes());
            }
            AggregationKind::Avg => {
                let present = state[0] != 0;
                let current = read_scalar(&state[1..9]);
                let count = u64::from_le_bytes(state[9..17].try_into().unwrap());
                let updated = if present {
                    add_scalars(domain_of(self.input_type), current, scalar)
                } else {
                    scalar
                };
                state[0] = 1;
                state[1..9].copy_from_slice(&updated.to_le_bytes());
                state[9..17].copy_from_slice(&(count + 1).to_le_bytes());
            }
            AggregationKind::Min => {
                let present = state[0] != 0;
                if !present
                    || compare_scalars(domain_of(self.input_type), scalar, read_scalar(&state[1..9]))
                        .is_lt()
                {
                    state[0] = 1;
                    state[1..9].copy_from_slice(&scalar.to_le_bytes());
                }
            }
            AggregationKind::Max => {
                let present = state[0] != 0;
                if !present
                    || compare_scalars(domain_of(self.input_type), scalar, read_scalar(&state[1..9]))
                        .is_gt()
                {
                    state[0] = 1;
                    state[1..9].copy_from_slice(&scalar.to_le_bytes());
                }
            }
            AggregationKind::First => {
                if state[0] == 0 {
                    state[0] = 1;
                    state[1..9].copy_from_slice(&scalar.to_le_bytes());
                }
            }
            AggregationKind::Last => {
                state[0] = 1;
                state[1..9].copy_from_slice(&scalar.to_le_bytes());
            }
            AggregationKind::Count => unreachable!("count handled above"),
        }
        Ok(())
    }

    /// Merges `right` into `left`. Associative; `combine(combine(a,b),c)`
    /// equals `combine(a, combine(b,c))`.
    pub fn combine(&self, left: &mut [u8], right: &[u8]) {
        debug_assert_eq!(left.len(), self.state_size());
        debug_assert_eq!(right.len(), self.state_size());
        match self.kind {
            AggregationKind::Count => {
                let sum = u64::from_le_bytes(left[..8].try_into().unwrap())
                    + u64::from_le_bytes(right[..8].try_into().unwrap());
                left[..8].copy_from_slice(&sum.to_le_bytes());
            }
            AggregationKind::Sum => {
                if right[0] == 0 {
                    return;
                }
                let updated = if left[0] != 0 {
                    add_scalars(
                        domain_of(self.input_type),
                        read_scalar(&left[1..9]),
                        read_scalar(&right[1..9]),
                    )
                } else {
                    read_scalar(&right[1..9])
                };
                left[0] = 1;
                left[1..9].copy_from_slice(&updated.to_le_bytes());
            }
            AggregationKind::Avg => {
                if right[0] == 0 {
                    return;
                }
                let updated_sum = if left[0] != 0 {
                    add_scalars(
                        domain_of(self.input_type),
                        read_scalar(&left[1..9]),
                        read_scalar(&right[1..9]),
                    )
                } else {
                    read_scalar(&right[1..9])
                };
                let count = u64::from_le_bytes(left[9..17].try_into().unwrap())
                    + u64::from_le_bytes(right[9..17].try_into().unwrap());
                left[0] = 1;
                left[1..9].copy_from_slice(&updated_sum.to_le_bytes());
                left[9..17].copy_from_slice(&count.to_le_bytes());
            }
            AggregationKind::Min | AggregationKind::Max => {
                if right[0] == 0 {
                    return;
                }
                let take_right = left[0] == 0 || {
                    let ordering = compare_scalars(
                        domain_of(self.input_type),
                        read_scalar(&right[1..9]),
                        read_scalar(&left[1..9]),
                    );
                    if self.kind == AggregationKind::Min {
                        ordering.is_lt()
                    } else {
                        ordering.is_gt()
                    }
                };
                if take_right {
                    left[..9].copy_from_slice(&right[..9]);
                }
            }
            AggregationKind::First => {
                if left[0] == 0 {
                    left[..9].copy_from_slice(&right[..9]);
                }
            }
            AggregationKind::Last => {
                if right[0] != 0 {
                    left[..9].copy_from_slice(&right[..9]);
                }
            }
        }
    }

    /// Finalizes a state. Empty min/max/first/last/avg states lower to null.
    pub fn lower(&self, state: &[u8]) -> Value {
        debug_assert_eq!(state.len(), self.state_size());
        match self.kind {
            AggregationKind::Count => {
                Value::U64(u64::from_le_bytes(state[..8].try_into().unwrap()))
            }
            AggregationKind::Avg => {
                if state[0] == 0 {
                    return Value::Null;
                }
                let count = u64::from_le_bytes(state[9..17].try_into().unwrap());
                let sum = match domain_of(self.input_type) {
                    Domain::Signed => read_scalar(&state[1..9]) as i64 as f64,
                    Domain::Unsigned => read_scalar(&state[1..9]) as f64,
                    Domain::Float => f64::from_bits(read_scalar(&state[1..9])),
                };
                Value::F64(sum / count as f64)
            }
            AggregationKind::Sum => {
                if state[0] == 0 {
                    return Value::Null;
                }
                let scalar = read_scalar(&state[1..9]);
                match domain_of(self.input_type) {
                    Domain::Signed => Value::I64(scalar as i64),
                    Domain::Unsigned => Value::U64(scalar),
                    Domain::Float => Value::F64(f64::from_bits(scalar)),
                }
            }
            AggregationKind::Min
            | AggregationKind::Max
            | AggregationKind::First
            | AggregationKind::Last => {
                if state[0] == 0 {
                    return Value::Null;
                }
                value_from_scalar(self.input_type, read_scalar(&state[1..9]))
            }
        }
    }

    /// 8-byte accumulator representation of an input value.
    fn scalar_of(&self, value: &Value) -> EngineResult<u64> {
        let mismatch = || {
            EngineError::CannotInferSchema(format!(
                "value {value:?} does not match aggregation input type {:?}",
                self.input_type
            ))
        };
        let scalar = match domain_of(self.input_type) {
            Domain::Signed => match value {
                Value::I8(v) => i64::from(*v) as u64,
                Value::I16(v) => i64::from(*v) as u64,
                Value::I32(v) => i64::from(*v) as u64,
                Value::I64(v) => *v as u64,
                _ => return Err(mismatch()),
            },
            Domain::Unsigned => match value {
                Value::U8(v) => u64::from(*v),
                Value::U16(v) => u64::from(*v),
                Value::U32(v) => u64::from(*v),
                Value::U64(v) => *v,
                _ => return Err(mismatch()),
            },
            Domain::Float => match value {
                Value::F32(v) => f64::from(*v).to_bits(),
                Value::F64(v) => v.to_bits(),
                _ => return Err(mismatch()),
            },
        };
        Ok(scalar)
    }
}

fn read_scalar(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

fn add_scalars(domain: Domain, left: u64, right: u64) -> u64 {
    match domain {
        Domain::Signed => (left as i64).wrapping_add(right as i64) as u64,
        Domain::Unsigned => left.wrapping_add(right),
        Domain::Float => (f64::from_bits(left) + f64::from_bits(right)).to_bits(),
    }
}

fn compare_scalars(domain: Domain, left: u64, right: u64) -> std::cmp::Ordering {
    match domain {
        Domain::Signed => (left as i64).cmp(&(right as i64)),
        Domain::Unsigned => left.cmp(&right),
        Domain::Float => f64::from_bits(left).total_cmp(&f64::from_bits(right)),
    }
}

fn value_from_scalar(input_type: PhysicalType, scalar: u64) -> Value {
    match input_type {
        PhysicalType::I8 => Value::I8(scalar as i64 as i8),
        PhysicalType::I16 => Value::I16(scalar as i64 as i16),
        PhysicalType::I32 => Value::I32(scalar as i64 as i32),
        PhysicalType::I64 => Value::I64(scalar as i64),
        PhysicalType::U8 => Value::U8(scalar as u8),
        PhysicalType::U16 => Value::U16(scalar as u16),
        PhysicalType::U32 => Value::U32(scalar as u32),
        PhysicalType::U64 => Value::U64(scalar),
        PhysicalType::F32 => Value::F32(f64::from_bits(scalar) as f32),
        PhysicalType::F64 => Value::F64(f64::from_bits(scalar)),
        other => panic!("aggregation over non-numeric type {other:?}"),
    }
}
