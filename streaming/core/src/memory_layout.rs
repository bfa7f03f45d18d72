// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use crate::buffer::TupleBuffer;
use crate::error::{EngineError, EngineResult};

/// Physical type of one schema field. Carries its wire size; nullable fields
/// additionally spend one null-flag byte in front of the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhysicalType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    /// Fixed-size character field of the given byte width.
    Char(usize),
    /// Variable-sized payload transported in an attached child buffer; the
    /// fixed slot stores `(child index: u32, length: u32)`.
    VarSized,
}

impl PhysicalType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            PhysicalType::I8 | PhysicalType::U8 | PhysicalType::Bool => 1,
            PhysicalType::I16 | PhysicalType::U16 => 2,
            PhysicalType::I32 | PhysicalType::U32 | PhysicalType::F32 => 4,
            PhysicalType::I64 | PhysicalType::U64 | PhysicalType::F64 => 8,
            PhysicalType::Char(width) => *width,
            PhysicalType::VarSized => 8,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            PhysicalType::Bool | PhysicalType::Char(_) | PhysicalType::VarSized
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub physical_type: PhysicalType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, physical_type: PhysicalType) -> Self {
        Self {
            name: name.into(),
            physical_type,
            nullable: false,
        }
    }

    pub fn nullable(name: impl Into<String>, physical_type: PhysicalType) -> Self {
        Self {
            name: name.into(),
            physical_type,
            nullable: true,
        }
    }

    /// Bytes this field occupies in a flattened tuple, including the
    /// null-flag byte for nullable fields.
    pub fn slot_size(&self) -> usize {
        self.physical_type.size_in_bytes() + usize::from(self.nullable)
    }
}

/// How tuples are flattened into a buffer: row concatenates whole records,
/// column lays fields out struct-of-arrays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemoryLayoutKind {
    #[default]
    Row,
    Column,
}

/// Ordered list of named, typed, optionally nullable fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> EngineResult<usize> {
        self.fields
            .iter()
            .position(|field| field.name == name)
            .ok_or_else(|| EngineError::CannotInferSchema(format!("unknown field '{name}'")))
    }

    pub fn field(&self, name: &str) -> EngineResult<&Field> {
        Ok(&self.fields[self.field_index(name)?])
    }

    /// Bytes one flattened tuple occupies.
    pub fn tuple_size(&self) -> usize {
        self.fields.iter().map(Field::slot_size).sum()
    }
}

/// Variable-sized payload backed by a child buffer.
#[derive(Clone)]
pub struct VarSizedData {
    buffer: TupleBuffer,
    length: u32,
}

impl VarSizedData {
    pub fn new(buffer: TupleBuffer, length: u32) -> Self {
        Self { buffer, length }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.length as usize]
    }

    pub fn buffer(&self) -> &TupleBuffer {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl PartialEq for VarSizedData {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Debug for VarSizedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarSizedData({} bytes)", self.length)
    }
}

/// A typed runtime value. Records exist only inside operator code; on the
/// wire they are flattened per schema.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Char(Vec<u8>),
    VarSized(VarSizedData),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn matches_type(&self, physical_type: PhysicalType) -> bool {
        match (self, physical_type) {
            (Value::I8(_), PhysicalType::I8)
            | (Value::I16(_), PhysicalType::I16)
            | (Value::I32(_), PhysicalType::I32)
            | (Value::I64(_), PhysicalType::I64)
            | (Value::U8(_), PhysicalType::U8)
            | (Value::U16(_), PhysicalType::U16)
            | (Value::U32(_), PhysicalType::U32)
            | (Value::U64(_), PhysicalType::U64)
            | (Value::F32(_), PhysicalType::F32)
            | (Value::F64(_), PhysicalType::F64)
            | (Value::Bool(_), PhysicalType::Bool)
            | (Value::VarSized(_), PhysicalType::VarSized) => true,
            (Value::Char(bytes), PhysicalType::Char(width)) => bytes.len() == width,
            _ => false,
        }
    }

    /// Numeric view for comparisons and event-time extraction.
    pub fn to_u64(&self) -> Option<u64> {
        match self {
            Value::U8(v) => Some(u64::from(*v)),
            Value::U16(v) => Some(u64::from(*v)),
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            Value::I8(v) => u64::try_from(*v).ok(),
            Value::I16(v) => u64::try_from(*v).ok(),
            Value::I32(v) => u64::try_from(*v).ok(),
            Value::I64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Value::I8(v) => Some(f64::from(*v)),
            Value::I16(v) => Some(f64::from(*v)),
            Value::I32(v) => Some(f64::from(*v)),
            Value::I64(v) => Some(*v as f64),
            Value::U8(v) => Some(f64::from(*v)),
            Value::U16(v) => Some(f64::from(*v)),
            Value::U32(v) => Some(f64::from(*v)),
            Value::U64(v) => Some(*v as f64),
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }
}

/// Logical tuple: an ordered mapping from field name to value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn read(&self, name: &str) -> EngineResult<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
            .ok_or_else(|| EngineError::CannotInferSchema(format!("record misses field '{name}'")))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }
}

/// Flattens records into buffers and back, in row or column layout.
#[derive(Clone)]
pub struct MemoryProvider {
    schema: Arc<Schema>,
    layout: MemoryLayoutKind,
}

impl MemoryProvider {
    pub fn row(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            layout: MemoryLayoutKind::Row,
        }
    }

    pub fn column(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            layout: MemoryLayoutKind::Column,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn layout(&self) -> MemoryLayoutKind {
        self.layout
    }

    /// Number of tuples a buffer of `buffer_len` bytes can hold.
    pub fn capacity(&self, buffer_len: usize) -> usize {
        let tuple_size = self.schema.tuple_size();
        if tuple_size == 0 {
            return 0;
        }
        buffer_len / tuple_size
    }

    /// Byte offset of `field` for tuple `index` in a buffer of `buffer_len`.
    fn slot_offset(&self, buffer_len: usize, index: usize, field: usize) -> usize {
        match self.layout {
            MemoryLayoutKind::Row => {
                let row_base = index * self.schema.tuple_size();
                let field_base: usize = self.schema.fields()[..field]
                    .iter()
                    .map(Field::slot_size)
                    .sum();
                row_base + field_base
            }
            MemoryLayoutKind::Column => {
                let capacity = self.capacity(buffer_len);
                let column_base: usize = self.schema.fields()[..field]
                    .iter()
                    .map(|f| f.slot_size() * capacity)
                    .sum();
                column_base + index * self.schema.fields()[field].slot_size()
            }
        }
    }

    pub fn write_record(
        &self,
        buffer: &mut TupleBuffer,
        index: usize,
        record: &Record,
    ) -> EngineResult<()> {
        let buffer_len = buffer.capacity();
        if index >= self.capacity(buffer_len) {
            return Err(EngineError::RuntimeFailure(format!(
                "tuple index {index} beyond buffer capacity {}",
                self.capacity(buffer_len)
            )));
        }
        for (field_index, field) in self.schema.fields().iter().enumerate() {
            let value = record.read(&field.name)?.clone();
            let offset = self.slot_offset(buffer_len, index, field_index);
            self.write_value(buffer, offset, field, &value)?;
        }
        Ok(())
    }

    pub fn read_record(&self, buffer: &TupleBuffer, index: usize) -> EngineResult<Record> {
        let buffer_len = buffer.capacity();
        let mut record = Record::new();
        for (field_index, field) in self.schema.fields().iter().enumerate() {
            let offset = self.slot_offset(buffer_len, index, field_index);
            let value = self.read_value(buffer, offset, field)?;
            record.write(field.name.clone(), value);
        }
        Ok(record)
    }

    fn write_value(
        &self,
        buffer: &mut TupleBuffer,
        mut offset: usize,
        field: &Field,
        value: &Value,
    ) -> EngineResult<()> {
        if field.nullable {
            let null_flag = u8::from(value.is_null());
            buffer.as_mut_slice()[offset] = null_flag;
            offset += 1;
            if value.is_null() {
                // Zero the value bytes so buffers stay deterministic.
                let size = field.physical_type.size_in_bytes();
                buffer.as_mut_slice()[offset..offset + size].fill(0);
                return Ok(());
            }
        } else if value.is_null() {
            return Err(EngineError::CannotInferSchema(format!(
                "null value for non-nullable field '{}'",
                field.name
            )));
        }
        if !value.matches_type(field.physical_type) {
            return Err(EngineError::CannotInferSchema(format!(
                "value {value:?} does not match field '{}' of type {:?}",
                field.name, field.physical_type
            )));
        }
        let child_attach = match value {
            Value::VarSized(data) => {
                let child_index = buffer.attach_child(data.buffer().clone());
                Some((child_index, data.len() as u32))
            }
            _ => None,
        };
        let slice = buffer.as_mut_slice();
        match value {
            Value::I8(v) => slice[offset] = *v as u8,
            Value::I16(v) => slice[offset..offset + 2].copy_from_slice(&v.to_le_bytes()),
            Value::I32(v) => slice[offset..offset + 4].copy_from_slice(&v.to_le_bytes()),
            Value::I64(v) => slice[offset..offset + 8].copy_from_slice(&v.to_le_bytes()),
            Value::U8(v) => slice[offset] = *v,
            Value::U16(v) => slice[offset..offset + 2].copy_from_slice(&v.to_le_bytes()),
            Value::U32(v) => slice[offset..offset + 4].copy_from_slice(&v.to_le_bytes()),
            Value::U64(v) => slice[offset..offset + 8].copy_from_slice(&v.to_le_bytes()),
            Value::F32(v) => slice[offset..offset + 4].copy_from_slice(&v.to_le_bytes()),
            Value::F64(v) => slice[offset..offset + 8].copy_from_slice(&v.to_le_bytes()),
            Value::Bool(v) => slice[offset] = u8::from(*v),
            Value::Char(bytes) => slice[offset..offset + bytes.len()].copy_from_slice(bytes),
            Value::VarSized(_) => {
                let (child_index, length) = child_attach.expect("var-sized slot prepared above");
                slice[offset..offset + 4].copy_from_slice(&child_index.to_le_bytes());
                slice[offset + 4..offset + 8].copy_from_slice(&length.to_le_bytes());
            }
            Value::Null => unreachable!("null handled above"),
        }
        Ok(())
    }

    fn read_value(
        &self,
        buffer: &TupleBuffer,
        mut offset: usize,
        field: &Field,
    ) -> EngineResult<Value> {
        let slice = buffer.as_slice();
        if field.nullable {
            let null_flag = slice[offset];
            offset += 1;
            if null_flag != 0 {
                return Ok(Value::Null);
            }
        }
        let value = match field.physical_type {
            PhysicalType::I8 => Value::I8(slice[offset] as i8),
            PhysicalType::I16 => Value::I16(i16::from_le_bytes(
                slice[offset..offset + 2].try_into().unwrap(),
            )),
            PhysicalType::I32 => Value::I32(i32::from_le_bytes(
                slice[offset..offset + 4].try_into().unwrap(),
            )),
            PhysicalType::I64 => Value::I64(i64::from_le_bytes(
                slice[offset..offset + 8].try_into().unwrap(),
            )),
            PhysicalType::U8 => Value::U8(slice[offset]),
            PhysicalType::U16 => Value::U16(u16::from_le_bytes(
                slice[offset..offset + 2].try_into().unwrap(),
            )),
            PhysicalType::U32 => Value::U32(u32::from_le_bytes(
                slice[offset..offset + 4].try_into().unwrap(),
            )),
            PhysicalType::U64 => Value::U64(u64::from_le_bytes(
                slice[offset..offset + 8].try_into().unwrap(),
            )),
            PhysicalType::F32 => Value::F32(f32::from_le_bytes(
                slice[offset..offset + 4].try_into().unwrap(),
            )),
            PhysicalType::F64 => Value::F64(f64::from_le_bytes(
                slice[offset..offset + 8].try_into().unwrap(),
            )),
            PhysicalType::Bool => Value::Bool(slice[offset] != 0),
            PhysicalType::Char(width) => Value::Char(slice[offset..offset + width].to_vec()),
            PhysicalType::VarSized => {
                let child_index =
                    u32::from_le_bytes(slice[offset..offset + 4].try_into().unwrap());
                let length =
                    u32::from_le_bytes(slice[offset + 4..offset + 8].try_into().unwrap());
                let child = buffer.load_child(child_index)?;
                Value::VarSized(VarSizedData::new(child, length))
            }
        };
        Ok(value)
    }
}

/// Serializes a fixed set of record fields into fixed-width key bytes and
/// back. Grouping and join keys are compared as raw bytes, so only
/// fixed-size non-nullable fields are allowed.
#[derive(Clone)]
pub struct KeyCodec {
    fields: Vec<(String, PhysicalType)>,
    key_size: usize,
}

impl KeyCodec {
    pub fn new(schema: &Schema, field_names: &[String]) -> EngineResult<Self> {
        let mut fields = Vec::with_capacity(field_names.len());
        for name in field_names {
            let field = schema.field(name)?;
            if field.nullable || field.physical_type == PhysicalType::VarSized {
                return Err(EngineError::CannotInferSchema(format!(
                    "field '{name}' cannot be used as a key"
                )));
            }
            fields.push((name.clone(), field.physical_type));
        }
        let key_size = fields
            .iter()
            .map(|(_, physical_type)| physical_type.size_in_bytes())
            .sum();
        Ok(Self { fields, key_size })
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn fields(&self) -> &[(String, PhysicalType)] {
        &self.fields
    }

    pub fn encode(&self, record: &Record) -> EngineResult<Vec<u8>> {
        let mut key = Vec::with_capacity(self.key_size);
        for (name, physical_type) in &self.fields {
            let value = record.read(name)?;
            if !value.matches_type(*physical_type) {
                return Err(EngineError::CannotInferSchema(format!(
                    "key field '{name}' expects {physical_type:?}, got {value:?}"
                )));
            }
            match value {
                Value::I8(v) => key.push(*v as u8),
                Value::I16(v) => key.extend_from_slice(&v.to_le_bytes()),
                Value::I32(v) => key.extend_from_slice(&v.to_le_bytes()),
                Value::I64(v) => key.extend_from_slice(&v.to_le_bytes()),
                Value::U8(v) => key.push(*v),
                Value::U16(v) => key.extend_from_slice(&v.to_le_bytes()),
                Value::U32(v) => key.extend_from_slice(&v.to_le_bytes()),
                Value::U64(v) => key.extend_from_slice(&v.to_le_bytes()),
                Value::F32(v) => key.extend_from_slice(&v.to_le_bytes()),
                Value::F64(v) => key.extend_from_slice(&v.to_le_bytes()),
                Value::Bool(v) => key.push(u8::from(*v)),
                Value::Char(bytes) => key.extend_from_slice(bytes),
                Value::VarSized(_) | Value::Null => unreachable!("rejected at construction"),
            }
        }
        Ok(key)
    }

    /// Writes the decoded key fields into `record`.
    pub fn decode_into(&self, key: &[u8], record: &mut Record) {
        debug_assert_eq!(key.len(), self.key_size);
        let mut offset = 0;
        for (name, physical_type) in &self.fields {
            let size = physical_type.size_in_bytes();
            let bytes = &key[offset..offset + size];
            offset += size;
            let value = match physical_type {
                PhysicalType::I8 => Value::I8(bytes[0] as i8),
                PhysicalType::I16 => Value::I16(i16::from_le_bytes(bytes.try_into().unwrap())),
                PhysicalType::I32 => Value::I32(i32::from_le_bytes(bytes.try_into().unwrap())),
                PhysicalType::I64 => Value::I64(i64::from_le_bytes(bytes.try_into().unwrap())),
                PhysicalType::U8 => Value::U8(bytes[0]),
                PhysicalType::U16 => Value::U16(u16::from_le_bytes(bytes.try_into().unwrap())),
                PhysicalType::U32 => Value::U32(u32::from_le_bytes(bytes.try_into().unwrap())),
                PhysicalType::U64 => Value::U64(u64::from_le_bytes(bytes.try_into().unwrap())),
                PhysicalType::F32 => Value::F32(f32::from_le_bytes(bytes.try_into().unwrap())),
                PhysicalType::F64 => Value::F64(f64::from_le_bytes(bytes.try_into().unwrap())),
                PhysicalType::Bool => Value::Bool(bytes[0] != 0),
                PhysicalType::Char(_) => Value::Char(bytes.to_vec()),
                PhysicalType::VarSized => unreachable!("rejected at construction"),
            };
            record.write(name.clone(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::{BufferManager, BufferProvider};
    use crate::context::Context;

    fn test_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", PhysicalType::U32),
            Field::nullable("score", PhysicalType::F64),
            Field::new("tag", PhysicalType::Char(4)),
        ]))
    }

    fn sample_record(id: u32, score: Option<f64>) -> Record {
        let mut record = Record::new();
        record.write("id", Value::U32(id));
        record.write(
            "score",
            score.map(Value::F64).unwrap_or(Value::Null),
        );
        record.write("tag", Value::Char(b"abcd".to_vec()));
        record
    }

    #[test]
    fn row_layout_roundtrip() {
        let manager = BufferManager::new(Context::new_for_test()).unwrap();
        let provider = MemoryProvider::row(test_schema());
        let mut buffer = manager.get_buffer_blocking();

        for index in 0..8 {
            let record = sample_record(index as u32, (index % 2 == 0).then(|| index as f64));
            provider.write_record(&mut buffer, index, &record).unwrap();
        }
        for index in 0..8 {
            let record = provider.read_record(&buffer, index).unwrap();
            assert_eq!(record.read("id").unwrap(), &Value::U32(index as u32));
            if index % 2 == 0 {
                assert_eq!(record.read("score").unwrap(), &Value::F64(index as f64));
            } else {
                assert!(record.read("score").unwrap().is_null());
            }
        }
    }

    #[test]
    fn column_layout_roundtrip() {
        let manager = BufferManager::new(Context::new_for_test()).unwrap();
        let provider = MemoryProvider::column(test_schema());
        let mut buffer = manager.get_buffer_blocking();

        let capacity = provider.capacity(buffer.capacity());
        assert!(capacity >= 8);
        for index in 0..8 {
            let record = sample_record(index as u32, Some(0.5));
            provider.write_record(&mut buffer, index, &record).unwrap();
        }
        let record = provider.read_record(&buffer, 7).unwrap();
        assert_eq!(record.read("id").unwrap(), &Value::U32(7));
        assert_eq!(record.read("tag").unwrap(), &Value::Char(b"abcd".to_vec()));
    }

    #[test]
    fn var_sized_fields_travel_in_child_buffers() {
        let manager = BufferManager::new(Context::new_for_test()).unwrap();
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", PhysicalType::U64),
            Field::new("payload", PhysicalType::VarSized),
        ]));
        let provider = MemoryProvider::row(schema);
        let mut buffer = manager.get_buffer_blocking();

        let payload = b"variable sized payload";
        let mut child = manager.get_buffer_blocking();
        child.as_mut_slice()[..payload.len()].copy_from_slice(payload);
        let mut record = Record::new();
        record.write("id", Value::U64(7));
        record.write(
            "payload",
            Value::VarSized(VarSizedData::new(child, payload.len() as u32)),
        );
        provider.write_record(&mut buffer, 0, &record).unwrap();

        let restored = provider.read_record(&buffer, 0).unwrap();
        match restored.read("payload").unwrap() {
            Value::VarSized(data) => assert_eq!(data.as_bytes(), payload),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn unknown_field_is_rejected() {
        let schema = test_schema();
        assert!(schema.field_index("missing").is_err());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let manager = BufferManager::new(Context::new_for_test()).unwrap();
        let provider = MemoryProvider::row(test_schema());
        let mut buffer = manager.get_buffer_blocking();

        let mut record = sample_record(1, None);
        record.write("id", Value::U64(1));
        let result = provider.write_record(&mut buffer, 0, &record);
        assert!(matches!(result, Err(EngineError::CannotInferSchema(_))));
    }
}
