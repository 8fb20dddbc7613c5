use crate::storage::error::{StorageError, StorageResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Maximum payload of a `Text` field. Text fields occupy a fixed slot of
/// `4 + TEXT_MAX_LEN` bytes on disk regardless of the stored length, which
/// is what keeps tuple slots fixed-width.
pub const TEXT_MAX_LEN: usize = 128;

/// Field types supported by the engine. Every type has a fixed on-disk width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Text,
}

impl FieldType {
    /// On-disk width of one field of this type, in bytes.
    pub fn width(&self) -> usize {
        match self {
            FieldType::Int => 4,
            FieldType::Text => 4 + TEXT_MAX_LEN,
        }
    }

    /// Reads one field of this type from `r`, consuming exactly
    /// [`width`](Self::width) bytes.
    pub fn read_value<R: Read>(&self, r: &mut R) -> StorageResult<Value> {
        match self {
            FieldType::Int => Ok(Value::Int(r.read_i32::<LittleEndian>()?)),
            FieldType::Text => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut buf = [0u8; TEXT_MAX_LEN];
                r.read_exact(&mut buf)?;
                if len > TEXT_MAX_LEN {
                    return Err(StorageError::InvalidTuple(format!(
                        "text length {} exceeds maximum {}",
                        len, TEXT_MAX_LEN
                    )));
                }
                let s = std::str::from_utf8(&buf[..len])
                    .map_err(|e| StorageError::InvalidTuple(format!("invalid utf-8: {}", e)))?;
                Ok(Value::Text(s.to_string()))
            }
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Int => write!(f, "int"),
            FieldType::Text => write!(f, "string"),
        }
    }
}

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    Text(String),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Int(_) => FieldType::Int,
            Value::Text(_) => FieldType::Text,
        }
    }

    /// Writes this value in its fixed-width encoding, emitting exactly
    /// `self.field_type().width()` bytes.
    pub fn write_to<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        match self {
            Value::Int(v) => w.write_i32::<LittleEndian>(*v)?,
            Value::Text(s) => {
                let bytes = s.as_bytes();
                if bytes.len() > TEXT_MAX_LEN {
                    return Err(StorageError::InvalidTuple(format!(
                        "text length {} exceeds maximum {}",
                        bytes.len(),
                        TEXT_MAX_LEN
                    )));
                }
                w.write_u32::<LittleEndian>(bytes.len() as u32)?;
                w.write_all(bytes)?;
                // zero-pad to the fixed field width
                w.write_all(&[0u8; TEXT_MAX_LEN][bytes.len()..])?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}
