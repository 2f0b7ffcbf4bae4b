//! Column types and their binary decoders.
//!
//! Each column type carries a wire code (the producer announces codes in
//! the Schema frame) and a binary decoder. A producer may announce a code
//! this side has no decoder for; such a column can still be consumed when
//! the caller declared the column as `Text`, in which case the raw bytes
//! are converted from the transport encoding.

use crate::error::{TaskError, TaskResult};

use super::decode_text;

/// Column types with a registered binary decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int32,
    Int64,
    Float8,
    Text,
    Bytes,
}

impl ColumnType {
    /// Wire code announced in Schema frames.
    pub fn code(self) -> u32 {
        match self {
            Self::Bool => 16,
            Self::Int32 => 23,
            Self::Int64 => 20,
            Self::Float8 => 701,
            Self::Text => 25,
            Self::Bytes => 17,
        }
    }

    /// Look up a type by wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            16 => Some(Self::Bool),
            23 => Some(Self::Int32),
            20 => Some(Self::Int64),
            701 => Some(Self::Float8),
            25 => Some(Self::Text),
            17 => Some(Self::Bytes),
            _ => None,
        }
    }
}

/// Whether a binary decoder is registered for a producer-declared code.
pub fn has_binary_decoder(code: u32) -> bool {
    ColumnType::from_code(code).is_some()
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float8(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// The text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Decode one binary column payload as `ty`.
pub fn decode_value(ty: ColumnType, bytes: &[u8]) -> TaskResult<Value> {
    match ty {
        ColumnType::Bool => match bytes {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(malformed("bool", bytes.len())),
        },
        ColumnType::Int32 => {
            let arr: [u8; 4] = bytes.try_into().map_err(|_| malformed("int32", bytes.len()))?;
            Ok(Value::Int32(i32::from_be_bytes(arr)))
        }
        ColumnType::Int64 => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| malformed("int64", bytes.len()))?;
            Ok(Value::Int64(i64::from_be_bytes(arr)))
        }
        ColumnType::Float8 => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| malformed("float8", bytes.len()))?;
            Ok(Value::Float8(f64::from_be_bytes(arr)))
        }
        ColumnType::Text => Ok(Value::Text(decode_text(bytes))),
        ColumnType::Bytes => Ok(Value::Bytes(bytes.to_vec())),
    }
}

/// Encode a value as the binary payload for its column type. Used by the
/// worker-side shim; `Null` has no payload and must be framed as an
/// explicit null marker instead.
pub fn encode_value(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(vec![*b as u8]),
        Value::Int32(v) => Some(v.to_be_bytes().to_vec()),
        Value::Int64(v) => Some(v.to_be_bytes().to_vec()),
        Value::Float8(v) => Some(v.to_be_bytes().to_vec()),
        Value::Text(s) => Some(s.as_bytes().to_vec()),
        Value::Bytes(b) => Some(b.clone()),
    }
}

fn malformed(ty: &str, len: usize) -> TaskError {
    TaskError::Protocol(format!("malformed {ty} value of {len} bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for ty in [
            ColumnType::Bool,
            ColumnType::Int32,
            ColumnType::Int64,
            ColumnType::Float8,
            ColumnType::Text,
            ColumnType::Bytes,
        ] {
            assert_eq!(ColumnType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(ColumnType::from_code(9999), None);
        assert!(!has_binary_decoder(9999));
    }

    #[test]
    fn test_decode_int64() {
        let v = decode_value(ColumnType::Int64, &42i64.to_be_bytes()).unwrap();
        assert_eq!(v, Value::Int64(42));
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        assert!(decode_value(ColumnType::Int32, &[1, 2]).is_err());
        assert!(decode_value(ColumnType::Bool, &[2]).is_err());
    }

    #[test]
    fn test_encode_matches_decode() {
        let v = Value::Float8(1.5);
        let bytes = encode_value(&v).unwrap();
        assert_eq!(decode_value(ColumnType::Float8, &bytes).unwrap(), v);
        assert_eq!(encode_value(&Value::Null), None);
    }
}
