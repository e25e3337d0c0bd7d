use anyhow::{Context, Result};

use super::schema::{TypeId, STRING_LEN};

const LENGTH_PREFIX: usize = std::mem::size_of::<u32>();

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Value {
    Integer(i32),
    String(String),
}

impl Value {
    /// parses a value of the given type from bytes
    pub fn parse_value(bytes: &[u8], type_id: TypeId) -> Result<Self> {
        match type_id {
            TypeId::Integer => {
                let val = i32::from_be_bytes(bytes[..4].try_into()?);
                Ok(Value::Integer(val))
            }
            TypeId::Text => {
                let len = u32::from_be_bytes(bytes[..LENGTH_PREFIX].try_into()?) as usize;
                let len = len.min(STRING_LEN);
                let slice = &bytes[LENGTH_PREFIX..LENGTH_PREFIX + len];
                let val = std::str::from_utf8(slice)
                    .context("Stored text is not valid UTF-8")?
                    .to_owned();
                Ok(Value::String(val))
            }
        }
    }

    /// Writes the value using the fixed width of its type.
    /// Text is stored as its length followed by the bytes, padded with zeros.
    pub fn serialize_value(&self, buffer: &mut [u8]) {
        match self {
            Value::Integer(val) => {
                buffer[..std::mem::size_of::<i32>()].copy_from_slice(val.to_be_bytes().as_slice())
            }
            Value::String(val) => {
                let bytes = val.as_bytes();
                let len = bytes.len().min(STRING_LEN);
                buffer[..LENGTH_PREFIX].copy_from_slice((len as u32).to_be_bytes().as_slice());
                buffer[LENGTH_PREFIX..LENGTH_PREFIX + len].copy_from_slice(&bytes[..len]);
                buffer[LENGTH_PREFIX + len..LENGTH_PREFIX + STRING_LEN].fill(0);
            }
        }
    }

    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Integer(_) => TypeId::Integer,
            Value::String(_) => TypeId::Text,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Integer(val) => Some(*val),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(val) => Some(val),
            _ => None,
        }
    }
}
