//! # Wire Codec
//!
//! Encodes a [`MessageInstance`] against its schema and decodes bytes back
//! into an instance using a [`TypeRegistry`].
//!
//! ## Layout (big-endian)
//! ```text
//! [typeId i16] [anyEncrypted bool] [argument 0] ... [argument n-1]
//! ```
//! - numerics and bools are fixed width (bool is one byte, 0 or 1)
//! - `string` is `[i32 byte length][UTF-8]`
//! - `byte[]` is `[i32 count][bytes]`, `string[]` is `[i32 count][string]*`
//! - an argument flagged `encrypt` is encoded as above, sealed with the session
//!   cipher, and written as `[i32 length][sealed bytes]`
//!
//! Only flagged arguments are encrypted; everything else stays readable, which is
//! what lets handshake messages travel before any key exists.

use crate::error::{ProtocolError, Result};
use crate::protocol::message::{MessageInstance, Value};
use crate::protocol::registry::TypeRegistry;
use crate::protocol::schema::ValueType;
use crate::utils::crypto::SessionCipher;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;

/// Registry-backed message codec
#[derive(Debug, Clone)]
pub struct WireCodec {
    registry: Arc<TypeRegistry>,
}

impl WireCodec {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Encode a complete instance
    pub fn encode(&self, message: &MessageInstance, cipher: &SessionCipher) -> Result<BytesMut> {
        let values = message.arguments()?;
        let spec = message.spec();

        let mut buf = BytesMut::with_capacity(64);
        buf.put_i16(spec.id);
        buf.put_u8(u8::from(spec.has_encrypted_arguments()));

        for (argument, value) in spec.arguments.iter().zip(values) {
            if argument.must_encrypt {
                let mut plain = BytesMut::new();
                put_value(&mut plain, value)?;
                let sealed = cipher.encrypt_field(&plain)?;
                put_len(&mut buf, sealed.len())?;
                buf.put_slice(&sealed);
            } else {
                put_value(&mut buf, value)?;
            }
        }
        Ok(buf)
    }

    /// Decode exactly one message from `bytes`
    pub fn decode(&self, bytes: &[u8], cipher: &SessionCipher) -> Result<MessageInstance> {
        let mut cursor = bytes;
        let id = get_i16(&mut cursor)?;
        let spec = self
            .registry
            .lookup_id(id)
            .ok_or(ProtocolError::UnknownType(id))?;

        let flagged = get_bool(&mut cursor)?;
        if flagged != spec.has_encrypted_arguments() {
            return Err(ProtocolError::MalformedArgument(format!(
                "{} encryption flag is {flagged} but schema says {}",
                spec.name,
                spec.has_encrypted_arguments()
            )));
        }

        let mut message = MessageInstance::new(spec.clone());
        for (position, argument) in spec.arguments.iter().enumerate() {
            let value = if argument.must_encrypt {
                let len = get_len(&mut cursor)?;
                let sealed = take(&mut cursor, len)?;
                let plain = cipher.decrypt_field(sealed)?;
                let mut inner = plain.as_slice();
                let value = get_value(&mut inner, argument.value_type)?;
                if !inner.is_empty() {
                    return Err(ProtocolError::MalformedArgument(format!(
                        "{}.{} has {} stray bytes after decryption",
                        spec.name,
                        argument.name,
                        inner.len()
                    )));
                }
                value
            } else {
                get_value(&mut cursor, argument.value_type)?
            };
            message.set_at(position, value)?;
        }

        if !cursor.is_empty() {
            return Err(ProtocolError::MalformedArgument(format!(
                "{} has {} trailing bytes",
                spec.name,
                cursor.len()
            )));
        }
        Ok(message)
    }
}

/// Read the type id from the front of a payload, if it is long enough
pub fn peek_type_id(bytes: &[u8]) -> Option<i16> {
    let mut cursor = bytes;
    get_i16(&mut cursor).ok()
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = i32::try_from(len)
        .map_err(|_| ProtocolError::InvalidArgument(format!("length {len} exceeds i32")))?;
    buf.put_i32(len);
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    put_len(buf, value.len())?;
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &Value) -> Result<()> {
    match value {
        Value::Int16(v) => buf.put_i16(*v),
        Value::Int32(v) => buf.put_i32(*v),
        Value::Int64(v) => buf.put_i64(*v),
        Value::Float32(v) => buf.put_f32(*v),
        Value::Float64(v) => buf.put_f64(*v),
        Value::Bool(v) => buf.put_u8(u8::from(*v)),
        Value::Byte(v) => buf.put_u8(*v),
        Value::String(v) => put_string(buf, v)?,
        Value::Bytes(v) => {
            put_len(buf, v.len())?;
            buf.put_slice(v);
        }
        Value::Strings(v) => {
            put_len(buf, v.len())?;
            for s in v {
                put_string(buf, s)?;
            }
        }
    }
    Ok(())
}

fn need(cursor: &[u8], len: usize, what: &str) -> Result<()> {
    if cursor.remaining() < len {
        return Err(ProtocolError::MalformedArgument(format!(
            "{what} needs {len} bytes, {} left",
            cursor.remaining()
        )));
    }
    Ok(())
}

fn get_i16(cursor: &mut &[u8]) -> Result<i16> {
    need(cursor, 2, "int16")?;
    Ok(cursor.get_i16())
}

fn get_bool(cursor: &mut &[u8]) -> Result<bool> {
    need(cursor, 1, "bool")?;
    match cursor.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::MalformedArgument(format!(
            "bool byte must be 0 or 1, got {other}"
        ))),
    }
}

fn get_len(cursor: &mut &[u8]) -> Result<usize> {
    need(cursor, 4, "length prefix")?;
    let len = cursor.get_i32();
    usize::try_from(len)
        .map_err(|_| ProtocolError::MalformedArgument(format!("negative length {len}")))
}

fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    need(cursor, len, "field")?;
    let slice: &'a [u8] = *cursor;
    let (head, tail) = slice.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn get_string(cursor: &mut &[u8]) -> Result<String> {
    let len = get_len(cursor)?;
    let raw = take(cursor, len)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| ProtocolError::MalformedArgument(format!("invalid UTF-8: {e}")))
}

fn get_value(cursor: &mut &[u8], value_type: ValueType) -> Result<Value> {
    let value = match value_type {
        ValueType::Int16 => Value::Int16(get_i16(cursor)?),
        ValueType::Int32 => {
            need(cursor, 4, "int32")?;
            Value::Int32(cursor.get_i32())
        }
        ValueType::Int64 => {
            need(cursor, 8, "int64")?;
            Value::Int64(cursor.get_i64())
        }
        ValueType::Float32 => {
            need(cursor, 4, "float32")?;
            Value::Float32(cursor.get_f32())
        }
        ValueType::Float64 => {
            need(cursor, 8, "float64")?;
            Value::Float64(cursor.get_f64())
        }
        ValueType::Bool => Value::Bool(get_bool(cursor)?),
        ValueType::Byte => {
            need(cursor, 1, "byte")?;
            Value::Byte(cursor.get_u8())
        }
        ValueType::String => Value::String(get_string(cursor)?),
        ValueType::Bytes => {
            let len = get_len(cursor)?;
            Value::Bytes(take(cursor, len)?.to_vec())
        }
        ValueType::Strings => {
            let count = get_len(cursor)?;
            // every element carries at least its 4-byte length prefix
            need(cursor, count.saturating_mul(4), "string[]")?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(get_string(cursor)?);
            }
            Value::Strings(items)
        }
    };
    Ok(value)
}
