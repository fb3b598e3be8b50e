//! Binary message codec.
//!
//! ```text
//! [message id: u32 BE] { [field id: u32 BE] [length: u32 BE]? [value] }*
//! ```
//!
//! The length is present only for variable-size kinds. The registry decides every field's
//! kind; the wire carries no type tags.

use crate::core::message::Message;
use crate::core::types::{FieldKind, FieldValue};
use crate::error::{constants, ProtocolError, Result};
use crate::spec::Specification;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

/// Encodes and decodes messages against one shared specification.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    spec: Arc<Specification>,
}

fn malformed(reason: &str) -> ProtocolError {
    ProtocolError::MalformedMessage(reason.to_string())
}

fn length_of(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::OversizedPacket(len))
}

fn date_to_seconds(date: &DateTime<Utc>) -> f64 {
    date.timestamp() as f64 + f64::from(date.timestamp_subsec_nanos()) / 1e9
}

/// Finite values outside what `chrono` represents saturate to its limits.
fn seconds_to_date(seconds: f64) -> Result<DateTime<Utc>> {
    if !seconds.is_finite() {
        return Err(malformed("date is not a finite number"));
    }
    let whole = seconds.floor();
    if whole < DateTime::<Utc>::MIN_UTC.timestamp() as f64 {
        return Ok(DateTime::<Utc>::MIN_UTC);
    }
    if whole > DateTime::<Utc>::MAX_UTC.timestamp() as f64 {
        return Ok(DateTime::<Utc>::MAX_UTC);
    }
    let nanos = (((seconds - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos).ok_or_else(|| malformed("date out of range"))
}

fn put_string(dst: &mut BytesMut, value: &str) -> Result<()> {
    dst.put_u32(length_of(value.len() + 1)?);
    dst.put_slice(value.as_bytes());
    dst.put_u8(0);
    Ok(())
}

fn read_string(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_suffix(&[0u8]).unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|_| malformed(constants::ERR_INVALID_UTF8))
}

impl MessageCodec {
    pub fn new(spec: Arc<Specification>) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &Arc<Specification> {
        &self.spec
    }

    /// Serialize a message into its wire form.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let mut dst = BytesMut::with_capacity(64);
        dst.put_u32(message.id());
        for (field_id, value) in message.raw_fields() {
            dst.put_u32(field_id);
            Self::encode_value(value, &mut dst)?;
        }
        trace!(message = %message, bytes = dst.len(), "Encoded message");
        Ok(dst.to_vec())
    }

    fn encode_value(value: &FieldValue, dst: &mut BytesMut) -> Result<()> {
        match value {
            FieldValue::Bool(v) => dst.put_u8(u8::from(*v)),
            FieldValue::Enum(v) | FieldValue::Uint32(v) => dst.put_u32(*v),
            FieldValue::Int32(v) => dst.put_i32(*v),
            FieldValue::Int64(v) => dst.put_i64(*v),
            FieldValue::Uint64(v) => dst.put_u64(*v),
            FieldValue::Double(v) => dst.put_f64(*v),
            FieldValue::Uuid(v) => dst.put_slice(v.as_bytes()),
            FieldValue::Date(v) => dst.put_f64(date_to_seconds(v)),
            FieldValue::String(v) => put_string(dst, v)?,
            FieldValue::Data(v) => {
                dst.put_u32(length_of(v.len())?);
                dst.put_slice(v);
            }
            FieldValue::Oob(v) => {
                dst.put_u32(8);
                dst.put_u64(*v);
            }
            FieldValue::List(items) => {
                let mut inner = BytesMut::new();
                for item in items {
                    put_string(&mut inner, item)?;
                }
                dst.put_u32(length_of(inner.len())?);
                dst.put_slice(&inner);
            }
        }
        Ok(())
    }

    /// Decode one message occupying exactly `bytes`.
    ///
    /// Never reads beyond the slice. An unknown message or field id aborts the decode.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let mut src = bytes;
        if src.remaining() < 4 {
            return Err(malformed(constants::ERR_MISSING_MESSAGE_ID));
        }
        let mut message = Message::from_id(&self.spec, src.get_u32())?;

        while src.has_remaining() {
            if src.remaining() < 4 {
                return Err(malformed(constants::ERR_TRUNCATED_FIELD));
            }
            let field_id = src.get_u32();
            let kind = self
                .spec
                .field_by_id(field_id)
                .ok_or(ProtocolError::UnknownFieldId(field_id))?
                .kind;

            let width = match kind.fixed_size() {
                Some(width) => width,
                None => {
                    if src.remaining() < 4 {
                        return Err(malformed(constants::ERR_TRUNCATED_FIELD));
                    }
                    src.get_u32() as usize
                }
            };
            if src.remaining() < width {
                return Err(malformed(constants::ERR_TRUNCATED_FIELD));
            }
            let (raw, rest) = src.split_at(width);
            src = rest;
            message.insert_decoded(field_id, Self::decode_value(kind, raw)?);
        }

        trace!(message = %message, bytes = bytes.len(), "Decoded message");
        Ok(message)
    }

    fn decode_value(kind: FieldKind, mut raw: &[u8]) -> Result<FieldValue> {
        Ok(match kind {
            FieldKind::Bool => FieldValue::Bool(raw.get_u8() != 0),
            FieldKind::Enum => FieldValue::Enum(raw.get_u32()),
            FieldKind::Int32 => FieldValue::Int32(raw.get_i32()),
            FieldKind::Uint32 => FieldValue::Uint32(raw.get_u32()),
            FieldKind::Int64 => FieldValue::Int64(raw.get_i64()),
            FieldKind::Uint64 => FieldValue::Uint64(raw.get_u64()),
            FieldKind::Double => FieldValue::Double(raw.get_f64()),
            FieldKind::Uuid => {
                let mut uuid = [0u8; 16];
                raw.copy_to_slice(&mut uuid);
                FieldValue::Uuid(Uuid::from_bytes(uuid))
            }
            FieldKind::Date => FieldValue::Date(seconds_to_date(raw.get_f64())?),
            FieldKind::String => FieldValue::String(read_string(raw)?),
            FieldKind::Data => FieldValue::Data(raw.to_vec()),
            FieldKind::Oob => {
                if raw.len() != 8 {
                    return Err(malformed(constants::ERR_INVALID_OOB_LENGTH));
                }
                FieldValue::Oob(raw.get_u64())
            }
            FieldKind::List => {
                let mut items = Vec::new();
                while raw.has_remaining() {
                    if raw.remaining() < 4 {
                        return Err(malformed(constants::ERR_TRUNCATED_FIELD));
                    }
                    let len = raw.get_u32() as usize;
                    if raw.remaining() < len {
                        return Err(malformed(constants::ERR_TRUNCATED_FIELD));
                    }
                    let (item, rest) = raw.split_at(len);
                    items.push(read_string(item)?);
                    raw = rest;
                }
                FieldValue::List(items)
            }
        })
    }
}
