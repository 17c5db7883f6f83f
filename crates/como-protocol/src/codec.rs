//! Binary encoding of source values and snapshots.
//!
//! Snapshot layout (all integers big-endian):
//! ```text
//! +------+--------+-------------+-----------------+--------------------+-------------+
//! | type | name   | type name   | value           | description        | timestamp   |
//! | u8   | string | string      | u8 tag + data   | string             | i64 (ms)    |
//! +------+--------+-------------+-----------------+--------------------+-------------+
//! ```
//!
//! A string is a `u32` byte length followed by UTF-8 bytes. Value data is a
//! string, an `i64` or the IEEE 754 bits of an `f64` depending on the tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use como_types::{Source, SourceError, SourceType, SourceValue};

/// Errors in the content of a single, correctly delimited frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Truncated payload while reading {field}")]
    Truncated { field: &'static str },

    #[error("Invalid type tag: {0:#04x}")]
    InvalidTypeTag(u8),

    #[error("Value of type {actual} does not match source type {declared}")]
    TypeMismatch {
        declared: SourceType,
        actual: SourceType,
    },

    #[error("Invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("Invalid timestamp: {0} ms")]
    InvalidTimestamp(i64),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("Unexpected {0} byte payload for an empty message")]
    UnexpectedPayload(usize),
}

impl From<SourceError> for CodecError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::TypeMismatch { expected, actual } => CodecError::TypeMismatch {
                declared: expected,
                actual,
            },
            SourceError::UnknownType(tag) => CodecError::InvalidTypeTag(tag),
        }
    }
}

// Strings longer than u32::MAX cannot fit in any frame; the frame encoder
// rejects the oversized result.
#[allow(clippy::cast_possible_truncation)]
fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u32(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

fn get_u8(src: &mut Bytes, field: &'static str) -> Result<u8, CodecError> {
    if src.remaining() < 1 {
        return Err(CodecError::Truncated { field });
    }
    Ok(src.get_u8())
}

fn get_i64(src: &mut Bytes, field: &'static str) -> Result<i64, CodecError> {
    if src.remaining() < 8 {
        return Err(CodecError::Truncated { field });
    }
    Ok(src.get_i64())
}

fn get_string(src: &mut Bytes, field: &'static str) -> Result<String, CodecError> {
    if src.remaining() < 4 {
        return Err(CodecError::Truncated { field });
    }
    let len = src.get_u32() as usize;
    if src.remaining() < len {
        return Err(CodecError::Truncated { field });
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
}

fn get_type(src: &mut Bytes, field: &'static str) -> Result<SourceType, CodecError> {
    let tag = get_u8(src, field)?;
    SourceType::from_tag(tag).ok_or(CodecError::InvalidTypeTag(tag))
}

/// Append a tagged value.
pub fn encode_value(value: &SourceValue, dst: &mut BytesMut) {
    dst.put_u8(value.source_type().tag());
    match value {
        SourceValue::String(s) => put_string(dst, s),
        SourceValue::Int(v) => dst.put_i64(*v),
        SourceValue::Double(v) => dst.put_f64(*v),
    }
}

/// Read a tagged value from the front of `src`.
///
/// # Errors
///
/// Returns `CodecError::InvalidTypeTag` for an unknown tag and
/// `CodecError::Truncated` when the data is shorter than the tag requires.
pub fn decode_value(src: &mut Bytes) -> Result<SourceValue, CodecError> {
    let value = match get_type(src, "value type")? {
        SourceType::String => SourceValue::String(get_string(src, "value")?),
        SourceType::Int => SourceValue::Int(get_i64(src, "value")?),
        SourceType::Double => {
            if src.remaining() < 8 {
                return Err(CodecError::Truncated { field: "value" });
            }
            SourceValue::Double(src.get_f64())
        }
    };
    Ok(value)
}

/// Encode a full source snapshot.
#[must_use]
pub fn encode_source(source: &Source) -> Bytes {
    let mut dst = BytesMut::with_capacity(
        32 + source.name().len() + source.type_name().len() + source.description().len(),
    );
    dst.put_u8(source.source_type().tag());
    put_string(&mut dst, source.name());
    put_string(&mut dst, source.type_name());
    encode_value(source.value(), &mut dst);
    put_string(&mut dst, source.description());
    dst.put_i64(source.timestamp().timestamp_millis());
    dst.freeze()
}

/// Decode a full source snapshot from exactly one frame payload.
///
/// # Errors
///
/// Returns a `CodecError` for a truncated field, an unknown type tag, a value
/// whose tag disagrees with the declared source type, invalid UTF-8, an
/// out-of-range timestamp or unconsumed trailing bytes.
pub fn decode_source(mut payload: Bytes) -> Result<Source, CodecError> {
    let declared = get_type(&mut payload, "source type")?;
    let name = get_string(&mut payload, "name")?;
    let type_name = get_string(&mut payload, "type name")?;
    let value = decode_value(&mut payload)?;
    let description = get_string(&mut payload, "description")?;
    let millis = get_i64(&mut payload, "timestamp")?;

    if payload.has_remaining() {
        return Err(CodecError::TrailingBytes(payload.remaining()));
    }

    let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(CodecError::InvalidTimestamp(millis))?;

    Ok(Source::new(declared, name, type_name, value, description)?.with_timestamp(timestamp))
}
