//! Protobuf binary encoding for dynamic messages.
//!
//! Output is byte-compatible with `prost`-generated code for the same schema:
//! proto3 implicit presence (zero scalars are not written), packed repeated
//! numerics, and unknown fields skipped on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{
    DecodeContext, WireType, decode_key, decode_varint, encode_key, encode_varint, skip_field,
};
use thiserror::Error;

use super::{FieldDescriptor, FieldKind, Message, MessageSchema, Value};

/// Nesting limit for messages within messages, matching prost's default.
pub const MAX_DEPTH: usize = 100;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Malformed protobuf: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Field `{field}` expects {expected}")]
    TypeMismatch { field: String, expected: &'static str },

    #[error("Field `{field}` is out of range for {kind}")]
    OutOfRange { field: String, kind: &'static str },

    #[error("Field `{field}` has unexpected wire type {wire_type:?}")]
    WireTypeMismatch { field: String, wire_type: WireType },

    #[error("Field `{field}` is truncated")]
    Truncated { field: String },

    #[error("Field `{field}` is not valid UTF-8")]
    InvalidUtf8 { field: String },

    #[error("Message nesting exceeds {MAX_DEPTH} levels")]
    RecursionLimit,
}

/// Encodes `message` according to `schema`.
///
/// Fields present in the message but absent from the schema are ignored.
pub fn encode(schema: &MessageSchema, message: &Message) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::new();
    encode_message(schema, message, &mut buf, 0)?;
    Ok(buf.freeze())
}

/// Decodes `buf` according to `schema`. Absent fields hold their defaults.
pub fn decode(schema: &MessageSchema, mut buf: Bytes) -> Result<Message, WireError> {
    decode_message(schema, &mut buf, 0)
}

fn encode_message(
    schema: &MessageSchema,
    message: &Message,
    buf: &mut BytesMut,
    depth: usize,
) -> Result<(), WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::RecursionLimit);
    }
    for field in schema.fields() {
        let Some(value) = message.get(&field.name) else {
            continue;
        };
        if field.repeated {
            let items = match value {
                Value::List(items) => items.as_slice(),
                single => std::slice::from_ref(single),
            };
            encode_repeated(field, items, buf, depth)?;
        } else if field.kind.is_message() || !value.is_default() {
            encode_key(field.number, wire_type(&field.kind), buf);
            encode_value(field, value, buf, depth)?;
        }
    }
    Ok(())
}

fn encode_repeated(
    field: &FieldDescriptor,
    items: &[Value],
    buf: &mut BytesMut,
    depth: usize,
) -> Result<(), WireError> {
    if items.is_empty() {
        return Ok(());
    }
    if field.kind.is_packable() {
        let mut packed = BytesMut::new();
        for item in items {
            encode_value(field, item, &mut packed, depth)?;
        }
        encode_key(field.number, WireType::LengthDelimited, buf);
        encode_varint(packed.len() as u64, buf);
        buf.put(packed);
        return Ok(());
    }
    for item in items {
        encode_key(field.number, wire_type(&field.kind), buf);
        encode_value(field, item, buf, depth)?;
    }
    Ok(())
}

/// Writes one value without its key.
fn encode_value(
    field: &FieldDescriptor,
    value: &Value,
    buf: &mut BytesMut,
    depth: usize,
) -> Result<(), WireError> {
    let mismatch = |expected| WireError::TypeMismatch {
        field: field.name.clone(),
        expected,
    };
    let out_of_range = |kind| WireError::OutOfRange {
        field: field.name.clone(),
        kind,
    };

    match &field.kind {
        FieldKind::Bool => {
            let b = value.as_bool().ok_or_else(|| mismatch("a boolean"))?;
            encode_varint(u64::from(b), buf);
        }
        FieldKind::Int32 => {
            let v = signed(value).ok_or_else(|| mismatch("an integer"))?;
            let v = i32::try_from(v).map_err(|_| out_of_range("int32"))?;
            // Negative int32 values are sign-extended to ten bytes.
            encode_varint(i64::from(v) as u64, buf);
        }
        FieldKind::Int64 => {
            let v = signed(value).ok_or_else(|| mismatch("an integer"))?;
            encode_varint(v as u64, buf);
        }
        FieldKind::Uint32 => {
            let v = unsigned(value).ok_or_else(|| mismatch("a non-negative integer"))?;
            let v = u32::try_from(v).map_err(|_| out_of_range("uint32"))?;
            encode_varint(u64::from(v), buf);
        }
        FieldKind::Uint64 => {
            let v = unsigned(value).ok_or_else(|| mismatch("a non-negative integer"))?;
            encode_varint(v, buf);
        }
        FieldKind::Float => {
            let v = value.as_f64().ok_or_else(|| mismatch("a number"))?;
            if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                return Err(out_of_range("float"));
            }
            buf.put_f32_le(v as f32);
        }
        FieldKind::Double => {
            let v = value.as_f64().ok_or_else(|| mismatch("a number"))?;
            buf.put_f64_le(v);
        }
        FieldKind::String => {
            let s = value.as_str().ok_or_else(|| mismatch("a string"))?;
            encode_varint(s.len() as u64, buf);
            buf.put_slice(s.as_bytes());
        }
        FieldKind::Bytes => {
            let bytes: &[u8] = match value {
                Value::Bytes(b) => b,
                Value::String(s) => s.as_bytes(),
                _ => return Err(mismatch("bytes")),
            };
            encode_varint(bytes.len() as u64, buf);
            buf.put_slice(bytes);
        }
        FieldKind::Message(schema) => {
            let nested = value.as_message().ok_or_else(|| mismatch("a message"))?;
            let mut inner = BytesMut::new();
            encode_message(schema, nested, &mut inner, depth + 1)?;
            encode_varint(inner.len() as u64, buf);
            buf.put(inner);
        }
    }
    Ok(())
}

fn decode_message(
    schema: &MessageSchema,
    buf: &mut Bytes,
    depth: usize,
) -> Result<Message, WireError> {
    let mut message = schema.default_message();
    merge_message(schema, buf, depth, &mut message)?;
    Ok(message)
}

/// Decodes `buf` on top of `message`. Later scalars replace earlier ones,
/// repeated fields append and singular nested messages merge recursively.
fn merge_message(
    schema: &MessageSchema,
    buf: &mut Bytes,
    depth: usize,
    message: &mut Message,
) -> Result<(), WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::RecursionLimit);
    }
    while buf.has_remaining() {
        let (number, wire) = decode_key(buf)?;
        let Some(field) = schema.field_by_number(number) else {
            skip_field(wire, number, buf, DecodeContext::default())?;
            continue;
        };

        if field.repeated && field.kind.is_packable() && wire == WireType::LengthDelimited {
            let mut packed = take_delimited(field, buf)?;
            while packed.has_remaining() {
                let value = decode_value(field, &mut packed, depth)?;
                message.push(&field.name, value);
            }
            continue;
        }

        if wire != wire_type(&field.kind) {
            return Err(WireError::WireTypeMismatch {
                field: field.name.clone(),
                wire_type: wire,
            });
        }
        match &field.kind {
            FieldKind::Message(nested) if !field.repeated => {
                let mut raw = take_delimited(field, buf)?;
                let mut current = match message.remove(&field.name) {
                    Some(Value::Message(previous)) => previous,
                    _ => nested.default_message(),
                };
                merge_message(nested, &mut raw, depth + 1, &mut current)?;
                message.set(field.name.clone(), current);
            }
            _ if field.repeated => {
                let value = decode_value(field, buf, depth)?;
                message.push(&field.name, value);
            }
            _ => {
                let value = decode_value(field, buf, depth)?;
                message.set(field.name.clone(), value);
            }
        }
    }
    Ok(())
}

/// Reads one value whose key has already been consumed.
fn decode_value(field: &FieldDescriptor, buf: &mut Bytes, depth: usize) -> Result<Value, WireError> {
    let value = match &field.kind {
        FieldKind::Bool => Value::Bool(decode_varint(buf)? != 0),
        FieldKind::Int32 => Value::I64(i64::from(decode_varint(buf)? as i32)),
        FieldKind::Int64 => Value::I64(decode_varint(buf)? as i64),
        FieldKind::Uint32 => Value::U64(u64::from(decode_varint(buf)? as u32)),
        FieldKind::Uint64 => Value::U64(decode_varint(buf)?),
        FieldKind::Float => {
            ensure_remaining(field, buf, 4)?;
            Value::F64(f64::from(buf.get_f32_le()))
        }
        FieldKind::Double => {
            ensure_remaining(field, buf, 8)?;
            Value::F64(buf.get_f64_le())
        }
        FieldKind::String => {
            let raw = take_delimited(field, buf)?;
            let s = String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8 {
                field: field.name.clone(),
            })?;
            Value::String(s)
        }
        FieldKind::Bytes => Value::Bytes(take_delimited(field, buf)?),
        FieldKind::Message(schema) => {
            let mut raw = take_delimited(field, buf)?;
            Value::Message(decode_message(schema, &mut raw, depth + 1)?)
        }
    };
    Ok(value)
}

fn take_delimited(field: &FieldDescriptor, buf: &mut Bytes) -> Result<Bytes, WireError> {
    let len = decode_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| WireError::Truncated {
        field: field.name.clone(),
    })?;
    ensure_remaining(field, buf, len)?;
    Ok(buf.split_to(len))
}

fn ensure_remaining(field: &FieldDescriptor, buf: &Bytes, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated {
            field: field.name.clone(),
        });
    }
    Ok(())
}

fn wire_type(kind: &FieldKind) -> WireType {
    match kind {
        FieldKind::Bool
        | FieldKind::Int32
        | FieldKind::Int64
        | FieldKind::Uint32
        | FieldKind::Uint64 => WireType::Varint,
        FieldKind::Float => WireType::ThirtyTwoBit,
        FieldKind::Double => WireType::SixtyFourBit,
        FieldKind::String | FieldKind::Bytes | FieldKind::Message(_) => WireType::LengthDelimited,
    }
}

/// Integer view of a value, accepting integral floats.
fn signed(value: &Value) -> Option<i64> {
    match value {
        Value::F64(v) if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 => {
            Some(*v as i64)
        }
        other => other.as_i64(),
    }
}

fn unsigned(value: &Value) -> Option<u64> {
    match value {
        Value::F64(v) if v.fract() == 0.0 && *v >= 0.0 && *v < u64::MAX as f64 => Some(*v as u64),
        other => other.as_u64(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use prost::Message as _;

    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Inner {
        #[prost(string, tag = "1")]
        label: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Sample {
        #[prost(string, tag = "1")]
        name: String,
        #[prost(int32, tag = "2")]
        count: i32,
        #[prost(int64, repeated, tag = "3")]
        ids: Vec<i64>,
        #[prost(message, optional, tag = "4")]
        inner: Option<Inner>,
        #[prost(double, tag = "5")]
        ratio: f64,
        #[prost(bytes = "vec", tag = "6")]
        blob: Vec<u8>,
        #[prost(bool, tag = "7")]
        flag: bool,
        #[prost(uint32, tag = "8")]
        small: u32,
        #[prost(string, repeated, tag = "9")]
        tags: Vec<String>,
        #[prost(float, tag = "10")]
        scale: f32,
    }

    fn inner_schema() -> Arc<MessageSchema> {
        Arc::new(
            MessageSchema::new("test.Inner")
                .with_field(FieldDescriptor::new("label", 1, FieldKind::String)),
        )
    }

    fn sample_schema() -> MessageSchema {
        MessageSchema::new("test.Sample")
            .with_field(FieldDescriptor::new("name", 1, FieldKind::String))
            .with_field(FieldDescriptor::new("count", 2, FieldKind::Int32))
            .with_field(FieldDescriptor::new("ids", 3, FieldKind::Int64).repeated())
            .with_field(FieldDescriptor::new("inner", 4, FieldKind::Message(inner_schema())))
            .with_field(FieldDescriptor::new("ratio", 5, FieldKind::Double))
            .with_field(FieldDescriptor::new("blob", 6, FieldKind::Bytes))
            .with_field(FieldDescriptor::new("flag", 7, FieldKind::Bool))
            .with_field(FieldDescriptor::new("small", 8, FieldKind::Uint32))
            .with_field(FieldDescriptor::new("tags", 9, FieldKind::String).repeated())
            .with_field(FieldDescriptor::new("scale", 10, FieldKind::Float))
    }

    #[test]
    fn test_encode_matches_prost() {
        let message = Message::new()
            .with("name", "Ada")
            .with("count", -7)
            .with("ids", vec![1i64, 300, -2])
            .with("inner", Message::new().with("label", "x"))
            .with("ratio", 0.5)
            .with("blob", Bytes::from_static(b"\x00\x01"))
            .with("flag", true)
            .with("small", 42u32)
            .with("tags", vec!["a", "b"])
            .with("scale", 1.5f32);

        let encoded = encode(&sample_schema(), &message).unwrap();
        let decoded = Sample::decode(encoded.clone()).unwrap();
        let expected = Sample {
            name: "Ada".into(),
            count: -7,
            ids: vec![1, 300, -2],
            inner: Some(Inner { label: "x".into() }),
            ratio: 0.5,
            blob: vec![0, 1],
            flag: true,
            small: 42,
            tags: vec!["a".into(), "b".into()],
            scale: 1.5,
        };
        assert_eq!(decoded, expected);
        assert_eq!(encoded.as_ref(), expected.encode_to_vec().as_slice());
    }

    #[test]
    fn test_decode_prost_output() {
        let sample = Sample {
            name: "Grace".into(),
            count: i32::MIN,
            ids: vec![i64::MAX],
            tags: vec!["t".into()],
            ..Default::default()
        };
        let message = decode(&sample_schema(), Bytes::from(sample.encode_to_vec())).unwrap();
        assert_eq!(message.get_str("name"), Some("Grace"));
        assert_eq!(message.get("count"), Some(&Value::I64(i64::from(i32::MIN))));
        assert_eq!(message.get("ids"), Some(&Value::List(vec![Value::I64(i64::MAX)])));
        assert_eq!(message.get("tags"), Some(&Value::List(vec!["t".into()])));
        // Absent fields decode to their zero values.
        assert_eq!(message.get("flag"), Some(&Value::Bool(false)));
        assert_eq!(message.get("blob"), Some(&Value::Bytes(Bytes::new())));
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Part {
        #[prost(string, tag = "1")]
        label: String,
        #[prost(int32, tag = "2")]
        count: i32,
        #[prost(string, repeated, tag = "3")]
        tags: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Outer {
        #[prost(message, optional, tag = "1")]
        part: Option<Part>,
    }

    #[test]
    fn test_repeated_nested_message_merges() {
        let part = Arc::new(
            MessageSchema::new("test.Part")
                .with_field(FieldDescriptor::new("label", 1, FieldKind::String))
                .with_field(FieldDescriptor::new("count", 2, FieldKind::Int32))
                .with_field(FieldDescriptor::new("tags", 3, FieldKind::String).repeated()),
        );
        let outer = MessageSchema::new("test.Outer")
            .with_field(FieldDescriptor::new("part", 1, FieldKind::Message(part)));

        let first = Outer {
            part: Some(Part {
                label: "a".into(),
                tags: vec!["x".into()],
                ..Default::default()
            }),
        };
        let second = Outer {
            part: Some(Part {
                count: 5,
                tags: vec!["y".into()],
                ..Default::default()
            }),
        };
        let mut wire = first.encode_to_vec();
        wire.extend(second.encode_to_vec());

        let merged = Outer::decode(wire.as_slice()).unwrap();
        assert_eq!(
            merged.part,
            Some(Part {
                label: "a".into(),
                count: 5,
                tags: vec!["x".into(), "y".into()],
            })
        );

        let message = decode(&outer, Bytes::from(wire)).unwrap();
        let Some(Value::Message(part)) = message.get("part") else {
            panic!("part missing");
        };
        assert_eq!(part.get_str("label"), Some("a"));
        assert_eq!(part.get("count"), Some(&Value::I64(5)));
        assert_eq!(
            part.get("tags"),
            Some(&Value::List(vec!["x".into(), "y".into()]))
        );
    }

    #[test]
    fn test_zero_values_are_omitted() {
        let message = Message::new().with("name", "").with("count", 0);
        let encoded = encode(&sample_schema(), &message).unwrap();
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let wide = Sample {
            name: "kept".into(),
            ratio: 2.0,
            small: 9,
            ..Default::default()
        };
        let narrow = MessageSchema::new("test.Narrow")
            .with_field(FieldDescriptor::new("name", 1, FieldKind::String));
        let message = decode(&narrow, Bytes::from(wide.encode_to_vec())).unwrap();
        assert_eq!(message.get_str("name"), Some("kept"));
        assert_eq!(message.len(), 1);
    }

    #[test]
    fn test_unpacked_repeated_is_accepted() {
        let schema = sample_schema();
        let mut buf = BytesMut::new();
        for id in [5u64, 6] {
            encode_key(3, WireType::Varint, &mut buf);
            encode_varint(id, &mut buf);
        }
        let message = decode(&schema, buf.freeze()).unwrap();
        assert_eq!(message.get("ids"), Some(&Value::List(vec![5i64.into(), 6i64.into()])));
    }

    #[test]
    fn test_type_mismatch() {
        let message = Message::new().with("count", "seven");
        let err = encode(&sample_schema(), &message).unwrap_err();
        assert!(matches!(err, WireError::TypeMismatch { ref field, .. } if field == "count"));
    }

    #[test]
    fn test_int32_out_of_range() {
        let message = Message::new().with("count", i64::from(i32::MAX) + 1);
        let err = encode(&sample_schema(), &message).unwrap_err();
        assert!(matches!(err, WireError::OutOfRange { kind: "int32", .. }));
    }

    #[test]
    fn test_integral_float_is_accepted() {
        let message = Message::new().with("count", 3.0);
        let encoded = encode(&sample_schema(), &message).unwrap();
        assert_eq!(Sample::decode(encoded).unwrap().count, 3);
    }

    #[test]
    fn test_truncated_string() {
        let mut buf = BytesMut::new();
        encode_key(1, WireType::LengthDelimited, &mut buf);
        encode_varint(10, &mut buf);
        buf.put_slice(b"abc");
        let err = decode(&sample_schema(), buf.freeze()).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn test_wire_type_mismatch() {
        let mut buf = BytesMut::new();
        encode_key(1, WireType::Varint, &mut buf);
        encode_varint(1, &mut buf);
        let err = decode(&sample_schema(), buf.freeze()).unwrap_err();
        assert!(matches!(err, WireError::WireTypeMismatch { .. }));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = BytesMut::new();
        encode_key(1, WireType::LengthDelimited, &mut buf);
        encode_varint(2, &mut buf);
        buf.put_slice(&[0xff, 0xfe]);
        let err = decode(&sample_schema(), buf.freeze()).unwrap_err();
        assert!(matches!(err, WireError::InvalidUtf8 { .. }));
    }
}
