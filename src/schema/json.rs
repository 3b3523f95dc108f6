//! JSON mapping for dynamic messages.
//!
//! Output uses schema field names in schema order. Input accepts either the
//! schema name or its lowerCamelCase form, ignores unknown keys and treats
//! `null` as absent.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use bytes::Bytes;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use sonic_rs::{JsonContainerTrait, JsonValueTrait};
use thiserror::Error;

use super::message::serialize_f64;
use super::{FieldDescriptor, FieldKind, Message, MessageSchema, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JsonError {
    #[error("Expected a JSON object for `{path}`")]
    NotAnObject { path: String },

    #[error("Field `{path}` expects {expected}")]
    TypeMismatch { path: String, expected: &'static str },

    #[error("Field `{path}` is out of range for {kind}")]
    OutOfRange { path: String, kind: &'static str },

    #[error("Field `{path}` is not valid base64")]
    InvalidBase64 { path: String },
}

impl JsonError {
    /// Dotted path of the offending field.
    pub fn path(&self) -> &str {
        match self {
            JsonError::NotAnObject { path }
            | JsonError::TypeMismatch { path, .. }
            | JsonError::OutOfRange { path, .. }
            | JsonError::InvalidBase64 { path } => path,
        }
    }
}

/// Serializes a message in schema order.
pub struct JsonMessage<'a> {
    schema: &'a MessageSchema,
    message: &'a Message,
}

impl<'a> JsonMessage<'a> {
    pub fn new(schema: &'a MessageSchema, message: &'a Message) -> Self {
        Self { schema, message }
    }
}

impl Serialize for JsonMessage<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let present: Vec<(&FieldDescriptor, &Value)> = self
            .schema
            .fields()
            .iter()
            .filter_map(|f| self.message.get(&f.name).map(|v| (f, v)))
            .collect();
        let mut map = serializer.serialize_map(Some(present.len()))?;
        for (field, value) in present {
            map.serialize_entry(&field.name, &JsonValue { field, value })?;
        }
        map.end()
    }
}

struct JsonValue<'a> {
    field: &'a FieldDescriptor,
    value: &'a Value,
}

impl Serialize for JsonValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match (&self.field.kind, self.value) {
            (_, Value::List(items)) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&JsonValue {
                        field: self.field,
                        value: item,
                    })?;
                }
                seq.end()
            }
            (FieldKind::Message(schema), Value::Message(nested)) => {
                JsonMessage::new(schema, nested).serialize(serializer)
            }
            (FieldKind::Float, Value::F64(v)) if v.is_finite() => {
                serializer.serialize_f32(*v as f32)
            }
            (_, Value::F64(v)) => serialize_f64(*v, serializer),
            (_, other) => other.serialize(serializer),
        }
    }
}

/// Merges the keys of a JSON object into `message`, overwriting fields that
/// are already set.
pub fn merge_json(
    schema: &MessageSchema,
    json: &sonic_rs::Value,
    message: &mut Message,
    prefix: &str,
) -> Result<(), JsonError> {
    let object = json.as_object().ok_or_else(|| JsonError::NotAnObject {
        path: prefix.to_string(),
    })?;
    for (key, raw) in object.iter() {
        let Some(field) = lookup_field(schema, key) else {
            continue;
        };
        let path = join(prefix, &field.name);
        if let Some(value) = field_from_json_at(field, raw, &path)? {
            message.set(field.name.clone(), value);
        }
    }
    Ok(())
}

/// Converts a JSON value for one field. `None` when the value is `null`.
pub fn field_from_json(
    field: &FieldDescriptor,
    json: &sonic_rs::Value,
) -> Result<Option<Value>, JsonError> {
    field_from_json_at(field, json, &field.name)
}

fn field_from_json_at(
    field: &FieldDescriptor,
    json: &sonic_rs::Value,
    path: &str,
) -> Result<Option<Value>, JsonError> {
    if json.is_null() {
        return Ok(None);
    }
    if !field.repeated {
        return scalar_from_json(&field.kind, json, path).map(Some);
    }
    let items = json.as_array().ok_or_else(|| JsonError::TypeMismatch {
        path: path.to_string(),
        expected: "an array",
    })?;
    let values = items
        .iter()
        .map(|item| scalar_from_json(&field.kind, item, path))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(Value::List(values)))
}

fn scalar_from_json(
    kind: &FieldKind,
    json: &sonic_rs::Value,
    path: &str,
) -> Result<Value, JsonError> {
    let mismatch = |expected| JsonError::TypeMismatch {
        path: path.to_string(),
        expected,
    };
    let out_of_range = |kind| JsonError::OutOfRange {
        path: path.to_string(),
        kind,
    };

    let value = match kind {
        FieldKind::Bool => Value::Bool(json.as_bool().ok_or_else(|| mismatch("a boolean"))?),
        FieldKind::Int32 | FieldKind::Int64 => {
            let v = if let Some(s) = json.as_str() {
                s.trim().parse::<i64>().map_err(|_| mismatch("an integer"))?
            } else if let Some(v) = json.as_i64() {
                v
            } else if json.as_u64().is_some() {
                return Err(out_of_range(kind_name(kind)));
            } else {
                integral(json).ok_or_else(|| mismatch("an integer"))?
            };
            if matches!(kind, FieldKind::Int32) && i32::try_from(v).is_err() {
                return Err(out_of_range("int32"));
            }
            Value::I64(v)
        }
        FieldKind::Uint32 | FieldKind::Uint64 => {
            let v = if let Some(s) = json.as_str() {
                s.trim()
                    .parse::<u64>()
                    .map_err(|_| mismatch("a non-negative integer"))?
            } else if let Some(v) = json.as_u64() {
                v
            } else if json.as_i64().is_some() {
                return Err(out_of_range(kind_name(kind)));
            } else {
                let v = integral(json).ok_or_else(|| mismatch("a non-negative integer"))?;
                u64::try_from(v).map_err(|_| out_of_range(kind_name(kind)))?
            };
            if matches!(kind, FieldKind::Uint32) && u32::try_from(v).is_err() {
                return Err(out_of_range("uint32"));
            }
            Value::U64(v)
        }
        FieldKind::Float | FieldKind::Double => {
            let v = match json.as_str() {
                Some(s) => parse_float(s).ok_or_else(|| mismatch("a number"))?,
                None => json.as_f64().ok_or_else(|| mismatch("a number"))?,
            };
            if matches!(kind, FieldKind::Float) && v.is_finite() && v.abs() > f64::from(f32::MAX)
            {
                return Err(out_of_range("float"));
            }
            Value::F64(v)
        }
        FieldKind::String => {
            Value::String(json.as_str().ok_or_else(|| mismatch("a string"))?.to_string())
        }
        FieldKind::Bytes => {
            let text = json.as_str().ok_or_else(|| mismatch("a base64 string"))?;
            Value::Bytes(decode_base64(text).ok_or_else(|| JsonError::InvalidBase64 {
                path: path.to_string(),
            })?)
        }
        FieldKind::Message(schema) => {
            let mut nested = Message::new();
            merge_json(schema, json, &mut nested, path)?;
            Value::Message(nested)
        }
    };
    Ok(value)
}

/// Parses a path or query parameter for a scalar field.
pub fn value_from_text(field: &FieldDescriptor, text: &str) -> Result<Value, JsonError> {
    let path = field.name.as_str();
    let mismatch = |expected| JsonError::TypeMismatch {
        path: path.to_string(),
        expected,
    };
    match &field.kind {
        FieldKind::String => Ok(Value::String(text.to_string())),
        FieldKind::Bytes => decode_base64(text)
            .map(Value::Bytes)
            .ok_or_else(|| JsonError::InvalidBase64 {
                path: path.to_string(),
            }),
        FieldKind::Bool => match text {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(mismatch("a boolean")),
        },
        FieldKind::Message(_) => Err(mismatch("a message")),
        kind => {
            // Numbers share the JSON rules, including range checks.
            let json = sonic_rs::Value::from(text);
            scalar_from_json(kind, &json, path)
        }
    }
}

/// Schema field for a JSON key: the field name itself or its lowerCamelCase
/// form.
fn lookup_field<'a>(schema: &'a MessageSchema, key: &str) -> Option<&'a FieldDescriptor> {
    schema
        .field(key)
        .or_else(|| schema.fields().iter().find(|f| camel_case(&f.name) == key))
}

pub(crate) fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn integral(json: &sonic_rs::Value) -> Option<i64> {
    let v = json.as_f64()?;
    (v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64).then_some(v as i64)
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
    }
}

fn decode_base64(text: &str) -> Option<Bytes> {
    STANDARD
        .decode(text)
        .or_else(|_| URL_SAFE.decode(text))
        .ok()
        .map(Bytes::from)
}

fn kind_name(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::Int32 => "int32",
        FieldKind::Int64 => "int64",
        FieldKind::Uint32 => "uint32",
        _ => "uint64",
    }
}
