//! Message schemas and the dynamic messages they describe.
//!
//! A [`MessageSchema`] is the runtime equivalent of a protobuf message
//! definition: an ordered list of numbered, typed fields. Messages are plain
//! field-name keyed records ([`Message`]) that are encoded to the protobuf wire
//! format by [`wire`] and to JSON by [`json`].

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

pub mod json;
pub mod message;
pub mod validate;
pub mod wire;

pub use message::{Message, Value};
pub use validate::{FieldViolation, Rule, Validate, ValidationErrors};

/// Highest field number protobuf allows.
pub const MAX_FIELD_NUMBER: u32 = 536_870_911;

/// Field numbers reserved by the protobuf implementation.
const RESERVED_FIELD_NUMBERS: std::ops::RangeInclusive<u32> = 19_000..=19_999;

#[derive(Error, Debug, PartialEq)]
pub enum SchemaError {
    #[error("message name must not be empty")]
    EmptyName,

    #[error("{message}: duplicate field name `{field}`")]
    DuplicateFieldName { message: String, field: String },

    #[error("{message}: field number {number} is used more than once")]
    DuplicateFieldNumber { message: String, number: u32 },

    #[error("{message}: field `{field}` has invalid number {number}")]
    InvalidFieldNumber {
        message: String,
        field: String,
        number: u32,
    },
}

/// The type of a single field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float,
    Double,
    String,
    Bytes,
    Message(Arc<MessageSchema>),
}

impl FieldKind {
    /// Protobuf scalar type name, or the message name for nested messages.
    pub fn name(&self) -> &str {
        match self {
            FieldKind::Bool => "bool",
            FieldKind::Int32 => "int32",
            FieldKind::Int64 => "int64",
            FieldKind::Uint32 => "uint32",
            FieldKind::Uint64 => "uint64",
            FieldKind::Float => "float",
            FieldKind::Double => "double",
            FieldKind::String => "string",
            FieldKind::Bytes => "bytes",
            FieldKind::Message(schema) => schema.full_name(),
        }
    }

    /// Numeric and bool fields use packed encoding when repeated.
    pub fn is_packable(&self) -> bool {
        !matches!(
            self,
            FieldKind::String | FieldKind::Bytes | FieldKind::Message(_)
        )
    }

    pub fn is_message(&self) -> bool {
        matches!(self, FieldKind::Message(_))
    }
}

/// A single field of a [`MessageSchema`].
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub number: u32,
    pub kind: FieldKind,
    pub repeated: bool,
    pub rules: Vec<Rule>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, number: u32, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            number,
            kind,
            repeated: false,
            rules: Vec::new(),
        }
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// The value an absent field decodes to.
    pub fn default_value(&self) -> Value {
        if self.repeated {
            return Value::List(Vec::new());
        }
        match &self.kind {
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Int32 | FieldKind::Int64 => Value::I64(0),
            FieldKind::Uint32 | FieldKind::Uint64 => Value::U64(0),
            FieldKind::Float | FieldKind::Double => Value::F64(0.0),
            FieldKind::String => Value::String(String::new()),
            FieldKind::Bytes => Value::Bytes(bytes::Bytes::new()),
            FieldKind::Message(schema) => Value::Message(schema.default_message()),
        }
    }
}

/// Schema of one message type, identified by its fully-qualified name
/// (`package.Message`).
#[derive(Clone, Debug, PartialEq)]
pub struct MessageSchema {
    name: String,
    fields: Vec<FieldDescriptor>,
}

impl MessageSchema {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            name: full_name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn full_name(&self) -> &str {
        &self.name
    }

    /// Everything before the last `.` of the full name.
    pub fn package(&self) -> &str {
        self.name.rsplit_once('.').map(|(pkg, _)| pkg).unwrap_or("")
    }

    pub fn simple_name(&self) -> &str {
        self.name
            .rsplit_once('.')
            .map(|(_, name)| name)
            .unwrap_or(&self.name)
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_number(&self, number: u32) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.number == number)
    }

    /// A message holding the zero value of every field.
    pub fn default_message(&self) -> Message {
        let mut message = Message::new();
        for field in &self.fields {
            message.set(field.name.clone(), field.default_value());
        }
        message
    }

    /// Resolves a dotted field path (`address.city`) through nested,
    /// non-repeated message fields. Returns the descriptors along the path.
    pub fn resolve_path(&self, path: &str) -> Option<Vec<&FieldDescriptor>> {
        let mut resolved = Vec::new();
        let mut schema = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let field = schema.field(segment)?;
            resolved.push(field);
            if segments.peek().is_some() {
                match &field.kind {
                    FieldKind::Message(nested) if !field.repeated => schema = nested,
                    _ => return None,
                }
            }
        }
        Some(resolved)
    }

    /// Every message schema reachable from this one, itself included.
    pub fn reachable(root: &Arc<MessageSchema>) -> Vec<Arc<MessageSchema>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![Arc::clone(root)];
        while let Some(schema) = stack.pop() {
            if !seen.insert(schema.name.clone()) {
                continue;
            }
            for field in &schema.fields {
                if let FieldKind::Message(nested) = &field.kind {
                    stack.push(Arc::clone(nested));
                }
            }
            out.push(schema);
        }
        out
    }

    /// Checks names and numbers, recursing into nested schemas.
    pub fn check(&self) -> Result<(), SchemaError> {
        if self.name.is_empty() {
            return Err(SchemaError::EmptyName);
        }
        let mut names = HashSet::new();
        let mut numbers = HashSet::new();
        for field in &self.fields {
            if field.number == 0
                || field.number > MAX_FIELD_NUMBER
                || RESERVED_FIELD_NUMBERS.contains(&field.number)
            {
                return Err(SchemaError::InvalidFieldNumber {
                    message: self.name.clone(),
                    field: field.name.clone(),
                    number: field.number,
                });
            }
            if !names.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateFieldName {
                    message: self.name.clone(),
                    field: field.name.clone(),
                });
            }
            if !numbers.insert(field.number) {
                return Err(SchemaError::DuplicateFieldNumber {
                    message: self.name.clone(),
                    number: field.number,
                });
            }
            if let FieldKind::Message(nested) = &field.kind {
                nested.check()?;
            }
        }
        Ok(())
    }
}
