//! Declarative field validation.

use thiserror::Error;
use tonic::{Code, Status};
use tonic_types::{ErrorDetails, StatusExt};

use super::{FieldKind, Message, MessageSchema, Value};

/// A constraint attached to a field.
#[derive(Clone, Debug, PartialEq)]
pub enum Rule {
    /// The field must hold a non-zero value.
    Required,
    /// Minimum length of a string (in characters), bytes or list.
    MinLen(usize),
    /// Maximum length of a string (in characters), bytes or list.
    MaxLen(usize),
    /// Inclusive bounds for numeric values, applied to every element of a
    /// repeated field.
    Range { min: f64, max: f64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid {message}: {}", summary(.violations))]
pub struct ValidationErrors {
    pub message: String,
    pub violations: Vec<FieldViolation>,
}

fn summary(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Violations travel as `google.rpc.BadRequest` details.
impl From<ValidationErrors> for Status {
    fn from(err: ValidationErrors) -> Self {
        let violations = err
            .violations
            .iter()
            .map(|v| tonic_types::FieldViolation::new(v.field.clone(), v.reason.clone()))
            .collect::<Vec<_>>();
        Status::with_error_details(
            Code::InvalidArgument,
            err.to_string(),
            ErrorDetails::with_bad_request(violations),
        )
    }
}

pub trait Validate {
    /// Every rule violation in `message`, with dotted field paths.
    fn violations(&self, message: &Message) -> Vec<FieldViolation>;

    fn validate(&self, message: &Message) -> Result<(), ValidationErrors>;
}

impl Validate for MessageSchema {
    fn violations(&self, message: &Message) -> Vec<FieldViolation> {
        let mut out = Vec::new();
        collect(self, message, "", &mut out);
        out
    }

    fn validate(&self, message: &Message) -> Result<(), ValidationErrors> {
        let violations = self.violations(message);
        if violations.is_empty() {
            return Ok(());
        }
        Err(ValidationErrors {
            message: self.full_name().to_string(),
            violations,
        })
    }
}

fn collect(schema: &MessageSchema, message: &Message, prefix: &str, out: &mut Vec<FieldViolation>) {
    for field in schema.fields() {
        let path = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{prefix}.{}", field.name)
        };
        let value = message.get(&field.name);

        for rule in &field.rules {
            if let Some(reason) = check(rule, value) {
                out.push(FieldViolation::new(path.clone(), reason));
            }
        }

        let FieldKind::Message(nested) = &field.kind else {
            continue;
        };
        match value {
            Some(Value::Message(m)) => collect(nested, m, &path, out),
            Some(Value::List(items)) => {
                for (i, item) in items.iter().enumerate() {
                    if let Value::Message(m) = item {
                        collect(nested, m, &format!("{path}[{i}]"), out);
                    }
                }
            }
            _ => {}
        }
    }
}

/// The reason `rule` rejects `value`, if it does.
fn check(rule: &Rule, value: Option<&Value>) -> Option<String> {
    match rule {
        Rule::Required => match value {
            Some(v) if !is_zero(v) => None,
            _ => Some("value is required".to_string()),
        },
        Rule::MinLen(min) => {
            let len = length(value?)?;
            (len < *min).then(|| format!("length must be at least {min}"))
        }
        Rule::MaxLen(max) => {
            let len = length(value?)?;
            (len > *max).then(|| format!("length must be at most {max}"))
        }
        Rule::Range { min, max } => {
            let in_range = |v: &Value| v.as_f64().is_none_or(|n| n >= *min && n <= *max);
            let ok = match value? {
                Value::List(items) => items.iter().all(in_range),
                single => in_range(single),
            };
            (!ok).then(|| format!("value must be between {min} and {max}"))
        }
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Bytes(b) => Some(b.len()),
        Value::List(items) => Some(items.len()),
        _ => None,
    }
}

/// Zero values, including messages whose fields are all zero.
fn is_zero(value: &Value) -> bool {
    match value {
        Value::Message(m) => m.iter().all(|(_, v)| is_zero(v)),
        other => other.is_default(),
    }
}
