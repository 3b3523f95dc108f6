//! HTTP path templates.
//!
//! Supports the usual gateway subset: literal segments, `*`, a trailing `**`,
//! variables `{field}` / `{field=pattern}` and an optional `:verb` suffix.

use std::cmp::Reverse;

use percent_encoding::percent_decode_str;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("template must start with `/`")]
    MissingLeadingSlash,

    #[error("template has an empty segment")]
    EmptySegment,

    #[error("unclosed variable")]
    UnclosedVariable,

    #[error("variable has an empty field path")]
    EmptyFieldPath,

    #[error("invalid field path `{0}`")]
    InvalidFieldPath(String),

    #[error("variable `{0}` appears more than once")]
    DuplicateVariable(String),

    #[error("`**` must be the last segment")]
    DeepWildcardNotLast,

    #[error("invalid character in segment `{0}`")]
    InvalidSegment(String),
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Wildcard,
    DeepWildcard,
}

/// A variable and the template segments it captures.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub field: String,
    start: usize,
    end: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
    variables: Vec<Variable>,
    verb: Option<String>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let path = raw
            .strip_prefix('/')
            .ok_or(TemplateError::MissingLeadingSlash)?;

        let (path, verb) = split_verb(path);
        let mut segments = Vec::new();
        let mut variables: Vec<Variable> = Vec::new();

        let mut rest = path;
        while !rest.is_empty() {
            let token;
            if let Some(inner) = rest.strip_prefix('{') {
                let close = inner.find('}').ok_or(TemplateError::UnclosedVariable)?;
                let (field, pattern) = match inner[..close].split_once('=') {
                    Some((field, pattern)) => (field, pattern),
                    None => (&inner[..close], "*"),
                };
                check_field_path(field)?;
                if variables.iter().any(|v| v.field == field) {
                    return Err(TemplateError::DuplicateVariable(field.to_string()));
                }
                let start = segments.len();
                for part in pattern.split('/') {
                    segments.push(parse_segment(part)?);
                }
                variables.push(Variable {
                    field: field.to_string(),
                    start,
                    end: segments.len(),
                });
                token = &inner[..close];
                rest = &inner[close + 1..];
            } else {
                let end = rest.find('/').unwrap_or(rest.len());
                token = &rest[..end];
                segments.push(parse_segment(token)?);
                rest = &rest[end..];
            }

            match rest.strip_prefix('/') {
                Some("") => return Err(TemplateError::EmptySegment),
                Some(next) => rest = next,
                None if rest.is_empty() => {}
                None => return Err(TemplateError::InvalidSegment(token.to_string())),
            }
        }

        let deep = segments
            .iter()
            .position(|s| *s == Segment::DeepWildcard);
        if deep.is_some_and(|i| i + 1 != segments.len()) {
            return Err(TemplateError::DeepWildcardNotLast);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
            variables,
            verb: verb.map(str::to_string),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn verb(&self) -> Option<&str> {
        self.verb.as_deref()
    }

    /// Matches a request path, returning the percent-decoded variable values.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let path = path.strip_prefix('/')?;
        let path = match &self.verb {
            Some(verb) => path.strip_suffix(verb.as_str())?.strip_suffix(':')?,
            None => path,
        };
        let parts: Vec<&str> = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/').collect()
        };

        // Template index -> the slice of `parts` it consumed.
        let mut spans = Vec::with_capacity(self.segments.len());
        let mut pos = 0;
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    let part = parts.get(pos)?;
                    if decode(part) != *lit {
                        return None;
                    }
                    spans.push((pos, pos + 1));
                    pos += 1;
                }
                Segment::Wildcard => {
                    let part = parts.get(pos)?;
                    if part.is_empty() {
                        return None;
                    }
                    spans.push((pos, pos + 1));
                    pos += 1;
                }
                Segment::DeepWildcard => {
                    spans.push((pos, parts.len()));
                    pos = parts.len();
                }
            }
        }
        if pos != parts.len() {
            return None;
        }

        let params = self
            .variables
            .iter()
            .map(|var| {
                let from = spans.get(var.start).map_or(pos, |s| s.0);
                let to = var
                    .end
                    .checked_sub(1)
                    .and_then(|i| spans.get(i))
                    .map_or(from, |s| s.1);
                (var.field.clone(), decode(&parts[from..to].join("/")))
            })
            .collect();
        Some(params)
    }

    /// Ranking among templates that match the same path: more literal
    /// segments first, then fewer `**` wildcards.
    pub fn specificity(&self) -> (usize, Reverse<usize>) {
        let literals = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
            + usize::from(self.verb.is_some());
        let deep = self
            .segments
            .iter()
            .filter(|s| **s == Segment::DeepWildcard)
            .count();
        (literals, Reverse(deep))
    }

    /// The template with variable names erased. Two templates with the same
    /// shape match exactly the same paths.
    pub fn shape(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            out.push('/');
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Wildcard => out.push('*'),
                Segment::DeepWildcard => out.push_str("**"),
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        if let Some(verb) = &self.verb {
            out.push(':');
            out.push_str(verb);
        }
        out
    }
}

impl std::fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Splits a trailing `:verb` that is not part of a variable.
fn split_verb(path: &str) -> (&str, Option<&str>) {
    let Some(colon) = path.rfind(':') else {
        return (path, None);
    };
    let after_slash = path.rfind('/').is_none_or(|slash| colon > slash);
    let after_brace = path.rfind('}').is_none_or(|brace| colon > brace);
    if after_slash && after_brace && colon + 1 < path.len() {
        (&path[..colon], Some(&path[colon + 1..]))
    } else {
        (path, None)
    }
}

fn parse_segment(token: &str) -> Result<Segment, TemplateError> {
    match token {
        "" => Err(TemplateError::EmptySegment),
        "*" => Ok(Segment::Wildcard),
        "**" => Ok(Segment::DeepWildcard),
        lit if lit.contains(['{', '}', '=', '*']) => {
            Err(TemplateError::InvalidSegment(lit.to_string()))
        }
        lit => Ok(Segment::Literal(lit.to_string())),
    }
}

fn check_field_path(field: &str) -> Result<(), TemplateError> {
    if field.is_empty() {
        return Err(TemplateError::EmptyFieldPath);
    }
    let valid = field.split('.').all(|part| {
        let mut chars = part.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    if !valid {
        return Err(TemplateError::InvalidFieldPath(field.to_string()));
    }
    Ok(())
}

fn decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
