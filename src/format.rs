//! Serialization format abstraction.
//!
//! Provides a unified interface for HTTP request and response bodies.
//! Currently supports JSON via sonic-rs.

use serde::Serialize;

use crate::error::GatewayError;

/// Supported serialization formats.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum Format {
    #[default]
    Json,
}

impl std::str::FromStr for Format {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parameters such as `; charset=utf-8` do not change the format.
        let essence = s.split(';').next().unwrap_or("").trim();
        match essence {
            "application/json" => Ok(Format::Json),
            _ => Err(()),
        }
    }
}

impl Format {
    /// Returns the MIME content type for this format.
    pub fn content_type(self) -> &'static str {
        match self {
            Format::Json => "application/json",
        }
    }

    /// Serialize the value to bytes.
    pub fn serialize<T: Serialize>(self, val: &T) -> Result<Vec<u8>, GatewayError> {
        match self {
            Format::Json => {
                sonic_rs::to_vec(val).map_err(|e| GatewayError::Serialize(e.to_string()))
            }
        }
    }

    /// Parses a request body into a generic document. An empty body is an
    /// empty object.
    pub fn parse(self, body: &[u8]) -> Result<sonic_rs::Value, GatewayError> {
        match self {
            Format::Json => {
                if body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(sonic_rs::Value::new_object());
                }
                sonic_rs::from_slice(body).map_err(|e| GatewayError::MalformedBody(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_rs::{JsonContainerTrait, JsonValueTrait};
    use std::str::FromStr;

    #[derive(Serialize)]
    struct TestStruct {
        name: String,
        value: i32,
    }

    #[test]
    fn test_format_default() {
        let format = Format::default();
        assert_eq!(format, Format::Json);
    }

    #[test]
    fn test_format_from_str_json() {
        assert_eq!(Format::from_str("application/json").unwrap(), Format::Json);
        assert_eq!(
            Format::from_str("application/json; charset=utf-8").unwrap(),
            Format::Json
        );
    }

    #[test]
    fn test_format_from_str_invalid() {
        assert!(Format::from_str("text/plain").is_err());
        assert!(Format::from_str("application/xml").is_err());
        assert!(Format::from_str("").is_err());
        assert!(Format::from_str("json").is_err());
    }

    #[test]
    fn test_serialize_struct() {
        let test_data = TestStruct {
            name: "test".to_string(),
            value: 42,
        };
        let serialized = Format::Json.serialize(&test_data).unwrap();
        assert_eq!(serialized, br#"{"name":"test","value":42}"#);
    }

    #[test]
    fn test_parse_object() {
        let value = Format::Json.parse(br#"{"name":"Ada"}"#).unwrap();
        assert_eq!(value["name"].as_str(), Some("Ada"));
    }

    #[test]
    fn test_parse_empty_body_is_empty_object() {
        for body in [&b""[..], b"  \n"] {
            let value = Format::Json.parse(body).unwrap();
            assert!(value.is_object());
            assert_eq!(value.as_object().unwrap().len(), 0);
        }
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = Format::Json.parse(b"{invalid}").unwrap_err();
        assert!(matches!(err, GatewayError::MalformedBody(_)));
    }

    #[test]
    fn test_content_type() {
        assert_eq!(Format::Json.content_type(), "application/json");
    }
}
