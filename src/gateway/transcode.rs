//! Builds an RPC request message from the parts of an HTTP request.
//!
//! The body is applied first, then path variables (which win over the body
//! for the same field), then query parameters for every field that neither
//! the body nor the path bound. Query parameters are skipped entirely when the
//! body is the whole message.

use axum::extract::Query;
use axum::http::Uri;

use crate::error::GatewayError;
use crate::format::Format;
use crate::registry::{BodySelector, RouteMatch};
use crate::schema::json::{field_from_json, merge_json, value_from_text};
use crate::schema::{FieldDescriptor, Message, Value};

pub fn build_request(
    route: &RouteMatch,
    uri: &Uri,
    body: &[u8],
    format: Format,
) -> Result<Message, GatewayError> {
    let method = &route.method;
    let schema = &method.input;
    let selector = match &method.http {
        Some(binding) => &binding.body,
        None => return Err(GatewayError::RouteNotFound),
    };

    let mut message = Message::new();
    let mut bound: Vec<String> = Vec::new();

    match selector {
        BodySelector::None => {}
        BodySelector::Whole => {
            let json = format.parse(body)?;
            merge_json(schema, &json, &mut message, "")?;
        }
        BodySelector::Field(name) => {
            let field = schema.field(name).ok_or_else(|| {
                GatewayError::InvalidRequest(format!("body field `{name}` is not in the request"))
            })?;
            if !is_blank(body) {
                let json = format.parse(body)?;
                if let Some(value) = field_from_json(field, &json)? {
                    message.set(field.name.clone(), value);
                }
            }
            bound.push(name.clone());
        }
    }

    for (path, text) in &route.params {
        let fields = schema.resolve_path(path).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("path variable `{path}` is not a request field"))
        })?;
        let Some(leaf) = fields.last() else {
            continue;
        };
        let value = value_from_text(leaf, text)?;
        let value = if leaf.repeated {
            Value::List(vec![value])
        } else {
            value
        };
        set_at(&mut message, &fields, value);
        bound.push(path.clone());
    }

    if *selector != BodySelector::Whole {
        let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(uri)
            .map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
        for (key, text) in pairs {
            if is_bound(&bound, &key) {
                continue;
            }
            // Unknown keys are ignored.
            let Some(fields) = schema.resolve_path(&key) else {
                continue;
            };
            let Some(leaf) = fields.last() else {
                continue;
            };
            let value = value_from_text(leaf, &text)?;
            if leaf.repeated {
                push_at(&mut message, &fields, value);
            } else {
                set_at(&mut message, &fields, value);
            }
        }
    }

    Ok(message)
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

/// Whether `key` names a bound field or anything beneath one.
fn is_bound(bound: &[String], key: &str) -> bool {
    bound.iter().any(|b| {
        key == b
            || key
                .strip_prefix(b.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

fn target<'a>(message: &'a mut Message, parents: &[&FieldDescriptor]) -> &'a mut Message {
    parents
        .iter()
        .fold(message, |current, parent| current.message_mut(&parent.name))
}

fn set_at(message: &mut Message, fields: &[&FieldDescriptor], value: Value) {
    if let Some((leaf, parents)) = fields.split_last() {
        target(message, parents).set(leaf.name.clone(), value);
    }
}

fn push_at(message: &mut Message, fields: &[&FieldDescriptor], value: Value) {
    if let Some((leaf, parents)) = fields.split_last() {
        target(message, parents).push(&leaf.name, value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::Method;

    use super::*;
    use crate::registry::{HttpBinding, MethodDescriptor, Registry, ServiceDescriptor};
    use crate::schema::json::JsonError;
    use crate::schema::{FieldKind, MessageSchema};

    fn address() -> Arc<MessageSchema> {
        Arc::new(
            MessageSchema::new("shop.Address")
                .with_field(FieldDescriptor::new("city", 1, FieldKind::String))
                .with_field(FieldDescriptor::new("zip", 2, FieldKind::String)),
        )
    }

    fn order_schema() -> Arc<MessageSchema> {
        Arc::new(
            MessageSchema::new("shop.Order")
                .with_field(FieldDescriptor::new("id", 1, FieldKind::String))
                .with_field(FieldDescriptor::new("quantity", 2, FieldKind::Int32))
                .with_field(FieldDescriptor::new("tags", 3, FieldKind::String).repeated())
                .with_field(FieldDescriptor::new("ship_to", 4, FieldKind::Message(address())))
                .with_field(FieldDescriptor::new("note", 5, FieldKind::String)),
        )
    }

    fn registry() -> Registry {
        let order = order_schema();
        let method = |name: &str, binding: HttpBinding| {
            MethodDescriptor::new(name, Arc::clone(&order), Arc::clone(&order)).with_http(binding)
        };
        Registry::new()
            .with_service(
                ServiceDescriptor::new("shop.Orders")
                    .with_method(method("Get", HttpBinding::get("/v1/orders/{id}")))
                    .with_method(method(
                        "Create",
                        HttpBinding::post("/v1/orders").with_body("*"),
                    ))
                    .with_method(method(
                        "Update",
                        HttpBinding::put("/v1/orders/{id}").with_body("*"),
                    ))
                    .with_method(method(
                        "Ship",
                        HttpBinding::post("/v1/orders/{id}:ship").with_body("ship_to"),
                    ))
                    .with_method(method(
                        "ByCity",
                        HttpBinding::get("/v1/cities/{ship_to.city}/orders"),
                    )),
            )
            .unwrap()
    }

    fn build(verb: Method, uri: &str, body: &str) -> Result<Message, GatewayError> {
        let registry = registry();
        let uri: Uri = uri.parse().unwrap();
        let route = registry.resolve_http(&verb, uri.path()).unwrap();
        build_request(&route, &uri, body.as_bytes(), Format::Json)
    }

    #[test]
    fn test_path_and_query() {
        let message = build(
            Method::GET,
            "/v1/orders/o-1?quantity=3&tags=a&tags=b&ship_to.city=Oslo&unknown=1",
            "",
        )
        .unwrap();
        assert_eq!(message.get_str("id"), Some("o-1"));
        assert_eq!(message.get("quantity").and_then(Value::as_i64), Some(3));
        let tags: Vec<_> = message
            .get("tags")
            .and_then(Value::as_list)
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(tags, vec!["a", "b"]);
        let ship_to = message.get("ship_to").and_then(Value::as_message).unwrap();
        assert_eq!(ship_to.get_str("city"), Some("Oslo"));
        assert!(!message.contains("unknown"));
    }

    #[test]
    fn test_query_cannot_override_path() {
        let message = build(Method::GET, "/v1/orders/o-1?id=o-2", "").unwrap();
        assert_eq!(message.get_str("id"), Some("o-1"));
    }

    #[test]
    fn test_whole_body_ignores_query() {
        let message = build(
            Method::POST,
            "/v1/orders?note=from-query",
            r#"{"id":"o-9","quantity":"7","unknownField":true}"#,
        )
        .unwrap();
        assert_eq!(message.get_str("id"), Some("o-9"));
        assert_eq!(message.get("quantity").and_then(Value::as_i64), Some(7));
        assert!(!message.contains("note"));
    }

    #[test]
    fn test_path_wins_over_body() {
        let message = build(Method::PUT, "/v1/orders/o-1", r#"{"id":"o-2","note":"n"}"#).unwrap();
        assert_eq!(message.get_str("id"), Some("o-1"));
        assert_eq!(message.get_str("note"), Some("n"));
    }

    #[test]
    fn test_field_body() {
        let message = build(
            Method::POST,
            "/v1/orders/o-1:ship?note=fragile&ship_to.city=ignored",
            r#"{"city":"Bergen","zip":"5003"}"#,
        )
        .unwrap();
        assert_eq!(message.get_str("id"), Some("o-1"));
        assert_eq!(message.get_str("note"), Some("fragile"));
        let ship_to = message.get("ship_to").and_then(Value::as_message).unwrap();
        assert_eq!(ship_to.get_str("city"), Some("Bergen"));
        assert_eq!(ship_to.get_str("zip"), Some("5003"));
    }

    #[test]
    fn test_nested_path_variable() {
        let message = build(Method::GET, "/v1/cities/Troms%C3%B8/orders", "").unwrap();
        let ship_to = message.get("ship_to").and_then(Value::as_message).unwrap();
        assert_eq!(ship_to.get_str("city"), Some("Tromsø"));
    }

    #[test]
    fn test_empty_body_is_empty_message() {
        let message = build(Method::POST, "/v1/orders", "").unwrap();
        assert!(message.is_empty());
    }

    #[test]
    fn test_body_without_binding_is_ignored() {
        let message = build(Method::GET, "/v1/orders/o-1", "{not json").unwrap();
        assert_eq!(message.get_str("id"), Some("o-1"));
    }

    #[test]
    fn test_malformed_json() {
        let err = build(Method::POST, "/v1/orders", "{not json").unwrap_err();
        assert!(matches!(err, GatewayError::MalformedBody(_)));
    }

    #[test]
    fn test_kind_mismatch() {
        let err = build(Method::POST, "/v1/orders", r#"{"quantity":"many"}"#).unwrap_err();
        match err {
            GatewayError::InvalidField(JsonError::TypeMismatch { path, .. }) => {
                assert_eq!(path, "quantity")
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = build(Method::GET, "/v1/orders/o-1?quantity=lots", "").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidField(_)));
    }

    #[test]
    fn test_is_bound() {
        let bound = vec!["ship_to".to_string()];
        assert!(is_bound(&bound, "ship_to"));
        assert!(is_bound(&bound, "ship_to.city"));
        assert!(!is_bound(&bound, "ship_tools"));
    }
}
