//! Error types and HTTP response conversion.
//!
//! Every error becomes a JSON body `{code, message, details?}` where `code`
//! is the gRPC status code and the HTTP status follows the usual gateway
//! mapping (see [`http_status_from_code`]).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tonic::Code;
use tonic_types::StatusExt;

use crate::schema::ValidationErrors;
use crate::schema::json::JsonError;

/// Gateway error types with automatic HTTP status code mapping.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Not Found")]
    RouteNotFound,

    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Invalid field: {0}")]
    InvalidField(#[from] JsonError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to serialize response: {0}")]
    Serialize(String),

    #[error("{}", .0.message())]
    Rpc(#[from] tonic::Status),
}

impl GatewayError {
    /// The gRPC status code reported for this error.
    pub fn code(&self) -> Code {
        match self {
            GatewayError::RouteNotFound => Code::NotFound,
            GatewayError::MalformedBody(_)
            | GatewayError::InvalidField(_)
            | GatewayError::InvalidRequest(_) => Code::InvalidArgument,
            GatewayError::PayloadTooLarge { .. } => Code::ResourceExhausted,
            GatewayError::Serialize(_) => Code::Internal,
            GatewayError::Rpc(status) => status.code(),
        }
    }

    /// The HTTP status for this error. Follows [`http_status_from_code`]
    /// except for oversized bodies, which are rejected before any RPC.
    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            other => http_status_from_code(other.code()),
        }
    }
}

/// Failures that can explain themselves beyond a single message.
pub trait DiagnosticDetail {
    /// Human-readable details, one entry per problem. Empty when there is
    /// nothing beyond the message.
    fn diagnostic_details(&self) -> Vec<String>;
}

impl DiagnosticDetail for tonic::Status {
    fn diagnostic_details(&self) -> Vec<String> {
        self.get_details_bad_request()
            .map(|bad_request| {
                bad_request
                    .field_violations
                    .iter()
                    .map(|v| format!("{}: {}", v.field, v.description))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl DiagnosticDetail for ValidationErrors {
    fn diagnostic_details(&self) -> Vec<String> {
        self.violations
            .iter()
            .map(|v| format!("{}: {}", v.field, v.reason))
            .collect()
    }
}

impl DiagnosticDetail for JsonError {
    fn diagnostic_details(&self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl DiagnosticDetail for GatewayError {
    fn diagnostic_details(&self) -> Vec<String> {
        match self {
            GatewayError::InvalidField(e) => e.diagnostic_details(),
            GatewayError::Rpc(status) => status.diagnostic_details(),
            _ => Vec::new(),
        }
    }
}

/// Maps a gRPC status code onto an HTTP status.
pub fn http_status_from_code(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        // nginx's "client closed request".
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = self.http_status();
        let message = match &self {
            GatewayError::Rpc(status) => status.message().to_string(),
            other => other.to_string(),
        };
        let body = ErrorResponse {
            code: code as i32,
            message,
            details: self.diagnostic_details(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use sonic_rs::JsonValueTrait;

    use crate::schema::FieldViolation;

    async fn body_json(response: Response) -> sonic_rs::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        sonic_rs::from_slice(&body).unwrap()
    }

    #[test]
    fn test_status_table() {
        let table = [
            (Code::Ok, 200),
            (Code::Cancelled, 499),
            (Code::Unknown, 500),
            (Code::InvalidArgument, 400),
            (Code::DeadlineExceeded, 504),
            (Code::NotFound, 404),
            (Code::AlreadyExists, 409),
            (Code::PermissionDenied, 403),
            (Code::ResourceExhausted, 429),
            (Code::FailedPrecondition, 400),
            (Code::Aborted, 409),
            (Code::OutOfRange, 400),
            (Code::Unimplemented, 501),
            (Code::Internal, 500),
            (Code::Unavailable, 503),
            (Code::DataLoss, 500),
            (Code::Unauthenticated, 401),
        ];
        for (code, http) in table {
            assert_eq!(http_status_from_code(code).as_u16(), http, "{code:?}");
        }
    }

    #[test]
    fn test_raw_codes_outside_table_are_500() {
        assert_eq!(http_status_from_code(Code::from(5)), StatusCode::NOT_FOUND);
        for raw in [-1, 17, 99, i32::MAX] {
            assert_eq!(
                http_status_from_code(Code::from(raw)),
                StatusCode::INTERNAL_SERVER_ERROR
            );
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(GatewayError::RouteNotFound.to_string(), "Not Found");
        let err = GatewayError::InvalidRequest("missing field".to_string());
        assert_eq!(err.to_string(), "Invalid request: missing field");
        let err = GatewayError::from(tonic::Status::not_found("no such user"));
        assert_eq!(err.to_string(), "no such user");
    }

    #[tokio::test]
    async fn test_route_not_found_body() {
        let response = GatewayError::RouteNotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), br#"{"code":5,"message":"Not Found"}"#);
    }

    #[tokio::test]
    async fn test_rpc_error_preserves_code_and_message() {
        let err = GatewayError::from(tonic::Status::permission_denied("not allowed"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["code"].as_i64(), Some(7));
        assert_eq!(json["message"].as_str(), Some("not allowed"));
        assert!(json.get("details").is_none());
    }

    #[tokio::test]
    async fn test_validation_details_are_rendered() {
        let status = tonic::Status::from(ValidationErrors {
            message: "test.Req".into(),
            violations: vec![FieldViolation::new("name", "value is required")],
        });
        let response = GatewayError::from(status).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["code"].as_i64(), Some(3));
        assert_eq!(json["details"][0].as_str(), Some("name: value is required"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let response = GatewayError::MalformedBody("expected value".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["code"].as_i64(), Some(3));
    }

    #[test]
    fn test_json_error_details() {
        let err = GatewayError::from(JsonError::TypeMismatch {
            path: "age".into(),
            expected: "an integer",
        });
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(
            err.diagnostic_details(),
            vec!["Field `age` expects an integer".to_string()]
        );
    }
}
