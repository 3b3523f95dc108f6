//! HTTP route handlers.
//!
//! The HTTP surface is the union of the registry's HTTP bindings. Routes are
//! resolved per request against the registry, so the router itself is a
//! single fallback handler.

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE, request::Parts},
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;
use tracing::{debug, warn};

use crate::{
    error::{DiagnosticDetail, GatewayError},
    gateway::{state::AppState, transcode::build_request},
    registry::RouteMatch,
    rpc::{CallContext, parse_grpc_timeout},
    schema::json::JsonMessage,
};

/// Creates the router that transcodes every registered HTTP binding.
pub fn create_router() -> Router<AppState> {
    Router::new().fallback(handle_transcode)
}

/// Resolves the request to a method, calls it through the internal client
/// and renders the result as JSON.
pub async fn handle_transcode(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let Some(route) = state.registry.resolve_http(&parts.method, parts.uri.path()) else {
        debug!("No binding for {} {}", parts.method, parts.uri.path());
        return GatewayError::RouteNotFound.into_response();
    };
    let path = route.method.path();
    match transcode(&state, route, parts, body).await {
        Ok(response) => response,
        Err((err, headers)) => error_response(&path, err, headers),
    }
}

type Failure = (GatewayError, HeaderMap);

async fn transcode(
    state: &AppState,
    route: RouteMatch,
    parts: Parts,
    body: Body,
) -> Result<Response, Failure> {
    let limit = state.config.max_body_bytes;
    let body = axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| plain(body_error(e, limit)))?;
    let message = build_request(&route, &parts.uri, &body, state.format).map_err(plain)?;

    let timeout = parts
        .headers
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
        .unwrap_or(state.config.request_timeout);
    let ctx = CallContext::new()
        .with_metadata(state.forwarding.to_metadata(&parts.headers))
        .with_timeout(timeout);

    let response = state
        .client
        .call(&route.method, message, &ctx)
        .await
        .map_err(|status| {
            let headers = state.forwarding.to_headers(status.metadata());
            (GatewayError::from(status), headers)
        })?;

    let (metadata, output, _) = response.into_parts();
    let headers = state.forwarding.to_headers(&metadata);
    let body = state
        .format
        .serialize(&JsonMessage::new(&route.method.output, &output))
        .map_err(|e| (e, headers.clone()))?;

    let mut response = (
        StatusCode::OK,
        [(CONTENT_TYPE, state.format.content_type())],
        body,
    )
        .into_response();
    response.headers_mut().extend(headers);
    Ok(response)
}

fn body_error(err: axum::Error, limit: usize) -> GatewayError {
    let inner = err.into_inner();
    if inner.is::<LengthLimitError>() {
        GatewayError::PayloadTooLarge { limit }
    } else {
        GatewayError::MalformedBody(inner.to_string())
    }
}

fn plain(err: GatewayError) -> Failure {
    (err, HeaderMap::new())
}

fn error_response(path: &str, err: GatewayError, headers: HeaderMap) -> Response {
    let status = err.http_status();
    if status.is_server_error() {
        warn!(
            method = %path,
            code = ?err.code(),
            details = ?err.diagnostic_details(),
            "Transcoded call failed: {}",
            err
        );
    } else {
        debug!(method = %path, code = ?err.code(), "Transcoded call rejected: {}", err);
    }
    let mut response = err.into_response();
    response.headers_mut().extend(headers);
    response
}
