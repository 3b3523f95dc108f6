//! Cross-origin policy filter in front of the transcoding router.
//!
//! Preflights are answered here and never reach the router. Other requests
//! carrying an `Origin` pass through and get the allow headers added on the
//! way out.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
            ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
            ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
            ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
        },
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::config::CorsConfig;

const PREFLIGHT_VARY: &str = "Origin, Access-Control-Request-Method, Access-Control-Request-Headers";

#[derive(Debug)]
pub struct CorsPolicy {
    any_origin: bool,
    origins: Vec<String>,
    any_method: bool,
    methods: Vec<String>,
    any_header: bool,
    headers: Vec<String>,
    exposed: Option<HeaderValue>,
    allow_credentials: bool,
    max_age: Option<HeaderValue>,
}

impl CorsPolicy {
    pub fn new(config: &CorsConfig) -> Self {
        let exposed = config.exposed_headers.join(", ");
        let max_age = config.max_age.as_secs();
        Self {
            any_origin: config.allowed_origins.iter().any(|o| o == "*"),
            origins: config.allowed_origins.clone(),
            any_method: config.allowed_methods.iter().any(|m| m == "*"),
            methods: config.allowed_methods.clone(),
            any_header: config.allowed_headers.iter().any(|h| h == "*"),
            headers: config
                .allowed_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            exposed: (!exposed.is_empty())
                .then(|| HeaderValue::from_str(&exposed).ok())
                .flatten(),
            allow_credentials: config.allow_credentials,
            max_age: (max_age > 0).then(|| HeaderValue::from(max_age)),
        }
    }

    pub fn allows_origin(&self, origin: &str) -> bool {
        self.any_origin || self.origins.iter().any(|o| o == origin)
    }

    pub fn allows_method(&self, method: &str) -> bool {
        self.any_method || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Checks an `Access-Control-Request-Headers` list. An empty list is
    /// always allowed.
    pub fn allows_headers(&self, requested: &str) -> bool {
        self.any_header
            || requested
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .all(|h| self.headers.contains(&h.to_ascii_lowercase()))
    }

    fn allows(&self, origin: &HeaderValue) -> bool {
        origin.to_str().is_ok_and(|o| self.allows_origin(o))
    }

    fn allow_origin(&self, origin: &HeaderValue) -> HeaderValue {
        if self.any_origin && !self.allow_credentials {
            HeaderValue::from_static("*")
        } else {
            origin.clone()
        }
    }

    /// Answers a preflight. The status is always 204; the allow headers are
    /// present only when the origin, method and every header pass.
    pub fn preflight(&self, origin: &HeaderValue, request: &HeaderMap) -> Response {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        headers.insert(VARY, HeaderValue::from_static(PREFLIGHT_VARY));

        let Some(method) = request.get(ACCESS_CONTROL_REQUEST_METHOD) else {
            return response;
        };
        let requested = request.get(ACCESS_CONTROL_REQUEST_HEADERS);
        let requested_str = requested.and_then(|v| v.to_str().ok()).unwrap_or("");
        let permitted = self.allows(origin)
            && method.to_str().is_ok_and(|m| self.allows_method(m))
            && requested.is_none_or(|v| v.to_str().is_ok())
            && self.allows_headers(requested_str);
        if !permitted {
            debug!(?origin, ?method, ?requested, "Rejected CORS preflight");
            return response;
        }

        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin(origin));
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, method.clone());
        if let Some(requested) = requested.filter(|_| !requested_str.trim().is_empty()) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        if self.allow_credentials {
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        if let Some(max_age) = &self.max_age {
            headers.insert(ACCESS_CONTROL_MAX_AGE, max_age.clone());
        }
        response
    }

    /// Adds the allow headers to a response for an actual cross-origin
    /// request.
    pub fn decorate(&self, origin: &HeaderValue, method: &Method, response: &mut Response) {
        let headers = response.headers_mut();
        if self.allows(origin) && self.allows_method(method.as_str()) {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin(origin));
            if self.allow_credentials {
                headers.insert(
                    ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                );
            }
            if let Some(exposed) = &self.exposed {
                headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, exposed.clone());
            }
        }
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }
}

/// Middleware applying `policy` to every request.
pub async fn filter(State(policy): State<Arc<CorsPolicy>>, request: Request, next: Next) -> Response {
    let Some(origin) = request.headers().get(ORIGIN).cloned() else {
        return next.run(request).await;
    };
    if request.method() == Method::OPTIONS
        && request.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    {
        return policy.preflight(&origin, request.headers());
    }
    let method = request.method().clone();
    let mut response = next.run(request).await;
    policy.decorate(&origin, &method, &mut response);
    response
}
