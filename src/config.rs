//! Gateway configuration loaded from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid socket address in {var}: `{value}`")]
    InvalidAddr { var: &'static str, value: String },
}

/// Binary RPC listener configuration.
///
/// # Environment Variables
///
/// - `RPC_LISTEN_ADDR` - RPC server bind address (default: `0.0.0.0:50051`)
#[derive(Clone, Debug)]
pub struct RpcConfig {
    pub listen_addr: SocketAddr,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
        }
    }
}

/// Internal client configuration for the loopback connection to the RPC
/// server.
///
/// Controls connection behavior and HTTP/2 settings.
///
/// # Environment Variables
///
/// - `GRPC_CONNECT_TIMEOUT_MS` - Connection and handshake timeout (default: `5000`)
/// - `GRPC_TCP_KEEPALIVE_SECS` - TCP keepalive interval (default: `60`)
/// - `GRPC_HTTP2_KEEPALIVE_INTERVAL_SECS` - HTTP/2 ping interval (default: `60`)
/// - `GRPC_HTTP2_KEEPALIVE_TIMEOUT_SECS` - HTTP/2 ping timeout (default: `20`)
/// - `GRPC_HTTP2_ADAPTIVE_WINDOW` - Enable adaptive flow control (default: `true`)
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Connection establishment and health handshake timeout
    pub connect_timeout: Duration,
    /// TCP keepalive interval
    pub tcp_keepalive: Duration,
    /// HTTP/2 keepalive ping interval
    pub http2_keepalive_interval: Duration,
    /// HTTP/2 keepalive ping timeout
    pub http2_keepalive_timeout: Duration,
    /// Enable HTTP/2 adaptive flow control window
    pub http2_adaptive_window: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5_000),
            tcp_keepalive: Duration::from_secs(60),
            http2_keepalive_interval: Duration::from_secs(60),
            http2_keepalive_timeout: Duration::from_secs(20),
            http2_adaptive_window: true,
        }
    }
}

impl ClientConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: Duration::from_millis(parsed(
                lookup,
                "GRPC_CONNECT_TIMEOUT_MS",
                5_000,
            )),
            tcp_keepalive: Duration::from_secs(parsed(lookup, "GRPC_TCP_KEEPALIVE_SECS", 60)),
            http2_keepalive_interval: Duration::from_secs(parsed(
                lookup,
                "GRPC_HTTP2_KEEPALIVE_INTERVAL_SECS",
                60,
            )),
            http2_keepalive_timeout: Duration::from_secs(parsed(
                lookup,
                "GRPC_HTTP2_KEEPALIVE_TIMEOUT_SECS",
                20,
            )),
            http2_adaptive_window: lookup("GRPC_HTTP2_ADAPTIVE_WINDOW")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.http2_adaptive_window),
        }
    }
}

/// Cross-origin policy for the HTTP listener.
///
/// # Environment Variables
///
/// Lists are comma separated.
///
/// - `CORS_ALLOWED_ORIGINS` - Allowed origins, `*` for any (default: `*`)
/// - `CORS_ALLOWED_METHODS` - (default: `GET,POST,PATCH,PUT,DELETE,OPTIONS`)
/// - `CORS_ALLOWED_HEADERS` - (default: `Accept,Authorization,Content-Type,X-CSRF-Token`)
/// - `CORS_EXPOSED_HEADERS` - (default: `Link`)
/// - `CORS_ALLOW_CREDENTIALS` - (default: `true`)
/// - `CORS_MAX_AGE_SECS` - Preflight cache lifetime, `0` to omit (default: `300`)
#[derive(Clone, Debug)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: Duration,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: strings(&["*"]),
            allowed_methods: strings(&["GET", "POST", "PATCH", "PUT", "DELETE", "OPTIONS"]),
            allowed_headers: strings(&["Accept", "Authorization", "Content-Type", "X-CSRF-Token"]),
            exposed_headers: strings(&["Link"]),
            allow_credentials: true,
            max_age: Duration::from_secs(300),
        }
    }
}

impl CorsConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            allowed_origins: list(lookup, "CORS_ALLOWED_ORIGINS")
                .unwrap_or(defaults.allowed_origins),
            allowed_methods: list(lookup, "CORS_ALLOWED_METHODS")
                .unwrap_or(defaults.allowed_methods),
            allowed_headers: list(lookup, "CORS_ALLOWED_HEADERS")
                .unwrap_or(defaults.allowed_headers),
            exposed_headers: list(lookup, "CORS_EXPOSED_HEADERS")
                .unwrap_or(defaults.exposed_headers),
            allow_credentials: lookup("CORS_ALLOW_CREDENTIALS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.allow_credentials),
            max_age: Duration::from_secs(parsed(lookup, "CORS_MAX_AGE_SECS", 300)),
        }
    }
}

/// Gateway configuration.
///
/// Load from environment with [`Config::from_env`], or use [`Config::default`]
/// for development defaults.
///
/// # Environment Variables
///
/// - `HTTP_LISTEN_ADDR` - HTTP server bind address (default: `0.0.0.0:8090`)
/// - `REQUEST_TIMEOUT_MS` - Deadline for transcoded calls without a
///   `grpc-timeout` header (default: `30000`)
/// - `DRAIN_TIMEOUT_MS` - Graceful shutdown budget (default: `10000`)
/// - `MAX_BODY_BYTES` - Largest accepted HTTP request body (default: `4194304`)
/// - `FORWARD_HEADER_PREFIXES` - Comma separated header name prefixes
///   forwarded as call metadata (default: `authorization,x-,grpc-metadata-`)
///
/// See [`RpcConfig`], [`ClientConfig`] and [`CorsConfig`] for the rest.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub request_timeout: Duration,
    pub drain_timeout: Duration,
    pub max_body_bytes: usize,
    pub forward_header_prefixes: Vec<String>,
    pub rpc: RpcConfig,
    pub client: ClientConfig,
    pub cors: CorsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            request_timeout: Duration::from_millis(30_000),
            drain_timeout: Duration::from_millis(10_000),
            max_body_bytes: 4 * 1024 * 1024,
            forward_header_prefixes: strings(&["authorization", "x-", "grpc-metadata-"]),
            rpc: RpcConfig::default(),
            client: ClientConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            listen_addr: addr(&lookup, "HTTP_LISTEN_ADDR", defaults.listen_addr)?,
            request_timeout: Duration::from_millis(parsed(&lookup, "REQUEST_TIMEOUT_MS", 30_000)),
            drain_timeout: Duration::from_millis(parsed(&lookup, "DRAIN_TIMEOUT_MS", 10_000)),
            max_body_bytes: parsed(&lookup, "MAX_BODY_BYTES", defaults.max_body_bytes),
            forward_header_prefixes: list(&lookup, "FORWARD_HEADER_PREFIXES")
                .unwrap_or(defaults.forward_header_prefixes),
            rpc: RpcConfig {
                listen_addr: addr(&lookup, "RPC_LISTEN_ADDR", defaults.rpc.listen_addr)?,
            },
            client: ClientConfig::from_lookup(&lookup),
            cors: CorsConfig::from_lookup(&lookup),
        })
    }
}

/// Parses `key`, keeping `default` when it is unset or unparsable.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn addr(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: SocketAddr,
) -> Result<SocketAddr, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAddr { var, value }),
        None => Ok(default),
    }
}

fn list(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Vec<String>> {
    lookup(key).map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
