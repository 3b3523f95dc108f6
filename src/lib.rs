//! # Transcode Gateway
//!
//! Serves one set of RPC methods two ways at once: natively over gRPC, and
//! as JSON over HTTP through per-method bindings that are transcoded into
//! calls on the same gRPC server.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tonic::Status;
//! use transcode_gateway::registry::{HttpBinding, MethodDescriptor, Registry, ServiceDescriptor};
//! use transcode_gateway::rpc::{CallContext, Implementations};
//! use transcode_gateway::schema::{FieldDescriptor, FieldKind, Message, MessageSchema};
//!
//! #[tokio::main]
//! async fn main() -> eyre::Result<()> {
//!     let request = Arc::new(
//!         MessageSchema::new("greet.GreetRequest")
//!             .with_field(FieldDescriptor::new("name", 1, FieldKind::String)),
//!     );
//!     let reply = Arc::new(
//!         MessageSchema::new("greet.GreetReply")
//!             .with_field(FieldDescriptor::new("message", 1, FieldKind::String)),
//!     );
//!     let registry = Registry::new().with_service(
//!         ServiceDescriptor::new("greet.Greeter").with_method(
//!             MethodDescriptor::new("Greet", request, reply)
//!                 .with_http(HttpBinding::post("/v1/greet").with_body("*")),
//!         ),
//!     )?;
//!     let implementations = Implementations::new().with(
//!         "greet.Greeter",
//!         "Greet",
//!         |_ctx: CallContext, request: Message| async move {
//!             let name = request.get_str("name").unwrap_or_default().to_string();
//!             Ok::<_, Status>(Message::new().with("message", format!("Hello {name}")))
//!         },
//!     );
//!     transcode_gateway::gateway::run(registry, implementations).await
//! }
//! ```
//!
//! ## Configuration
//!
//! The gateway is configured via environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HTTP_LISTEN_ADDR` | `0.0.0.0:8090` | HTTP server listen address |
//! | `RPC_LISTEN_ADDR` | `0.0.0.0:50051` | gRPC server listen address |
//! | `REQUEST_TIMEOUT_MS` | `30000` | Deadline for HTTP calls without `grpc-timeout` |
//! | `DRAIN_TIMEOUT_MS` | `10000` | Graceful shutdown budget |
//! | `MAX_BODY_BYTES` | `4194304` | Largest accepted HTTP body |
//! | `FORWARD_HEADER_PREFIXES` | `authorization,x-,grpc-metadata-` | Headers forwarded as metadata |
//! | `CORS_ALLOWED_ORIGINS` | `*` | Allowed origins |
//!
//! See [`config`] for the complete list.
//!
//! ## Endpoints
//!
//! - gRPC: every registered method, `grpc.health.v1.Health`, and server
//!   reflection (v1 and v1alpha)
//! - HTTP: every method's HTTP binding; anything else is a JSON 404

pub mod client;
pub mod config;
pub mod error;
pub mod format;
pub mod gateway;
pub mod registry;
pub mod rpc;
pub mod schema;

pub use config::Config;
pub use format::Format;

#[cfg(test)]
mod tests;
