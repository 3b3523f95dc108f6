//! Binary RPC server.
//!
//! Serves every registered method over gRPC, plus the standard health and
//! reflection services. Requests are dispatched by path, so methods are
//! resolved from the [`Registry`] at runtime rather than from generated code.
//!
//! ```text
//! POST /{package.Service}/{Method}          registered methods
//! POST /grpc.health.v1.Health/*             health checks
//! POST /grpc.reflection.v1.ServerReflection/*
//! POST /grpc.reflection.v1alpha.ServerReflection/*
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::routing::post;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tonic::metadata::MetadataMap;
use tonic::server::UnaryService;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::registry::{MethodDescriptor, Registry, reflection};
use crate::schema::{Message, Validate};

pub mod codec;
pub mod context;
pub mod handler;

pub use codec::MessageCodec;
pub use context::{CallContext, parse_grpc_timeout};
pub use handler::{Implementations, MethodHandler};

/// How long terminated calls get to write their `UNAVAILABLE` response
/// before the server task is aborted.
pub const FORCE_CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ListenError {
    #[error("failed to bind RPC listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("failed to read RPC listener address: {0}")]
    LocalAddr(#[source] std::io::Error),

    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),
}

/// Result of [`RpcServerHandle::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight call finished within the drain timeout.
    Drained,
    /// The drain timeout elapsed; `terminated` calls were still running.
    TimedOut { terminated: usize },
}

pub struct RpcServer {
    registry: Arc<Registry>,
    implementations: Implementations,
}

impl RpcServer {
    pub fn new(registry: Arc<Registry>, implementations: Implementations) -> Self {
        Self {
            registry,
            implementations,
        }
    }

    /// Binds `addr` and starts serving.
    pub async fn start(self, addr: SocketAddr) -> Result<RpcServerHandle, ListenError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener until [`RpcServerHandle::stop`].
    pub async fn serve(self, listener: TcpListener) -> Result<RpcServerHandle, ListenError> {
        let local_addr = listener.local_addr().map_err(ListenError::LocalAddr)?;

        for service in self.registry.services() {
            for method in &service.methods {
                let path = method.path();
                if self.implementations.get(&path).is_none() {
                    warn!("{} has no implementation and will answer UNIMPLEMENTED", path);
                }
            }
        }

        let descriptors = reflection::file_descriptor_set(&self.registry);
        let reflection_v1 = tonic_reflection::server::Builder::configure()
            .register_file_descriptor_set(descriptors.clone())
            .build_v1()?;
        let reflection_v1alpha = tonic_reflection::server::Builder::configure()
            .register_file_descriptor_set(descriptors)
            .build_v1alpha()?;

        let (health, health_service) = tonic_health::server::health_reporter();
        let services: Vec<String> = self
            .registry
            .services()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        for service in &services {
            health
                .set_service_status(service, ServingStatus::Serving)
                .await;
        }

        let shutdown = CancellationToken::new();
        let terminate = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Dispatcher {
            registry: self.registry,
            implementations: self.implementations,
            shutdown: shutdown.clone(),
            terminate: terminate.clone(),
            in_flight: Arc::clone(&in_flight),
        });

        let app = Router::new()
            .route("/{service}/{method}", post(dispatch))
            .route_service("/grpc.health.v1.Health/{*rpc}", health_service)
            .route_service("/grpc.reflection.v1.ServerReflection/{*rpc}", reflection_v1)
            .route_service(
                "/grpc.reflection.v1alpha.ServerReflection/{*rpc}",
                reflection_v1alpha,
            )
            .fallback(unknown_path)
            .layer(TraceLayer::new_for_grpc())
            .with_state(dispatcher);

        info!("RPC server listening on {}", local_addr);
        let task = tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .into_future(),
        );

        Ok(RpcServerHandle {
            local_addr,
            shutdown,
            terminate,
            health,
            services,
            in_flight,
            task,
        })
    }
}

/// A running RPC server.
pub struct RpcServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    terminate: CancellationToken,
    health: HealthReporter,
    services: Vec<String>,
    in_flight: Arc<AtomicUsize>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RpcServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of method calls currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn health(&self) -> HealthReporter {
        self.health.clone()
    }

    /// Stops accepting connections and calls, waits up to `drain_timeout` for
    /// in-flight calls, then terminates the rest with `UNAVAILABLE`.
    pub async fn stop(mut self, drain_timeout: Duration) -> DrainOutcome {
        self.health
            .set_service_status("", ServingStatus::NotServing)
            .await;
        for service in &self.services {
            self.health
                .set_service_status(service, ServingStatus::NotServing)
                .await;
        }
        self.shutdown.cancel();

        let outcome = match tokio::time::timeout(drain_timeout, &mut self.task).await {
            Ok(result) => {
                log_exit(result);
                DrainOutcome::Drained
            }
            Err(_) => {
                let terminated = self.in_flight();
                warn!(
                    "RPC drain timed out after {:?}; terminating {} in-flight call(s)",
                    drain_timeout, terminated
                );
                self.terminate.cancel();
                match tokio::time::timeout(FORCE_CLOSE_GRACE, &mut self.task).await {
                    Ok(result) => log_exit(result),
                    Err(_) => self.task.abort(),
                }
                DrainOutcome::TimedOut { terminated }
            }
        };
        info!("RPC server stopped");
        outcome
    }
}

fn log_exit(result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("RPC server exited with error: {}", e),
        Err(e) => warn!("RPC server task failed: {}", e),
    }
}

struct Dispatcher {
    registry: Arc<Registry>,
    implementations: Implementations,
    shutdown: CancellationToken,
    terminate: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

async fn dispatch(State(dispatcher): State<Arc<Dispatcher>>, request: Request) -> Response {
    if dispatcher.shutdown.is_cancelled() {
        return Status::unavailable("server is shutting down").into_http();
    }
    let path = request.uri().path().to_owned();
    let Some(method) = dispatcher.registry.lookup_path(&path) else {
        return Status::unimplemented(format!("unknown method {path}")).into_http();
    };
    let Some(handler) = dispatcher.implementations.get(&path) else {
        return Status::unimplemented(format!("{path} is not implemented")).into_http();
    };

    let call = UnaryCall {
        method: Arc::clone(&method),
        handler,
        terminate: dispatcher.terminate.clone(),
        in_flight: Arc::clone(&dispatcher.in_flight),
    };
    let mut grpc = tonic::server::Grpc::new(MessageCodec::server(&method));
    grpc.unary(call, request).await.map(axum::body::Body::new)
}

async fn unknown_path(request: Request) -> Response {
    Status::unimplemented(format!("unknown method {}", request.uri().path())).into_http()
}

/// Counts a call as in flight for as long as it lives.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct UnaryCall {
    method: Arc<MethodDescriptor>,
    handler: Arc<dyn MethodHandler>,
    terminate: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

type CallFuture = Pin<Box<dyn Future<Output = Result<tonic::Response<Message>, Status>> + Send>>;

impl UnaryService<Message> for UnaryCall {
    type Response = Message;
    type Future = CallFuture;

    fn call(&mut self, request: tonic::Request<Message>) -> Self::Future {
        let method = Arc::clone(&self.method);
        let handler = Arc::clone(&self.handler);
        let terminate = self.terminate.clone();
        let in_flight = Arc::clone(&self.in_flight);

        Box::pin(async move {
            let _guard = InFlightGuard::enter(&in_flight);
            let (metadata, _extensions, message) = request.into_parts();
            method.input.validate(&message)?;

            // Dropping this future (client went away) cancels the handler's token.
            let cancellation = terminate.child_token();
            let _cancel_on_drop = cancellation.clone().drop_guard();

            let timeout = metadata
                .get("grpc-timeout")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_grpc_timeout);
            let mut ctx = CallContext::new()
                .with_metadata(metadata)
                .with_cancellation(cancellation);
            if let Some(timeout) = timeout {
                ctx = ctx.with_timeout(timeout);
            }

            let result = tokio::select! {
                result = handler.call(ctx.clone(), message) => result,
                _ = terminate.cancelled() => {
                    Err(Status::unavailable("call terminated by server shutdown"))
                }
                _ = ctx.expired() => Err(Status::deadline_exceeded("deadline exceeded")),
            };

            let response_metadata = ctx.take_response_metadata();
            match result {
                Ok(reply) => Ok(tonic::Response::from_parts(
                    response_metadata,
                    reply,
                    Default::default(),
                )),
                Err(mut status) => {
                    let mut headers = status.metadata().clone().into_headers();
                    headers.extend(response_metadata.into_headers());
                    *status.metadata_mut() = MetadataMap::from_headers(headers);
                    Err(status)
                }
            }
        })
    }
}
