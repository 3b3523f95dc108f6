//! Gateway server initialization and lifecycle management.
//!
//! A [`Gateway`] owns both listeners. Starting it binds the RPC listener,
//! starts the RPC server, connects the internal client to it, then binds the
//! HTTP listener. Cancelling its shutdown token drains both servers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, middleware};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    client::{ConnectError, InternalClient},
    config::Config,
    registry::Registry,
    rpc::{DrainOutcome, FORCE_CLOSE_GRACE, Implementations, ListenError, RpcServer, RpcServerHandle},
};

pub mod cors;
pub mod lifecycle;
pub mod metadata;
pub mod routes;
pub mod state;
pub mod transcode;

pub use cors::CorsPolicy;
pub use lifecycle::{Lifecycle, LifecycleState, TransitionError};
pub use state::AppState;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    RpcListen(#[from] ListenError),

    #[error("internal connection failed: {0}")]
    InternalConnection(#[from] ConnectError),

    #[error("failed to bind HTTP listener on {addr}: {source}")]
    HttpListen {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Lifecycle(#[from] TransitionError),
}

/// The HTTP application: transcoding router behind the CORS filter.
pub fn app(state: AppState) -> Router {
    let policy = Arc::new(CorsPolicy::new(&state.config.cors));
    routes::create_router()
        .layer(middleware::from_fn_with_state(policy, cors::filter))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct Gateway {
    config: Config,
    registry: Arc<Registry>,
    implementations: Implementations,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: Config, registry: Arc<Registry>, implementations: Implementations) -> Self {
        Self {
            config,
            registry,
            implementations,
            lifecycle: Lifecycle::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Cancelling this token starts the drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Brings both servers up. On failure everything already started is torn
    /// down and the lifecycle ends in `Stopped`.
    pub async fn start(self) -> Result<RunningGateway, StartupError> {
        self.lifecycle.advance(LifecycleState::Starting)?;
        let lifecycle = self.lifecycle.clone();
        match self.start_servers().await {
            Ok(running) => {
                running.lifecycle.advance(LifecycleState::Serving)?;
                Ok(running)
            }
            Err(e) => {
                error!("Gateway failed to start: {}", e);
                lifecycle.advance(LifecycleState::Stopped)?;
                Err(e)
            }
        }
    }

    async fn start_servers(self) -> Result<RunningGateway, StartupError> {
        let Gateway {
            config,
            registry,
            implementations,
            lifecycle,
            shutdown,
        } = self;

        let rpc = RpcServer::new(Arc::clone(&registry), implementations)
            .start(config.rpc.listen_addr)
            .await?;

        let client = match InternalClient::connect(rpc.local_addr(), &config.client).await {
            Ok(client) => client,
            Err(e) => {
                rpc.stop(config.drain_timeout).await;
                return Err(e.into());
            }
        };
        info!("Internal client connected to {}", rpc.local_addr());

        let listener = match TcpListener::bind(config.listen_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                rpc.stop(config.drain_timeout).await;
                return Err(StartupError::HttpListen {
                    addr: config.listen_addr,
                    source,
                });
            }
        };
        let http_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                rpc.stop(config.drain_timeout).await;
                return Err(StartupError::HttpListen {
                    addr: config.listen_addr,
                    source,
                });
            }
        };

        registry.seal();
        let drain_timeout = config.drain_timeout;
        let router = app(AppState::new(Arc::clone(&registry), client).with_config(config));

        info!("HTTP server listening on {}", http_addr);
        let http = tokio::spawn(
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .into_future(),
        );

        Ok(RunningGateway {
            rpc,
            http,
            http_addr,
            drain_timeout,
            lifecycle,
            shutdown,
        })
    }
}

/// Both servers up and accepting.
pub struct RunningGateway {
    rpc: RpcServerHandle,
    http: JoinHandle<std::io::Result<()>>,
    http_addr: SocketAddr,
    drain_timeout: std::time::Duration,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
}

impl RunningGateway {
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves until the shutdown token is cancelled, then drains both
    /// servers under the drain timeout.
    pub async fn serve(self) -> DrainOutcome {
        let RunningGateway {
            rpc,
            mut http,
            drain_timeout,
            lifecycle,
            shutdown,
            ..
        } = self;

        shutdown.cancelled().await;
        if let Err(e) = lifecycle.advance(LifecycleState::Draining) {
            warn!("{}", e);
        }
        info!("Draining for up to {:?}", drain_timeout);

        // Terminated RPCs still need to be written back through HTTP.
        let http_budget = drain_timeout + FORCE_CLOSE_GRACE * 2;
        let http_drain = async move {
            match tokio::time::timeout(http_budget, &mut http).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("HTTP server exited with error: {}", e),
                Ok(Err(e)) => warn!("HTTP server task failed: {}", e),
                Err(_) => {
                    warn!("HTTP drain timed out after {:?}", http_budget);
                    http.abort();
                }
            }
        };
        let (outcome, ()) = tokio::join!(rpc.stop(drain_timeout), http_drain);

        if let Err(e) = lifecycle.advance(LifecycleState::Stopped) {
            warn!("{}", e);
        }
        outcome
    }
}

/// Cancels `token` on SIGINT or SIGTERM (Ctrl-C elsewhere).
pub async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGINT handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
            _ = token.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
                info!("Received Ctrl-C, initiating graceful shutdown");
            }
            _ = token.cancelled() => return,
        }
    }
    token.cancel();
}

/// Starts the gateway and serves until SIGINT/SIGTERM.
///
/// This function:
/// 1. Initializes tracing with environment-based log filtering
/// 2. Loads configuration from environment variables
/// 3. Starts the RPC server and connects the internal client to it
/// 4. Binds the HTTP listener and serves transcoded requests
/// 5. Drains both servers on shutdown
///
/// # Errors
///
/// Returns an error if:
/// - The configuration is invalid
/// - Either listener cannot bind
/// - The internal client cannot complete its health handshake
pub async fn run(registry: Registry, implementations: Implementations) -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("transcode_gateway=info".parse()?),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        "Starting gateway (http={}, rpc={}, request_timeout={:?}, drain_timeout={:?})",
        config.listen_addr, config.rpc.listen_addr, config.request_timeout, config.drain_timeout
    );

    let gateway = Gateway::new(config, Arc::new(registry), implementations);
    tokio::spawn(cancel_on_signal(gateway.shutdown_token()));

    let running = gateway.start().await?;
    match running.serve().await {
        DrainOutcome::Drained => info!("Gateway stopped"),
        DrainOutcome::TimedOut { terminated } => {
            warn!("Gateway stopped after terminating {} call(s)", terminated)
        }
    }
    Ok(())
}
