//! Internal gRPC client used by the transcoding mux.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tonic::Status;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use crate::config::ClientConfig;
use crate::registry::MethodDescriptor;
use crate::rpc::{CallContext, MessageCodec};
use crate::schema::Message;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("failed to connect to RPC server: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("health handshake failed: {0}")]
    Handshake(#[from] Status),

    #[error("health handshake timed out")]
    HandshakeTimeout,

    #[error("RPC server reported {0:?}")]
    NotServing(ServingStatus),
}

/// One HTTP/2 channel to the RPC server.
///
/// Cloning is cheap and every clone multiplexes over the same connection, so
/// the client can be shared freely across request tasks.
#[derive(Clone, Debug)]
pub struct InternalClient {
    channel: Channel,
}

impl InternalClient {
    /// Connects to `addr` and waits until its health service answers
    /// `SERVING`.
    ///
    /// Unspecified addresses (`0.0.0.0`, `::`) are dialed on loopback.
    pub async fn connect(addr: SocketAddr, config: &ClientConfig) -> Result<Self, ConnectError> {
        let addr = loopback(addr);
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))?
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(Some(config.tcp_keepalive))
            .http2_keep_alive_interval(config.http2_keepalive_interval)
            .keep_alive_timeout(config.http2_keepalive_timeout)
            .keep_alive_while_idle(true)
            .http2_adaptive_window(config.http2_adaptive_window);

        let channel = endpoint.connect().await?;
        let client = Self { channel };
        tokio::time::timeout(config.connect_timeout, client.handshake())
            .await
            .map_err(|_| ConnectError::HandshakeTimeout)??;
        Ok(client)
    }

    async fn handshake(&self) -> Result<(), ConnectError> {
        let mut health = HealthClient::new(self.channel.clone());
        let response = health
            .check(HealthCheckRequest {
                service: String::new(),
            })
            .await?;
        match response.into_inner().status() {
            ServingStatus::Serving => Ok(()),
            other => Err(ConnectError::NotServing(other)),
        }
    }

    /// Calls `method` with `request`.
    ///
    /// The context supplies request metadata and the deadline, sent as
    /// `grpc-timeout`. Cancelling the context abandons the call.
    pub async fn call(
        &self,
        method: &MethodDescriptor,
        request: Message,
        ctx: &CallContext,
    ) -> Result<tonic::Response<Message>, Status> {
        if ctx.is_cancelled() {
            return Err(Status::cancelled("call cancelled"));
        }
        let path = PathAndQuery::try_from(method.path())
            .map_err(|e| Status::internal(format!("invalid method path: {e}")))?;

        let mut request = tonic::Request::new(request);
        *request.metadata_mut() = ctx.metadata().clone();
        if let Some(remaining) = ctx.remaining() {
            if remaining.is_zero() {
                return Err(Status::deadline_exceeded("deadline exceeded"));
            }
            request.set_timeout(remaining);
        }

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        let call = async {
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("RPC server not ready: {e}")))?;
            grpc.unary(request, path, MessageCodec::client(method)).await
        };

        tokio::select! {
            result = call => result,
            _ = ctx.cancellation().cancelled() => Err(Status::cancelled("call cancelled")),
            _ = ctx.expired() => Err(Status::deadline_exceeded("deadline exceeded")),
        }
    }
}

/// Maps wildcard listen addresses onto loopback so they can be dialed.
pub fn loopback(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
