//! In-crate integration tests.
//!
//! Each test starts a real RPC server on a loopback port, connects the
//! internal client to it and drives the HTTP router with `oneshot`.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use tower::ServiceExt;

use crate::client::InternalClient;
use crate::config::Config;
use crate::gateway::{AppState, app};
use crate::registry::Registry;
use crate::rpc::{Implementations, RpcServer, RpcServerHandle};


/// An RPC server plus the HTTP router transcoding onto it.
pub struct Harness {
    pub registry: Arc<Registry>,
    pub client: InternalClient,
    pub rpc: RpcServerHandle,
    pub router: Router,
}

impl Harness {
    pub async fn start(registry: Registry, implementations: Implementations) -> Self {
        Self::start_with_config(registry, implementations, Config::default()).await
    }

    pub async fn start_with_config(
        registry: Registry,
        implementations: Implementations,
        config: Config,
    ) -> Self {
        let registry = Arc::new(registry);
        let rpc = RpcServer::new(Arc::clone(&registry), implementations)
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .expect("RPC server failed to start");
        let client = InternalClient::connect(rpc.local_addr(), &config.client)
            .await
            .expect("internal client failed to connect");
        registry.seal();
        let router = app(AppState::new(Arc::clone(&registry), client.clone()).with_config(config));
        Self {
            registry,
            client,
            rpc,
            router,
        }
    }

    /// Sends one request through the router.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Bytes) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    pub async fn post_json(&self, uri: &str, body: &str) -> (StatusCode, axum::http::HeaderMap, Bytes) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, axum::http::HeaderMap, Bytes) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }
}

/// Parses a response body as JSON.
pub fn json(body: &Bytes) -> sonic_rs::Value {
    sonic_rs::from_slice(body).unwrap_or_else(|e| {
        panic!(
            "response is not JSON ({e}): {}",
            String::from_utf8_lossy(body)
        )
    })
}
