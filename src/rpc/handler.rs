//! Method implementations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tonic::Status;

use super::CallContext;
use crate::schema::Message;

/// Business logic behind one RPC method.
///
/// Implemented for any `Fn(CallContext, Message) -> impl Future` so plain
/// async closures can be registered directly.
#[tonic::async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, request: Message) -> Result<Message, Status>;
}

#[tonic::async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(CallContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message, Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, request: Message) -> Result<Message, Status> {
        (self)(ctx, request).await
    }
}

/// Handlers keyed by gRPC path (`/package.Service/Method`).
#[derive(Clone, Default)]
pub struct Implementations {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl Implementations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: &str, method: &str, handler: impl MethodHandler) -> Self {
        self.insert(service, method, handler);
        self
    }

    pub fn insert(&mut self, service: &str, method: &str, handler: impl MethodHandler) {
        self.handlers
            .insert(format!("/{service}/{method}"), Arc::new(handler));
    }

    pub fn get(&self, path: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for Implementations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<&String> = self.handlers.keys().collect();
        paths.sort();
        f.debug_struct("Implementations")
            .field("methods", &paths)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closure_handler() {
        let implementations = Implementations::new().with(
            "test.Svc",
            "Echo",
            |_ctx: CallContext, request: Message| async move { Ok::<_, Status>(request) },
        );
        let handler = implementations.get("/test.Svc/Echo").unwrap();
        let reply = handler
            .call(CallContext::new(), Message::new().with("x", 1))
            .await
            .unwrap();
        assert_eq!(reply, Message::new().with("x", 1));
        assert!(implementations.get("/test.Svc/Other").is_none());
        assert_eq!(implementations.len(), 1);
    }

    struct Failing;

    #[tonic::async_trait]
    impl MethodHandler for Failing {
        async fn call(&self, _ctx: CallContext, _request: Message) -> Result<Message, Status> {
            Err(Status::permission_denied("nope"))
        }
    }

    #[tokio::test]
    async fn test_struct_handler() {
        let implementations = Implementations::new().with("test.Svc", "Fail", Failing);
        let err = implementations
            .get("/test.Svc/Fail")
            .unwrap()
            .call(CallContext::new(), Message::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }
}
