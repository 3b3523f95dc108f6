//! Demo gateway serving `helloworld.Greeter`.
//!
//! ```text
//! grpcurl -plaintext -d '{"name":"Ada"}' localhost:50051 helloworld.Greeter/SayHello
//! curl -d '{"name":"Ada"}' localhost:8090/v1/message
//! ```

use std::sync::Arc;

use tonic::Status;
use transcode_gateway::registry::{HttpBinding, MethodDescriptor, Registry, ServiceDescriptor};
use transcode_gateway::rpc::{CallContext, Implementations};
use transcode_gateway::schema::{FieldDescriptor, FieldKind, Message, MessageSchema};

fn greeter() -> ServiceDescriptor {
    let request = Arc::new(
        MessageSchema::new("helloworld.HelloRequest")
            .with_field(FieldDescriptor::new("name", 1, FieldKind::String)),
    );
    let response = Arc::new(
        MessageSchema::new("helloworld.HelloResponse")
            .with_field(FieldDescriptor::new("message", 1, FieldKind::String)),
    );
    ServiceDescriptor::new("helloworld.Greeter").with_method(
        MethodDescriptor::new("SayHello", request, response)
            .with_http(HttpBinding::post("/v1/message").with_body("*")),
    )
}

async fn say_hello(_ctx: CallContext, request: Message) -> Result<Message, Status> {
    let name = request.get_str("name").unwrap_or_default();
    Ok(Message::new().with("message", format!("Hello {name}")))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let registry = Registry::new().with_service(greeter())?;
    let implementations = Implementations::new().with("helloworld.Greeter", "SayHello", say_hello);
    transcode_gateway::gateway::run(registry, implementations).await
}
