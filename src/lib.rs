//! # rpc-dispatch
//!
//! Request-dispatch core for RPC servers.
//!
//! Binds declared methods, per-call dependencies, interceptor chains and
//! exception handlers into one callable surface for a transport layer.
//!
//! ## Architecture
//!
//! - **Configuration phase**: a [`Controller`] collects [`Method`]s, middleware
//!   and exception handlers, validates them against a service descriptor and
//!   builds an immutable [`Service`]
//! - **Serving phase**: each call runs through
//!   context binding → exception handling → scheduler → user middleware →
//!   dependency resolution → endpoint → serialization
//!
//! Four calling conventions are supported:
//!
//! ```text
//! unary_unary:   (request)          -> response
//! unary_stream:  (request)          -> stream<response>
//! stream_unary:  (stream<request>)  -> response
//! stream_stream: (stream<request>)  -> stream<response>
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use rpc_dispatch::transport::mem::LocalCall;
//! use rpc_dispatch::transport::{MethodDescriptor, ServiceDescriptor};
//! use rpc_dispatch::{Controller, Message, Method, MethodMode};
//! use serde_json::{json, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut controller = Controller::new("Greeter").package("greeter");
//! controller.register(Method::unary_unary("say_hello", |req: Value, _ctx, _deps| async move {
//!     Ok(json!({ "message": format!("Hello {}", req["name"].as_str().unwrap_or("")) }))
//! }))?;
//!
//! let service = controller
//!     .descriptor(ServiceDescriptor::new("greeter.Greeter").method(MethodDescriptor::new(
//!         "greeter.Greeter",
//!         "SayHello",
//!         MethodMode::UnaryUnary,
//!         "HelloRequest",
//!         "HelloReply",
//!     )))
//!     .build()?;
//!
//! let request = Message::encode("HelloRequest", &json!({ "name": "World" }))?;
//! let reply = service
//!     .method("SayHello")
//!     .expect("registered")
//!     .unary_unary(request, Arc::new(LocalCall::new("ipv4:127.0.0.1:50051")))
//!     .await?;
//! assert_eq!(reply.to_value()?, json!({ "message": "Hello World" }));
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod controller;
pub mod dependency;
pub mod error;
pub mod exception;
pub mod message;
pub mod method;
pub mod middleware;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod transport;

pub use context::{CallContext, CallState};
pub use controller::{Controller, ControllerConfig};
pub use dependency::{Dependency, Resolved};
pub use error::{BoxError, ConfigError, DispatchError, ValidationError};
pub use exception::ExceptionRegistry;
pub use message::{Message, Schema};
pub use method::{Method, MethodMode, Streaming};
pub use middleware::Middleware;
pub use service::{BoundMethod, Service};
pub use status::{Code, Status};
