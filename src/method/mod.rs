//! Method module - one registered endpoint and its calling convention.
//!
//! A [`Method`] pairs a typed endpoint with:
//! - its [`MethodMode`] (single or streamed request, single or streamed response)
//! - the request/response schema names derived from the endpoint's types
//! - the [`DependencyPlan`] built from its declared dependencies
//!
//! # Endpoint signatures
//!
//! | Mode           | Endpoint                                                      |
//! |----------------|---------------------------------------------------------------|
//! | `UnaryUnary`   | `Fn(Req, CallContext, Resolved) -> Future<EndpointResult<Resp>>` |
//! | `UnaryStream`  | `Fn(Req, CallContext, Resolved) -> Stream<EndpointResult<Resp>>` |
//! | `StreamUnary`  | `Fn(Streaming<Req>, CallContext, Resolved) -> Future<..>`      |
//! | `StreamStream` | `Fn(Streaming<Req>, CallContext, Resolved) -> Stream<..>`      |
//!
//! `Req` is anything implementing [`FromMessage`], `Resp` anything implementing
//! [`IntoMessage`].
//!
//! # Example
//!
//! ```
//! use rpc_dispatch::method::{Method, MethodMode};
//! use serde_json::{json, Value};
//!
//! let method = Method::unary_unary("say_hello", |req: Value, _ctx, _deps| async move {
//!     Ok(json!({ "message": format!("Hello {}", req["name"].as_str().unwrap_or("")) }))
//! })
//! .description("Greets the caller");
//!
//! assert_eq!(method.name(), "SayHello");
//! assert_eq!(method.mode(), MethodMode::UnaryUnary);
//! ```

mod endpoint;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::context::{CallContext, CallState};
use crate::dependency::{AnyDependency, Dependency, DependencyPlan, DependencyScope, Resolved};
use crate::error::{BoxError, ConfigError, DispatchError, Result};
use crate::message::{FromMessage, IntoMessage, Message};
use crate::transport::RequestStream;

pub use endpoint::Streaming;
pub(crate) use endpoint::Endpoint;

/// Boxed future used at every erased async seam.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound sequence of serialized responses.
pub type ResponseStream = BoxStream<'static, Result<Message>>;

/// What an endpoint returns. Any error converts with `?`.
pub type EndpointResult<T> = std::result::Result<T, BoxError>;

/// Calling convention of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodMode {
    UnaryUnary,
    UnaryStream,
    StreamUnary,
    StreamStream,
}

impl MethodMode {
    /// Mode matching a descriptor's streaming flags.
    pub fn from_flags(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => MethodMode::UnaryUnary,
            (false, true) => MethodMode::UnaryStream,
            (true, false) => MethodMode::StreamUnary,
            (true, true) => MethodMode::StreamStream,
        }
    }

    #[inline]
    pub fn is_request_streaming(&self) -> bool {
        matches!(self, MethodMode::StreamUnary | MethodMode::StreamStream)
    }

    #[inline]
    pub fn is_response_streaming(&self) -> bool {
        matches!(self, MethodMode::UnaryStream | MethodMode::StreamStream)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MethodMode::UnaryUnary => "unary_unary",
            MethodMode::UnaryStream => "unary_stream",
            MethodMode::StreamUnary => "stream_unary",
            MethodMode::StreamStream => "stream_stream",
        }
    }
}

impl fmt::Display for MethodMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payload of one call.
pub enum Request {
    /// A single request message.
    Unary(Message),
    /// A pull-based sequence of request messages.
    Streaming(RequestStream),
}

impl Request {
    /// Streamed request built from any stream of messages.
    pub fn streaming<S>(requests: S) -> Self
    where
        S: Stream<Item = std::result::Result<Message, crate::error::TransportError>>
            + Send
            + 'static,
    {
        Request::Streaming(requests.boxed())
    }

    #[inline]
    pub fn is_streaming(&self) -> bool {
        matches!(self, Request::Streaming(_))
    }

    /// Short rendering for log lines.
    pub fn summary(&self, limit: usize) -> String {
        match self {
            Request::Unary(message) => message.summary(limit),
            Request::Streaming(_) => "<stream>".to_string(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Unary(message) => f.debug_tuple("Unary").field(message).finish(),
            Request::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// `say_hello` → `SayHello`. Names already in PascalCase are unchanged.
pub fn to_pascal_case(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// A registered endpoint.
#[derive(Clone)]
pub struct Method {
    name: String,
    description: String,
    request_schema: Option<&'static str>,
    response_schema: Option<&'static str>,
    roots: Vec<AnyDependency>,
    plan: DependencyPlan,
    endpoint: Endpoint,
}

impl Method {
    fn new(
        name: &str,
        endpoint: Endpoint,
        request_schema: Option<&'static str>,
        response_schema: Option<&'static str>,
    ) -> Self {
        Self {
            name: to_pascal_case(name),
            description: String::new(),
            request_schema,
            response_schema,
            roots: Vec::new(),
            plan: DependencyPlan::default(),
            endpoint,
        }
    }

    /// Single request, single response.
    pub fn unary_unary<Req, Resp, F, Fut>(name: &str, endpoint: F) -> Self
    where
        Req: FromMessage,
        Resp: IntoMessage,
        F: Fn(Req, CallContext, Resolved) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EndpointResult<Resp>> + Send + 'static,
    {
        Self::new(
            name,
            endpoint::unary_unary(endpoint),
            Req::SCHEMA,
            Resp::SCHEMA,
        )
    }

    /// Single request, streamed response.
    pub fn unary_stream<Req, Resp, F, S>(name: &str, endpoint: F) -> Self
    where
        Req: FromMessage,
        Resp: IntoMessage,
        F: Fn(Req, CallContext, Resolved) -> S + Send + Sync + 'static,
        S: Stream<Item = EndpointResult<Resp>> + Send + 'static,
    {
        Self::new(
            name,
            endpoint::unary_stream(endpoint),
            Req::SCHEMA,
            Resp::SCHEMA,
        )
    }

    /// Streamed request, single response.
    pub fn stream_unary<Req, Resp, F, Fut>(name: &str, endpoint: F) -> Self
    where
        Req: FromMessage,
        Resp: IntoMessage,
        F: Fn(Streaming<Req>, CallContext, Resolved) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EndpointResult<Resp>> + Send + 'static,
    {
        Self::new(
            name,
            endpoint::stream_unary(endpoint),
            Req::SCHEMA,
            Resp::SCHEMA,
        )
    }

    /// Streamed request, streamed response.
    pub fn stream_stream<Req, Resp, F, S>(name: &str, endpoint: F) -> Self
    where
        Req: FromMessage,
        Resp: IntoMessage,
        F: Fn(Streaming<Req>, CallContext, Resolved) -> S + Send + Sync + 'static,
        S: Stream<Item = EndpointResult<Resp>> + Send + 'static,
    {
        Self::new(
            name,
            endpoint::stream_stream(endpoint),
            Req::SCHEMA,
            Resp::SCHEMA,
        )
    }

    /// Set the human-readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare a dependency the endpoint reads from [`Resolved`].
    pub fn depends_on<T>(mut self, dependency: &Dependency<T>) -> Self {
        self.roots.push(dependency.erased());
        self.plan = DependencyPlan::new(self.roots.iter().cloned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> MethodMode {
        self.endpoint.mode()
    }

    pub fn about(&self) -> &str {
        &self.description
    }

    pub fn request_schema(&self) -> Option<&'static str> {
        self.request_schema
    }

    pub fn response_schema(&self) -> Option<&'static str> {
        self.response_schema
    }

    /// Resolution order of the declared dependencies.
    pub fn dependencies(&self) -> &DependencyPlan {
        &self.plan
    }

    /// Name used in log lines: the descriptor's full path when bound.
    pub(crate) fn signature_name(&self, ctx: &CallContext) -> String {
        ctx.descriptor()
            .map(|d| d.full_name())
            .unwrap_or_else(|| self.name.clone())
    }

    fn shape_mismatch(&self) -> DispatchError {
        ConfigError::ShapeMismatch {
            method: self.name.clone(),
            mode: self.mode().to_string(),
        }
        .into()
    }

    fn log_success(&self, ctx: &CallContext, summary: &str) {
        tracing::info!(
            "invoke {}({}) [OK] {} ms",
            self.signature_name(ctx),
            summary,
            ctx.elapsed_ms()
        );
    }

    /// Resolve dependencies, run a single-response endpoint, release dependencies.
    pub(crate) async fn call_unary(
        self: Arc<Self>,
        request: Request,
        ctx: CallContext,
        log_limit: usize,
    ) -> Result<Message> {
        let summary = request.summary(log_limit);
        let mut scope = DependencyScope::new();
        ctx.advance(CallState::DependenciesResolving);

        let outcome = match scope.resolve(&self.plan).await {
            Ok(deps) => match (&self.endpoint, request) {
                (Endpoint::UnaryUnary(call), Request::Unary(message)) => {
                    call(message, ctx.clone(), deps).await
                }
                (Endpoint::StreamUnary(call), Request::Streaming(requests)) => {
                    call(requests, ctx.clone(), deps).await
                }
                _ => Err(self.shape_mismatch()),
            },
            Err(e) => Err(e),
        };
        scope.close().await;

        if outcome.is_ok() {
            self.log_success(&ctx, &summary);
        }
        outcome
    }

    /// Resolve dependencies, stream a sequence-producing endpoint, release
    /// dependencies once the endpoint's stream has ended or failed.
    pub(crate) fn call_streaming(
        self: Arc<Self>,
        request: Request,
        ctx: CallContext,
        log_limit: usize,
    ) -> ResponseStream {
        Box::pin(async_stream::stream! {
            let summary = request.summary(log_limit);
            let mut scope = DependencyScope::new();
            ctx.advance(CallState::DependenciesResolving);

            let deps = match scope.resolve(&self.plan).await {
                Ok(deps) => deps,
                Err(e) => {
                    scope.close().await;
                    yield Err(e);
                    return;
                }
            };
            let mut responses = match (&self.endpoint, request) {
                (Endpoint::UnaryStream(call), Request::Unary(message)) => {
                    call(message, ctx.clone(), deps)
                }
                (Endpoint::StreamStream(call), Request::Streaming(requests)) => {
                    call(requests, ctx.clone(), deps)
                }
                _ => {
                    scope.close().await;
                    yield Err(self.shape_mismatch());
                    return;
                }
            };

            let mut failure = None;
            while let Some(item) = responses.next().await {
                // an abort ends the stream; the item produced alongside it is dropped
                if ctx.is_aborted() {
                    break;
                }
                match item {
                    Ok(message) => yield Ok(message),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            drop(responses);
            scope.close().await;

            match (failure, ctx.abort_status()) {
                (Some(e), _) => yield Err(e),
                (None, Some(status)) => yield Err(DispatchError::Aborted(status.clone())),
                (None, None) => self.log_success(&ctx, &summary),
            }
        })
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("request_schema", &self.request_schema)
            .field("response_schema", &self.response_schema)
            .field("dependencies", &self.plan)
            .finish()
    }
}
