//! Service - the frozen, callable surface handed to the transport.
//!
//! A [`Service`] is built by [`Controller::build`](crate::controller::Controller::build)
//! and is cheap to clone. Each [`BoundMethod`] exposes exactly one entry point
//! per calling convention:
//!
//! | Mode           | Entry point                                                  |
//! |----------------|--------------------------------------------------------------|
//! | `UnaryUnary`   | `unary_unary(Message, handle) -> Result<Message, Status>`    |
//! | `UnaryStream`  | `unary_stream(Message, handle) -> Stream<Result<Message, Status>>` |
//! | `StreamUnary`  | `stream_unary(RequestStream, handle) -> Result<Message, Status>` |
//! | `StreamStream` | `stream_stream(RequestStream, handle) -> Stream<..>`         |
//!
//! The caller always gets either fully serialized responses or the status the
//! call was aborted with.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};

use crate::context::{CallContext, CallState};
use crate::error::{DispatchError, Result};
use crate::message::Message;
use crate::method::{Method, MethodMode, Request};
use crate::middleware::{Call, ChainBuilder, StreamNext, UnaryNext};
use crate::status::{Code, Status};
use crate::transport::{CallHandle, MethodDescriptor, RequestStream};

/// Outbound stream as the transport sees it.
pub type StatusStream = BoxStream<'static, std::result::Result<Message, Status>>;

#[derive(Clone)]
enum Chain {
    Unary(UnaryNext),
    Streaming(StreamNext),
}

/// One method bound to its composed interceptor chain.
#[derive(Clone)]
pub struct BoundMethod {
    method: Arc<Method>,
    descriptor: Option<Arc<MethodDescriptor>>,
    chain: Chain,
}

impl BoundMethod {
    pub(crate) fn new(
        method: Arc<Method>,
        descriptor: Option<Arc<MethodDescriptor>>,
        chain: &ChainBuilder,
        log_limit: usize,
    ) -> Self {
        let chain = if method.mode().is_response_streaming() {
            Chain::Streaming(chain.streaming(log_limit))
        } else {
            Chain::Unary(chain.unary(log_limit))
        };
        Self {
            method,
            descriptor,
            chain,
        }
    }

    pub fn name(&self) -> &str {
        self.method.name()
    }

    pub fn mode(&self) -> MethodMode {
        self.method.mode()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Descriptor calls are bound to, if any.
    pub fn descriptor(&self) -> Option<&MethodDescriptor> {
        self.descriptor.as_deref()
    }

    /// Same method, with calls bound to `descriptor`.
    ///
    /// For transports that present their own descriptor per service.
    pub fn with_descriptor(&self, descriptor: MethodDescriptor) -> Self {
        Self {
            descriptor: Some(Arc::new(descriptor)),
            ..self.clone()
        }
    }

    fn check_mode(&self, expected: MethodMode) -> std::result::Result<(), Status> {
        if self.mode() == expected {
            return Ok(());
        }
        Err(Status::unimplemented(format!(
            "method {} is {}, not {}",
            self.name(),
            self.mode(),
            expected
        )))
    }

    fn call(&self, request: Request, handle: Arc<dyn CallHandle>) -> Call {
        let context = CallContext::new(handle, self.descriptor.clone());
        Call::new(self.method.clone(), request, context)
    }

    /// Single request, single response.
    pub async fn unary_unary(
        &self,
        request: Message,
        handle: Arc<dyn CallHandle>,
    ) -> std::result::Result<Message, Status> {
        self.check_mode(MethodMode::UnaryUnary)?;
        self.run_unary(Request::Unary(request), handle).await
    }

    /// Streamed request, single response.
    pub async fn stream_unary(
        &self,
        requests: RequestStream,
        handle: Arc<dyn CallHandle>,
    ) -> std::result::Result<Message, Status> {
        self.check_mode(MethodMode::StreamUnary)?;
        self.run_unary(Request::Streaming(requests), handle).await
    }

    /// Single request, streamed response.
    pub fn unary_stream(&self, request: Message, handle: Arc<dyn CallHandle>) -> StatusStream {
        match self.check_mode(MethodMode::UnaryStream) {
            Ok(()) => self.run_streaming(Request::Unary(request), handle),
            Err(status) => stream::once(async move { Err(status) }).boxed(),
        }
    }

    /// Streamed request, streamed response.
    pub fn stream_stream(&self, requests: RequestStream, handle: Arc<dyn CallHandle>) -> StatusStream {
        match self.check_mode(MethodMode::StreamStream) {
            Ok(()) => self.run_streaming(Request::Streaming(requests), handle),
            Err(status) => stream::once(async move { Err(status) }).boxed(),
        }
    }

    async fn run_unary(
        &self,
        request: Request,
        handle: Arc<dyn CallHandle>,
    ) -> std::result::Result<Message, Status> {
        let Chain::Unary(chain) = &self.chain else {
            return Err(Status::internal("single-response call on a streaming chain"));
        };
        let call = self.call(request, handle);
        let ctx = call.context.clone();
        let outcome = chain.run(call).await;
        finish(&ctx, outcome).await
    }

    fn run_streaming(&self, request: Request, handle: Arc<dyn CallHandle>) -> StatusStream {
        let Chain::Streaming(chain) = &self.chain else {
            return stream::once(async {
                Err(Status::internal("streaming call on a single-response chain"))
            })
            .boxed();
        };
        let call = self.call(request, handle);
        let ctx = call.context.clone();
        let mut responses = chain.run(call);
        Box::pin(async_stream::stream! {
            let mut failure = None;
            while let Some(item) = responses.next().await {
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

            if let Some(e) = failure {
                yield Err(escaped(&ctx, e).await);
                return;
            }
            match ctx.abort_status() {
                Some(status) => yield Err(status.clone()),
                None => {
                    ctx.advance(CallState::Completed);
                }
            }
        })
    }
}

impl fmt::Debug for BoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundMethod")
            .field("method", &self.method)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

async fn finish(ctx: &CallContext, outcome: Result<Message>) -> std::result::Result<Message, Status> {
    match outcome {
        Ok(message) => match ctx.abort_status() {
            // the endpoint aborted the call itself and still returned
            Some(status) => Err(status.clone()),
            None => {
                ctx.advance(CallState::Completed);
                Ok(message)
            }
        },
        Err(e) => Err(escaped(ctx, e).await),
    }
}

/// Status for an error that left the chain.
async fn escaped(ctx: &CallContext, err: DispatchError) -> Status {
    let (code, message) = match err {
        DispatchError::Aborted(status) => return status,
        DispatchError::Config(e) => {
            tracing::error!("Configuration error: {}", e);
            (Code::FailedPrecondition, e.to_string())
        }
        other => {
            tracing::error!("Error escaped the exception stage: {}", other);
            (Code::Unknown, other.to_string())
        }
    };
    ctx.abort(code, message.clone()).await;
    ctx.abort_status()
        .cloned()
        .unwrap_or_else(|| Status::new(code, message))
}

struct Inner {
    name: String,
    methods: Vec<BoundMethod>,
    index: HashMap<String, usize>,
}

/// Immutable set of bound methods. Clones share the same service.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    pub(crate) fn new(name: String, methods: Vec<BoundMethod>) -> Self {
        let index = methods
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name().to_string(), i))
            .collect();
        Self {
            inner: Arc::new(Inner {
                name,
                methods,
                index,
            }),
        }
    }

    /// Fully qualified service name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Look up a method by name (`SayHello`) or path (`/greeter.Greeter/SayHello`).
    pub fn method(&self, name: &str) -> Option<&BoundMethod> {
        let name = name.rsplit('/').next().unwrap_or(name);
        self.inner
            .index
            .get(name)
            .map(|&i| &self.inner.methods[i])
    }

    /// Bound methods in registration order.
    pub fn methods(&self) -> impl Iterator<Item = &BoundMethod> {
        self.inner.methods.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.methods.is_empty()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.name)
            .field(
                "methods",
                &self.inner.methods.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::controller::Controller;
    use crate::method::EndpointResult;
    use crate::transport::mem::LocalCall;
    use crate::transport::ServiceDescriptor;

    fn service() -> Service {
        let mut controller = Controller::new("Echo").package("echo");
        controller
            .register(Method::unary_unary("echo", |v: Value, _, _| async move { Ok(v) }))
            .unwrap()
            .register(Method::unary_stream("repeat", |v: Value, _, _| {
                futures::stream::iter(vec![Ok::<_, crate::error::BoxError>(v.clone()), Ok(v)])
            }))
            .unwrap();
        let descriptor = ServiceDescriptor::new("echo.Echo")
            .method(MethodDescriptor::new("", "Echo", MethodMode::UnaryUnary, "Any", "Any"))
            .method(MethodDescriptor::new("", "Repeat", MethodMode::UnaryStream, "Any", "Any"));
        controller.descriptor(descriptor).build().unwrap()
    }

    fn msg(value: Value) -> Message {
        Message::encode("Any", &value).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_by_name_and_path() {
        let service = service();
        assert_eq!(service.len(), 2);
        assert!(service.method("Echo").is_some());
        assert!(service.method("/echo.Echo/Repeat").is_some());
        assert!(service.method("Missing").is_none());
    }

    #[tokio::test]
    async fn test_unary_call_completes() {
        let service = service();
        let handle = LocalCall::new("peer");
        let out = service
            .method("Echo")
            .unwrap()
            .unary_unary(msg(json!({"a": 1})), Arc::new(handle.clone()))
            .await
            .unwrap();
        assert_eq!(out.to_value().unwrap(), json!({"a": 1}));
        assert!(handle.aborts().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_entry_point_is_unimplemented() {
        let service = service();
        let echo = service.method("Echo").unwrap();
        let out: Vec<_> = echo
            .unary_stream(msg(json!({})), Arc::new(LocalCall::new("peer")))
            .collect()
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap_err().code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_streaming_call() {
        let service = service();
        let out: Vec<_> = service
            .method("Repeat")
            .unwrap()
            .unary_stream(msg(json!({"x": 1})), Arc::new(LocalCall::new("peer")))
            .collect()
            .await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_unbound_call_fails_precondition() {
        let mut controller = Controller::new("Loose");
        controller
            .register(Method::unary_unary("ping", |v: Value, _, _| async move {
                EndpointResult::Ok(v)
            }))
            .unwrap();
        let service = controller.build().unwrap();
        let handle = LocalCall::new("peer");

        let status = service
            .method("Ping")
            .unwrap()
            .unary_unary(msg(json!({})), Arc::new(handle.clone()))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(handle.aborts(), vec![status]);
    }

    #[tokio::test]
    async fn test_with_descriptor_binds_calls() {
        let mut controller = Controller::new("Loose");
        controller
            .register(Method::unary_unary("ping", |v: Value, _, _| async move {
                EndpointResult::Ok(v)
            }))
            .unwrap();
        let service = controller.build().unwrap();
        let bound = service.method("Ping").unwrap().with_descriptor(MethodDescriptor::new(
            "loose.Loose",
            "Ping",
            MethodMode::UnaryUnary,
            "Any",
            "Any",
        ));

        let out = bound
            .unary_unary(msg(json!({"ok": true})), Arc::new(LocalCall::new("peer")))
            .await
            .unwrap();
        assert_eq!(out.to_value().unwrap(), json!({"ok": true}));
    }
}
