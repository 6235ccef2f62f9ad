//! Middleware module - interceptor chains around a method.
//!
//! Every call runs through a chain of interceptors, outermost first:
//!
//! 1. [`ContextBinding`] - checks the method descriptor and enters the `rpc.call` span
//! 2. [`ExceptionStage`] - the single error boundary; turns every failure into an abort
//! 3. [`SchedulerStage`] - only when the controller has a scheduler
//! 4. user interceptors, in registration order
//! 5. dependency resolution and the endpoint itself
//!
//! There are two flavors of interceptor. A [`UnaryInterceptor`] wraps methods
//! with a single response, a [`StreamInterceptor`] wraps methods with a streamed
//! response and must itself return a lazy stream. A [`Middleware`] carries one
//! or both.
//!
//! Chains are composed once, when the service is built, by folding the
//! interceptors from the innermost outwards. Each interceptor receives the
//! [`Call`] and a `next` continuation, and may observe, modify or short-circuit.
//!
//! # Example
//!
//! ```
//! use rpc_dispatch::middleware::{self, Call, UnaryNext};
//!
//! let timing = middleware::from_fn(|call: Call, next: UnaryNext| async move {
//!     let ctx = call.context.clone();
//!     let result = next.run(call).await;
//!     tracing::debug!("call took {} ms", ctx.elapsed_ms());
//!     result
//! });
//! # let _ = timing;
//! ```

mod builtin;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::stream::Stream;

use crate::context::CallContext;
use crate::error::Result;
use crate::message::Message;
use crate::method::{BoxFuture, Method, Request, ResponseStream};

pub use builtin::{ContextBinding, ExceptionStage, SchedulerStage};

/// One call travelling through the chain.
pub struct Call {
    pub method: Arc<Method>,
    pub request: Request,
    pub context: CallContext,
}

impl Call {
    pub fn new(method: Arc<Method>, request: Request, context: CallContext) -> Self {
        Self {
            method,
            request,
            context,
        }
    }

    /// `name(request)` rendering used in log lines.
    pub fn signature(&self, limit: usize) -> String {
        format!(
            "{}({})",
            self.method.signature_name(&self.context),
            self.request.summary(limit)
        )
    }

    /// Copy of the request message, for unary requests.
    pub fn request_message(&self) -> Option<Message> {
        match &self.request {
            Request::Unary(message) => Some(message.clone()),
            Request::Streaming(_) => None,
        }
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method.name())
            .field("request", &self.request)
            .field("context", &self.context)
            .finish()
    }
}

/// Interceptor for methods with a single response.
pub trait UnaryInterceptor: Send + Sync + 'static {
    fn intercept(&self, call: Call, next: UnaryNext) -> BoxFuture<'static, Result<Message>>;
}

/// Interceptor for methods with a streamed response.
///
/// The returned stream must stay lazy: pull from `next` only as the consumer
/// pulls from you.
pub trait StreamInterceptor: Send + Sync + 'static {
    fn intercept(&self, call: Call, next: StreamNext) -> ResponseStream;
}

/// Continuation into the rest of a single-response chain.
#[derive(Clone)]
pub struct UnaryNext {
    inner: Arc<dyn Fn(Call) -> BoxFuture<'static, Result<Message>> + Send + Sync>,
}

impl UnaryNext {
    fn new<F>(f: F) -> Self
    where
        F: Fn(Call) -> BoxFuture<'static, Result<Message>> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Dependency resolution and the endpoint.
    fn terminal(log_limit: usize) -> Self {
        Self::new(move |call: Call| {
            Box::pin(
                call.method
                    .clone()
                    .call_unary(call.request, call.context, log_limit),
            )
        })
    }

    /// Hand the call to the next stage.
    pub fn run(&self, call: Call) -> BoxFuture<'static, Result<Message>> {
        (self.inner)(call)
    }
}

/// Continuation into the rest of a streamed-response chain.
#[derive(Clone)]
pub struct StreamNext {
    inner: Arc<dyn Fn(Call) -> ResponseStream + Send + Sync>,
}

impl StreamNext {
    fn new<F>(f: F) -> Self
    where
        F: Fn(Call) -> ResponseStream + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    fn terminal(log_limit: usize) -> Self {
        Self::new(move |call: Call| {
            call.method
                .clone()
                .call_streaming(call.request, call.context, log_limit)
        })
    }

    /// Hand the call to the next stage.
    pub fn run(&self, call: Call) -> ResponseStream {
        (self.inner)(call)
    }
}

/// A middleware registration: a unary interceptor, a stream interceptor, or both.
#[derive(Clone, Default)]
pub struct Middleware {
    unary: Option<Arc<dyn UnaryInterceptor>>,
    streaming: Option<Arc<dyn StreamInterceptor>>,
}

impl Middleware {
    /// Applies to single-response methods only.
    pub fn unary<I: UnaryInterceptor>(interceptor: I) -> Self {
        Self {
            unary: Some(Arc::new(interceptor)),
            streaming: None,
        }
    }

    /// Applies to streamed-response methods only.
    pub fn streaming<I: StreamInterceptor>(interceptor: I) -> Self {
        Self {
            unary: None,
            streaming: Some(Arc::new(interceptor)),
        }
    }

    /// Applies to every method.
    pub fn both<I>(interceptor: I) -> Self
    where
        I: UnaryInterceptor + StreamInterceptor,
    {
        let interceptor = Arc::new(interceptor);
        Self {
            unary: Some(interceptor.clone()),
            streaming: Some(interceptor),
        }
    }

    pub fn is_unary(&self) -> bool {
        self.unary.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("unary", &self.is_unary())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

/// Closure-based [`UnaryInterceptor`].
pub struct FnInterceptor<F>(F);

impl<F, Fut> UnaryInterceptor for FnInterceptor<F>
where
    F: Fn(Call, UnaryNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message>> + Send + 'static,
{
    fn intercept(&self, call: Call, next: UnaryNext) -> BoxFuture<'static, Result<Message>> {
        Box::pin((self.0)(call, next))
    }
}

/// Closure-based [`StreamInterceptor`].
pub struct FnStreamInterceptor<F>(F);

impl<F, S> StreamInterceptor for FnStreamInterceptor<F>
where
    F: Fn(Call, StreamNext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Message>> + Send + 'static,
{
    fn intercept(&self, call: Call, next: StreamNext) -> ResponseStream {
        Box::pin((self.0)(call, next))
    }
}

/// Single-response middleware from an async closure.
pub fn from_fn<F, Fut>(f: F) -> Middleware
where
    F: Fn(Call, UnaryNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message>> + Send + 'static,
{
    Middleware::unary(FnInterceptor(f))
}

/// Streamed-response middleware from a closure returning a stream.
pub fn stream_from_fn<F, S>(f: F) -> Middleware
where
    F: Fn(Call, StreamNext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Message>> + Send + 'static,
{
    Middleware::streaming(FnStreamInterceptor(f))
}

/// Ordered middleware list, outermost first.
#[derive(Clone, Default, Debug)]
pub struct ChainBuilder {
    stages: Vec<Middleware>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage inside every stage added so far.
    pub fn push(&mut self, stage: Middleware) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Compose the single-response chain.
    pub fn unary(&self, log_limit: usize) -> UnaryNext {
        self.stages
            .iter()
            .rev()
            .filter_map(|stage| stage.unary.clone())
            .fold(UnaryNext::terminal(log_limit), |next, interceptor| {
                UnaryNext::new(move |call| interceptor.intercept(call, next.clone()))
            })
    }

    /// Compose the streamed-response chain.
    pub fn streaming(&self, log_limit: usize) -> StreamNext {
        self.stages
            .iter()
            .rev()
            .filter_map(|stage| stage.streaming.clone())
            .fold(StreamNext::terminal(log_limit), |next, interceptor| {
                StreamNext::new(move |call| interceptor.intercept(call, next.clone()))
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::StreamExt;
    use serde_json::{json, Value};

    use super::*;
    use crate::method::EndpointResult;
    use crate::transport::mem::LocalCall;

    fn call(method: Method, request: Value) -> Call {
        Call::new(
            Arc::new(method),
            Request::Unary(Message::encode("Req", &request).unwrap()),
            CallContext::new(Arc::new(LocalCall::new("peer")), None),
        )
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Middleware {
        let log = log.clone();
        from_fn(move |call: Call, next: UnaryNext| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{name}:before"));
                let result = next.run(call).await;
                log.lock().unwrap().push(format!("{name}:after"));
                result
            }
        })
    }

    #[tokio::test]
    async fn test_chain_order_is_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ChainBuilder::new();
        chain.push(recorder(&log, "outer")).push(recorder(&log, "inner"));

        let method = Method::unary_unary("Echo", |req: Value, _, _| async move { Ok(req) });
        let out = chain
            .unary(64)
            .run(call(method, json!({"a": 1})))
            .await
            .unwrap();

        assert_eq!(out.to_value().unwrap(), json!({"a": 1}));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn test_interceptor_can_short_circuit() {
        let mut chain = ChainBuilder::new();
        chain.push(from_fn(|_call: Call, _next: UnaryNext| async {
            Ok(Message::new("Cached", bytes::Bytes::new()))
        }));

        let method = Method::unary_unary("Echo", |_: Value, _, _| async {
            Err::<Value, _>("endpoint must not run".into())
        });
        let out = chain.unary(64).run(call(method, json!({}))).await.unwrap();
        assert_eq!(out.type_name(), "Cached");
    }

    #[tokio::test]
    async fn test_unary_only_middleware_skips_streams() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ChainBuilder::new();
        chain.push(recorder(&log, "unary"));

        let method = Method::unary_stream("Count", |_: Value, _, _| {
            futures::stream::iter((0..2).map(|i| -> EndpointResult<Value> { Ok(json!({ "i": i })) }))
        });
        let out: Vec<_> = chain.streaming(64).run(call(method, json!({}))).collect().await;

        assert_eq!(out.len(), 2);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_interceptor_sees_each_item() {
        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        let mut chain = ChainBuilder::new();
        chain.push(stream_from_fn(move |call: Call, next: StreamNext| {
            let counter = counter.clone();
            next.run(call).inspect(move |_| *counter.lock().unwrap() += 1)
        }));

        let method = Method::unary_stream("Count", |_: Value, _, _| {
            futures::stream::iter((0..3).map(|i| -> EndpointResult<Value> { Ok(json!({ "i": i })) }))
        });
        let mut out = chain.streaming(64).run(call(method, json!({})));

        assert!(out.next().await.is_some());
        assert_eq!(*seen.lock().unwrap(), 1);
        while out.next().await.is_some() {}
        assert_eq!(*seen.lock().unwrap(), 3);
    }
}
