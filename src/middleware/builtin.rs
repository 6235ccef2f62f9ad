//! Built-in stages.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{Instrument, Span};

use super::{Call, StreamInterceptor, StreamNext, UnaryInterceptor, UnaryNext};
use crate::context::{CallContext, CallState};
use crate::error::{ConfigError, DispatchError, Result};
use crate::exception::ExceptionRegistry;
use crate::message::Message;
use crate::method::{BoxFuture, ResponseStream};
use crate::scheduler::Scheduler;
use crate::status::{Code, Status};

/// Outermost stage: requires a method descriptor and opens the call's span.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextBinding;

impl ContextBinding {
    fn bind(call: &Call) -> Result<Span> {
        let Some(descriptor) = call.context.descriptor() else {
            return Err(ConfigError::MissingDescriptor(call.method.name().to_string()).into());
        };
        call.context.advance(CallState::ContextBound);
        Ok(tracing::info_span!(
            "rpc.call",
            method = %descriptor.full_name(),
            peer = %call.context.peer(),
        ))
    }
}

impl UnaryInterceptor for ContextBinding {
    fn intercept(&self, call: Call, next: UnaryNext) -> BoxFuture<'static, Result<Message>> {
        match Self::bind(&call) {
            Ok(span) => Box::pin(next.run(call).instrument(span)),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}

impl StreamInterceptor for ContextBinding {
    fn intercept(&self, call: Call, next: StreamNext) -> ResponseStream {
        let span = match Self::bind(&call) {
            Ok(span) => span,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let mut inner = next.run(call);
        Box::pin(async_stream::stream! {
            while let Some(item) = inner.next().instrument(span.clone()).await {
                yield item;
            }
        })
    }
}

/// The call's error boundary.
///
/// Every failure raised further in is logged, handed to the exception handler
/// registered for its type, and then answered with a fallback `UNKNOWN` abort
/// carrying the error text. The fallback does nothing when a handler already
/// aborted the call. Errors leave this stage as [`DispatchError::Aborted`].
#[derive(Debug, Clone)]
pub struct ExceptionStage {
    handlers: Arc<ExceptionRegistry>,
    log_limit: usize,
}

impl ExceptionStage {
    pub fn new(handlers: Arc<ExceptionRegistry>, log_limit: usize) -> Self {
        Self {
            handlers,
            log_limit,
        }
    }
}

async fn handle_failure(
    handlers: &ExceptionRegistry,
    signature: &str,
    request: Option<Message>,
    ctx: &CallContext,
    err: DispatchError,
) -> DispatchError {
    if err.is_aborted() {
        return err;
    }
    ctx.advance(CallState::Error);
    match &err {
        DispatchError::Transport(e) => {
            tracing::error!("Transport error: {} [ERR] {} ms: {}", signature, ctx.elapsed_ms(), e)
        }
        _ => tracing::error!(
            "Unexpected Error: {} [ERR] {} ms: {}",
            signature,
            ctx.elapsed_ms(),
            err
        ),
    }

    ctx.advance(CallState::HandlerDispatch);
    handlers.dispatch(request, ctx, &err).await;
    ctx.abort(Code::Unknown, err.to_string()).await;

    let status = ctx
        .abort_status()
        .cloned()
        .unwrap_or_else(|| Status::unknown(err.to_string()));
    DispatchError::Aborted(status)
}

impl UnaryInterceptor for ExceptionStage {
    fn intercept(&self, call: Call, next: UnaryNext) -> BoxFuture<'static, Result<Message>> {
        let handlers = self.handlers.clone();
        let signature = call.signature(self.log_limit);
        let request = call.request_message();
        let ctx = call.context.clone();
        Box::pin(async move {
            match next.run(call).await {
                Ok(message) => Ok(message),
                Err(e) => Err(handle_failure(&handlers, &signature, request, &ctx, e).await),
            }
        })
    }
}

impl StreamInterceptor for ExceptionStage {
    fn intercept(&self, call: Call, next: StreamNext) -> ResponseStream {
        let handlers = self.handlers.clone();
        let signature = call.signature(self.log_limit);
        let request = call.request_message();
        let ctx = call.context.clone();
        let mut inner = next.run(call);
        Box::pin(async_stream::stream! {
            let mut failure = None;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(message) => yield Ok(message),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            drop(inner);
            if let Some(err) = failure {
                yield Err(handle_failure(&handlers, &signature, request, &ctx, err).await);
            }
        })
    }
}

/// Attaches a background [`Scheduler`] to every call's context.
#[derive(Debug, Clone)]
pub struct SchedulerStage {
    scheduler: Scheduler,
}

impl SchedulerStage {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

impl UnaryInterceptor for SchedulerStage {
    fn intercept(&self, call: Call, next: UnaryNext) -> BoxFuture<'static, Result<Message>> {
        call.context.attach_scheduler(self.scheduler.clone());
        next.run(call)
    }
}

impl StreamInterceptor for SchedulerStage {
    fn intercept(&self, call: Call, next: StreamNext) -> ResponseStream {
        call.context.attach_scheduler(self.scheduler.clone());
        next.run(call)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use thiserror::Error;

    use super::*;
    use crate::method::{Method, MethodMode, Request};
    use crate::middleware::{ChainBuilder, Middleware};
    use crate::transport::mem::LocalCall;
    use crate::transport::MethodDescriptor;

    #[derive(Debug, Error)]
    #[error("out of stock: {0}")]
    struct OutOfStock(String);

    fn call_with(method: Method, handle: &LocalCall, bound: bool) -> Call {
        let descriptor = MethodDescriptor::new(
            "shop.Shop",
            method.name(),
            method.mode(),
            "Req",
            "Reply",
        );
        let ctx = CallContext::new(
            Arc::new(handle.clone()),
            bound.then(|| Arc::new(descriptor)),
        );
        Call::new(
            Arc::new(method),
            Request::Unary(Message::encode("Req", &json!({"item": "tea"})).unwrap()),
            ctx,
        )
    }

    fn chain(handlers: ExceptionRegistry) -> ChainBuilder {
        let mut chain = ChainBuilder::new();
        chain
            .push(Middleware::both(ContextBinding))
            .push(Middleware::both(ExceptionStage::new(Arc::new(handlers), 64)));
        chain
    }

    fn failing() -> Method {
        Method::unary_unary("Buy", |req: Value, _, _| async move {
            Err::<Value, _>(OutOfStock(req["item"].as_str().unwrap_or("").into()).into())
        })
    }

    #[tokio::test]
    async fn test_missing_descriptor_fails_fast() {
        let handle = LocalCall::new("peer");
        let err = chain(ExceptionRegistry::new())
            .unary(64)
            .run(call_with(failing(), &handle, false))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Config(ConfigError::MissingDescriptor(ref m)) if m == "Buy"
        ));
        assert!(handle.aborts().is_empty());
    }

    #[tokio::test]
    async fn test_unhandled_error_aborts_unknown() {
        let handle = LocalCall::new("peer");
        let call = call_with(failing(), &handle, true);
        let ctx = call.context.clone();

        let err = chain(ExceptionRegistry::new()).unary(64).run(call).await.unwrap_err();

        let expected = Status::unknown("out of stock: tea");
        assert!(matches!(err, DispatchError::Aborted(ref s) if *s == expected));
        assert_eq!(handle.aborts(), vec![expected]);
        assert_eq!(ctx.state(), CallState::Aborted);
    }

    #[tokio::test]
    async fn test_registered_handler_decides_status() {
        let mut handlers = ExceptionRegistry::new();
        handlers.on(|_req, ctx, err: &OutOfStock| {
            let message = format!("no {}", err.0);
            async move { ctx.abort(Code::FailedPrecondition, message).await }
        });
        let handle = LocalCall::new("peer");

        let err = chain(handlers)
            .unary(64)
            .run(call_with(failing(), &handle, true))
            .await
            .unwrap_err();

        assert!(err.is_aborted());
        assert_eq!(handle.aborts(), vec![Status::failed_precondition("no tea")]);
    }

    #[tokio::test]
    async fn test_handler_that_does_not_abort_gets_fallback() {
        let mut handlers = ExceptionRegistry::new();
        handlers.on(|_req, _ctx, _err: &OutOfStock| async {});
        let handle = LocalCall::new("peer");

        chain(handlers)
            .unary(64)
            .run(call_with(failing(), &handle, true))
            .await
            .unwrap_err();

        assert_eq!(handle.aborts(), vec![Status::unknown("out of stock: tea")]);
    }

    #[tokio::test]
    async fn test_stream_error_mid_way_keeps_earlier_items() {
        let method = Method::unary_stream("Browse", |_: Value, _, _| {
            futures::stream::iter(vec![
                Ok(json!({"n": 0})),
                Err(OutOfStock("coffee".into()).into()),
                Ok(json!({"n": 2})),
            ])
        });
        assert_eq!(method.mode(), MethodMode::UnaryStream);
        let handle = LocalCall::new("peer");

        let out: Vec<_> = chain(ExceptionRegistry::new())
            .streaming(64)
            .run(call_with(method, &handle, true))
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().to_value().unwrap(), json!({"n": 0}));
        assert!(matches!(out[1], Err(DispatchError::Aborted(_))));
        assert_eq!(handle.aborts(), vec![Status::unknown("out of stock: coffee")]);
    }

    #[tokio::test]
    async fn test_scheduler_stage_attaches_scheduler() {
        let mut chain = ChainBuilder::new();
        chain.push(Middleware::both(SchedulerStage::new(
            Scheduler::current().unwrap(),
        )));
        let method = Method::unary_unary("Check", |_: Value, ctx: CallContext, _| async move {
            Ok::<_, crate::error::BoxError>(json!({ "scheduled": ctx.scheduler().is_some() }))
        });

        let out = chain
            .unary(64)
            .run(call_with(method, &LocalCall::new("peer"), true))
            .await
            .unwrap();
        assert_eq!(out.to_value().unwrap(), json!({"scheduled": true}));
    }
}
