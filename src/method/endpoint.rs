//! Endpoint erasure.
//!
//! A typed endpoint (`Fn(Req, CallContext, Resolved) -> Fut`) is turned into one
//! of four erased shapes that speak [`Message`] on both sides. Request
//! validation and response serialization happen here.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};

use super::{BoxFuture, EndpointResult, MethodMode, ResponseStream};
use crate::context::{CallContext, CallState};
use crate::dependency::Resolved;
use crate::error::{DispatchError, Result};
use crate::message::{FromMessage, IntoMessage, Message};
use crate::transport::RequestStream;

pub(crate) type UnaryFn =
    Arc<dyn Fn(Message, CallContext, Resolved) -> BoxFuture<'static, Result<Message>> + Send + Sync>;
pub(crate) type ClientStreamFn = Arc<
    dyn Fn(RequestStream, CallContext, Resolved) -> BoxFuture<'static, Result<Message>>
        + Send
        + Sync,
>;
pub(crate) type ServerStreamFn =
    Arc<dyn Fn(Message, CallContext, Resolved) -> ResponseStream + Send + Sync>;
pub(crate) type BidiFn =
    Arc<dyn Fn(RequestStream, CallContext, Resolved) -> ResponseStream + Send + Sync>;

/// Erased endpoint, one variant per calling convention.
#[derive(Clone)]
pub(crate) enum Endpoint {
    UnaryUnary(UnaryFn),
    UnaryStream(ServerStreamFn),
    StreamUnary(ClientStreamFn),
    StreamStream(BidiFn),
}

impl Endpoint {
    pub(crate) fn mode(&self) -> MethodMode {
        match self {
            Endpoint::UnaryUnary(_) => MethodMode::UnaryUnary,
            Endpoint::UnaryStream(_) => MethodMode::UnaryStream,
            Endpoint::StreamUnary(_) => MethodMode::StreamUnary,
            Endpoint::StreamStream(_) => MethodMode::StreamStream,
        }
    }
}

/// Inbound request stream handed to a streaming endpoint.
///
/// Each raw message is validated when the endpoint pulls it, never ahead of
/// time. A failed item is yielded as an error; the endpoint decides whether to
/// stop (usually with `?`).
pub struct Streaming<T> {
    inner: BoxStream<'static, Result<T>>,
}

impl<T: FromMessage> Streaming<T> {
    pub(crate) fn new(requests: RequestStream) -> Self {
        let inner = requests
            .map(|item| -> Result<T> {
                let message = item?;
                Ok(T::from_message(message)?)
            })
            .boxed();
        Self { inner }
    }
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

fn serialize<R: IntoMessage>(response: R, ctx: &CallContext) -> Result<Message> {
    ctx.advance(CallState::Serializing);
    Ok(response.into_message(ctx.output_type())?)
}

/// Serialize every produced item as soon as it is pulled.
///
/// The endpoint's stream is only polled when the consumer asks for the next
/// item, so at most one item is in flight. The first error ends the stream.
fn serialize_stream<S, R>(produced: Result<S>, ctx: CallContext) -> ResponseStream
where
    S: Stream<Item = EndpointResult<R>> + Send + 'static,
    R: IntoMessage,
{
    Box::pin(async_stream::stream! {
        let mut produced = match produced {
            Ok(stream) => Box::pin(stream),
            Err(e) => {
                yield Err(e);
                return;
            }
        };
        while let Some(item) = produced.next().await {
            match item
                .map_err(DispatchError::from_boxed)
                .and_then(|response| serialize(response, &ctx))
            {
                Ok(message) => yield Ok(message),
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}

pub(crate) fn unary_unary<Req, Resp, F, Fut>(endpoint: F) -> Endpoint
where
    Req: FromMessage,
    Resp: IntoMessage,
    F: Fn(Req, CallContext, Resolved) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EndpointResult<Resp>> + Send + 'static,
{
    Endpoint::UnaryUnary(Arc::new(
        move |raw: Message, ctx: CallContext, deps: Resolved| -> BoxFuture<'static, Result<Message>> {
            let invoked = Req::from_message(raw).map(|request| {
                ctx.advance(CallState::Executing);
                endpoint(request, ctx.clone(), deps)
            });
            Box::pin(async move {
                let response = invoked?.await.map_err(DispatchError::from_boxed)?;
                serialize(response, &ctx)
            })
        },
    ))
}

pub(crate) fn stream_unary<Req, Resp, F, Fut>(endpoint: F) -> Endpoint
where
    Req: FromMessage,
    Resp: IntoMessage,
    F: Fn(Streaming<Req>, CallContext, Resolved) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EndpointResult<Resp>> + Send + 'static,
{
    Endpoint::StreamUnary(Arc::new(
        move |requests: RequestStream,
              ctx: CallContext,
              deps: Resolved|
              -> BoxFuture<'static, Result<Message>> {
            ctx.advance(CallState::Executing);
            let invoked = endpoint(Streaming::new(requests), ctx.clone(), deps);
            Box::pin(async move {
                let response = invoked.await.map_err(DispatchError::from_boxed)?;
                serialize(response, &ctx)
            })
        },
    ))
}

pub(crate) fn unary_stream<Req, Resp, F, S>(endpoint: F) -> Endpoint
where
    Req: FromMessage,
    Resp: IntoMessage,
    F: Fn(Req, CallContext, Resolved) -> S + Send + Sync + 'static,
    S: Stream<Item = EndpointResult<Resp>> + Send + 'static,
{
    Endpoint::UnaryStream(Arc::new(
        move |raw: Message, ctx: CallContext, deps: Resolved| -> ResponseStream {
            let produced = Req::from_message(raw)
                .map(|request| {
                    ctx.advance(CallState::Executing);
                    endpoint(request, ctx.clone(), deps)
                })
                .map_err(DispatchError::from);
            serialize_stream(produced, ctx)
        },
    ))
}

pub(crate) fn stream_stream<Req, Resp, F, S>(endpoint: F) -> Endpoint
where
    Req: FromMessage,
    Resp: IntoMessage,
    F: Fn(Streaming<Req>, CallContext, Resolved) -> S + Send + Sync + 'static,
    S: Stream<Item = EndpointResult<Resp>> + Send + 'static,
{
    Endpoint::StreamStream(Arc::new(
        move |requests: RequestStream, ctx: CallContext, deps: Resolved| -> ResponseStream {
            ctx.advance(CallState::Executing);
            let produced = endpoint(Streaming::new(requests), ctx.clone(), deps);
            serialize_stream(Ok(produced), ctx)
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TransportError, ValidationError};
    use crate::transport::mem::LocalCall;
    use serde_json::{json, Value};

    fn ctx() -> CallContext {
        CallContext::new(Arc::new(LocalCall::new("peer")), None)
    }

    fn raw(value: Value) -> Message {
        Message::encode("Req", &value).unwrap()
    }

    #[tokio::test]
    async fn test_streaming_validates_lazily() {
        let items: Vec<std::result::Result<Message, TransportError>> = vec![
            Ok(raw(json!({"n": 1}))),
            Ok(Message::new("Req", bytes::Bytes::from_static(b"\xc1"))),
            Err(TransportError::Disconnected),
        ];
        let mut requests = Streaming::<Value>::new(futures::stream::iter(items).boxed());

        assert_eq!(requests.next().await.unwrap().unwrap(), json!({"n": 1}));
        assert!(matches!(
            requests.next().await.unwrap(),
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            requests.next().await.unwrap(),
            Err(DispatchError::Transport(TransportError::Disconnected))
        ));
        assert!(requests.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unary_endpoint_serializes_mapping() {
        let endpoint = unary_unary(|req: Value, _ctx, _deps| async move {
            Ok(json!({"echo": req["name"].clone()}))
        });
        let Endpoint::UnaryUnary(call) = endpoint else {
            panic!("wrong variant");
        };

        let ctx = ctx();
        let out = call(raw(json!({"name": "x"})), ctx.clone(), Resolved::default())
            .await
            .unwrap();
        assert_eq!(out.to_value().unwrap(), json!({"echo": "x"}));
        assert_eq!(ctx.state(), CallState::Serializing);
    }

    #[tokio::test]
    async fn test_stream_ends_at_first_error() {
        let endpoint = unary_stream(|_req: Value, _ctx, _deps| {
            futures::stream::iter(vec![
                Ok(json!({"i": 0})),
                Err(ValidationError::new("bad item").into()),
                Ok(json!({"i": 2})),
            ])
        });
        let Endpoint::UnaryStream(call) = endpoint else {
            panic!("wrong variant");
        };

        let out: Vec<_> = call(raw(json!({})), ctx(), Resolved::default()).collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(DispatchError::Validation(_))));
    }

    #[test]
    fn test_endpoint_modes() {
        let uu = unary_unary(|_: Message, _, _| async { Ok(json!({})) });
        let su = stream_unary(|_: Streaming<Message>, _, _| async { Ok(json!({})) });
        let us = unary_stream(|_: Message, _, _| futures::stream::empty::<EndpointResult<Value>>());
        let ss = stream_stream(|_: Streaming<Message>, _, _| {
            futures::stream::empty::<EndpointResult<Value>>()
        });

        assert_eq!(uu.mode(), MethodMode::UnaryUnary);
        assert_eq!(su.mode(), MethodMode::StreamUnary);
        assert_eq!(us.mode(), MethodMode::UnaryStream);
        assert_eq!(ss.mode(), MethodMode::StreamStream);
    }
}
