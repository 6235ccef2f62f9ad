//! Exception handlers.
//!
//! An [`ExceptionRegistry`] maps an error type to an async handler. When a call
//! fails, the exception-handling stage looks up the handler for the exact type
//! of the error the endpoint raised (no walk over wrapping or "parent" types)
//! and runs it. Handlers normally abort the call with a status of their choice.
//!
//! The default registry already handles:
//! - [`Status`]: aborts with the status's own code and message
//! - [`ValidationError`]: aborts with `INVALID_ARGUMENT` and the rendered error
//!
//! # Example
//!
//! ```
//! use rpc_dispatch::exception::ExceptionRegistry;
//! use rpc_dispatch::status::Code;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("user {0} not found")]
//! struct UserNotFound(u64);
//!
//! let mut handlers = ExceptionRegistry::new();
//! handlers.on(|_request, ctx, err: &UserNotFound| {
//!     let message = err.to_string();
//!     async move { ctx.abort(Code::NotFound, message).await }
//! });
//! assert!(handlers.handles::<UserNotFound>());
//! ```

use std::any::{type_name, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::context::CallContext;
use crate::error::{DispatchError, ValidationError};
use crate::message::Message;
use crate::method::BoxFuture;
use crate::status::{Code, Status};

type ErasedHandler = Arc<
    dyn Fn(Option<Message>, CallContext, &DispatchError) -> Option<BoxFuture<'static, ()>>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct Binding {
    kind: TypeId,
    name: &'static str,
    matches: fn(&DispatchError) -> bool,
    handler: ErasedHandler,
}

fn is_kind<E: std::error::Error + 'static>(err: &DispatchError) -> bool {
    err.kind().is::<E>()
}

/// Error type → handler mapping.
#[derive(Clone)]
pub struct ExceptionRegistry {
    bindings: Vec<Binding>,
}

impl ExceptionRegistry {
    /// Registry with the default handlers for [`Status`] and [`ValidationError`].
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.on(|_request, ctx, status: &Status| {
            let status = status.clone();
            async move { ctx.abort(status.code(), status.message()).await }
        });
        registry.on(|_request, ctx, err: &ValidationError| {
            let message = err.to_string();
            async move { ctx.abort(Code::InvalidArgument, message).await }
        });
        registry
    }

    /// Registry without any handler.
    pub fn empty() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Handle errors of type `E`.
    ///
    /// The handler receives the request message (unary requests only), the
    /// call context and the error. It replaces any handler already registered
    /// for `E`.
    pub fn on<E, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        E: std::error::Error + 'static,
        F: Fn(Option<Message>, CallContext, &E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let erased: ErasedHandler = Arc::new(
            move |request: Option<Message>,
                  ctx: CallContext,
                  err: &DispatchError|
                  -> Option<BoxFuture<'static, ()>> {
                err.kind()
                    .downcast_ref::<E>()
                    .map(|err| Box::pin(handler(request, ctx, err)) as BoxFuture<'static, ()>)
            },
        );
        self.insert(Binding {
            kind: TypeId::of::<E>(),
            name: type_name::<E>(),
            matches: is_kind::<E>,
            handler: erased,
        });
        self
    }

    /// Add every handler of `other`, replacing ours for the same error types.
    pub fn merge(&mut self, other: ExceptionRegistry) -> &mut Self {
        for binding in other.bindings {
            self.insert(binding);
        }
        self
    }

    /// Whether a handler is registered for `E`.
    pub fn handles<E: 'static>(&self) -> bool {
        let kind = TypeId::of::<E>();
        self.bindings.iter().any(|b| b.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Run the handler registered for the exact type of `err`.
    ///
    /// Returns `false` when no handler matched.
    pub async fn dispatch(
        &self,
        request: Option<Message>,
        ctx: &CallContext,
        err: &DispatchError,
    ) -> bool {
        let Some(binding) = self.bindings.iter().find(|b| (b.matches)(err)) else {
            return false;
        };
        match (binding.handler)(request, ctx.clone(), err) {
            Some(handled) => {
                tracing::debug!("dispatching {} to its exception handler", binding.name);
                handled.await;
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, binding: Binding) {
        match self.bindings.iter_mut().find(|b| b.kind == binding.kind) {
            Some(existing) => *existing = binding,
            None => self.bindings.push(binding),
        }
    }
}

impl Default for ExceptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExceptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.bindings.iter().map(|b| b.name))
            .finish()
    }
}
