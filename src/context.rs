//! Per-call execution context.
//!
//! [`CallContext`] wraps the transport's [`CallHandle`] for the duration of one
//! call. It is created by the dispatcher, bound by the context-binding stage and
//! handed to every interceptor, exception handler and endpoint.
//!
//! It provides:
//! - `elapsed` - monotonic time since the call started, computed on read
//! - `metadata` - pulled from the transport on first read, cached afterwards
//! - `time_remaining` / `peer` - delegated to the transport
//! - `set_code` / `set_details` - the status reported when the call ends normally
//! - `abort` - terminates the call; only the first abort reaches the transport
//! - `state` - where the call is in its lifecycle
//!
//! # Lifecycle
//!
//! ```text
//! Created → ContextBound → DependenciesResolving → Executing → Serializing → Completed
//!    └──────────┴────────────────┴──────────────────┴────────────┴──→ Error → HandlerDispatch → Aborted
//! ```
//!
//! No state is entered twice, and `Completed` and `Aborted` exclude each other.
//! `Aborted` is only entered from `HandlerDispatch`: an abort issued while the
//! call is still on the success path moves it through `Error` first.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::scheduler::Scheduler;
use crate::status::{Code, Status};
use crate::transport::{CallHandle, Metadata, MethodDescriptor};

/// Lifecycle state of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CallState {
    Created = 0,
    ContextBound = 1,
    DependenciesResolving = 2,
    Executing = 3,
    Serializing = 4,
    Completed = 5,
    Error = 6,
    HandlerDispatch = 7,
    Aborted = 8,
}

impl CallState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CallState::Created,
            1 => CallState::ContextBound,
            2 => CallState::DependenciesResolving,
            3 => CallState::Executing,
            4 => CallState::Serializing,
            5 => CallState::Completed,
            6 => CallState::Error,
            7 => CallState::HandlerDispatch,
            _ => CallState::Aborted,
        }
    }

    /// `Completed` or `Aborted`.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Aborted)
    }

    fn is_success_path(&self) -> bool {
        *self <= CallState::Completed
    }

    /// Whether a call in `self` may move to `next`.
    pub fn can_advance_to(&self, next: CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            CallState::Error => self.is_success_path(),
            CallState::HandlerDispatch => *self == CallState::Error,
            CallState::Aborted => *self == CallState::HandlerDispatch,
            _ => self.is_success_path() && next > *self,
        }
    }
}

struct Inner {
    handle: Arc<dyn CallHandle>,
    descriptor: Option<Arc<MethodDescriptor>>,
    started: Instant,
    state: AtomicU8,
    metadata: OnceLock<Metadata>,
    scheduler: OnceLock<Scheduler>,
    abort_status: OnceLock<Status>,
}

/// Context of one call. Clones share the same call.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<Inner>,
}

impl CallContext {
    /// Create the context for a new call.
    pub fn new(handle: Arc<dyn CallHandle>, descriptor: Option<Arc<MethodDescriptor>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                handle,
                descriptor,
                started: Instant::now(),
                state: AtomicU8::new(CallState::Created as u8),
                metadata: OnceLock::new(),
                scheduler: OnceLock::new(),
                abort_status: OnceLock::new(),
            }),
        }
    }

    /// Descriptor of the method being called, if the transport supplied one.
    pub fn descriptor(&self) -> Option<&MethodDescriptor> {
        self.inner.descriptor.as_deref()
    }

    /// Declared response type, empty when no descriptor is bound.
    pub fn output_type(&self) -> &str {
        self.descriptor().map(|d| d.output_type.as_str()).unwrap_or("")
    }

    /// Declared request type, empty when no descriptor is bound.
    pub fn input_type(&self) -> &str {
        self.descriptor().map(|d| d.input_type.as_str()).unwrap_or("")
    }

    /// Time since the call started.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Time since the call started, in whole milliseconds.
    #[inline]
    pub fn elapsed_ms(&self) -> u128 {
        self.elapsed().as_millis()
    }

    /// Invocation metadata. Read from the transport once, then cached.
    pub fn metadata(&self) -> &Metadata {
        self.inner
            .metadata
            .get_or_init(|| self.inner.handle.invocation_metadata().into_iter().collect())
    }

    /// Time left before the deadline.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.inner.handle.time_remaining()
    }

    /// Identity of the calling peer.
    pub fn peer(&self) -> String {
        self.inner.handle.peer()
    }

    /// Background scheduler, when the controller was configured with one.
    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.inner.scheduler.get()
    }

    /// Attach a scheduler. Returns `false` if one was already attached.
    pub fn attach_scheduler(&self, scheduler: Scheduler) -> bool {
        self.inner.scheduler.set(scheduler).is_ok()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CallState {
        CallState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// Returns `false`, leaving the state alone, for re-entries, backward moves
    /// and anything out of a terminal state.
    pub fn advance(&self, next: CallState) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if !CallState::from_u8(current).can_advance_to(next) {
                return false;
            }
            match self.inner.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Status code the transport reports when the call ends normally.
    ///
    /// Unlike [`abort`](Self::abort) the call keeps running.
    pub fn set_code(&self, code: Code) {
        self.inner.handle.set_code(code);
    }

    /// Status details the transport reports when the call ends normally.
    pub fn set_details(&self, details: impl AsRef<str>) {
        self.inner.handle.set_details(details.as_ref());
    }

    /// Terminate the call with `code` and `message`.
    ///
    /// Safe to call any number of times: only the first call reaches the
    /// transport, later calls do nothing. A transport failure while aborting
    /// is logged; the call counts as aborted either way.
    pub async fn abort(&self, code: Code, message: impl Into<String>) {
        let status = Status::new(code, message);
        if self.state() == CallState::Completed {
            tracing::debug!("call already completed, ignoring {}", status);
            return;
        }
        if self.inner.abort_status.set(status.clone()).is_err() {
            tracing::debug!("call already aborted, ignoring {}", status);
            return;
        }
        self.advance(CallState::Error);
        self.advance(CallState::HandlerDispatch);
        self.advance(CallState::Aborted);
        if let Err(e) = self.inner.handle.abort(status).await {
            tracing::error!("Transport error while aborting call: {}", e);
        }
    }

    /// Status of the first abort, if the call was aborted.
    pub fn abort_status(&self) -> Option<&Status> {
        self.inner.abort_status.get()
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.inner.abort_status.get().is_some()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("method", &self.descriptor().map(|d| d.full_name()))
            .field("state", &self.state())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}
