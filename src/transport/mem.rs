//! In-memory call handle.
//!
//! [`LocalCall`] stands in for a network transport: it serves fixed metadata,
//! a peer name and an optional deadline, and records every abort that reaches it
//! along with the status code and details set on it.
//!
//! # Example
//!
//! ```
//! use rpc_dispatch::transport::mem::LocalCall;
//! use rpc_dispatch::transport::CallHandle;
//!
//! let call = LocalCall::new("ipv4:127.0.0.1:50051").with_metadata("x-request-id", "abc");
//! assert_eq!(call.peer(), "ipv4:127.0.0.1:50051");
//! assert!(call.aborts().is_empty());
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;

use super::{CallHandle, MetadataValue};
use crate::error::TransportError;
use crate::method::BoxFuture;
use crate::status::{Code, Status};

/// In-memory [`CallHandle`].
///
/// `Clone` shares the recorded aborts, so a test can keep one clone and hand
/// the other to the dispatcher.
#[derive(Clone)]
pub struct LocalCall {
    peer: String,
    metadata: Vec<(String, MetadataValue)>,
    deadline: Option<Instant>,
    aborts: Arc<Mutex<Vec<Status>>>,
    reported: Arc<Mutex<Reported>>,
    fail_abort: bool,
}

#[derive(Default)]
struct Reported {
    code: Option<Code>,
    details: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LocalCall {
    /// Create a handle for the given peer, with no metadata and no deadline.
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            metadata: Vec::new(),
            deadline: None,
            aborts: Arc::new(Mutex::new(Vec::new())),
            reported: Arc::new(Mutex::new(Reported::default())),
            fail_abort: false,
        }
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.metadata.push((key.to_ascii_lowercase(), value.into()));
        self
    }

    /// Set a deadline relative to now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Make every abort fail with a transport error, as if the peer had gone.
    pub fn disconnected(mut self) -> Self {
        self.fail_abort = true;
        self
    }

    /// Every status this handle was aborted with, in order.
    pub fn aborts(&self) -> Vec<Status> {
        lock(&self.aborts).clone()
    }

    /// The first abort status, if any.
    pub fn aborted_with(&self) -> Option<Status> {
        self.aborts().into_iter().next()
    }

    /// Last status code set with [`CallHandle::set_code`].
    pub fn code(&self) -> Option<Code> {
        lock(&self.reported).code
    }

    /// Last details set with [`CallHandle::set_details`].
    pub fn details(&self) -> Option<String> {
        lock(&self.reported).details.clone()
    }
}

impl CallHandle for LocalCall {
    fn invocation_metadata(&self) -> Vec<(String, MetadataValue)> {
        self.metadata.clone()
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn set_code(&self, code: Code) {
        lock(&self.reported).code = Some(code);
    }

    fn set_details(&self, details: &str) {
        lock(&self.reported).details = Some(details.to_string());
    }

    fn abort(&self, status: Status) -> BoxFuture<'static, Result<(), TransportError>> {
        if self.fail_abort {
            return futures::future::ready(Err(TransportError::Disconnected)).boxed();
        }
        lock(&self.aborts).push(status);
        futures::future::ready(Ok(())).boxed()
    }
}
