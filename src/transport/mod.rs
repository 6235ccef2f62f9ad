//! Transport module - what the dispatcher needs from the RPC transport.
//!
//! The transport owns connections, framing and deadlines. It presents each call
//! to the dispatcher as:
//! - a request payload, either one [`Message`] or a pull-based [`RequestStream`]
//! - a [`CallHandle`] offering metadata, peer, remaining time, the final
//!   status code/details and abort
//! - a [`MethodDescriptor`] naming the declared input/output types
//!
//! [`mem::LocalCall`] is an in-memory handle for tests and embedding.

pub mod mem;

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::TransportError;
use crate::message::Message;
use crate::method::{BoxFuture, MethodMode};
use crate::status::{Code, Status};

/// Inbound sequence of raw request messages, pulled one at a time.
pub type RequestStream = BoxStream<'static, Result<Message, TransportError>>;

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    /// The value as text, if it is an ASCII entry.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Ascii(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Ascii(s)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(b: Bytes) -> Self {
        MetadataValue::Binary(b)
    }
}

/// Invocation metadata keyed by lower-case header name.
pub type Metadata = HashMap<String, MetadataValue>;

/// Transport-side handle of one call.
pub trait CallHandle: Send + Sync + 'static {
    /// Metadata sent by the client with the call.
    fn invocation_metadata(&self) -> Vec<(String, MetadataValue)>;

    /// Identity of the calling peer (address or name).
    fn peer(&self) -> String;

    /// Time left before the call's deadline, `None` without a deadline.
    fn time_remaining(&self) -> Option<Duration>;

    /// Status code reported when the call ends, without ending it now.
    fn set_code(&self, code: Code);

    /// Status details reported when the call ends.
    fn set_details(&self, details: &str);

    /// Terminate the call with the given status.
    fn abort(&self, status: Status) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// Identity of one declared method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Fully qualified service name, e.g. `greeter.Greeter`.
    pub service: String,
    /// Method name as declared, e.g. `SayHello`.
    pub name: String,
    /// Declared request message type.
    pub input_type: String,
    /// Declared response message type.
    pub output_type: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodDescriptor {
    /// Describe a method of the given mode.
    pub fn new(
        service: impl Into<String>,
        name: impl Into<String>,
        mode: MethodMode,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            input_type: input_type.into(),
            output_type: output_type.into(),
            client_streaming: mode.is_request_streaming(),
            server_streaming: mode.is_response_streaming(),
        }
    }

    /// Path form used on the wire: `/greeter.Greeter/SayHello`.
    pub fn full_name(&self) -> String {
        format!("/{}/{}", self.service, self.name)
    }

    /// Calling convention declared by the streaming flags.
    pub fn mode(&self) -> MethodMode {
        MethodMode::from_flags(self.client_streaming, self.server_streaming)
    }
}

/// All declared methods of one service.
#[derive(Debug, Clone, Default)]
pub struct ServiceDescriptor {
    /// Fully qualified service name.
    pub name: String,
    methods: HashMap<String, MethodDescriptor>,
}

impl ServiceDescriptor {
    /// Create an empty service descriptor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Declare a method. The descriptor's service name is overwritten with ours.
    pub fn method(mut self, mut method: MethodDescriptor) -> Self {
        method.service = self.name.clone();
        self.methods.insert(method.name.clone(), method);
        self
    }

    /// Look up a method by its declared name.
    pub fn get(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
