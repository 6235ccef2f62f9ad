//! Error types for rpc-dispatch.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::status::Status;

/// Boxed error returned by endpoints and dependency producers.
///
/// Any error type converts into it with `?`. The dispatcher turns it back into
/// a [`DispatchError`] with [`DispatchError::from_boxed`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for everything that can flow through a call.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Inbound or outbound payload did not match its declared schema.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// An endpoint asked for a specific status.
    #[error("{0}")]
    Status(#[from] Status),

    /// The call has been terminated through its abort primitive.
    #[error("call aborted with {0}")]
    Aborted(Status),

    /// Error surfaced by the transport layer (peer disconnect, failed abort).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The call or the controller was configured incorrectly.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Any other error raised by user code.
    #[error("{0}")]
    Endpoint(BoxError),
}

impl DispatchError {
    /// Normalize a boxed error into the matching variant.
    ///
    /// Errors that are already one of this crate's kinds keep their variant;
    /// everything else becomes [`DispatchError::Endpoint`].
    pub fn from_boxed(err: BoxError) -> Self {
        let err = match err.downcast::<DispatchError>() {
            Ok(e) => return *e,
            Err(err) => err,
        };
        let err = match err.downcast::<Status>() {
            Ok(s) => return DispatchError::Status(*s),
            Err(err) => err,
        };
        let err = match err.downcast::<ValidationError>() {
            Ok(v) => return DispatchError::Validation(*v),
            Err(err) => err,
        };
        match err.downcast::<TransportError>() {
            Ok(t) => DispatchError::Transport(*t),
            Err(err) => DispatchError::Endpoint(err),
        }
    }

    /// The concrete error value this error carries.
    ///
    /// Exception handlers are looked up by the exact type of this value.
    pub fn kind(&self) -> &(dyn std::error::Error + 'static) {
        match self {
            DispatchError::Validation(e) => e,
            DispatchError::Status(s) | DispatchError::Aborted(s) => s,
            DispatchError::Transport(e) => e,
            DispatchError::Config(e) => e,
            DispatchError::Endpoint(e) => e.as_ref(),
        }
    }

    /// Whether the call was already terminated through abort.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        matches!(self, DispatchError::Aborted(_))
    }
}

/// A payload failed schema validation.
///
/// Carries the location of the offending field, the offending input and a message.
#[derive(Debug, Clone, PartialEq, Error)]
pub struct ValidationError {
    location: Vec<String>,
    input: Option<Value>,
    message: String,
}

impl ValidationError {
    /// Create a validation error with a message and no location.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            location: Vec::new(),
            input: None,
            message: message.into(),
        }
    }

    /// Set the field path, e.g. `["user", "email"]`.
    pub fn at<I, S>(mut self, location: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.location = location.into_iter().map(Into::into).collect();
        self
    }

    /// Attach the offending input value.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn location(&self) -> &[String] {
        &self.location
    }

    pub fn input(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Dotted field path, `<root>` when the whole payload is at fault.
    pub fn path(&self) -> String {
        if self.location.is_empty() {
            "<root>".to_string()
        } else {
            self.location.join(".")
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (location: {}", self.message, self.path())?;
        if let Some(input) = &self.input {
            write!(f, ", input: {}", input)?;
        }
        f.write_str(")")
    }
}

/// Error surfaced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer went away mid-call.
    #[error("peer disconnected")]
    Disconnected,

    /// The call was cancelled by the peer or its deadline passed.
    #[error("call cancelled")]
    Cancelled,

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// Configuration and binding errors.
///
/// Raised while registering methods or building a service, and at dispatch time
/// when a call is presented without a method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("method `{0}` is already registered")]
    DuplicateMethod(String),

    #[error("method `{0}` is not declared in service `{1}`")]
    UnknownMethod(String, String),

    #[error("method `{method}` is {registered} but its descriptor declares {declared}")]
    ModeMismatch {
        method: String,
        registered: String,
        declared: String,
    },

    #[error("method `{method}` declares {side} schema `{schema}` but the descriptor names `{declared}`")]
    SchemaMismatch {
        method: String,
        side: &'static str,
        schema: String,
        declared: String,
    },

    #[error("no method descriptor bound for `{0}`")]
    MissingDescriptor(String),

    #[error("dependency `{0}` was not declared for this call")]
    UndeclaredDependency(String),

    #[error("method `{method}` is {mode} and was called with the wrong request or response shape")]
    ShapeMismatch { method: String, mode: String },
}

/// Result type alias using DispatchError.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[derive(Debug, Error)]
    #[error("quota exceeded")]
    struct QuotaExceeded;

    #[test]
    fn test_from_boxed_keeps_status_variant() {
        let boxed: BoxError = Box::new(Status::not_found("missing"));
        match DispatchError::from_boxed(boxed) {
            DispatchError::Status(s) => assert_eq!(s.code(), Code::NotFound),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_from_boxed_unwraps_dispatch_error() {
        let boxed: BoxError = Box::new(DispatchError::Validation(ValidationError::new("bad")));
        assert!(matches!(
            DispatchError::from_boxed(boxed),
            DispatchError::Validation(_)
        ));
    }

    #[test]
    fn test_from_boxed_user_error_is_endpoint() {
        let boxed: BoxError = Box::new(QuotaExceeded);
        let err = DispatchError::from_boxed(boxed);
        assert!(matches!(err, DispatchError::Endpoint(_)));
        assert!(err.kind().is::<QuotaExceeded>());
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("field required")
            .at(["name"])
            .with_input(serde_json::json!({}));
        assert_eq!(err.path(), "name");
        assert_eq!(err.to_string(), "field required (location: name, input: {})");
    }

    #[test]
    fn test_validation_error_root_path() {
        let err = ValidationError::new("expected a mapping");
        assert_eq!(err.path(), "<root>");
        assert_eq!(err.to_string(), "expected a mapping (location: <root>)");
    }
}
