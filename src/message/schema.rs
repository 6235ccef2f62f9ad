//! Request validation and response serialization.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::Message;
use crate::error::ValidationError;

/// A declared message schema.
///
/// Implement it for the serde types an endpoint takes or returns. `validate`
/// runs after decoding (inbound) and before encoding (outbound).
pub trait Schema: Serialize + DeserializeOwned + Send + 'static {
    /// Message type name, matched against the service descriptor.
    const NAME: &'static str;

    /// Field-level checks that serde cannot express.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Conversion from a raw inbound message into what the endpoint receives.
pub trait FromMessage: Sized + Send + 'static {
    /// Name of the declared request schema, if any.
    const SCHEMA: Option<&'static str>;

    fn from_message(message: Message) -> Result<Self, ValidationError>;
}

/// Conversion from an endpoint's result into a wire message.
pub trait IntoMessage: Send + 'static {
    /// Name of the declared response schema, if any.
    const SCHEMA: Option<&'static str>;

    /// `output_type` is the response type named by the method descriptor.
    fn into_message(self, output_type: &str) -> Result<Message, ValidationError>;
}

impl FromMessage for Message {
    const SCHEMA: Option<&'static str> = None;

    #[inline]
    fn from_message(message: Message) -> Result<Self, ValidationError> {
        Ok(message)
    }
}

impl FromMessage for Value {
    const SCHEMA: Option<&'static str> = None;

    fn from_message(message: Message) -> Result<Self, ValidationError> {
        message.to_value()
    }
}

impl<T: Schema> FromMessage for T {
    const SCHEMA: Option<&'static str> = Some(T::NAME);

    fn from_message(message: Message) -> Result<Self, ValidationError> {
        let value = message.decode::<T>()?;
        value.validate()?;
        Ok(value)
    }
}

impl IntoMessage for Message {
    const SCHEMA: Option<&'static str> = None;

    #[inline]
    fn into_message(self, _output_type: &str) -> Result<Message, ValidationError> {
        Ok(self)
    }
}

impl IntoMessage for Map<String, Value> {
    const SCHEMA: Option<&'static str> = None;

    fn into_message(self, output_type: &str) -> Result<Message, ValidationError> {
        Message::encode(output_type, &self)
    }
}

impl IntoMessage for Value {
    const SCHEMA: Option<&'static str> = None;

    fn into_message(self, output_type: &str) -> Result<Message, ValidationError> {
        match self {
            Value::Object(map) => map.into_message(output_type),
            other => Err(ValidationError::new("response must be a mapping").with_input(other)),
        }
    }
}

impl<T: Schema> IntoMessage for T {
    const SCHEMA: Option<&'static str> = Some(T::NAME);

    fn into_message(self, output_type: &str) -> Result<Message, ValidationError> {
        self.validate()?;
        Message::encode(output_type, &self)
    }
}
