//! Wire message and its MessagePack body.
//!
//! Bodies are always encoded with `rmp_serde::to_vec_named` so structs travel as
//! maps with field names. Positional (`to_vec`) encoding would make the schema
//! layer unable to report which field is missing.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::ValidationError;

/// A wire-native message.
///
/// Cheap to clone: the type name is shared and the body is reference counted.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    type_name: Arc<str>,
    body: Bytes,
}

impl Message {
    /// Wrap an already-encoded body.
    pub fn new(type_name: impl Into<Arc<str>>, body: Bytes) -> Self {
        Self {
            type_name: type_name.into(),
            body,
        }
    }

    /// Encode a value as the body of a message of the given type.
    pub fn encode<T: Serialize + ?Sized>(
        type_name: impl Into<Arc<str>>,
        value: &T,
    ) -> Result<Self, ValidationError> {
        let body = rmp_serde::to_vec_named(value)
            .map_err(|e| ValidationError::new(format!("cannot encode message: {e}")))?;
        Ok(Self::new(type_name, Bytes::from(body)))
    }

    /// Decode the body into `T`.
    ///
    /// Goes through an intermediate JSON value so a failure can report the input.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        let value = self.to_value()?;
        serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::new(e.to_string()).with_input(value))
    }

    /// Decode the body into a generic JSON value.
    pub fn to_value(&self) -> Result<Value, ValidationError> {
        rmp_serde::from_slice(&self.body)
            .map_err(|e| ValidationError::new(format!("malformed message body: {e}")))
    }

    /// Declared message type name.
    #[inline]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Raw encoded body.
    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Into the raw body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Short, single-line rendering used in call logs.
    ///
    /// At most `limit` characters of the JSON form are kept.
    pub fn summary(&self, limit: usize) -> String {
        let rendered = match self.to_value() {
            Ok(value) => value.to_string(),
            Err(_) => return format!("<{} bytes>", self.body.len()),
        };
        if rendered.chars().count() <= limit {
            rendered
        } else {
            let mut cut: String = rendered.chars().take(limit).collect();
            cut.push_str("...");
            cut
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type_name", &self.type_name)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Greeting {
        message: String,
    }

    #[test]
    fn test_body_is_encoded_as_map() {
        let msg = Message::encode("Greeting", &Greeting { message: "hi".into() }).unwrap();
        // fixmap with one entry
        assert_eq!(msg.body()[0], 0x81);
        assert_eq!(msg.type_name(), "Greeting");
    }

    #[test]
    fn test_decode_reports_input_on_missing_field() {
        let msg = Message::encode("Greeting", &serde_json::json!({"other": 1})).unwrap();
        let err = msg.decode::<Greeting>().unwrap_err();
        assert!(err.message().contains("missing field `message`"));
        assert_eq!(err.input(), Some(&serde_json::json!({"other": 1})));
    }

    #[test]
    fn test_malformed_body() {
        let msg = Message::new("Greeting", Bytes::from_static(&[0xc1]));
        assert!(msg.to_value().is_err());
        assert_eq!(msg.summary(10), "<1 bytes>");
    }

    #[test]
    fn test_summary_truncates() {
        let msg = Message::encode("Greeting", &Greeting { message: "a".repeat(50) }).unwrap();
        let summary = msg.summary(12);
        assert_eq!(summary, "{\"message\":\"...");
        assert!(msg.summary(1000).ends_with("\"}"));
    }

    #[test]
    fn test_clone_shares_body() {
        let msg = Message::encode("Greeting", &Greeting { message: "x".into() }).unwrap();
        let copy = msg.clone();
        assert_eq!(msg, copy);
        assert_eq!(msg.body().as_ptr(), copy.body().as_ptr());
    }
}
