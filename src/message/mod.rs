//! Message module - wire payloads and schema conversion.
//!
//! Provides:
//! - [`Message`] - the wire-native payload: a MessagePack body tagged with its type name
//! - [`Schema`] - marks a serde type as a declared request/response schema
//! - [`FromMessage`] / [`IntoMessage`] - how endpoints receive and return payloads
//!
//! # Conversion rules
//!
//! Inbound, a method with a declared request schema converts each raw message
//! into the schema type before the endpoint sees it. Without a schema the endpoint
//! receives the [`Message`] itself, or a generic `serde_json::Value`.
//!
//! Outbound, a [`Message`] passes through untouched, a generic JSON mapping is
//! encoded directly, and a schema type is validated and then encoded.
//!
//! # Example
//!
//! ```
//! use rpc_dispatch::message::{FromMessage, IntoMessage, Message, Schema};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct HelloRequest {
//!     name: String,
//! }
//!
//! impl Schema for HelloRequest {
//!     const NAME: &'static str = "HelloRequest";
//! }
//!
//! let raw = Message::encode("greeter.HelloRequest", &HelloRequest { name: "World".into() }).unwrap();
//! let request = HelloRequest::from_message(raw).unwrap();
//! assert_eq!(request.name, "World");
//! ```

mod codec;
mod schema;

pub use codec::Message;
pub use schema::{FromMessage, IntoMessage, Schema};
