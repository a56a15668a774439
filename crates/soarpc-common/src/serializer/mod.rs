//! Body serialization: a binary msgpack encoding and a textual JSON one.
//!
//! Serializers are resolved by MIME content type, which is what travels in
//! the wire frame's `content-type` header. Both encodings round-trip the
//! full [`Value`] model including the extension types.
//!
//! [`Value`]: crate::types::Value

mod json;
mod msgpack;

pub use json::JsonSerializer;
pub use msgpack::MsgpackSerializer;

use crate::errors::SerializationError;
use crate::types::Value;
use std::sync::Arc;

/// MIME type of the binary msgpack encoding.
pub const MSGPACK_MIME_TYPE: &str = "application/msgpack";

/// MIME type of the textual JSON encoding.
pub const JSON_MIME_TYPE: &str = "application/json";

/// Encodes and decodes a message body (a top-level map of values).
pub trait Serializer: Send + Sync {
    /// The content type carried in the wire frame for this encoding.
    fn mime_type(&self) -> &'static str;

    /// Encodes a body. The input must be a [`Value::Map`].
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializationError>;

    /// Decodes a body back into a [`Value::Map`].
    fn decode(&self, bytes: &[u8]) -> Result<Value, SerializationError>;
}

/// Resolves a serializer from a content type, if it names a known encoding.
pub fn resolve(mime_type: &str) -> Option<Arc<dyn Serializer>> {
    match mime_type {
        MSGPACK_MIME_TYPE => Some(Arc::new(MsgpackSerializer)),
        JSON_MIME_TYPE => Some(Arc::new(JsonSerializer)),
        _ => None,
    }
}

/// The preferred encoding: msgpack.
pub fn default_serializer() -> Arc<dyn Serializer> {
    Arc::new(MsgpackSerializer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_content_types() {
        assert_eq!(resolve(MSGPACK_MIME_TYPE).unwrap().mime_type(), MSGPACK_MIME_TYPE);
        assert_eq!(resolve(JSON_MIME_TYPE).unwrap().mime_type(), JSON_MIME_TYPE);
        assert!(resolve("application/x-unknown").is_none());
    }
}
