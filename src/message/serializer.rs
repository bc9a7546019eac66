//! Pluggable body serialization.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors raised while encoding or decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("Failed to encode message body: {0}")]
    Encode(String),

    #[error("Failed to decode message body: {0}")]
    Decode(String),

    #[error("Unsupported content type '{actual}', expected '{expected}'")]
    UnsupportedContentType { expected: String, actual: String },
}

/// Converts message values to and from wire bytes.
///
/// Serializers operate on `serde_json::Value` so they stay object-safe; the
/// typed helpers [`encode_message`] and [`decode_message`] bridge to concrete
/// message types.
pub trait MessageSerializer: Send + Sync {
    /// Content type stamped on every message this serializer encodes.
    fn content_type(&self) -> &str;

    fn encode(&self, value: &serde_json::Value) -> Result<Bytes, SerializerError>;

    fn decode(&self, body: &[u8]) -> Result<serde_json::Value, SerializerError>;
}

/// JSON bodies (`application/json`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

pub const JSON_CONTENT_TYPE: &str = "application/json";

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Bytes, SerializerError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| SerializerError::Encode(e.to_string()))
    }

    fn decode(&self, body: &[u8]) -> Result<serde_json::Value, SerializerError> {
        serde_json::from_slice(body).map_err(|e| SerializerError::Decode(e.to_string()))
    }
}

/// Encode a typed message with the given serializer.
pub fn encode_message<M: Serialize>(
    serializer: &dyn MessageSerializer,
    message: &M,
) -> Result<Bytes, SerializerError> {
    let value = serde_json::to_value(message).map_err(|e| SerializerError::Encode(e.to_string()))?;
    serializer.encode(&value)
}

/// Decode a typed message, rejecting bodies whose declared content type
/// differs from the serializer's.
pub fn decode_message<M: DeserializeOwned>(
    serializer: &dyn MessageSerializer,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<M, SerializerError> {
    if let Some(actual) = content_type {
        if !content_type_matches(serializer.content_type(), actual) {
            return Err(SerializerError::UnsupportedContentType {
                expected: serializer.content_type().to_string(),
                actual: actual.to_string(),
            });
        }
    }
    let value = serializer.decode(body)?;
    serde_json::from_value(value).map_err(|e| SerializerError::Decode(e.to_string()))
}

/// Compare media types ignoring case and parameters such as `charset`.
fn content_type_matches(expected: &str, actual: &str) -> bool {
    let media = actual.split(';').next().unwrap_or(actual).trim();
    media.eq_ignore_ascii_case(expected)
}
