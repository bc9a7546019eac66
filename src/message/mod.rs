//! Message envelope and serialization.
//!
//! [`TransportMessage`] is the immutable unit every transport moves. Typed
//! application messages implement [`Message`], whose `MESSAGE_TYPE` constant
//! replaces runtime type inspection when routing to handlers.

pub mod headers;
mod serializer;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

pub use headers::Headers;
pub use serializer::{
    decode_message, encode_message, JsonSerializer, MessageSerializer, SerializerError,
    JSON_CONTENT_TYPE,
};

/// A typed application message.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type identifier used for routing, topics and handler lookup.
    const MESSAGE_TYPE: &'static str;
}

/// Immutable wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    body: Bytes,
    content_type: Option<String>,
    headers: Headers,
    message_id: Option<Uuid>,
    correlation_id: Option<Uuid>,
    conversation_id: Option<Uuid>,
    message_type: Option<String>,
    sent_time: Option<DateTime<Utc>>,
}

impl TransportMessage {
    pub fn builder(body: impl Into<Bytes>) -> TransportMessageBuilder {
        TransportMessageBuilder {
            message: TransportMessage {
                body: body.into(),
                content_type: None,
                headers: Headers::new(),
                message_id: None,
                correlation_id: None,
                conversation_id: None,
                message_type: None,
                sent_time: None,
            },
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn message_id(&self) -> Option<Uuid> {
        self.message_id
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.conversation_id
    }

    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn sent_time(&self) -> Option<DateTime<Utc>> {
        self.sent_time
    }

    /// Copy of this message with extra headers merged over the existing ones.
    pub fn with_headers<K, V>(&self, extra: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut copy = self.clone();
        copy.headers.extend(extra);
        copy
    }

    /// Flatten the envelope fields into a header map.
    ///
    /// Used by transports whose wire format only carries string attributes.
    /// Explicit headers win over envelope fields of the same name.
    pub fn wire_headers(&self) -> Headers {
        let mut wire = Headers::new();
        if let Some(content_type) = &self.content_type {
            wire.insert(headers::CONTENT_TYPE, content_type.as_str());
        }
        if let Some(message_type) = &self.message_type {
            wire.insert(headers::MESSAGE_TYPE, message_type.as_str());
        }
        if let Some(id) = self.message_id {
            wire.insert(headers::MESSAGE_ID, id.to_string());
        }
        if let Some(id) = self.correlation_id {
            wire.insert(headers::CORRELATION_ID, id.to_string());
        }
        if let Some(id) = self.conversation_id {
            wire.insert(headers::CONVERSATION_ID, id.to_string());
        }
        if let Some(sent) = self.sent_time {
            wire.insert(headers::SENT_TIME, sent.to_rfc3339());
        }
        wire.extend(self.headers.iter());
        wire
    }

    /// Rebuild a message from a body and flattened wire headers.
    ///
    /// Envelope headers are lifted back into fields; absent or malformed
    /// values are tolerated and left unset.
    pub fn from_wire(body: impl Into<Bytes>, mut wire: Headers) -> Self {
        let content_type = wire.remove(headers::CONTENT_TYPE);
        let message_type = wire.remove(headers::MESSAGE_TYPE);
        let message_id = take_uuid(&mut wire, headers::MESSAGE_ID);
        let sent_time = wire
            .remove(headers::SENT_TIME)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|time| time.with_timezone(&Utc));
        let correlation_id = take_uuid(&mut wire, headers::CORRELATION_ID);
        let conversation_id = take_uuid(&mut wire, headers::CONVERSATION_ID);

        TransportMessage {
            body: body.into(),
            content_type,
            headers: wire,
            message_id,
            correlation_id,
            conversation_id,
            message_type,
            sent_time,
        }
    }
}

fn parse_uuid(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok()
}

fn take_uuid(wire: &mut Headers, key: &str) -> Option<Uuid> {
    wire.remove(key).as_deref().and_then(parse_uuid)
}

/// Builder for [`TransportMessage`].
#[derive(Debug, Clone)]
pub struct TransportMessageBuilder {
    message: TransportMessage,
}

impl TransportMessageBuilder {
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.message.content_type = Some(content_type.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.headers.insert(key, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.message.headers.extend(headers.iter());
        self
    }

    pub fn message_id(mut self, id: Uuid) -> Self {
        self.message.message_id = Some(id);
        self
    }

    pub fn correlation_id(mut self, id: Option<Uuid>) -> Self {
        self.message.correlation_id = id;
        self
    }

    pub fn conversation_id(mut self, id: Option<Uuid>) -> Self {
        self.message.conversation_id = id;
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message.message_type = Some(message_type.into());
        self
    }

    pub fn sent_time(mut self, time: DateTime<Utc>) -> Self {
        self.message.sent_time = Some(time);
        self
    }

    pub fn build(self) -> TransportMessage {
        self.message
    }
}
