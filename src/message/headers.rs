//! Case-insensitive header map and well-known header names.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Logical message type name.
pub const MESSAGE_TYPE: &str = "MessageType";
/// Body content type.
pub const CONTENT_TYPE: &str = "ContentType";
/// Correlation identifier.
pub const CORRELATION_ID: &str = "CorrelationId";
/// Conversation identifier.
pub const CONVERSATION_ID: &str = "ConversationId";
/// Message identifier, carried as a header by transports without a native id field.
pub const MESSAGE_ID: &str = "MessageId";
/// Time the message was handed to the transport (RFC 3339).
pub const SENT_TIME: &str = "SentTime";
/// Destination of a scheduled or staged send; absent for publishes.
pub const DESTINATION_ADDRESS: &str = "DestinationAddress";
/// Address replies should be sent to.
pub const RESPONSE_ADDRESS: &str = "ResponseAddress";
/// Identifier pairing a response with its request.
pub const REQUEST_ID: &str = "RequestId";
/// Why a message was dead-lettered.
pub const DEAD_LETTER_REASON: &str = "DeadLetterReason";
/// Human readable dead-letter detail, usually the last error.
pub const DEAD_LETTER_DESCRIPTION: &str = "DeadLetterDescription";
/// When the message was dead-lettered (RFC 3339).
pub const DEAD_LETTER_TIME: &str = "DeadLetterTime";

/// String headers with case-insensitive keys.
///
/// The original spelling of each key is kept for transmission; lookups
/// ignore case, and inserting a key that differs only in case replaces the
/// existing entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Headers {
    entries: BTreeMap<String, (String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, returning the previous value for the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        self.entries
            .insert(key.to_ascii_lowercase(), (key, value.into()))
            .map(|(_, previous)| previous)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries
            .remove(&key.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    /// Iterate headers with their original key spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        headers.extend(iter);
        headers
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Headers {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl From<BTreeMap<String, String>> for Headers {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<Headers> for BTreeMap<String, String> {
    fn from(headers: Headers) -> Self {
        headers.entries.into_values().collect()
    }
}
