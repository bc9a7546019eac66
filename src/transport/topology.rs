//! Address-to-entity naming conventions shared by the hosts.
//!
//! - `scheme://host/orders` addresses the queue `orders`
//! - `scheme://host/orders/subscriptions/audit` addresses the subscription
//!   `audit` of the topic `orders`
//! - published messages go to a topic named after the message type

use url::Url;

use super::{Result, TransportError};

const SUBSCRIPTIONS_SEGMENT: &str = "subscriptions";

/// Native entity an address maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Queue(String),
    Subscription { topic: String, name: String },
}

fn segments(address: &Url) -> Vec<&str> {
    address
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Resolve the entity for an address.
pub fn entity(address: &Url) -> Result<Entity> {
    match segments(address).as_slice() {
        [] => Err(TransportError::Configuration(format!(
            "address '{address}' has no queue path segment"
        ))),
        [topic, marker, name, ..] if marker.eq_ignore_ascii_case(SUBSCRIPTIONS_SEGMENT) => {
            Ok(Entity::Subscription {
                topic: (*topic).to_string(),
                name: (*name).to_string(),
            })
        }
        [queue, ..] => Ok(Entity::Queue((*queue).to_string())),
    }
}

/// Queue name for an address: its first path segment.
pub fn queue_name(address: &Url) -> Result<String> {
    segments(address)
        .first()
        .map(|s| s.to_string())
        .ok_or_else(|| {
            TransportError::Configuration(format!("address '{address}' has no queue path segment"))
        })
}

/// Topic name for a published message type, with an optional prefix.
///
/// Characters outside `[A-Za-z0-9_-]` become `-` so the name is valid on
/// every supported broker.
pub fn topic_name(message_type: &str, prefix: Option<&str>) -> String {
    let sanitized: String = message_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}-{sanitized}"),
        _ => sanitized,
    }
}
