//! Per-message instrumentation scopes.
//!
//! The bus wraps every send, publish and consume in the span returned by
//! its [`MessageScopeProvider`]. Exporters hook in through the
//! `tracing` subscriber; nothing here emits metrics.

use tracing::Span;
use url::Url;

use crate::message::TransportMessage;

/// Which bus operation a scope covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Send,
    Publish,
    Consume,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::Send => "send",
            ScopeKind::Publish => "publish",
            ScopeKind::Consume => "consume",
        }
    }
}

/// Opens a scope around one message operation.
pub trait MessageScopeProvider: Send + Sync {
    /// `address` is the destination for sends and the input address for
    /// consumes.
    fn scope(&self, kind: ScopeKind, message: &TransportMessage, address: Option<&Url>) -> Span;
}

/// Default provider: an `info` span carrying the message identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingScopeProvider;

impl MessageScopeProvider for TracingScopeProvider {
    fn scope(&self, kind: ScopeKind, message: &TransportMessage, address: Option<&Url>) -> Span {
        tracing::info_span!(
            "courier.message",
            operation = kind.as_str(),
            message_id = ?message.message_id(),
            message_type = message.message_type().unwrap_or("unknown"),
            conversation_id = ?message.conversation_id(),
            address = address.map(Url::as_str).unwrap_or_default(),
        )
    }
}

/// Provider that opens no scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScopeProvider;

impl MessageScopeProvider for NoopScopeProvider {
    fn scope(&self, _kind: ScopeKind, _message: &TransportMessage, _address: Option<&Url>) -> Span {
        Span::none()
    }
}
