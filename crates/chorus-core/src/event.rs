//! Real-time lifecycle events pushed to the connected client.
//!
//! Every event carries the identifying tags of the query and the provider
//! that produced it, so a single sink can be shared by all concurrent
//! branches of a fan-out.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::session::QueryId;

/// Identifying tags attached to every emitted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTags {
    pub model: String,
    pub provider: String,
    pub nickname: String,
    pub query_id: QueryId,
}

impl EventTags {
    pub fn new(
        model: impl Into<String>,
        provider: impl Into<String>,
        nickname: impl Into<String>,
        query_id: QueryId,
    ) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            nickname: nickname.into(),
            query_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    /// A chunk of text parsed from one provider's stream.
    StreamChunk { text: String },
    /// One provider's stream completed normally.
    StreamEnd,
    /// One provider's stream failed.
    StreamError { error: String },
    /// Terminal reply for the whole query.
    #[serde(rename_all = "camelCase")]
    ChatReply { text: String, produced_by: String },
    /// Terminal fallback for a query where no provider succeeded.
    ChatError { text: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::StreamChunk { .. } => "streamChunk",
            EventKind::StreamEnd => "streamEnd",
            EventKind::StreamError { .. } => "streamError",
            EventKind::ChatReply { .. } => "chatReply",
            EventKind::ChatError { .. } => "chatError",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::ChatReply { .. } | EventKind::ChatError { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEvent {
    #[serde(flatten)]
    pub tags: EventTags,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl StreamEvent {
    pub fn new(tags: EventTags, kind: EventKind) -> Self {
        Self { tags, kind }
    }

    pub fn chunk(tags: &EventTags, text: impl Into<String>) -> Self {
        Self::new(tags.clone(), EventKind::StreamChunk { text: text.into() })
    }

    pub fn end(tags: &EventTags) -> Self {
        Self::new(tags.clone(), EventKind::StreamEnd)
    }

    pub fn error(tags: &EventTags, error: impl Into<String>) -> Self {
        Self::new(
            tags.clone(),
            EventKind::StreamError {
                error: error.into(),
            },
        )
    }
}

/// Destination for lifecycle events.
///
/// Implementations must be safe to call from many in-flight queries at once
/// and must never block or fail the caller.
pub trait EmitSink: Send + Sync {
    fn emit(&self, event: StreamEvent);
}

impl<T: EmitSink + ?Sized> EmitSink for Arc<T> {
    fn emit(&self, event: StreamEvent) {
        (**self).emit(event)
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EmitSink for NullSink {
    fn emit(&self, _event: StreamEvent) {}
}

/// Broadcast-backed sink.
///
/// Clone this to share across queries. Each clone shares the same
/// underlying broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events from this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }
}

impl EmitSink for EventBus {
    fn emit(&self, event: StreamEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}
