use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque unique token identifying one in-flight query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ephemeral state for one submitted prompt.
///
/// Owned by the orchestrator invocation that created it and dropped once
/// every branch has settled and the final answer has been emitted.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub query_id: QueryId,
    pub prompt: String,
    pub system_context: Option<String>,
    pub nickname: String,
    pub started_at: DateTime<Utc>,
}

impl StreamingSession {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            query_id: QueryId::new(),
            prompt: prompt.into(),
            system_context: None,
            nickname: String::new(),
            started_at: Utc::now(),
        }
    }

    pub fn with_system_context(mut self, context: impl Into<String>) -> Self {
        self.system_context = Some(context.into());
        self
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = nickname.into();
        self
    }

    /// A new session for a follow-up prompt within the same query.
    ///
    /// Keeps the query id, nickname and system context so events stay
    /// correlated with the original query.
    pub fn derive(&self, prompt: impl Into<String>) -> Self {
        Self {
            query_id: self.query_id,
            prompt: prompt.into(),
            system_context: self.system_context.clone(),
            nickname: self.nickname.clone(),
            started_at: Utc::now(),
        }
    }
}
