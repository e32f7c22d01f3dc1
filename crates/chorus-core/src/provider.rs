use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::event::EmitSink;
use crate::session::{QueryId, StreamingSession};

/// Default per-query timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Streaming wire protocol spoken by an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// `data: <json>` frames closed by the upstream hanging up; text at
    /// `candidates[0].content.parts[0].text`.
    Gemini,
    /// `data: <json>` frames ended by a `data: [DONE]` sentinel; text at
    /// `choices[0].delta.content`.
    #[serde(alias = "openai-compatible")]
    OpenAi,
}

impl WireProtocol {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            WireProtocol::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            WireProtocol::OpenAi => "https://api.openai.com/v1",
        }
    }
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireProtocol::Gemini => write!(f, "gemini"),
            WireProtocol::OpenAi => write!(f, "openai"),
        }
    }
}

/// One configured upstream. Immutable after startup.
#[derive(Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub model: String,
    pub endpoint_url: String,
    pub api_key: String,
    pub protocol: WireProtocol,
}

impl ProviderConfig {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        protocol: WireProtocol,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            endpoint_url: protocol.default_base_url().to_string(),
            api_key: api_key.into(),
            protocol,
        }
    }

    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = url.into();
        self
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("endpoint_url", &self.endpoint_url)
            .field("api_key", &"<redacted>")
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Outbound request triple built by a provider adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

impl ProviderRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Terminal state of one provider branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    Success { text: String },
    Error { message: String },
}

impl ProviderOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self::Success { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProviderOutcome::Success { .. })
    }

    /// The generated text, if this branch succeeded with non-empty output.
    pub fn text(&self) -> Option<&str> {
        match self {
            ProviderOutcome::Success { text } if !text.is_empty() => Some(text),
            _ => None,
        }
    }
}

/// Who produced a final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerSource {
    Provider(String),
    Synthesis,
}

impl std::fmt::Display for AnswerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerSource::Provider(id) => write!(f, "{}", id),
            AnswerSource::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// The single answer produced for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalAnswer {
    pub text: String,
    pub produced_by: AnswerSource,
    /// Model of the provider that wrote `text` (the master for a synthesis).
    pub model: String,
    pub query_id: QueryId,
}

/// Per-run knobs handed to a provider branch.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }
}

impl StreamOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A streaming upstream that can answer one prompt.
///
/// Implementations convert every failure into an error outcome; nothing
/// escapes `stream_query` as a panic or an `Err`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn model(&self) -> &str;

    async fn stream_query(
        &self,
        session: &StreamingSession,
        sink: Arc<dyn EmitSink>,
        options: StreamOptions,
    ) -> ProviderOutcome;
}
