//! Chat-layer glue around the orchestrator.
//!
//! Turns an authenticated prompt into exactly one terminal event and one
//! reply text, and records answered questions in history.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event::{EmitSink, EventKind, EventTags, StreamEvent};
use crate::history::{record_detached, HistoryEntry, HistoryStore};
use crate::orchestrator::Orchestrator;
use crate::provider::FinalAnswer;
use crate::session::{QueryId, StreamingSession};

/// Reply used when no provider produced an answer.
pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Sorry, none of the AI providers could answer right now. Please try again in a moment.";

/// A prompt submitted by an authenticated user.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user_id: String,
    pub prompt: String,
    pub system_context: Option<String>,
    pub nickname: String,
    /// Provider ids to query. Empty means every configured provider.
    pub providers: Vec<String>,
}

impl ChatRequest {
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            prompt: prompt.into(),
            system_context: None,
            nickname: String::new(),
            providers: Vec::new(),
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

    pub fn with_providers(mut self, providers: Vec<String>) -> Self {
        self.providers = providers;
        self
    }
}

/// What the client is shown for one query.
#[derive(Debug)]
pub struct ChatResponse {
    pub query_id: QueryId,
    pub text: String,
    /// `None` when the fallback message was used.
    pub answer: Option<FinalAnswer>,
    /// Background history write for this answer, if one was started.
    /// Await it before shutting the runtime down.
    pub history_write: Option<JoinHandle<()>>,
}

pub struct ChatService {
    orchestrator: Arc<Orchestrator>,
    history: Option<Arc<dyn HistoryStore>>,
    fallback_message: String,
}

impl ChatService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            history: None,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_fallback_message(mut self, message: impl Into<String>) -> Self {
        self.fallback_message = message.into();
        self
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub async fn handle_prompt(
        &self,
        request: ChatRequest,
        sink: Arc<dyn EmitSink>,
    ) -> ChatResponse {
        self.handle_prompt_with_cancel(request, sink, CancellationToken::new())
            .await
    }

    pub async fn handle_prompt_with_cancel(
        &self,
        request: ChatRequest,
        sink: Arc<dyn EmitSink>,
        cancel: CancellationToken,
    ) -> ChatResponse {
        let mut session = StreamingSession::new(&request.prompt).with_nickname(&request.nickname);
        if let Some(context) = &request.system_context {
            session = session.with_system_context(context);
        }

        let answer = if request.providers.is_empty() {
            self.orchestrator
                .generate_with_cancel(&session, Arc::clone(&sink), cancel)
                .await
        } else {
            self.orchestrator
                .generate_for(&session, &request.providers, Arc::clone(&sink), cancel)
                .await
        };

        let terminal = match &answer {
            Some(answer) => StreamEvent::new(
                EventTags::new(
                    &answer.model,
                    answer.produced_by.to_string(),
                    &session.nickname,
                    session.query_id,
                ),
                EventKind::ChatReply {
                    text: answer.text.clone(),
                    produced_by: answer.produced_by.to_string(),
                },
            ),
            None => StreamEvent::new(
                EventTags::new("", "", &session.nickname, session.query_id),
                EventKind::ChatError {
                    text: self.fallback_message.clone(),
                },
            ),
        };
        sink.emit(terminal);

        let elapsed = chrono::Utc::now() - session.started_at;
        info!(
            query_id = %session.query_id,
            answered = answer.is_some(),
            elapsed_ms = elapsed.num_milliseconds(),
            "Query complete"
        );

        let history_write = match (&answer, &self.history) {
            (Some(answer), Some(history)) => Some(record_detached(
                Arc::clone(history),
                HistoryEntry::new(&request.user_id, &request.prompt, &answer.text),
            )),
            _ => None,
        };

        ChatResponse {
            query_id: session.query_id,
            text: answer
                .as_ref()
                .map(|a| a.text.clone())
                .unwrap_or_else(|| self.fallback_message.clone()),
            answer,
            history_write,
        }
    }
}
