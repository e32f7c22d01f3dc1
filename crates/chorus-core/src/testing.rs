//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, TIMED_OUT};
use crate::event::{EmitSink, EventKind, EventTags, StreamEvent};
use crate::history::{HistoryEntry, HistoryStore};
use crate::provider::{Provider, ProviderOutcome, StreamOptions};
use crate::session::StreamingSession;

/// A mock provider that returns pre-configured outcomes.
///
/// Successful outcomes are emitted as one chunk followed by a stream end;
/// error outcomes as a stream error. A configured delay honors the run's
/// timeout and cancellation token unless it was set with
/// [`with_stubborn_delay`](Self::with_stubborn_delay).
pub struct MockProvider {
    id: String,
    model: String,
    outcomes: Mutex<VecDeque<ProviderOutcome>>,
    delay: Option<Duration>,
    ignores_deadline: bool,
    panics: bool,
    /// Captured sessions (for assertion).
    pub captured_sessions: Mutex<Vec<StreamingSession>>,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: "mock-model".to_string(),
            outcomes: Mutex::new(VecDeque::new()),
            delay: None,
            ignores_deadline: false,
            panics: false,
            captured_sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(id: impl Into<String>, text: &str) -> Self {
        let provider = Self::new(id);
        provider.queue_outcome(ProviderOutcome::success(text));
        provider
    }

    pub fn failing(id: impl Into<String>, message: &str) -> Self {
        let provider = Self::new(id);
        provider.queue_outcome(ProviderOutcome::error(message));
        provider
    }

    /// A provider whose branch panics instead of producing an outcome.
    pub fn panicking(id: impl Into<String>) -> Self {
        Self {
            panics: true,
            ..Self::new(id)
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep for `delay` on every call, ignoring the run's timeout and
    /// cancellation token.
    pub fn with_stubborn_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self.ignores_deadline = true;
        self
    }

    /// Queue an outcome for a later call (FIFO).
    pub fn queue_outcome(&self, outcome: ProviderOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.captured_sessions.lock().unwrap().len()
    }

    pub fn last_session(&self) -> Option<StreamingSession> {
        self.captured_sessions.lock().unwrap().last().cloned()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_session().map(|s| s.prompt)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_query(
        &self,
        session: &StreamingSession,
        sink: Arc<dyn EmitSink>,
        options: StreamOptions,
    ) -> ProviderOutcome {
        self.captured_sessions.lock().unwrap().push(session.clone());
        if self.panics {
            panic!("mock provider '{}' failed", self.id);
        }

        let tags = EventTags::new(
            self.model.clone(),
            self.id.clone(),
            session.nickname.clone(),
            session.query_id,
        );
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ProviderOutcome::error("No mock outcome queued"));

        match self.delay {
            Some(delay) if self.ignores_deadline => tokio::time::sleep(delay).await,
            Some(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = tokio::time::sleep(options.timeout) => {
                        sink.emit(StreamEvent::error(&tags, TIMED_OUT));
                        return ProviderOutcome::error(TIMED_OUT);
                    }
                    _ = options.cancel.cancelled() => {
                        sink.emit(StreamEvent::error(&tags, TIMED_OUT));
                        return ProviderOutcome::error(TIMED_OUT);
                    }
                }
            }
            None => {}
        }

        match &outcome {
            ProviderOutcome::Success { text } => {
                if !text.is_empty() {
                    sink.emit(StreamEvent::chunk(&tags, text.clone()));
                }
                sink.emit(StreamEvent::end(&tags));
            }
            ProviderOutcome::Error { message } => {
                sink.emit(StreamEvent::error(&tags, message.clone()));
            }
        }
        outcome
    }
}

/// A sink that keeps every event for inspection.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, provider: &str) -> Vec<StreamEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.tags.provider == provider)
            .collect()
    }

    /// Concatenated chunk text emitted for one provider.
    pub fn chunks_for(&self, provider: &str) -> String {
        self.events_for(provider)
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::StreamChunk { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::StreamError { error } => Some(error),
                _ => None,
            })
            .collect()
    }

    pub fn errors_for(&self, provider: &str) -> Vec<String> {
        self.events_for(provider)
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::StreamError { error } => Some(error),
                _ => None,
            })
            .collect()
    }

    pub fn terminal_events(&self) -> Vec<StreamEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.is_terminal())
            .collect()
    }
}

impl EmitSink for RecordingSink {
    fn emit(&self, event: StreamEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A history store that records appends, optionally failing every one.
#[derive(Default)]
pub struct RecordingHistory {
    entries: Mutex<Vec<HistoryEntry>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryStore for RecordingHistory {
    async fn append(&self, entry: HistoryEntry) -> Result<(), Error> {
        if self.fail {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Unknown("history unavailable".to_string()));
        }
        self.entries.lock().unwrap().push(entry);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<HistoryEntry>, Error> {
        let entries: Vec<_> = self
            .entries()
            .into_iter()
            .filter(|e| e.user_id == user_id)
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }
}
