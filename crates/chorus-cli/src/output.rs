//! Terminal rendering of live stream events.

use std::io::Write;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use chorus_core::{EventKind, QueryId, StreamEvent};

/// How live events are shown while a query runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Provider-prefixed chunk text on stderr.
    Text,
    /// One JSON event per line on stdout.
    Json,
    Quiet,
}

/// Turns events into prefixed text lines, tracking which provider printed last.
#[derive(Debug, Default)]
pub struct LiveRenderer {
    current: Option<String>,
}

impl LiveRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, event: &StreamEvent) -> Option<String> {
        let provider = &event.tags.provider;
        match &event.kind {
            EventKind::StreamChunk { text } => {
                if self.current.as_deref() == Some(provider.as_str()) {
                    Some(text.clone())
                } else {
                    let lead = if self.current.is_some() { "\n" } else { "" };
                    self.current = Some(provider.clone());
                    Some(format!("{}[{}] {}", lead, provider, text))
                }
            }
            EventKind::StreamEnd => Some(self.status_line(provider, "done")),
            EventKind::StreamError { error } => Some(self.status_line(provider, error)),
            EventKind::ChatReply { .. } | EventKind::ChatError { .. } => {
                self.current.take().map(|_| "\n".to_string())
            }
        }
    }

    fn status_line(&mut self, provider: &str, status: &str) -> String {
        let lead = if self.current.take().is_some() { "\n" } else { "" };
        format!("{}[{}] ({})\n", lead, provider, status)
    }
}

/// Print events for `query_id` until its terminal chat event arrives or the
/// bus closes.
pub fn spawn_printer(
    rx: broadcast::Receiver<StreamEvent>,
    query_id: Option<QueryId>,
    mode: OutputMode,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = BroadcastStream::new(rx);
        let mut renderer = LiveRenderer::new();

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Live output fell behind; events dropped");
                    continue;
                }
            };
            if query_id.is_some_and(|id| id != event.tags.query_id) {
                continue;
            }
            let terminal = event.kind.is_terminal();

            match mode {
                OutputMode::Quiet => {}
                OutputMode::Json => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                }
                OutputMode::Text => {
                    if let Some(text) = renderer.render(&event) {
                        let mut stderr = std::io::stderr().lock();
                        let _ = stderr.write_all(text.as_bytes());
                        let _ = stderr.flush();
                    }
                }
            }

            if terminal {
                break;
            }
        }
    })
}
