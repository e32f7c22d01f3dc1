use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chorus_core::{
    EmitSink, Error, EventTags, ProviderConfig, ProviderOutcome, StreamEvent, StreamingSession,
};

use crate::adapter::ProviderAdapter;
use crate::transport::Transport;
use crate::utf8::Utf8Decoder;

/// One streaming request against one provider.
///
/// Every run ends with exactly one `streamEnd` or `streamError` event for
/// the provider, and every failure comes back as an error outcome.
pub struct StreamingQuery {
    adapter: ProviderAdapter,
    transport: Arc<dyn Transport>,
    tags: EventTags,
    sink: Arc<dyn EmitSink>,
    prompt: String,
    system_context: Option<String>,
}

impl StreamingQuery {
    pub fn new(
        config: Arc<ProviderConfig>,
        transport: Arc<dyn Transport>,
        session: &StreamingSession,
        sink: Arc<dyn EmitSink>,
    ) -> Self {
        let tags = EventTags::new(
            config.model.clone(),
            config.id.clone(),
            session.nickname.clone(),
            session.query_id,
        );
        Self {
            adapter: ProviderAdapter::new(config, tags.clone(), sink.clone()),
            transport,
            tags,
            sink,
            prompt: session.prompt.clone(),
            system_context: session.system_context.clone(),
        }
    }

    pub async fn run(self, timeout: Duration) -> ProviderOutcome {
        self.run_with_cancel(timeout, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(
        mut self,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ProviderOutcome {
        let result = tokio::select! {
            result = self.drive() => result,
            _ = tokio::time::sleep(timeout) => {
                Err(Error::timeout(format!("no completion within {}ms", timeout.as_millis())))
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        match result {
            Ok(text) => {
                info!(
                    provider = %self.tags.provider,
                    query_id = %self.tags.query_id,
                    len = text.len(),
                    "Provider stream complete"
                );
                self.sink.emit(StreamEvent::end(&self.tags));
                ProviderOutcome::success(text)
            }
            Err(e) => {
                warn!(
                    provider = %self.tags.provider,
                    query_id = %self.tags.query_id,
                    error = %e,
                    "Provider stream failed"
                );
                let message = e.outcome_message();
                self.sink.emit(StreamEvent::error(&self.tags, message));
                ProviderOutcome::error(message)
            }
        }
    }

    async fn drive(&mut self) -> Result<String, Error> {
        let request = self
            .adapter
            .build_request(&self.prompt, self.system_context.as_deref());
        debug!(
            provider = %self.tags.provider,
            protocol = %self.adapter.protocol(),
            "Sending streaming request"
        );

        let response = self.transport.send(&request).await?;
        if !response.is_success() {
            return Err(Error::api(response.status, "non-success status"));
        }
        let mut body = response.body.ok_or(Error::EmptyBody)?;

        let mut decoder = Utf8Decoder::new();
        let mut buffer = String::new();
        let mut text = String::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            buffer.push_str(&decoder.decode(&chunk));
            text.push_str(&self.adapter.parser_mut().parse_increment(&buffer)?);
            if self.adapter.parser_mut().is_finished() {
                debug!(provider = %self.tags.provider, "Terminal sentinel received");
                return Ok(text);
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            buffer.push_str(&tail);
            text.push_str(&self.adapter.parser_mut().parse_increment(&buffer)?);
        }
        Ok(text)
    }
}
