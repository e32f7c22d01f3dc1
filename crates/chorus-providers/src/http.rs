use std::sync::Arc;

use async_trait::async_trait;

use chorus_core::{
    EmitSink, Provider, ProviderConfig, ProviderOutcome, StreamOptions, StreamingSession,
};

use crate::query::StreamingQuery;
use crate::transport::{HttpTransport, Transport};

/// A configured upstream reached over a [`Transport`].
pub struct HttpProvider {
    config: Arc<ProviderConfig>,
    transport: Arc<dyn Transport>,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self::with_transport(config, Arc::new(HttpTransport::new()))
    }

    pub fn with_transport(config: ProviderConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn stream_query(
        &self,
        session: &StreamingSession,
        sink: Arc<dyn EmitSink>,
        options: StreamOptions,
    ) -> ProviderOutcome {
        StreamingQuery::new(self.config.clone(), self.transport.clone(), session, sink)
            .run_with_cancel(options.timeout, options.cancel)
            .await
    }
}

/// Build providers in configuration order, sharing one transport.
pub fn build_providers(
    configs: impl IntoIterator<Item = ProviderConfig>,
    transport: Arc<dyn Transport>,
) -> Vec<Arc<dyn Provider>> {
    configs
        .into_iter()
        .map(|config| {
            Arc::new(HttpProvider::with_transport(config, transport.clone())) as Arc<dyn Provider>
        })
        .collect()
}
