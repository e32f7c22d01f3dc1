use std::sync::Arc;

use chorus_core::{EmitSink, EventTags, ProviderConfig, ProviderRequest, WireProtocol};

use crate::parser::ChunkParser;
use crate::{gemini, openai};

/// Request builder and stream parser for one provider run.
///
/// Dispatches on the provider's wire protocol; owns the single
/// [`ChunkParser`] used for the run's response stream.
pub struct ProviderAdapter {
    config: Arc<ProviderConfig>,
    parser: ChunkParser,
}

impl ProviderAdapter {
    pub fn new(config: Arc<ProviderConfig>, tags: EventTags, sink: Arc<dyn EmitSink>) -> Self {
        let parser = ChunkParser::new(config.protocol, tags, sink);
        Self { config, parser }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn protocol(&self) -> WireProtocol {
        self.config.protocol
    }

    /// Outbound request for `prompt`. Pure: no I/O, no events.
    pub fn build_request(&self, prompt: &str, system_context: Option<&str>) -> ProviderRequest {
        match self.config.protocol {
            WireProtocol::Gemini => gemini::build_request(&self.config, prompt, system_context),
            WireProtocol::OpenAi => openai::build_request(&self.config, prompt, system_context),
        }
    }

    pub fn parser_mut(&mut self) -> &mut ChunkParser {
        &mut self.parser
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{NullSink, QueryId};

    fn adapter(config: ProviderConfig) -> ProviderAdapter {
        let tags = EventTags::new(&config.model, &config.id, "", QueryId::new());
        ProviderAdapter::new(Arc::new(config), tags, Arc::new(NullSink))
    }

    #[test]
    fn test_dispatches_on_protocol() {
        let gemini = adapter(ProviderConfig::new(
            "g",
            "gemini-2.5-flash",
            "k1",
            WireProtocol::Gemini,
        ));
        let openai = adapter(ProviderConfig::new("o", "gpt-4o", "k2", WireProtocol::OpenAi));

        assert!(gemini
            .build_request("hi", None)
            .url
            .ends_with(":streamGenerateContent?alt=sse&key=k1"));
        assert_eq!(
            openai.build_request("hi", None).header("Authorization"),
            Some("Bearer k2")
        );
    }

    #[test]
    fn test_build_request_is_deterministic() {
        let adapter = adapter(ProviderConfig::new("o", "gpt-4o", "k", WireProtocol::OpenAi));
        assert_eq!(
            adapter.build_request("same", Some("ctx")),
            adapter.build_request("same", Some("ctx"))
        );
    }

    #[test]
    fn test_parser_starts_at_beginning() {
        let mut adapter = adapter(ProviderConfig::new("g", "m", "k", WireProtocol::Gemini));
        assert_eq!(adapter.protocol(), WireProtocol::Gemini);
        assert_eq!(adapter.parser_mut().cursor().processed, 0);
        assert!(!adapter.parser_mut().is_finished());
    }
}
