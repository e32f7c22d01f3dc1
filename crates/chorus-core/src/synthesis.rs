//! Merging several provider answers into one.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::event::{EmitSink, StreamEvent};
use crate::orchestrator::run_guarded;
use crate::provider::{AnswerSource, FinalAnswer, Provider, StreamOptions};
use crate::session::StreamingSession;

/// Provider tag used for events emitted while synthesizing.
pub const SYNTHESIS_TAG: &str = "synthesis";

/// Build the prompt asking the master provider to merge `responses`.
pub fn build_synthesis_prompt(original_prompt: &str, responses: &[&str]) -> String {
    let mut prompt = format!(
        "You are given {} answers from different AI assistants to the same question.\n\n\
         Original question:\n{}\n\n",
        responses.len(),
        original_prompt
    );
    for (i, response) in responses.iter().enumerate() {
        prompt.push_str(&format!("Response {}:\n{}\n\n", i + 1, response));
    }
    prompt.push_str(
        "Write one unified, coherent answer to the original question that combines the \
         strongest points of these responses and resolves any contradictions. Reply with the \
         answer only: do not restate these instructions or mention that several responses \
         were provided.",
    );
    prompt
}

/// Sink wrapper that re-tags events as coming from the synthesis pass.
struct SynthesisSink {
    inner: Arc<dyn EmitSink>,
}

impl EmitSink for SynthesisSink {
    fn emit(&self, mut event: StreamEvent) {
        event.tags.provider = SYNTHESIS_TAG.to_string();
        self.inner.emit(event);
    }
}

pub struct SynthesisStep<'a> {
    providers: &'a [Arc<dyn Provider>],
    preferred: Option<&'a str>,
}

impl<'a> SynthesisStep<'a> {
    /// `providers` is the full configured list in iteration order.
    pub fn new(providers: &'a [Arc<dyn Provider>], preferred: Option<&'a str>) -> Self {
        Self {
            providers,
            preferred,
        }
    }

    /// Pick the provider that performs the synthesis.
    ///
    /// The preferred provider wins when it is configured. Otherwise the first
    /// configured provider that succeeded in the fan-out, then the first
    /// configured provider at all.
    pub fn select_master(&self, succeeded: &[&str]) -> Option<&'a Arc<dyn Provider>> {
        if succeeded.is_empty() {
            return None;
        }
        if let Some(preferred) = self.preferred {
            if let Some(provider) = self.providers.iter().find(|p| p.id() == preferred) {
                return Some(provider);
            }
            warn!(provider = %preferred, "Preferred master provider is not configured");
        }
        self.providers
            .iter()
            .find(|p| succeeded.contains(&p.id()))
            .or_else(|| self.providers.first())
    }

    fn model_of(&self, provider_id: &str) -> String {
        self.providers
            .iter()
            .find(|p| p.id() == provider_id)
            .map(|p| p.model().to_string())
            .unwrap_or_default()
    }

    /// Synthesize `successes` (provider id, text) into one answer.
    ///
    /// The master runs under the same deadline and panic guard as a fan-out
    /// branch. Falls back to the first success when no master can be chosen
    /// or the synthesis run produces nothing.
    pub async fn synthesize(
        &self,
        session: &StreamingSession,
        successes: &[(&str, &str)],
        sink: Arc<dyn EmitSink>,
        options: StreamOptions,
    ) -> FinalAnswer {
        let fallback = |(provider_id, text): (&str, &str)| FinalAnswer {
            text: text.to_string(),
            produced_by: AnswerSource::Provider(provider_id.to_string()),
            model: self.model_of(provider_id),
            query_id: session.query_id,
        };

        let Some(&first) = successes.first() else {
            return FinalAnswer {
                text: String::new(),
                produced_by: AnswerSource::Synthesis,
                model: String::new(),
                query_id: session.query_id,
            };
        };

        let succeeded: Vec<&str> = successes.iter().map(|(id, _)| *id).collect();
        let Some(master) = self.select_master(&succeeded) else {
            return fallback(first);
        };

        let texts: Vec<&str> = successes.iter().map(|(_, text)| *text).collect();
        let prompt = build_synthesis_prompt(&session.prompt, &texts);
        let synthesis_session = session.derive(prompt);

        debug!(
            query_id = %session.query_id,
            master = %master.id(),
            responses = texts.len(),
            "Synthesizing responses"
        );

        let sink: Arc<dyn EmitSink> = Arc::new(SynthesisSink { inner: sink });
        let outcome = run_guarded(
            Arc::clone(master),
            Arc::new(synthesis_session),
            sink,
            options,
        )
        .await;

        match outcome.text() {
            Some(text) => FinalAnswer {
                text: text.to_string(),
                produced_by: AnswerSource::Synthesis,
                model: master.model().to_string(),
                query_id: session.query_id,
            },
            None => {
                warn!(
                    query_id = %session.query_id,
                    master = %master.id(),
                    "Synthesis produced no answer, using first response"
                );
                fallback(first)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderOutcome;
    use crate::testing::{MockProvider, RecordingSink};

    fn configured(ids: &[&str]) -> Vec<Arc<dyn Provider>> {
        ids.iter()
            .map(|id| Arc::new(MockProvider::succeeding(*id, "x")) as Arc<dyn Provider>)
            .collect()
    }

    #[test]
    fn test_prompt_labels_responses_positionally() {
        let prompt = build_synthesis_prompt("Why is the sky blue?", &["Rayleigh", "Scattering"]);

        assert!(prompt.contains("Why is the sky blue?"));
        assert!(prompt.contains("Response 1:\nRayleigh"));
        assert!(prompt.contains("Response 2:\nScattering"));
        assert!(prompt.find("Response 1").unwrap() < prompt.find("Response 2").unwrap());
        assert!(prompt.contains("2 answers"));
    }

    #[test]
    fn test_select_master_prefers_configured_preferred() {
        let providers = configured(&["openai", "gemini"]);
        let step = SynthesisStep::new(&providers, Some("gemini"));
        assert_eq!(step.select_master(&["openai"]).unwrap().id(), "gemini");
    }

    #[test]
    fn test_select_master_falls_back_to_first_successful() {
        let providers = configured(&["a", "b", "c"]);
        let step = SynthesisStep::new(&providers, Some("missing"));
        assert_eq!(step.select_master(&["c", "b"]).unwrap().id(), "b");

        let step = SynthesisStep::new(&providers, None);
        assert_eq!(step.select_master(&["c"]).unwrap().id(), "c");
    }

    #[test]
    fn test_select_master_without_candidates() {
        let providers = configured(&["a"]);
        let step = SynthesisStep::new(&providers, Some("a"));
        assert!(step.select_master(&[]).is_none());
    }

    #[tokio::test]
    async fn test_synthesis_events_are_retagged() {
        let master = Arc::new(MockProvider::succeeding("a", "merged"));
        let providers: Vec<Arc<dyn Provider>> = vec![master.clone()];
        let step = SynthesisStep::new(&providers, None);
        let sink = Arc::new(RecordingSink::new());

        let answer = step
            .synthesize(
                &StreamingSession::new("q"),
                &[("a", "one"), ("b", "two")],
                sink.clone(),
                StreamOptions::default(),
            )
            .await;

        assert_eq!(answer.text, "merged");
        assert_eq!(answer.produced_by, AnswerSource::Synthesis);
        assert_eq!(sink.chunks_for(SYNTHESIS_TAG), "merged");
        assert!(sink.chunks_for("a").is_empty());
    }

    #[tokio::test]
    async fn test_failed_synthesis_returns_first_success() {
        let master = Arc::new(MockProvider::new("a"));
        master.queue_outcome(ProviderOutcome::error("Request timed out"));
        let providers: Vec<Arc<dyn Provider>> = vec![master.clone()];
        let step = SynthesisStep::new(&providers, None);

        let answer = step
            .synthesize(
                &StreamingSession::new("q"),
                &[("a", "one"), ("b", "two")],
                Arc::new(RecordingSink::new()),
                StreamOptions::default(),
            )
            .await;

        assert_eq!(answer.text, "one");
        assert_eq!(answer.produced_by, AnswerSource::Provider("a".into()));
    }
}
