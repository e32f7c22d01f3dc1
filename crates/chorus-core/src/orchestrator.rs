//! Fan-out of one prompt to every configured provider.
//!
//! Each provider branch runs as its own task with its own deadline and
//! cancellation token. The orchestrator waits for every branch to settle,
//! then picks the final answer:
//!
//! - no successes: `None`
//! - one success: that provider's text, verbatim
//! - several successes: a synthesis pass on the master provider

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, TIMED_OUT, UNEXPECTED_FAILURE};
use crate::event::{EmitSink, EventTags, StreamEvent};
use crate::provider::{
    AnswerSource, FinalAnswer, Provider, ProviderOutcome, StreamOptions, DEFAULT_TIMEOUT,
};
use crate::session::StreamingSession;
use crate::synthesis::SynthesisStep;
use crate::Result;

/// Extra time a branch gets past its own timeout before the orchestrator
/// stops waiting for it.
const SETTLE_GRACE: Duration = Duration::from_secs(1);

/// Terminal state of one branch of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchResult {
    pub provider_id: String,
    pub outcome: ProviderOutcome,
}

pub struct Orchestrator {
    providers: Vec<Arc<dyn Provider>>,
    preferred_master: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field(
                "providers",
                &self.providers.iter().map(|p| p.id()).collect::<Vec<_>>(),
            )
            .field("preferred_master", &self.preferred_master)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator over providers in iteration order.
    ///
    /// Fails when no provider is configured.
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(Error::config("no providers configured"));
        }
        Ok(Self {
            providers,
            preferred_master: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_preferred_master(mut self, provider_id: impl Into<String>) -> Self {
        self.preferred_master = Some(provider_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn provider(&self, id: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.id() == id)
    }

    /// Fan the session's prompt out to every configured provider.
    pub async fn generate_multi_provider_response(
        &self,
        session: &StreamingSession,
        sink: Arc<dyn EmitSink>,
    ) -> Option<FinalAnswer> {
        self.generate_with_cancel(session, sink, CancellationToken::new())
            .await
    }

    /// Like [`generate_multi_provider_response`](Self::generate_multi_provider_response),
    /// aborting every branch when `cancel` fires.
    pub async fn generate_with_cancel(
        &self,
        session: &StreamingSession,
        sink: Arc<dyn EmitSink>,
        cancel: CancellationToken,
    ) -> Option<FinalAnswer> {
        let providers = self.providers.clone();
        self.run(providers, session, sink, cancel).await
    }

    /// Fan out to the requested provider ids only. Unknown ids are skipped
    /// and repeated ids are queried once.
    pub async fn generate_for(
        &self,
        session: &StreamingSession,
        requested: &[String],
        sink: Arc<dyn EmitSink>,
        cancel: CancellationToken,
    ) -> Option<FinalAnswer> {
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for id in requested.iter().filter(|id| seen.insert(id.as_str())) {
            match self.provider(id) {
                Some(provider) => selected.push(Arc::clone(provider)),
                None => warn!(provider = %id, "Requested provider is not configured"),
            }
        }
        if selected.is_empty() {
            warn!(query_id = %session.query_id, "No requested provider is configured");
            return None;
        }
        self.run(selected, session, sink, cancel).await
    }

    async fn run(
        &self,
        providers: Vec<Arc<dyn Provider>>,
        session: &StreamingSession,
        sink: Arc<dyn EmitSink>,
        cancel: CancellationToken,
    ) -> Option<FinalAnswer> {
        debug!(
            query_id = %session.query_id,
            providers = providers.len(),
            "Fanning out"
        );

        let results = self
            .fan_out(&providers, session, Arc::clone(&sink), &cancel)
            .await;

        let successes: Vec<(&str, &str)> = results
            .iter()
            .filter_map(|r| r.outcome.text().map(|t| (r.provider_id.as_str(), t)))
            .collect();

        info!(
            query_id = %session.query_id,
            settled = results.len(),
            succeeded = successes.len(),
            "All branches settled"
        );

        match successes.as_slice() {
            [] => None,
            [(provider_id, text)] => Some(FinalAnswer {
                text: (*text).to_string(),
                produced_by: AnswerSource::Provider((*provider_id).to_string()),
                model: providers
                    .iter()
                    .find(|p| p.id() == *provider_id)
                    .map(|p| p.model().to_string())
                    .unwrap_or_default(),
                query_id: session.query_id,
            }),
            _ => {
                let step = SynthesisStep::new(&self.providers, self.preferred_master.as_deref());
                let options = StreamOptions::new(self.timeout).with_cancel(cancel.child_token());
                Some(step.synthesize(session, &successes, sink, options).await)
            }
        }
    }

    /// Run every provider concurrently and wait for all of them to settle.
    ///
    /// Results are returned in provider order. A branch that panics or
    /// overruns its deadline becomes an error outcome; it never affects its
    /// siblings.
    pub async fn fan_out(
        &self,
        providers: &[Arc<dyn Provider>],
        session: &StreamingSession,
        sink: Arc<dyn EmitSink>,
        cancel: &CancellationToken,
    ) -> Vec<BranchResult> {
        let session = Arc::new(session.clone());

        let branches = providers.iter().map(|provider| {
            let options = StreamOptions::new(self.timeout).with_cancel(cancel.child_token());
            run_guarded(
                Arc::clone(provider),
                Arc::clone(&session),
                Arc::clone(&sink),
                options,
            )
        });
        let outcomes = join_all(branches).await;

        providers
            .iter()
            .zip(outcomes)
            .map(|(provider, outcome)| {
                if let ProviderOutcome::Error { message } = &outcome {
                    debug!(provider = %provider.id(), error = %message, "Branch failed");
                }
                BranchResult {
                    provider_id: provider.id().to_string(),
                    outcome,
                }
            })
            .collect()
    }
}

/// Run one provider call on its own task, bounded by `options.timeout` plus
/// [`SETTLE_GRACE`].
///
/// A provider that ignores its timeout is dropped at the deadline and a
/// panicking one is caught at the join. Both settle as an error outcome with
/// a matching stream error on `sink`.
pub(crate) async fn run_guarded(
    provider: Arc<dyn Provider>,
    session: Arc<StreamingSession>,
    sink: Arc<dyn EmitSink>,
    options: StreamOptions,
) -> ProviderOutcome {
    let deadline = options.timeout + SETTLE_GRACE;
    let tags = branch_tags(provider.as_ref(), &session);
    let provider_id = provider.id().to_string();

    let task_sink = Arc::clone(&sink);
    let task_tags = tags.clone();
    let handle = tokio::spawn(async move {
        match tokio::time::timeout(
            deadline,
            provider.stream_query(&session, Arc::clone(&task_sink), options),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(provider = %provider.id(), "Branch overran its deadline");
                task_sink.emit(StreamEvent::error(&task_tags, TIMED_OUT));
                ProviderOutcome::error(TIMED_OUT)
            }
        }
    });

    handle.await.unwrap_or_else(|e| {
        warn!(provider = %provider_id, error = %e, "Provider branch panicked");
        sink.emit(StreamEvent::error(&tags, UNEXPECTED_FAILURE));
        ProviderOutcome::error(UNEXPECTED_FAILURE)
    })
}

fn branch_tags(provider: &dyn Provider, session: &StreamingSession) -> EventTags {
    EventTags::new(
        provider.model(),
        provider.id(),
        session.nickname.clone(),
        session.query_id,
    )
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::event::EventKind;
    use crate::synthesis::SYNTHESIS_TAG;
    use crate::testing::{MockProvider, RecordingSink};

    fn providers(mocks: &[&Arc<MockProvider>]) -> Vec<Arc<dyn Provider>> {
        mocks
            .iter()
            .map(|m| Arc::clone(*m) as Arc<dyn Provider>)
            .collect()
    }

    #[test]
    fn test_new_rejects_empty_configuration() {
        let err = Orchestrator::new(Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_zero_success_returns_none() {
        let a = Arc::new(MockProvider::failing("a", "Bad response from provider"));
        let b = Arc::new(MockProvider::failing("b", "Parse error"));
        let orchestrator = Orchestrator::new(providers(&[&a, &b])).unwrap();
        let sink = Arc::new(RecordingSink::new());

        let answer = orchestrator
            .generate_multi_provider_response(&StreamingSession::new("hi"), sink.clone())
            .await;

        assert!(answer.is_none());
        assert_eq!(sink.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_single_success_skips_synthesis() {
        let master = Arc::new(MockProvider::failing("master", "Request timed out"));
        let other = Arc::new(MockProvider::succeeding("other", "only answer"));
        let orchestrator = Orchestrator::new(providers(&[&master, &other]))
            .unwrap()
            .with_preferred_master("master");

        let answer = orchestrator
            .generate_multi_provider_response(
                &StreamingSession::new("hi"),
                Arc::new(RecordingSink::new()),
            )
            .await
            .unwrap();

        assert_eq!(answer.text, "only answer");
        assert_eq!(answer.produced_by, AnswerSource::Provider("other".into()));
        // Only the fan-out request, no synthesis request
        assert_eq!(master.request_count(), 1);
        assert_eq!(other.request_count(), 1);
    }

    #[tokio::test]
    async fn test_multiple_successes_are_synthesized() {
        let a = Arc::new(MockProvider::succeeding("a", "first"));
        a.queue_outcome(ProviderOutcome::success("merged"));
        let b = Arc::new(MockProvider::succeeding("b", "second"));
        let orchestrator = Orchestrator::new(providers(&[&a, &b])).unwrap();

        let answer = orchestrator
            .generate_multi_provider_response(
                &StreamingSession::new("What is Rust?"),
                Arc::new(RecordingSink::new()),
            )
            .await
            .unwrap();

        assert_eq!(answer.text, "merged");
        assert_eq!(answer.produced_by, AnswerSource::Synthesis);
        assert_eq!(a.request_count(), 2);
        assert_eq!(b.request_count(), 1);

        let synthesis_prompt = a.last_prompt().unwrap();
        assert!(synthesis_prompt.contains("What is Rust?"));
        assert!(synthesis_prompt.contains("Response 1:\nfirst"));
        assert!(synthesis_prompt.contains("Response 2:\nsecond"));
    }

    #[tokio::test]
    async fn test_synthesis_failure_falls_back_to_first_success() {
        let failing = Arc::new(MockProvider::failing("a", "Parse error"));
        let b = Arc::new(MockProvider::succeeding("b", "from b"));
        b.queue_outcome(ProviderOutcome::success(""));
        let c = Arc::new(MockProvider::succeeding("c", "from c"));
        let orchestrator = Orchestrator::new(providers(&[&failing, &b, &c]))
            .unwrap()
            .with_preferred_master("b");

        let answer = orchestrator
            .generate_multi_provider_response(
                &StreamingSession::new("hi"),
                Arc::new(RecordingSink::new()),
            )
            .await
            .unwrap();

        assert_eq!(answer.text, "from b");
        assert_eq!(answer.produced_by, AnswerSource::Provider("b".into()));
        assert_eq!(b.request_count(), 2);
    }

    #[tokio::test]
    async fn test_waits_for_slowest_branch() {
        let fast = Arc::new(MockProvider::succeeding("fast", "quick"));
        let slow = Arc::new(
            MockProvider::succeeding("slow", "late").with_delay(Duration::from_millis(150)),
        );
        slow.queue_outcome(ProviderOutcome::success("merged"));
        let orchestrator = Orchestrator::new(providers(&[&slow, &fast])).unwrap();

        let started = Instant::now();
        let answer = orchestrator
            .generate_multi_provider_response(
                &StreamingSession::new("hi"),
                Arc::new(RecordingSink::new()),
            )
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(answer.produced_by, AnswerSource::Synthesis);
    }

    #[tokio::test]
    async fn test_timed_out_branch_does_not_block_reply() {
        let hung = Arc::new(
            MockProvider::succeeding("hung", "never").with_delay(Duration::from_secs(30)),
        );
        let ok = Arc::new(MockProvider::succeeding("ok", "answer"));
        let orchestrator = Orchestrator::new(providers(&[&hung, &ok]))
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let sink = Arc::new(RecordingSink::new());

        let started = Instant::now();
        let answer = orchestrator
            .generate_multi_provider_response(&StreamingSession::new("hi"), sink.clone())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(answer.text, "answer");
        assert!(sink
            .errors_for("hung")
            .iter()
            .any(|e| e == "Request timed out"));
    }

    #[tokio::test]
    async fn test_panicking_branch_is_isolated() {
        let bad = Arc::new(MockProvider::panicking("bad"));
        let a = Arc::new(MockProvider::succeeding("a", "alpha"));
        let session = StreamingSession::new("hi");
        let sink = Arc::new(RecordingSink::new());
        let orchestrator = Orchestrator::new(providers(&[&bad, &a])).unwrap();

        let results = orchestrator
            .fan_out(
                orchestrator.providers(),
                &session,
                sink.clone(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].outcome,
            ProviderOutcome::error("Unexpected failure")
        );
        assert_eq!(results[1].outcome, ProviderOutcome::success("alpha"));
        assert_eq!(sink.errors_for("bad"), vec!["Unexpected failure".to_string()]);
        assert_eq!(sink.chunks_for("a"), "alpha");
    }

    #[tokio::test]
    async fn test_generate_for_restricts_fan_out() {
        let a = Arc::new(MockProvider::succeeding("a", "alpha"));
        let b = Arc::new(MockProvider::succeeding("b", "beta"));
        let orchestrator = Orchestrator::new(providers(&[&a, &b])).unwrap();

        let answer = orchestrator
            .generate_for(
                &StreamingSession::new("hi"),
                &["b".to_string(), "missing".to_string()],
                Arc::new(RecordingSink::new()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(answer.text, "beta");
        assert_eq!(a.request_count(), 0);

        let none = orchestrator
            .generate_for(
                &StreamingSession::new("hi"),
                &["missing".to_string()],
                Arc::new(RecordingSink::new()),
                CancellationToken::new(),
            )
            .await;
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_all_branches() {
        let a = Arc::new(
            MockProvider::succeeding("a", "alpha").with_delay(Duration::from_secs(30)),
        );
        let b = Arc::new(
            MockProvider::succeeding("b", "beta").with_delay(Duration::from_secs(30)),
        );
        let orchestrator = Orchestrator::new(providers(&[&a, &b])).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let sink = Arc::new(RecordingSink::new());
        let answer = orchestrator
            .generate_with_cancel(&StreamingSession::new("hi"), sink.clone(), cancel)
            .await;

        assert!(answer.is_none());
        assert_eq!(sink.errors().len(), 2);
        assert!(sink
            .events()
            .iter()
            .all(|e| !matches!(e.kind, EventKind::StreamEnd)));
    }

    #[tokio::test]
    async fn test_branch_ignoring_its_timeout_is_cut_off_once() {
        let stuck = Arc::new(
            MockProvider::succeeding("stuck", "never")
                .with_stubborn_delay(Duration::from_secs(30)),
        );
        let ok = Arc::new(MockProvider::succeeding("ok", "answer"));
        let orchestrator = Orchestrator::new(providers(&[&stuck, &ok]))
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let session = StreamingSession::new("hi");
        let sink = Arc::new(RecordingSink::new());

        let started = Instant::now();
        let results = orchestrator
            .fan_out(
                orchestrator.providers(),
                &session,
                sink.clone(),
                &CancellationToken::new(),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results[0].outcome, ProviderOutcome::error("Request timed out"));
        assert_eq!(results[1].outcome, ProviderOutcome::success("answer"));
        assert_eq!(sink.errors_for("stuck"), vec!["Request timed out".to_string()]);
        assert!(sink.chunks_for("stuck").is_empty());
    }

    #[tokio::test]
    async fn test_panicking_master_falls_back_to_first_success() {
        let bad = Arc::new(MockProvider::panicking("bad"));
        let a = Arc::new(MockProvider::succeeding("a", "alpha").with_model("model-a"));
        let b = Arc::new(MockProvider::succeeding("b", "beta"));
        let orchestrator = Orchestrator::new(providers(&[&bad, &a, &b]))
            .unwrap()
            .with_preferred_master("bad");
        let sink = Arc::new(RecordingSink::new());

        let answer = orchestrator
            .generate_multi_provider_response(&StreamingSession::new("hi"), sink.clone())
            .await
            .unwrap();

        assert_eq!(answer.text, "alpha");
        assert_eq!(answer.produced_by, AnswerSource::Provider("a".into()));
        assert_eq!(answer.model, "model-a");
        // Once in the fan-out, once as master
        assert_eq!(bad.request_count(), 2);
        assert_eq!(
            sink.errors_for(SYNTHESIS_TAG),
            vec!["Unexpected failure".to_string()]
        );
    }

    #[tokio::test]
    async fn test_master_ignoring_its_timeout_falls_back_to_first_success() {
        let stuck = Arc::new(
            MockProvider::succeeding("stuck", "late")
                .with_stubborn_delay(Duration::from_secs(30)),
        );
        let a = Arc::new(MockProvider::succeeding("a", "alpha"));
        let b = Arc::new(MockProvider::succeeding("b", "beta"));
        let orchestrator = Orchestrator::new(providers(&[&stuck, &a, &b]))
            .unwrap()
            .with_preferred_master("stuck")
            .with_timeout(Duration::from_millis(100));
        let sink = Arc::new(RecordingSink::new());

        let answer = tokio::time::timeout(
            Duration::from_secs(10),
            orchestrator
                .generate_multi_provider_response(&StreamingSession::new("hi"), sink.clone()),
        )
        .await
        .expect("synthesis must respect its deadline")
        .unwrap();

        assert_eq!(answer.text, "alpha");
        assert_eq!(answer.produced_by, AnswerSource::Provider("a".into()));
        assert_eq!(stuck.request_count(), 2);
        assert_eq!(
            sink.errors_for(SYNTHESIS_TAG),
            vec!["Request timed out".to_string()]
        );
    }

    #[tokio::test]
    async fn test_single_success_reports_its_model() {
        let a = Arc::new(MockProvider::succeeding("a", "alpha").with_model("gpt-4o-mini"));
        let orchestrator = Orchestrator::new(providers(&[&a])).unwrap();

        let answer = orchestrator
            .generate_multi_provider_response(
                &StreamingSession::new("hi"),
                Arc::new(RecordingSink::new()),
            )
            .await
            .unwrap();

        assert_eq!(answer.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_generate_for_queries_repeated_ids_once() {
        let a = Arc::new(MockProvider::succeeding("a", "alpha"));
        a.queue_outcome(ProviderOutcome::success("merged"));
        let b = Arc::new(MockProvider::succeeding("b", "beta"));
        let orchestrator = Orchestrator::new(providers(&[&a, &b])).unwrap();

        let answer = orchestrator
            .generate_for(
                &StreamingSession::new("hi"),
                &["a".to_string(), "a".to_string()],
                Arc::new(RecordingSink::new()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(answer.text, "alpha");
        assert_eq!(answer.produced_by, AnswerSource::Provider("a".into()));
        assert_eq!(a.request_count(), 1);
        assert_eq!(b.request_count(), 0);
    }
}
