//! chorus-core: Core types and fan-out orchestration for chorus
//!
//! This crate provides the provider-agnostic half of the multi-provider
//! streaming engine: the domain types, the event sink contract, fan-out
//! across providers and synthesis of their answers.

pub mod chat;
pub mod error;
pub mod event;
pub mod history;
pub mod orchestrator;
pub mod provider;
pub mod session;
pub mod synthesis;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chat::{ChatRequest, ChatResponse, ChatService, DEFAULT_FALLBACK_MESSAGE};
pub use error::Error;
pub use event::{EmitSink, EventBus, EventKind, EventTags, NullSink, StreamEvent};
pub use history::{record_detached, BoundedHistory, HistoryEntry, HistoryStore};
pub use orchestrator::{BranchResult, Orchestrator};
pub use provider::{
    AnswerSource, FinalAnswer, Provider, ProviderConfig, ProviderOutcome, ProviderRequest,
    StreamOptions, WireProtocol, DEFAULT_TIMEOUT,
};
pub use session::{QueryId, StreamingSession};
pub use synthesis::{build_synthesis_prompt, SynthesisStep};

pub type Result<T> = std::result::Result<T, Error>;
