//! chorus-providers: Streaming provider adapters for chorus
//!
//! This crate turns a [`chorus_core::ProviderConfig`] into a live
//! [`chorus_core::Provider`]:
//! - Gemini (`streamGenerateContent` with `alt=sse`)
//! - OpenAI and OpenAI-compatible chat completions
//!
//! Response bodies are decoded incrementally and parsed frame by frame, so
//! chunks reach the event sink as soon as each frame is complete.

pub mod adapter;
pub mod gemini;
pub mod http;
pub mod openai;
pub mod parser;
pub mod query;
pub mod sse;
pub mod transport;
pub mod utf8;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adapter::ProviderAdapter;
pub use http::{build_providers, HttpProvider};
pub use parser::{scan, ChunkParser, Increment, ParserCursor};
pub use query::StreamingQuery;
pub use transport::{ByteStream, HttpTransport, Transport, TransportResponse};
pub use utf8::Utf8Decoder;
