//! Incremental chunk parsing over a growing response buffer.
//!
//! [`scan`] is the pure core: given a cursor and the whole buffer received so
//! far, it reads complete frames forward from the cursor and returns the new
//! cursor plus the chunk texts extracted. [`ChunkParser`] owns a cursor for
//! one stream and forwards every chunk to the event sink as it is parsed.

use std::sync::Arc;

use tracing::trace;

use chorus_core::{EmitSink, Error, EventTags, StreamEvent, WireProtocol};

use crate::sse::{Frame, FrameScanner, Framing};
use crate::{gemini, openai};

/// Scan state of one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserCursor {
    /// Byte offset of the first frame not yet consumed.
    pub processed: usize,
    /// Set once a terminal sentinel frame has been read.
    pub finished: bool,
}

/// Result of one [`scan`] call.
#[derive(Debug)]
pub struct Increment {
    pub cursor: ParserCursor,
    /// Non-empty chunk texts, in stream order.
    pub chunks: Vec<String>,
    /// Set when a frame failed to parse. Chunks before that frame are kept.
    pub failure: Option<Error>,
}

impl Increment {
    pub fn text(&self) -> String {
        self.chunks.concat()
    }
}

fn framing(protocol: WireProtocol) -> Framing {
    match protocol {
        WireProtocol::Gemini => Framing::Strict,
        WireProtocol::OpenAi => Framing::Event,
    }
}

fn extract_chunk(protocol: WireProtocol, payload: &str) -> Result<Option<String>, Error> {
    match protocol {
        WireProtocol::Gemini => gemini::extract_chunk(payload),
        WireProtocol::OpenAi => openai::extract_chunk(payload),
    }
}

/// Read every complete frame in `buffer` from `cursor` onward.
pub fn scan(protocol: WireProtocol, cursor: ParserCursor, buffer: &str) -> Increment {
    let mut cursor = cursor;
    let mut chunks = Vec::new();

    if cursor.finished {
        return Increment {
            cursor,
            chunks,
            failure: None,
        };
    }
    if cursor.processed > buffer.len() {
        return Increment {
            cursor,
            chunks,
            failure: Some(Error::protocol("buffer is shorter than the parser cursor")),
        };
    }

    let mut scanner = FrameScanner::new(buffer, cursor.processed, framing(protocol));
    while let Some(frame) = scanner.next_frame() {
        match frame {
            Frame::Done => {
                cursor.processed = scanner.position();
                cursor.finished = true;
                break;
            }
            Frame::Data(payload) => match extract_chunk(protocol, &payload) {
                Ok(chunk) => {
                    cursor.processed = scanner.position();
                    if let Some(text) = chunk.filter(|t| !t.is_empty()) {
                        chunks.push(text);
                    }
                }
                Err(e) => {
                    return Increment {
                        cursor,
                        chunks,
                        failure: Some(e),
                    };
                }
            },
        }
    }

    Increment {
        cursor,
        chunks,
        failure: None,
    }
}

/// Stateful parser for one upstream stream.
pub struct ChunkParser {
    protocol: WireProtocol,
    cursor: ParserCursor,
    tags: EventTags,
    sink: Arc<dyn EmitSink>,
}

impl ChunkParser {
    pub fn new(protocol: WireProtocol, tags: EventTags, sink: Arc<dyn EmitSink>) -> Self {
        Self {
            protocol,
            cursor: ParserCursor::default(),
            tags,
            sink,
        }
    }

    pub fn cursor(&self) -> ParserCursor {
        self.cursor
    }

    /// Whether a terminal sentinel has been read; later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.cursor.finished
    }

    /// Parse newly completed frames in `buffer`, the whole text received so
    /// far, emitting each chunk as a `streamChunk` event.
    ///
    /// Returns the concatenated new text. Chunks read before a failing frame
    /// are emitted before the error is returned.
    pub fn parse_increment(&mut self, buffer: &str) -> Result<String, Error> {
        let increment = scan(self.protocol, self.cursor, buffer);
        self.cursor = increment.cursor;

        let mut text = String::new();
        for chunk in &increment.chunks {
            trace!(provider = %self.tags.provider, len = chunk.len(), "Chunk parsed");
            self.sink.emit(StreamEvent::chunk(&self.tags, chunk.clone()));
            text.push_str(chunk);
        }

        match increment.failure {
            Some(e) => Err(e),
            None => Ok(text),
        }
    }
}
