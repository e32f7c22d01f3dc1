//! Server-Sent-Events frame lexer.
//!
//! A [`FrameScanner`] reads complete frames forward from a byte position in
//! a text buffer that may end mid-frame. It never consumes a partial frame:
//! when the remainder is incomplete, `next_frame` returns `None` and
//! `position` still points at the start of that frame.

use std::borrow::Cow;

const DATA_FIELD: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// How frame boundaries are recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Every frame must be a single `data: <payload>` event. Scanning stops
    /// at a remainder that does not start with a data field.
    Strict,
    /// Any blank-line-delimited event. Events without data lines (comments,
    /// keep-alives) are consumed silently; multiple data lines are joined.
    Event,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Data(Cow<'a, str>),
    /// The `[DONE]` sentinel.
    Done,
}

pub struct FrameScanner<'a> {
    buffer: &'a str,
    position: usize,
    framing: Framing,
}

impl<'a> FrameScanner<'a> {
    pub fn new(buffer: &'a str, position: usize, framing: Framing) -> Self {
        Self {
            buffer,
            position: position.min(buffer.len()),
            framing,
        }
    }

    /// Offset just past the last frame returned.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Read one complete frame at the current position.
    pub fn next_frame(&mut self) -> Option<Frame<'a>> {
        let buffer: &'a str = self.buffer;
        loop {
            let rest = &buffer[self.position..];
            if self.framing == Framing::Strict && !rest.starts_with(DATA_FIELD) {
                return None;
            }

            let (end, terminator_len) = find_terminator(rest)?;
            let event = &rest[..end];
            self.position += end + terminator_len;

            let payload = match self.framing {
                Framing::Strict => Some(Cow::Borrowed(field_value(event))),
                Framing::Event => data_payload(event),
            };
            match payload {
                Some(payload) if payload == DONE_SENTINEL => return Some(Frame::Done),
                Some(payload) => return Some(Frame::Data(payload)),
                None => continue,
            }
        }
    }
}

/// Earliest `\n\n` or `\r\n\r\n` in `text`: (offset, terminator length).
fn find_terminator(text: &str) -> Option<(usize, usize)> {
    let lf = text.find("\n\n").map(|i| (i, 2));
    let crlf = text.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Value of a `data:` line, without the field name and one optional space.
fn field_value(line: &str) -> &str {
    let value = line.strip_prefix(DATA_FIELD).unwrap_or(line);
    let value = value.strip_prefix(' ').unwrap_or(value);
    value.trim_end_matches('\r')
}

fn data_payload(event: &str) -> Option<Cow<'_, str>> {
    let mut lines = event
        .lines()
        .filter(|line| line.starts_with(DATA_FIELD))
        .map(field_value);

    let first = lines.next()?;
    match lines.next() {
        None => Some(Cow::Borrowed(first)),
        Some(second) => {
            let mut joined = format!("{}\n{}", first, second);
            for line in lines {
                joined.push('\n');
                joined.push_str(line);
            }
            Some(Cow::Owned(joined))
        }
    }
}
