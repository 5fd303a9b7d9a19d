//! Server-push record decoding.
//!
//! The transport delivers line-framed records (`data: <payload>`). [`decode`] is a pure
//! step function: it takes the bytes left over from the previous feed plus the new
//! input and returns the events found together with the new leftover. [`decode_stream`]
//! drives it over a live [`ByteStream`].

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use parley_backend::ByteStream;

/// Payloads that terminate an exchange. Matched exactly and case-sensitively.
pub const COMPLETION_TOKENS: [&str; 3] = ["[DONE]", "[COMPLETE]", "done"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Completed,
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error(_))
    }
}

/// Output of one [`decode`] step.
#[derive(Debug, Default)]
pub struct Decoded {
    pub events: Vec<StreamEvent>,
    /// Bytes after the last record boundary, to be passed into the next step.
    pub pending: BytesMut,
    /// A completion record was seen; the feed must not be decoded any further.
    pub finished: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Record {
    Payload(String),
    Completion,
    Ignored,
    Malformed(&'static str),
}

/// Decodes every complete record in `pending + input`.
pub fn decode(mut pending: BytesMut, input: &[u8]) -> Decoded {
    pending.extend_from_slice(input);
    let mut events = Vec::new();

    while let Some(boundary) = pending.iter().position(|byte| *byte == b'\n') {
        let line = pending.split_to(boundary);
        pending.advance(1);

        match parse_record(&line) {
            Record::Payload(payload) => events.push(StreamEvent::Chunk(payload)),
            Record::Completion => {
                events.push(StreamEvent::Completed);
                return Decoded {
                    events,
                    pending: BytesMut::new(),
                    finished: true,
                };
            }
            Record::Ignored => {}
            Record::Malformed(reason) => {
                tracing::debug!(reason, record_len = line.len(), "skipping malformed stream record");
            }
        }
    }

    Decoded {
        events,
        pending,
        finished: false,
    }
}

/// Flushes a trailing record that arrived without a boundary before the feed closed.
pub fn decode_final(pending: BytesMut) -> Decoded {
    if pending.is_empty() {
        return Decoded::default();
    }

    let mut decoded = decode(pending, b"\n");
    decoded.pending.clear();
    decoded
}

fn parse_record(line: &[u8]) -> Record {
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    // Blank lines separate events; they are framing, not content.
    if line.is_empty() {
        return Record::Ignored;
    }

    let Ok(line) = std::str::from_utf8(line) else {
        return Record::Malformed("record is not valid utf-8");
    };

    if let Some(payload) = line.strip_prefix("data:") {
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if COMPLETION_TOKENS.contains(&payload) {
            return Record::Completion;
        }
        if payload.is_empty() {
            return Record::Payload("\n".to_string());
        }
        return Record::Payload(payload.to_string());
    }

    if let Some(event_name) = line.strip_prefix("event:") {
        return if event_name.trim() == "done" {
            Record::Completion
        } else {
            Record::Ignored
        };
    }

    if line.starts_with(':') || line.starts_with("id:") || line.starts_with("retry:") {
        return Record::Ignored;
    }

    Record::Malformed("record has no recognised field")
}

/// Lazily decodes a transport feed.
///
/// The sequence ends after `Completed`, after `Error`, or when the feed closes. Dropping
/// the returned stream drops the feed and with it the connection.
pub fn decode_stream(mut feed: ByteStream) -> BoxStream<'static, StreamEvent> {
    async_stream::stream! {
        let mut pending = BytesMut::new();

        while let Some(next) = feed.next().await {
            match next {
                Ok(bytes) => {
                    let decoded = decode(pending, &bytes);
                    pending = decoded.pending;
                    for event in decoded.events {
                        yield event;
                    }
                    if decoded.finished {
                        return;
                    }
                }
                Err(error) => {
                    yield StreamEvent::Error(error.to_string());
                    return;
                }
            }
        }

        for event in decode_final(pending).events {
            yield event;
        }
    }
    .boxed()
}
