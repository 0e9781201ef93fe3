//! Incremental decoding of a `text/event-stream` body.
//!
//! Network chunks arrive with arbitrary boundaries: a UTF-8 character may be
//! split across two chunks and a `data:` line almost always is. [`SseDecoder`]
//! carries both kinds of partial state between calls to [`SseDecoder::push`]
//! and hands back only complete frames.

use crate::wire::CompletionChunk;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// A complete, classified line of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// `data: <payload>` with the prefix removed.
    Data(String),
    /// `data: [DONE]`, the natural end of the stream.
    Done,
}

/// UTF-8 decoder that keeps an incomplete trailing sequence for the next chunk.
///
/// Invalid bytes are replaced with U+FFFD; they never abort decoding.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, returning every character that is now complete.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }

    /// Flush at end of input. A dangling partial sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Byte-to-frame decoder for one response body.
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8Decoder,
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns the frames completed by it, in order.
    ///
    /// Frames after a [`SseFrame::Done`] are still returned; the caller is
    /// expected to stop at the sentinel.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let text = self.utf8.decode(chunk);
        self.buffer.push_str(&text);

        let mut frames = Vec::new();
        while let Some(line_end) = self.buffer.find('\n') {
            if let Some(frame) = classify(&self.buffer[..line_end]) {
                frames.push(frame);
            }
            self.buffer.drain(..=line_end);
        }
        frames
    }

    /// End of body: flush any trailing line that had no terminating newline.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let tail = self.utf8.finish();
        self.buffer.push_str(&tail);
        let line = std::mem::take(&mut self.buffer);
        classify(&line)
    }
}

/// Classify a single line (without its `\n`). Non-`data:` lines yield `None`.
pub fn classify(line: &str) -> Option<SseFrame> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX)?;
    if payload == DONE_SENTINEL {
        Some(SseFrame::Done)
    } else {
        Some(SseFrame::Data(payload.to_string()))
    }
}

/// Extract the assistant text delta from a data payload.
///
/// Returns `None` for payloads that fail to parse or carry no content; a
/// malformed frame is dropped rather than failing the stream.
pub fn parse_delta(payload: &str) -> Option<String> {
    parse_chunk(payload).and_then(|chunk| chunk.content().map(str::to_string))
}

/// Parse a data payload, logging and dropping it when it is not a chunk.
pub fn parse_chunk(payload: &str) -> Option<CompletionChunk> {
    match serde_json::from_str::<CompletionChunk>(payload) {
        Ok(chunk) => Some(chunk),
        Err(e) => {
            tracing::debug!(error = %e, len = payload.len(), "dropping malformed SSE frame");
            None
        }
    }
}
