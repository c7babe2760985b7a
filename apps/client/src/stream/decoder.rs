//! Incremental decoder for `text/event-stream` bodies.
//!
//! Bytes go in as they arrive from the network, in order but with arbitrary
//! boundaries (mid-record, mid-character). Complete `data: <payload>` records
//! come out as tokens. No I/O happens here.

use tracing::debug;

/// Field prefix of a record carrying a payload.
pub const DATA_PREFIX: &str = "data: ";
/// Payload marking the end of the stream.
pub const DONE_SENTINEL: &str = "[DONE]";
/// Longest record, terminated or not, before the framing is declared broken.
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

/// One decoded unit of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// Payload of a `data:` record, verbatim. May be empty.
    Token(String),
    /// The `[DONE]` sentinel was seen; the decoder accepts no further input.
    Done,
    /// Framing broke down; the decoder accepts no further input.
    Malformed(String),
}

/// Stateful UTF-8 decoding that tolerates a character split across chunks.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode_into(&mut self, chunk: &[u8], out: &mut String) {
        let joined;
        let mut input: &[u8] = if self.pending.is_empty() {
            chunk
        } else {
            let mut bytes = std::mem::take(&mut self.pending);
            bytes.extend_from_slice(chunk);
            joined = bytes;
            &joined
        };

        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&input[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &input[valid + len..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for the next chunk.
                            self.pending = input[valid..].to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Push parser turning raw body chunks into [`StreamItem`]s.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    utf8: Utf8Carry,
    buffer: String,
    /// Prefix of `buffer` already known to hold no line break.
    scanned: usize,
    finished: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` or a framing error has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds one chunk and returns every record it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamItem> {
        if self.finished {
            return Vec::new();
        }

        self.utf8.decode_into(chunk, &mut self.buffer);

        let mut items = Vec::new();
        let mut consumed = 0;
        let mut search_from = self.scanned;

        while let Some(rel) = self.buffer[search_from..].find('\n') {
            let end = search_from + rel;
            let start = consumed;
            consumed = end + 1;
            search_from = consumed;

            // Measured with any trailing '\r' so a split fragment can never exceed it.
            if end - start > MAX_RECORD_LEN {
                self.fail(&mut items);
                return items;
            }

            let line = &self.buffer[start..end];
            let line = line.strip_suffix('\r').unwrap_or(line);
            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };
            if payload == DONE_SENTINEL {
                items.push(StreamItem::Done);
                self.finished = true;
                self.buffer.clear();
                self.scanned = 0;
                return items;
            }
            items.push(StreamItem::Token(payload.to_string()));
        }

        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_RECORD_LEN {
            self.fail(&mut items);
        }

        items
    }

    fn fail(&mut self, items: &mut Vec<StreamItem>) {
        items.push(StreamItem::Malformed(format!(
            "record exceeds {MAX_RECORD_LEN} bytes"
        )));
        self.buffer.clear();
        self.scanned = 0;
        self.finished = true;
    }

    /// Signals that the byte source ended. An unterminated trailing fragment,
    /// including any incomplete UTF-8 sequence, is not a complete record and
    /// is dropped.
    pub fn finish(&mut self) {
        if !self.finished && (!self.buffer.is_empty() || self.utf8.has_pending()) {
            debug!(
                "Event stream ended with {} bytes of unterminated record; discarding",
                self.buffer.len() + self.utf8.pending.len()
            );
        }
        self.buffer.clear();
        self.utf8.pending.clear();
        self.scanned = 0;
        self.finished = true;
    }
}
