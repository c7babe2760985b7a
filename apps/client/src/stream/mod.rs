//! Turns a chunked `text/event-stream` body into content tokens.

pub mod decoder;

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use tracing::warn;

use crate::errors::ClientError;

pub use decoder::{EventStreamDecoder, StreamItem, DATA_PREFIX, DONE_SENTINEL, MAX_RECORD_LEN};

struct DecodeState<S> {
    source: Pin<Box<S>>,
    decoder: EventStreamDecoder,
    queued: VecDeque<StreamItem>,
    ended: bool,
}

/// Lazily decodes a byte-chunk stream into tokens.
///
/// The output ends at `[DONE]` (later chunks are never polled) or when the
/// source runs dry. Broken framing yields one `ClientError::Decode` as the
/// final item; a source error is yielded as the final item too.
pub fn decode_stream<S, E>(source: S) -> impl Stream<Item = Result<String, ClientError>>
where
    S: Stream<Item = Result<Bytes, E>>,
    ClientError: From<E>,
{
    let state = DecodeState {
        source: Box::pin(source),
        decoder: EventStreamDecoder::new(),
        queued: VecDeque::new(),
        ended: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queued.pop_front() {
                match item {
                    StreamItem::Token(token) => return Some((Ok(token), state)),
                    StreamItem::Done => {
                        state.ended = true;
                        return None;
                    }
                    StreamItem::Malformed(reason) => {
                        state.ended = true;
                        return Some((Err(ClientError::Decode(reason)), state));
                    }
                }
            }

            if state.ended {
                return None;
            }

            match state.source.next().await {
                Some(Ok(chunk)) => state.queued.extend(state.decoder.push(&chunk)),
                Some(Err(e)) => {
                    state.ended = true;
                    return Some((Err(ClientError::from(e)), state));
                }
                None => {
                    warn!("Event stream ended without {DONE_SENTINEL}; keeping partial output");
                    state.decoder.finish();
                    state.ended = true;
                }
            }
        }
    })
}
