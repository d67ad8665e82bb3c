//! Ready-made [`EventStream`]s over transport bodies.
//!
//! - [`EventStream::from_sse_response`]: SSE body with JSON `data:` payloads.
//! - [`EventStream::from_readable_stream`]: newline-delimited JSON body.

use std::collections::VecDeque;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::ClientError;
use crate::decoder::LineDecoder;
use crate::http::{byte_body, read_chunk, ByteBody, StreamResponse};
use crate::model::{RawChunk, ServerSentEvent, StreamItem};
use crate::options::StreamOptions;
use crate::sse::{is_done_marker, sse_messages};
use crate::stream::EventStream;

impl EventStream<StreamItem> {
    /// Decode an SSE response into JSON items.
    ///
    /// Fails with [`ClientError::EmptyBody`], after aborting `cancel`, when
    /// the response has no body.
    ///
    /// # Example
    /// ```
    /// use futures::{executor::block_on, stream};
    /// use reqwest::header::HeaderMap;
    /// use serde_json::json;
    /// use tokio_util::sync::CancellationToken;
    /// use tokenflow::http::StreamResponse;
    /// use tokenflow::stream::EventStream;
    ///
    /// let body = stream::iter(vec![Ok::<_, std::convert::Infallible>(
    ///     "data: {\"a\":1}\n\ndata: [DONE]\n\n",
    /// )]);
    /// let response = StreamResponse::new(HeaderMap::new(), body);
    /// let mut events = EventStream::from_sse_response(response, CancellationToken::new()).unwrap();
    ///
    /// let items = block_on(events.collect_items()).unwrap();
    /// assert_eq!(items[0].data(), &json!({"a": 1}));
    /// ```
    pub fn from_sse_response(
        response: impl Into<StreamResponse>,
        cancel: CancellationToken,
    ) -> Result<Self, ClientError> {
        Self::from_sse_response_with_options(response, cancel, StreamOptions::default())
    }

    pub fn from_sse_response_with_options(
        response: impl Into<StreamResponse>,
        cancel: CancellationToken,
        options: StreamOptions,
    ) -> Result<Self, ClientError> {
        let response = response.into();
        if !response.is_event_stream() {
            if let Some(content_type) = response.content_type() {
                warn!(content_type, "decoding a non event-stream response as SSE");
            }
        }

        let Some(body) = response.body else {
            cancel.cancel();
            return Err(ClientError::EmptyBody);
        };

        let token = cancel.clone();
        let done_marker = options.done_marker.clone();
        Ok(
            EventStream::new(move || sse_items(body, token, done_marker), cancel)
                .with_options(options),
        )
    }
}

impl EventStream<Value> {
    /// Decode a newline-delimited JSON body.
    ///
    /// Every non-empty line is parsed and yielded as is.
    pub fn from_readable_stream<S, C, E>(body: S, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = Result<C, E>> + Send + 'static,
        C: Into<RawChunk>,
        E: Into<ClientError>,
    {
        let body = byte_body(body);
        let token = cancel.clone();
        EventStream::new(move || json_lines(body, token), cancel)
    }
}

struct SseItems {
    messages: BoxStream<'static, Result<ServerSentEvent, ClientError>>,
    done_marker: String,
    done: bool,
}

/// Turn SSE messages into items, stopping at the done marker.
///
/// Messages after the done marker are drained so the body closes cleanly.
fn sse_items(
    body: ByteBody,
    cancel: CancellationToken,
    done_marker: String,
) -> impl Stream<Item = Result<StreamItem, ClientError>> + Send {
    let state = SseItems {
        messages: sse_messages(body, cancel).boxed(),
        done_marker,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        while let Some(message) = state.messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(err) => return Some((Err(err), state)),
            };
            if state.done {
                continue;
            }
            if is_done_marker(&message.data, &state.done_marker) {
                debug!("received done marker, draining the rest of the stream");
                state.done = true;
                continue;
            }
            return Some((parse_item(message), state));
        }
        None
    })
}

/// Parse one SSE message into an item, surfacing upstream errors.
fn parse_item(message: ServerSentEvent) -> Result<StreamItem, ClientError> {
    let payload: Value = serde_json::from_str(&message.data).map_err(|source| {
        error!(
            event = ?message.event,
            raw = ?message.raw,
            error = %source,
            "could not parse SSE payload"
        );
        ClientError::malformed(source, message.raw.clone())
    })?;

    let has_error = payload.get("error").is_some_and(|error| !error.is_null());
    if has_error || message.event.as_deref() == Some("error") {
        return Err(ClientError::upstream(payload));
    }

    Ok(match message.event {
        Some(event) => StreamItem::Event {
            event,
            data: payload,
        },
        None => StreamItem::Data(payload),
    })
}

struct JsonLineState {
    body: ByteBody,
    cancel: CancellationToken,
    lines: LineDecoder,
    ready: VecDeque<String>,
    finished: bool,
}

fn json_lines(
    body: ByteBody,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Value, ClientError>> + Send {
    let state = JsonLineState {
        body,
        cancel,
        lines: LineDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            while let Some(line) = state.ready.pop_front() {
                if line.is_empty() {
                    continue;
                }
                let parsed = serde_json::from_str(&line).map_err(|source| {
                    error!(line = %line, error = %source, "could not parse JSON line");
                    ClientError::malformed(source, vec![line])
                });
                return Some((parsed, state));
            }
            if state.finished {
                return None;
            }

            match read_chunk(&mut state.body, &state.cancel).await {
                Some(Ok(chunk)) => state.ready.extend(state.lines.decode(chunk)),
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    if !state.cancel.is_cancelled() {
                        state.ready.extend(state.lines.flush());
                    }
                    state.finished = true;
                }
            }
        }
    })
}
