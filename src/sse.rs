//! Server-Sent Events (SSE) decoding.
//!
//! SSE format:
//! ```text
//! : comment
//! event: message
//! data: {"key": "value"}
//!
//! data: {"another": "event"}
//!
//! data: [DONE]
//! ```
//!
//! Raw bytes go through [`ChunkAggregator`], then [`LineDecoder`], then
//! [`SseDecoder`].

use std::collections::VecDeque;
use std::mem;

use futures::stream::{self, Stream};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::chunks::ChunkAggregator;
use crate::client::ClientError;
use crate::decoder::LineDecoder;
use crate::http::{read_chunk, ByteBody};
use crate::model::ServerSentEvent;

/// Accumulates SSE field lines into [`ServerSentEvent`] records.
///
/// # Example
/// ```
/// use tokenflow::sse::SseDecoder;
///
/// let mut decoder = SseDecoder::new();
/// assert!(decoder.decode("event: delta").is_none());
/// assert!(decoder.decode("data: {\"a\":1}").is_none());
///
/// let event = decoder.decode("").unwrap();
/// assert_eq!(event.event.as_deref(), Some("delta"));
/// assert_eq!(event.data, "{\"a\":1}");
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
    raw: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (terminator already stripped).
    ///
    /// Returns a complete event on a blank line that follows at least one
    /// `event` or `data` field.
    pub fn decode(&mut self, line: &str) -> Option<ServerSentEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            return Some(ServerSentEvent {
                event: self.event.take(),
                data: mem::take(&mut self.data).join("\n"),
                raw: mem::take(&mut self.raw),
            });
        }

        self.raw.push(line.to_string());

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Check if an SSE data payload marks the end of the stream.
///
/// # Example
/// ```
/// use tokenflow::sse::is_done_marker;
///
/// assert!(is_done_marker("[DONE]", "[DONE]"));
/// assert!(!is_done_marker("", "[DONE]"));
/// assert!(!is_done_marker("{\"data\": \"value\"}", "[DONE]"));
/// ```
pub fn is_done_marker(data: &str, marker: &str) -> bool {
    data.starts_with(marker)
}

struct MessageState {
    body: ByteBody,
    cancel: CancellationToken,
    chunks: ChunkAggregator,
    lines: LineDecoder,
    decoder: SseDecoder,
    ready: VecDeque<ServerSentEvent>,
    finished: bool,
}

impl MessageState {
    fn feed(&mut self, segment: &[u8]) {
        for line in self.lines.decode(segment) {
            self.feed_line(&line);
        }
    }

    fn feed_line(&mut self, line: &str) {
        if let Some(event) = self.decoder.decode(line) {
            trace!(event = ?event.event, bytes = event.data.len(), "decoded SSE event");
            self.ready.push_back(event);
        }
    }

    fn finish(&mut self) {
        if let Some(rest) = self.chunks.finish() {
            self.feed(&rest);
        }
        for line in self.lines.flush() {
            self.feed_line(&line);
        }
        self.finished = true;
    }
}

/// Decode a raw body into Server-Sent Events.
///
/// Ends quietly when `cancel` fires, discarding any buffered partial input.
/// An event left without a terminating blank line at end of input is
/// discarded.
pub fn sse_messages(
    body: ByteBody,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<ServerSentEvent, ClientError>> + Send {
    let state = MessageState {
        body,
        cancel,
        chunks: ChunkAggregator::new(),
        lines: LineDecoder::new(),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            match read_chunk(&mut state.body, &state.cancel).await {
                Some(Ok(chunk)) => {
                    for segment in state.chunks.push(chunk) {
                        state.feed(&segment);
                    }
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None if state.cancel.is_cancelled() => state.finished = true,
                None => state.finish(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::byte_body;
    use futures::StreamExt;
    use std::convert::Infallible;

    fn decode_lines(lines: &[&str]) -> Vec<ServerSentEvent> {
        let mut decoder = SseDecoder::new();
        lines.iter().filter_map(|line| decoder.decode(line)).collect()
    }

    async fn collect_events(fragments: Vec<Vec<u8>>) -> Vec<ServerSentEvent> {
        let body = byte_body(stream::iter(fragments.into_iter().map(Ok::<_, Infallible>)));
        sse_messages(body, CancellationToken::new())
            .map(|event| event.unwrap())
            .collect()
            .await
    }

    #[test]
    fn test_event_and_data_fields() {
        let events = decode_lines(&["event: x", "data: {\"b\":2}", ""]);
        assert_eq!(
            events,
            vec![ServerSentEvent {
                event: Some("x".to_string()),
                data: "{\"b\":2}".to_string(),
                raw: vec!["event: x".to_string(), "data: {\"b\":2}".to_string()],
            }]
        );
    }

    #[test]
    fn test_multiple_data_lines_are_joined() {
        let events = decode_lines(&["data: one", "data:two", "data:  three", ""]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo\n three");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn test_comments_and_stray_blank_lines() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode("").is_none());
        assert!(decoder.decode(": keep-alive").is_none());
        assert!(decoder.decode("").is_none());
        assert!(decoder.decode("data: a").is_none());

        let event = decoder.decode("").unwrap();
        assert_eq!(event.data, "a");
        assert_eq!(event.raw, vec![": keep-alive", "data: a"]);
    }

    #[test]
    fn test_trailing_cr_and_unknown_fields() {
        let events = decode_lines(&["id: 7\r", "retry: 100", "data\r", "data: x\r", "\r"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "\nx");
        assert_eq!(events[0].raw, vec!["id: 7", "retry: 100", "data", "data: x"]);
    }

    #[test]
    fn test_event_without_data() {
        let events = decode_lines(&["event: ping", "", "event: a", "event: b", ""]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[0].data, "");
        assert_eq!(events[1].event.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_block_split_invariance() {
        let input = b"event: delta\r\ndata: {\"t\":\"h\xc3\xa9\"}\r\n\r\n: c\n\ndata: 1\ndata: 2\r\rdata: 3\n\n";
        let whole = collect_events(vec![input.to_vec()]).await;
        assert_eq!(whole.len(), 3);
        assert_eq!(whole[0].data, "{\"t\":\"hé\"}");
        assert_eq!(whole[1].data, "1\n2");
        assert_eq!(whole[2].data, "3");

        for first in 0..=input.len() {
            for second in (first..=input.len()).step_by(5) {
                let fragments = vec![
                    input[..first].to_vec(),
                    input[first..second].to_vec(),
                    input[second..].to_vec(),
                ];
                assert_eq!(collect_events(fragments).await, whole, "splits at {first}/{second}");
            }
        }
    }

    #[tokio::test]
    async fn test_unterminated_event_is_dropped() {
        let events = collect_events(vec![b"data: 1\n\ndata: 2".to_vec()]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "1");
    }

    #[tokio::test]
    async fn test_abort_ends_stream_quietly() {
        let first = stream::iter(vec![Ok::<_, Infallible>("data: 1\n\n")]);
        let body = byte_body(first.chain(stream::pending()));
        let cancel = CancellationToken::new();
        let mut events = Box::pin(sse_messages(body, cancel.clone()));

        assert_eq!(events.next().await.unwrap().unwrap().data, "1");
        cancel.cancel();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_abort_discards_buffered_residue() {
        // the residue would complete a block if flushed at end of input
        let first = stream::iter(vec![Ok::<_, Infallible>("data: 1\n\ndata: x\r\n\r")]);
        let body = byte_body(first.chain(stream::pending()));
        let cancel = CancellationToken::new();
        let mut events = Box::pin(sse_messages(body, cancel.clone()));

        assert_eq!(events.next().await.unwrap().unwrap().data, "1");
        cancel.cancel();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_residue_flushed_at_natural_end() {
        let events = collect_events(vec![b"data: 1\n\ndata: x\r\n\r".to_vec()]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "x");
    }
}
