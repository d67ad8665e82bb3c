//! HTTP response adapters.
//!
//! This module normalizes transport bodies into [`RawChunk`] streams once, at
//! the boundary, and provides cancellation-aware reads over them.

use std::collections::HashMap;
use std::fmt;

use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::RequestBuilder;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ClientError;
use crate::model::{RawChunk, StreamItem};
use crate::stream::EventStream;

/// A transport body normalized to raw chunks.
pub type ByteBody = BoxStream<'static, Result<RawChunk, ClientError>>;

/// Normalize any stream of byte or text fragments into a [`ByteBody`].
pub fn byte_body<S, C, E>(body: S) -> ByteBody
where
    S: Stream<Item = Result<C, E>> + Send + 'static,
    C: Into<RawChunk>,
    E: Into<ClientError>,
{
    body.map(|chunk| -> Result<RawChunk, ClientError> {
        chunk.map(Into::into).map_err(Into::into)
    })
    .boxed()
}

/// A response-like object: headers and an optional readable body.
pub struct StreamResponse {
    pub headers: HeaderMap,
    pub body: Option<ByteBody>,
}

impl StreamResponse {
    pub fn new<S, C, E>(headers: HeaderMap, body: S) -> Self
    where
        S: Stream<Item = Result<C, E>> + Send + 'static,
        C: Into<RawChunk>,
        E: Into<ClientError>,
    {
        Self {
            headers,
            body: Some(byte_body(body)),
        }
    }

    /// A response whose body cannot be read.
    pub fn without_body(headers: HeaderMap) -> Self {
        Self {
            headers,
            body: None,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Check whether the response declares a `text/event-stream` body.
    pub fn is_event_stream(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.trim_start().starts_with("text/event-stream"))
    }
}

impl fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResponse")
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(|_| ".."))
            .finish()
    }
}

impl From<reqwest::Response> for StreamResponse {
    fn from(response: reqwest::Response) -> Self {
        let headers = response.headers().clone();
        Self::new(headers, response.bytes_stream())
    }
}

/// Read the next chunk, ending the body quietly once `cancel` fires.
///
/// Errors the transport raises after cancellation are the abort itself and
/// are swallowed.
pub(crate) async fn read_chunk(
    body: &mut ByteBody,
    cancel: &CancellationToken,
) -> Option<Result<RawChunk, ClientError>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("transport aborted, ending stream");
            None
        }
        next = body.next() => match next {
            Some(Err(err)) if cancel.is_cancelled() => {
                debug!(error = %err, "ignoring transport error after abort");
                None
            }
            other => other,
        },
    }
}

/// Add extra headers to a request if specified in transport options.
///
/// # Example
/// ```ignore
/// let mut req = client.post(url);
/// req = add_extra_headers(req, &transport_options.extra_headers);
/// ```
pub fn add_extra_headers(
    mut request: RequestBuilder,
    extra_headers: &Option<HashMap<String, String>>,
) -> RequestBuilder {
    if let Some(headers) = extra_headers {
        for (key, value) in headers {
            request = request.header(key, value);
        }
    }
    request
}

/// Extension trait for `reqwest::Response` to decode streaming bodies.
///
/// Each stream gets its own cancellation handle, reachable through
/// [`EventStream::cancellation_handle`].
///
/// # Example
/// ```ignore
/// use tokenflow::http::SSEResponseExt;
///
/// let response = client.get("https://api.example.com/stream").send().await?;
///
/// let mut stream = response.sse()?;
/// let mut items = stream.iter()?;
/// while let Some(item) = items.next().await {
///     println!("Item: {:?}", item?);
/// }
/// ```
pub trait SSEResponseExt {
    /// Decode the body as Server-Sent Events carrying JSON payloads.
    fn sse(self) -> Result<EventStream<StreamItem>, ClientError>;

    /// Decode the body as newline-delimited JSON.
    fn json_lines(self) -> EventStream<Value>;
}

impl SSEResponseExt for reqwest::Response {
    fn sse(self) -> Result<EventStream<StreamItem>, ClientError> {
        EventStream::from_sse_response(self, CancellationToken::new())
    }

    fn json_lines(self) -> EventStream<Value> {
        EventStream::from_readable_stream(self.bytes_stream(), CancellationToken::new())
    }
}
