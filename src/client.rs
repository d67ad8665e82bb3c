//! Core error type and the generic request/response interface.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::http::{add_extra_headers, StreamResponse};
use crate::model::StreamItem;
use crate::options::{StreamOptions, TransportOptions};
use crate::stream::EventStream;

/// Errors that can occur while reading or decoding a stream.
///
/// Sources are reference counted so a teed stream can deliver the same error
/// to both of its branches.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[source] Arc<reqwest::Error>),

    #[error("Transport error: {0}")]
    Transport(#[source] Arc<dyn std::error::Error + Send + Sync>),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// A `data:` payload or a JSON line could not be parsed.
    #[error("Could not parse stream payload: {source}")]
    Malformed {
        #[source]
        source: Arc<serde_json::Error>,
        /// The raw lines the payload was decoded from
        raw: Vec<String>,
    },

    /// The upstream service reported an error inside the stream.
    #[error("{message}")]
    Upstream { message: String, payload: Value },

    #[error("JSON serialization error: {0}")]
    Serialize(#[source] Arc<serde_json::Error>),

    #[error("Stream has already been consumed; use tee() to iterate it more than once")]
    AlreadyConsumed,

    #[error("Response has no body")]
    EmptyBody,
}

impl ClientError {
    /// Wrap any transport-level error.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ClientError::Transport(Arc::new(err))
    }

    pub(crate) fn malformed(source: serde_json::Error, raw: Vec<String>) -> Self {
        ClientError::Malformed {
            source: Arc::new(source),
            raw,
        }
    }

    /// Build an upstream error from a payload that carries an `error` field.
    ///
    /// The message is the `error` string itself, or its `message` when it is
    /// an object.
    pub(crate) fn upstream(payload: Value) -> Self {
        let message = match payload.get("error") {
            Some(Value::String(message)) => message.clone(),
            Some(Value::Object(error)) => error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| Value::Object(error.clone()).to_string()),
            Some(other) if !other.is_null() => other.to_string(),
            _ => payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Upstream reported an error")
                .to_owned(),
        };
        ClientError::Upstream { message, payload }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Http(Arc::new(err))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::transport(err)
    }
}

impl From<Infallible> for ClientError {
    fn from(err: Infallible) -> Self {
        match err {}
    }
}

/// A streaming request handed to a [`Fetch`] implementation.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub method: Method,
    pub url: String,

    /// JSON request body
    pub body: Option<Value>,

    pub transport: TransportOptions,

    /// Decoding options for the resulting stream
    pub options: StreamOptions,
}

impl StreamRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            transport: TransportOptions::default(),
            options: StreamOptions::default(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Set the JSON body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }
}

/// Fetch-like primitive that turns a request into a streaming response.
///
/// Implement this for whatever transport the application uses; the provided
/// methods wire the response into an [`EventStream`] with a fresh
/// cancellation handle.
///
/// # Example
/// ```rust,ignore
/// use futures::StreamExt;
/// use tokenflow::client::{Fetch, StreamRequest};
///
/// let http = reqwest::Client::new();
/// let request = StreamRequest::post("https://api.example.com/v1/run")
///     .json(serde_json::json!({"stream": true}));
///
/// let mut stream = http.stream_sse(request).await?;
/// let mut items = stream.iter()?;
/// while let Some(item) = items.next().await {
///     print!("{}", item?.text_delta().unwrap_or_default());
/// }
/// ```
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Send the request and return the response without reading its body.
    async fn fetch(&self, request: StreamRequest) -> Result<StreamResponse, ClientError>;

    /// Send the request and decode its body as Server-Sent Events.
    async fn stream_sse(
        &self,
        request: StreamRequest,
    ) -> Result<EventStream<StreamItem>, ClientError> {
        let options = request.options.clone();
        let response = self.fetch(request).await?;
        EventStream::from_sse_response_with_options(response, CancellationToken::new(), options)
    }

    /// Send the request and decode its body as newline-delimited JSON.
    async fn stream_json_lines(
        &self,
        request: StreamRequest,
    ) -> Result<EventStream<Value>, ClientError> {
        let options = request.options.clone();
        let cancel = CancellationToken::new();
        let Some(body) = self.fetch(request).await?.body else {
            cancel.cancel();
            return Err(ClientError::EmptyBody);
        };
        Ok(EventStream::from_readable_stream(body, cancel).with_options(options))
    }
}

#[async_trait]
impl Fetch for reqwest::Client {
    async fn fetch(&self, request: StreamRequest) -> Result<StreamResponse, ClientError> {
        let mut req = self.request(request.method.clone(), &request.url);

        if let Some(timeout) = request.transport.timeout {
            req = req.timeout(timeout);
        }

        req = add_extra_headers(req, &request.transport.extra_headers);

        if let Some(body) = &request.body {
            req = req.json(body);
        }

        debug!(method = %request.method, url = %request.url, "sending streaming request");
        let response = req.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.into())
    }
}
