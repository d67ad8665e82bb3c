//! Options structures for stream decoding and transport configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default payload prefix that ends the logical item sequence.
pub const DEFAULT_DONE_MARKER: &str = "[DONE]";

/// Default tee backlog length at which a warning is logged.
pub const DEFAULT_TEE_BACKLOG_WARNING: usize = 1024;

/// Decoding options for an [`EventStream`](crate::stream::EventStream).
///
/// Every field has a default, so a partial config deserializes cleanly.
///
/// # Example
/// ```rust
/// use tokenflow::options::StreamOptions;
///
/// let options: StreamOptions = serde_json::from_str(r#"{"tee_backlog_warning": null}"#).unwrap();
/// assert_eq!(options.done_marker, "[DONE]");
/// assert_eq!(options.tee_backlog_warning, None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// SSE `data` prefix that ends the item sequence without error
    pub done_marker: String,

    /// Backlog length at which a lagging tee branch logs a warning.
    /// The backlog itself is never bounded.
    pub tee_backlog_warning: Option<usize>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            done_marker: DEFAULT_DONE_MARKER.to_string(),
            tee_backlog_warning: Some(DEFAULT_TEE_BACKLOG_WARNING),
        }
    }
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the done marker.
    pub fn with_done_marker(mut self, marker: impl Into<String>) -> Self {
        self.done_marker = marker.into();
        self
    }

    /// Set the tee backlog warning threshold, or disable it with `None`.
    pub fn with_tee_backlog_warning(mut self, threshold: Option<usize>) -> Self {
        self.tee_backlog_warning = threshold;
        self
    }
}

/// Transport options applied by the bundled [`Fetch`](crate::client::Fetch)
/// implementation.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Request timeout
    pub timeout: Option<Duration>,

    /// Additional HTTP headers to include in requests
    pub extra_headers: Option<HashMap<String, String>>,
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set extra headers.
    pub fn with_extra_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.extra_headers = Some(headers);
        self
    }

    /// Add a single extra header.
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.extra_headers
            .get_or_insert_with(HashMap::new)
            .insert(key, value);
        self
    }
}
