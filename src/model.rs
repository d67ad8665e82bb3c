//! Common data models for decoded stream records.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// A single fragment read from a transport body.
///
/// Text and byte fragments are both fed through the same incremental UTF-8
/// decoder, so a multi-byte sequence may be split across fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChunk {
    Text(String),
    Bytes(Bytes),
}

impl RawChunk {
    /// Get the fragment as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RawChunk::Text(text) => text.as_bytes(),
            RawChunk::Bytes(bytes) => bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl AsRef<[u8]> for RawChunk {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl From<String> for RawChunk {
    fn from(text: String) -> Self {
        RawChunk::Text(text)
    }
}

impl From<&str> for RawChunk {
    fn from(text: &str) -> Self {
        RawChunk::Text(text.to_string())
    }
}

impl From<Bytes> for RawChunk {
    fn from(bytes: Bytes) -> Self {
        RawChunk::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RawChunk {
    fn from(bytes: Vec<u8>) -> Self {
        RawChunk::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for RawChunk {
    fn from(bytes: &'static [u8]) -> Self {
        RawChunk::Bytes(Bytes::from_static(bytes))
    }
}

/// A single Server-Sent Event record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerSentEvent {
    /// Last `event:` value seen in the block, if any
    pub event: Option<String>,

    /// Every `data:` value of the block joined with `\n`
    pub data: String,

    /// All lines that contributed to this event, kept for diagnostics
    pub raw: Vec<String>,
}

/// Application-level item produced by the SSE path.
///
/// Serializes as the bare payload, or as `{"event": ..., "data": ...}` when
/// the block carried an event name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamItem {
    /// Payload tagged with its SSE event name
    Event { event: String, data: Value },

    /// Untagged payload
    Data(Value),
}

impl StreamItem {
    /// Get the SSE event name, if the item was tagged with one.
    pub fn event(&self) -> Option<&str> {
        match self {
            StreamItem::Event { event, .. } => Some(event),
            StreamItem::Data(_) => None,
        }
    }

    /// Get the parsed payload.
    pub fn data(&self) -> &Value {
        match self {
            StreamItem::Event { data, .. } | StreamItem::Data(data) => data,
        }
    }

    pub fn into_data(self) -> Value {
        match self {
            StreamItem::Event { data, .. } | StreamItem::Data(data) => data,
        }
    }

    /// Locate the incremental text of a chat completion chunk
    /// (`choices[0].delta.content`).
    ///
    /// # Example
    /// ```
    /// use serde_json::json;
    /// use tokenflow::model::StreamItem;
    ///
    /// let item = StreamItem::Data(json!({"choices": [{"delta": {"content": "Hi"}}]}));
    /// assert_eq!(item.text_delta(), Some("Hi"));
    /// ```
    pub fn text_delta(&self) -> Option<&str> {
        self.data()
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
    }
}
