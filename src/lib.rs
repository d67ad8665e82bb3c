//! # tokenflow - Streaming response decoding
//!
//! A small, pragmatic Rust library that turns incremental HTTP bodies from
//! token-streaming APIs into typed, single-pass async streams.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - Server-Sent Events and newline-delimited JSON bodies
//! - Byte fragments split anywhere, including inside UTF-8 sequences and CRLF pairs
//! - Single-consumption streams with [`EventStream::tee`] for fan-out
//! - Cancellation through a [`CancellationToken`](tokio_util::sync::CancellationToken)
//!   shared with the transport
//!
//! ## Architecture
//!
//! Decoding is layered, each layer usable on its own:
//!
//! 1. **[`ChunkAggregator`]**: groups raw fragments into blank-line terminated blocks
//! 2. **[`LineDecoder`]**: splits bytes into lines on `\n`, `\r\n` or `\r`
//! 3. **[`SseDecoder`]**: turns lines into [`ServerSentEvent`] records
//! 4. **[`EventStream`]**: parses payloads and owns the transport lifecycle
//!
//! ## Example
//! ```no_run
//! use futures::StreamExt;
//! use tokenflow::client::{Fetch, StreamRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let http = reqwest::Client::new();
//!     let request = StreamRequest::post("https://api.example.com/v1/chat/completions")
//!         .json(serde_json::json!({"stream": true}));
//!
//!     let stream = http.stream_sse(request).await?;
//!     let (mut display, mut audit) = stream.tee()?;
//!
//!     let mut items = display.iter()?;
//!     while let Some(item) = items.next().await {
//!         print!("{}", item?.text_delta().unwrap_or_default());
//!     }
//!
//!     let transcript = audit.collect_items().await?;
//!     println!("\n{} chunks", transcript.len());
//!     Ok(())
//! }
//! ```

pub mod chunks;
pub mod client;
pub mod decoder;
pub mod http;
pub mod model;
pub mod options;
pub mod sse;
pub mod stream;

mod sources;
mod tee;

// Re-exports for convenience
pub use chunks::ChunkAggregator;
pub use client::{ClientError, Fetch, StreamRequest};
pub use decoder::LineDecoder;
pub use http::{SSEResponseExt, StreamResponse};
pub use model::{RawChunk, ServerSentEvent, StreamItem};
pub use options::{StreamOptions, TransportOptions};
pub use sse::SseDecoder;
pub use stream::{EventIter, EventStream, JsonLines, StreamPhase};
