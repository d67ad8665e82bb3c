//! Incremental line decoding over arbitrary byte and text fragments.
//!
//! Lines may be terminated by `\n`, `\r` or `\r\n`. A terminator split
//! across two fragments (a trailing `\r` followed by a leading `\n`) is
//! recognised as a single `\r\n`.

use std::mem;

const REPLACEMENT_CHARACTER: char = '\u{FFFD}';

/// Streaming UTF-8 decoder.
///
/// Holds back an incomplete multi-byte sequence at the end of a fragment until
/// the next fragment completes it. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        let joined: Vec<u8>;
        let mut input = if self.pending.is_empty() {
            bytes
        } else {
            self.pending.extend_from_slice(bytes);
            joined = mem::take(&mut self.pending);
            &joined[..]
        };

        let mut out = String::with_capacity(input.len());
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        None => {
                            // Truncated sequence, wait for the rest of it.
                            self.pending.extend_from_slice(rest);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Decode whatever is still held back at end of input.
    fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        String::from_utf8_lossy(&mem::take(&mut self.pending)).into_owned()
    }
}

/// Turns arbitrary fragments into complete text lines.
///
/// # Example
/// ```
/// use tokenflow::decoder::LineDecoder;
///
/// let mut decoder = LineDecoder::new();
/// assert_eq!(decoder.decode("data: a\r"), Vec::<String>::new());
/// assert_eq!(decoder.decode("\ndata: b"), vec!["data: a"]);
/// assert_eq!(decoder.flush(), vec!["data: b"]);
/// ```
#[derive(Debug, Default)]
pub struct LineDecoder {
    utf8: Utf8Decoder,
    buffer: String,
    /// A `\r` ended the previous fragment; it may be the first half of `\r\n`.
    pending_cr: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a fragment, returning every line it completes.
    ///
    /// A fragment without a terminator is buffered and yields nothing.
    pub fn decode(&mut self, chunk: impl AsRef<[u8]>) -> Vec<String> {
        let text = self.utf8.decode(chunk.as_ref());
        self.push_text(&text)
    }

    /// Emit the residual buffered text as a final line.
    ///
    /// A deferred bare `\r` terminates the buffered line, which is emitted
    /// exactly once (even if empty). Without a deferred `\r`, an empty buffer
    /// yields nothing.
    pub fn flush(&mut self) -> Vec<String> {
        let tail = self.utf8.finish();
        let mut lines = self.push_text(&tail);
        if mem::take(&mut self.pending_cr) || !self.buffer.is_empty() {
            lines.push(mem::take(&mut self.buffer));
        }
        lines
    }

    fn push_text(&mut self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        if text.is_empty() {
            return lines;
        }

        let mut rest = text;
        if mem::take(&mut self.pending_cr) {
            lines.push(mem::take(&mut self.buffer));
            rest = rest.strip_prefix('\n').unwrap_or(rest);
        }

        while let Some(pos) = rest.find(|c: char| c == '\r' || c == '\n') {
            self.buffer.push_str(&rest[..pos]);
            let terminator = rest.as_bytes()[pos];
            rest = &rest[pos + 1..];

            if terminator == b'\r' {
                if rest.is_empty() {
                    self.pending_cr = true;
                    return lines;
                }
                rest = rest.strip_prefix('\n').unwrap_or(rest);
            }
            lines.push(mem::take(&mut self.buffer));
        }

        self.buffer.push_str(rest);
        lines
    }
}
