//! NDJSON line framing for agent streams.
//!
//! [`LineCodec`] is the line framer: the [`FramedRead`](tokio_util::codec::FramedRead)
//! buffer carries any incomplete trailing fragment across reads, and each call
//! to [`Decoder::decode`] yields at most one complete `\n`-terminated line.
//!
//! Decoding never fails on content. Lines longer than the configured limit are
//! discarded up to the next newline and surfaced as [`Line::Oversized`], so one
//! bad line cannot terminate the stream. UTF-8 and JSON validity are checked
//! later by the reader, per line.
//!
//! On the outbound side, [`LineCodec`] serialises a [`serde_json::Value`] to a
//! single line, escapes U+2028 / U+2029 (which line-oriented peers treat as
//! line breaks), and appends `\n`.

use std::borrow::Cow;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::{AppError, Result};

/// Default maximum inbound line length: 8 MiB.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

const LINE_SEPARATOR: char = '\u{2028}';
const PARAGRAPH_SEPARATOR: char = '\u{2029}';

/// One decoded unit of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A complete line, without its terminator (`\n` or `\r\n`).
    Complete(Bytes),
    /// A line longer than the limit; `usize` is the number of bytes discarded.
    Oversized(usize),
}

/// NDJSON codec with a maximum inbound line length.
#[derive(Debug)]
pub struct LineCodec {
    max_length: usize,
    /// Offset up to which the buffer has already been scanned for `\n`.
    next_index: usize,
    /// Bytes dropped so far while skipping an oversized line.
    discarding: Option<usize>,
}

impl LineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom inbound line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: None,
        }
    }

    /// Inbound line limit in bytes.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Line>> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            if let Some(dropped) = self.discarding {
                match newline {
                    Some(idx) => {
                        src.advance(idx + 1);
                        self.next_index = 0;
                        self.discarding = None;
                        return Ok(Some(Line::Oversized(dropped + idx)));
                    }
                    None => {
                        let len = src.len();
                        src.advance(len);
                        self.next_index = 0;
                        self.discarding = Some(dropped + len);
                        return Ok(None);
                    }
                }
            }

            match newline {
                Some(idx) if idx <= self.max_length => {
                    self.next_index = 0;
                    let mut line = src.split_to(idx + 1);
                    line.truncate(idx);
                    if line.last() == Some(&b'\r') {
                        line.truncate(idx - 1);
                    }
                    return Ok(Some(Line::Complete(line.freeze())));
                }
                Some(_) => {
                    // Terminated but too long: drop it through the newline.
                    self.discarding = Some(0);
                }
                None if src.len() > self.max_length => {
                    self.discarding = Some(0);
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Line>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        if let Some(dropped) = self.discarding.take() {
            self.next_index = 0;
            return Ok((dropped > 0).then_some(Line::Oversized(dropped)));
        }

        if src.is_empty() {
            return Ok(None);
        }

        // Unterminated trailing fragment at EOF is still a line.
        self.next_index = 0;
        let len = src.len();
        let line = src.split_to(len);
        Ok(Some(Line::Complete(line.freeze())))
    }
}

impl Encoder<Value> for LineCodec {
    type Error = AppError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        let line = encode_line(&item)?;
        dst.reserve(line.len());
        dst.put_slice(line.as_bytes());
        Ok(())
    }
}

/// Serialise `frame` as one `\n`-terminated wire line.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if serialisation fails.
pub fn encode_line(frame: &Value) -> Result<String> {
    let json = serde_json::to_string(frame)
        .map_err(|e| AppError::Protocol(format!("failed to serialise outbound frame: {e}")))?;
    let mut line = escape_line_terminators(&json).into_owned();
    line.push('\n');
    Ok(line)
}

/// Replace raw U+2028 / U+2029 in serialised JSON with their `\uXXXX` escapes.
///
/// Both code points can only occur inside JSON string literals, where the
/// escape decodes to the identical character.
#[must_use]
pub fn escape_line_terminators(json: &str) -> Cow<'_, str> {
    if !json.contains([LINE_SEPARATOR, PARAGRAPH_SEPARATOR]) {
        return Cow::Borrowed(json);
    }

    let mut out = String::with_capacity(json.len() + 8);
    for ch in json.chars() {
        match ch {
            LINE_SEPARATOR => out.push_str("\\u2028"),
            PARAGRAPH_SEPARATOR => out.push_str("\\u2029"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}
