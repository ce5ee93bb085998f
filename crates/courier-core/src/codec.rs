//! Newline-delimited JSON framing for the courier wire protocol.
//!
//! Wire format: `<JSON object>\n` (a trailing `\r` before the newline is
//! tolerated).

use crate::error::{CourierError, CourierResult};

/// Default upper bound on a single line (64 KiB).
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Encode a serializable value as one newline-terminated JSON line.
pub fn line_encode<T: serde::Serialize>(value: &T) -> CourierResult<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one line (with or without its terminator) into a typed value.
pub fn line_decode<T: serde::de::DeserializeOwned>(line: &[u8]) -> CourierResult<T> {
    let trimmed = strip_terminator(line);
    if trimmed.iter().all(u8::is_ascii_whitespace) {
        return Err(CourierError::Protocol("empty line".into()));
    }
    Ok(serde_json::from_slice(trimmed)?)
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Streaming line splitter: accumulates bytes and yields complete lines.
///
/// A line longer than the configured maximum is reported once as a
/// protocol error and skipped up to its terminating newline; later lines
/// are unaffected.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line: usize,
    /// Inside an oversized line, dropping bytes until the next newline.
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl LineDecoder {
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Append raw bytes read from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete line (terminator stripped).
    ///
    /// Returns `None` when more bytes are needed.
    pub fn next_line(&mut self) -> Option<CourierResult<Vec<u8>>> {
        loop {
            let newline = self.buffer.iter().position(|&b| b == b'\n');

            if self.discarding {
                match newline {
                    Some(pos) => {
                        self.buffer.drain(..=pos);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.buffer.clear();
                        return None;
                    }
                }
            }

            return match newline {
                Some(pos) if self.content_len(pos) > self.max_line => {
                    self.buffer.drain(..=pos);
                    Some(Err(self.too_long()))
                }
                Some(pos) => {
                    let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                    Some(Ok(strip_terminator(&line).to_vec()))
                }
                None if self.content_len(self.buffer.len()) > self.max_line => {
                    self.buffer.clear();
                    self.discarding = true;
                    Some(Err(self.too_long()))
                }
                None => None,
            };
        }
    }

    /// Length of the first `end` buffered bytes without a trailing `\r`,
    /// which belongs to the terminator.
    fn content_len(&self, end: usize) -> usize {
        match end.checked_sub(1) {
            Some(last) if self.buffer[last] == b'\r' => last,
            _ => end,
        }
    }

    fn too_long(&self) -> CourierError {
        CourierError::Protocol(format!("line exceeds {} bytes", self.max_line))
    }

    /// Number of bytes buffered but not yet returned.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
