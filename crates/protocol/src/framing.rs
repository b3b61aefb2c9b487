use alloc::{string::String, vec::Vec};
use core::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineError {
    /// The line has an embedded `\n` or `\r`, so the device would see more than one line
    /// (and send more than one ack).
    EmbeddedNewline,
    /// An inbound line ran past the buffer's limit and was dropped.
    TooLong,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineError::EmbeddedNewline => f.write_str("line contains a line break"),
            LineError::TooLong => f.write_str("line is too long"),
        }
    }
}

/// The bytes to put on the wire for one outbound line.
pub fn frame_line(line: &str) -> Result<Vec<u8>, LineError> {
    if line.contains(['\n', '\r']) {
        return Err(LineError::EmbeddedNewline);
    }
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    Ok(buf)
}

/// Longest inbound line kept by default, not counting the `\n`.
pub const MAX_LINE_LEN: usize = 512;

/// Reassembles newline-delimited lines from arbitrarily sized chunks.
///
/// BLE notifications carry at most a handful of bytes, so a single device line usually
/// arrives in pieces. A `\r` immediately before the `\n` is dropped. Invalid UTF-8 is
/// replaced rather than rejected.
///
/// A line longer than the limit (counting any `\r`) is reported once as
/// [`LineError::TooLong`], and everything up to the next `\n` is thrown away.
#[derive(Clone, Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_len: usize,
    // Skipping the rest of an over-long line.
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_len(MAX_LINE_LEN)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_len(max_len: usize) -> Self {
        LineBuffer {
            buf: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, LineError>> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                if core::mem::replace(&mut self.discarding, false) {
                    continue;
                }
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
                lines.push(Ok(String::from_utf8_lossy(&self.buf).into_owned()));
                self.buf.clear();
            } else if self.discarding {
                continue;
            } else if self.buf.len() >= self.max_len {
                self.buf.clear();
                self.discarding = true;
                lines.push(Err(LineError::TooLong));
            } else {
                self.buf.push(b);
            }
        }
        lines
    }

    /// Bytes of an incomplete line.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Forgets any partial line, e.g. after the connection drops.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }
}
