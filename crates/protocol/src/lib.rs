#![cfg_attr(not(test), no_std)]

//! The line protocol spoken between the host and the laser controller.
//!
//! Every host-originated line must be acknowledged by the device before the next one is
//! sent. Acknowledgments start with [`ACK_MARKER`], optionally followed by a response.
//! Anything else the device says is an unsolicited message.

extern crate alloc;

mod framing;

pub use framing::{frame_line, LineBuffer, LineError, MAX_LINE_LEN};

/// Prefix reserved for acknowledgment lines.
pub const ACK_MARKER: char = '*';

/// A classified device-originated line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Incoming<'a> {
    /// Resolves the in-flight line. The payload is empty for a bare `*`.
    Ack(&'a str),
    /// Not associated with anything we sent.
    Unsolicited(&'a str),
}

/// Does this line carry the acknowledgment marker?
pub fn is_ack_line(line: &str) -> bool {
    line.starts_with(ACK_MARKER)
}

/// Classifies one received line.
///
/// A marker line only counts as an ack while we are waiting for one. Otherwise the whole
/// line, marker included, is unsolicited.
pub fn classify(line: &str, awaiting_ack: bool) -> Incoming<'_> {
    match line.strip_prefix(ACK_MARKER) {
        Some(payload) if awaiting_ack => Incoming::Ack(payload),
        _ => Incoming::Unsolicited(line),
    }
}
