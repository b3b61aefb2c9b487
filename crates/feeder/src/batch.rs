//! Multi-line sends.
//!
//! A batch is an ordered set of lines that succeeds or fails as a unit. It is sent
//! through the send queue as a single request, so the next line only goes out once the
//! previous one is acknowledged and nothing after a failed line is ever transmitted.
//! The response of a batch is the payload of its last ack; earlier payloads only gate
//! progress.

use crate::error::SendError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    lines: Vec<String>,
}

impl Batch {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Batch {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn single(line: impl Into<String>) -> Self {
        Batch {
            lines: vec![line.into()],
        }
    }

    /// Builds a batch from a script, one command per line. Blank lines are skipped and
    /// trailing whitespace (including `\r`) is trimmed.
    pub fn from_script(text: &str) -> Self {
        Batch::new(
            text.lines()
                .map(str::trim_end)
                .filter(|l| !l.trim_start().is_empty()),
        )
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Checks that the batch can be sent: it has at least one line, and each line is a
    /// single protocol line.
    pub fn validate(&self) -> Result<(), SendError> {
        if self.lines.is_empty() {
            return Err(SendError::EmptyBatch);
        }
        if let Some(bad) = self.lines.iter().find(|l| l.contains(['\n', '\r'])) {
            return Err(SendError::InvalidLine(bad.clone()));
        }
        Ok(())
    }
}

impl From<&str> for Batch {
    fn from(line: &str) -> Self {
        Batch::single(line)
    }
}

impl From<String> for Batch {
    fn from(line: String) -> Self {
        Batch::single(line)
    }
}

impl From<Vec<String>> for Batch {
    fn from(lines: Vec<String>) -> Self {
        Batch { lines }
    }
}
