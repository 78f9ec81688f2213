//! Console line value type.

use chrono::{DateTime, Utc};
use std::fmt;

/// One logical line of console output.
///
/// Produced by the reader daemon after telnet decoding and log-interleave
/// repair. Ownership moves from the reader into the line queue and from
/// there to whichever caller dequeues it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    seq: u64,
    text: String,
    received_at: DateTime<Utc>,
}

impl RawLine {
    /// Creates a line stamped with the current time.
    pub fn new(seq: u64, text: impl Into<String>) -> Self {
        Self {
            seq,
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    /// Sequence number assigned by the reader (monotonic per client).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The decoded line text, without line terminator.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// When the reader received the line.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Returns true if the line contains `needle` verbatim.
    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }

    /// Consumes the line and returns its text.
    pub fn into_text(self) -> String {
        self.text
    }
}

impl fmt::Display for RawLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Joins lines into one newline-separated block.
pub fn join_lines(lines: &[RawLine]) -> String {
    lines
        .iter()
        .map(RawLine::text)
        .collect::<Vec<_>>()
        .join("\n")
}
