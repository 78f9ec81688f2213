//! Log-interleave repair for console lines.
//!
//! A kernel or system logger writing straight to the console device can
//! land a complete `[   12.345678] message` line in the middle of a line the
//! shell is printing. What arrives on the wire is
//!
//! ```text
//! root@dut:~# echo HE[   12.345678] usb 1-1: new high-speed USB device
//! LLO
//! ```
//!
//! [`LineRepairer`] splits such a line into a head (`root@dut:~# echo HE`)
//! and a fragment (`[   12.345678] usb …`), waits for the next line (the
//! tail, `LLO`) and reassembles:
//!
//! - tail starts with a bracketed timestamp: the interleave happened at a
//!   line boundary, so head, fragment and tail are three separate lines
//! - otherwise `head + tail` is the logical line, emitted first, followed
//!   by the fragment on its own
//!
//! When the head is exactly one of the configured prompts the console was
//! idle, no tail is coming, and head and fragment are emitted at once.
//!
//! This is a heuristic. Genuine output that prints a bracketed timestamp
//! after other text on the same line will be treated as interleaved.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

/// Kernel `printk` timestamp: `[    1.234567]`.
const TIMESTAMP_PATTERN: &str = r"\[\s*\d+\.\d+\]";

/// Compiled once; `None` only if the pattern fails to compile, in which
/// case no line is ever treated as interleaved.
fn timestamp_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TIMESTAMP_PATTERN).ok()).as_ref()
}

/// Returns true if the line (ignoring leading whitespace) starts with a
/// bracketed timestamp.
pub fn starts_with_timestamp(line: &str) -> bool {
    let trimmed = line.trim_start();
    timestamp_regex()
        .and_then(|re| re.find(trimmed))
        .is_some_and(|m| m.start() == 0)
}

/// Byte offset where an interleaved fragment starts, if the line looks
/// corrupted.
///
/// A line qualifies when it does not itself start with a timestamp and a
/// timestamp appears after non-whitespace text.
pub fn find_interleave(line: &str) -> Option<usize> {
    if starts_with_timestamp(line) {
        return None;
    }
    timestamp_regex()?
        .find_iter(line)
        .map(|m| m.start())
        .find(|&start| start > 0 && !line[..start].trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    head: String,
    fragment: String,
}

/// Stateful repairer fed with decoded lines, one at a time.
#[derive(Debug, Default)]
pub struct LineRepairer {
    prompts: Vec<String>,
    pending: Option<Pending>,
    repaired: u64,
}

impl LineRepairer {
    /// Creates a repairer that recognises the given prompts as idle heads.
    pub fn new(prompts: &[String]) -> Self {
        Self {
            prompts: prompts
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            pending: None,
            repaired: 0,
        }
    }

    /// Feeds one decoded line and returns the logical lines now complete.
    pub fn push(&mut self, line: String) -> Vec<String> {
        let mut out = Vec::new();

        match self.pending.take() {
            Some(pending) if starts_with_timestamp(&line) => {
                debug!(head = %pending.head, "Interleave at line boundary");
                out.push(pending.head);
                out.push(pending.fragment);
                self.scan(line, &mut out);
            }
            Some(pending) => {
                let combined = pending.head + &line;
                self.repaired += 1;
                debug!(line = %combined, "Repaired interleaved line");
                if find_interleave(&combined).is_some() {
                    // The tail carried another fragment; keep the order the
                    // bytes arrived in.
                    out.push(pending.fragment);
                    self.scan(combined, &mut out);
                } else {
                    out.push(combined);
                    out.push(pending.fragment);
                }
            }
            None => self.scan(line, &mut out),
        }

        out
    }

    /// Emits a held head/fragment pair as two lines.
    ///
    /// Called when no tail arrived within the idle window.
    pub fn flush(&mut self) -> Vec<String> {
        match self.pending.take() {
            Some(pending) => vec![pending.head, pending.fragment],
            None => Vec::new(),
        }
    }

    /// Returns true while a head/fragment pair is waiting for its tail.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of lines reassembled from head and tail so far.
    pub fn repaired_count(&self) -> u64 {
        self.repaired
    }

    fn scan(&mut self, line: String, out: &mut Vec<String>) {
        let Some(at) = find_interleave(&line) else {
            out.push(line);
            return;
        };

        let mut head = line;
        let fragment = head.split_off(at);

        if self.is_prompt(&head) {
            out.push(head);
            out.push(fragment);
        } else {
            self.pending = Some(Pending { head, fragment });
        }
    }

    fn is_prompt(&self, head: &str) -> bool {
        let head = head.trim();
        self.prompts.iter().any(|p| p == head)
    }
}
