//! Pattern waits over the line queue.
//!
//! Every wait consumes lines from the shared queue until its predicate
//! matches or its deadline passes. Lines read while waiting are gone from
//! the queue; they are returned to the caller or attached to the timeout
//! error, never silently lost.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::debug;

use conpilot_core::RawLine;

use crate::error::{ConsoleError, Result};
use crate::queue::LineQueue;

/// What a wait does when its deadline passes without a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnTimeout {
    /// Fail with [`ConsoleError::WaitTimeout`].
    #[default]
    Raise,
    /// Return an empty result.
    ReturnEmpty,
}

/// How [`PatternWaiter::filter_read`] treats the first non-matching line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Stop at the first line that does not match.
    #[default]
    Contiguous,
    /// Skip non-matching lines until at least one match has been collected.
    LeastOne,
}

/// A matching line and its capture groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub line: RawLine,
    /// Capture groups 1..n; unmatched optional groups are `None`.
    pub groups: Vec<Option<String>>,
}

impl PatternMatch {
    /// Returns capture group `index` (1-based, like the regex).
    pub fn group(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.groups.get(i))
            .and_then(|g| g.as_deref())
    }
}

/// Blocking waits for console output.
#[derive(Debug, Clone)]
pub struct PatternWaiter {
    queue: Arc<LineQueue>,
}

impl PatternWaiter {
    pub fn new(queue: Arc<LineQueue>) -> Self {
        Self { queue }
    }

    /// Reads lines until `accept` returns a value or the deadline passes.
    ///
    /// Returns the value and every line consumed, including the matching one.
    async fn wait_until<T, F>(&self, timeout: Duration, mut accept: F) -> (Option<T>, Vec<RawLine>)
    where
        F: FnMut(&RawLine) -> Option<T>,
    {
        let deadline = Instant::now() + timeout;
        let mut consumed = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(line) = self.queue.read(remaining).await else {
                return (None, consumed);
            };

            let found = accept(&line);
            consumed.push(line);
            if found.is_some() {
                return (found, consumed);
            }
            if remaining.is_zero() {
                return (None, consumed);
            }
        }
    }

    fn timed_out<T>(
        pattern: &str,
        timeout: Duration,
        consumed: Vec<RawLine>,
        on_timeout: OnTimeout,
        empty: T,
    ) -> Result<T> {
        debug!(pattern, lines = consumed.len(), "Wait timed out");
        match on_timeout {
            OnTimeout::ReturnEmpty => Ok(empty),
            OnTimeout::Raise => Err(ConsoleError::WaitTimeout {
                pattern: pattern.to_string(),
                timeout,
                captured: consumed.into_iter().map(RawLine::into_text).collect(),
            }),
        }
    }

    /// Waits for a line containing `needle` and returns it.
    pub async fn wait_for_string(
        &self,
        needle: &str,
        timeout: Duration,
        on_timeout: OnTimeout,
    ) -> Result<Option<RawLine>> {
        let (found, mut consumed) = self
            .wait_until(timeout, |line| line.contains(needle).then_some(()))
            .await;

        match found {
            Some(()) => Ok(consumed.pop()),
            None => Self::timed_out(needle, timeout, consumed, on_timeout, None),
        }
    }

    /// Waits for a line containing `needle` and returns every line read,
    /// the matching one last.
    pub async fn wait_for_string_return_all(
        &self,
        needle: &str,
        timeout: Duration,
        on_timeout: OnTimeout,
    ) -> Result<Vec<RawLine>> {
        let (found, consumed) = self
            .wait_until(timeout, |line| line.contains(needle).then_some(()))
            .await;

        match found {
            Some(()) => Ok(consumed),
            None => Self::timed_out(needle, timeout, consumed, on_timeout, Vec::new()),
        }
    }

    /// Waits for a line matching `pattern` and returns it with its groups.
    pub async fn wait_for_filtered_string(
        &self,
        pattern: &Regex,
        timeout: Duration,
        on_timeout: OnTimeout,
    ) -> Result<Option<PatternMatch>> {
        let (found, mut consumed) = self
            .wait_until(timeout, |line| {
                pattern.captures(line.text()).map(|caps| {
                    caps.iter()
                        .skip(1)
                        .map(|g| g.map(|m| m.as_str().to_string()))
                        .collect::<Vec<_>>()
                })
            })
            .await;

        match (found, consumed.pop()) {
            (Some(groups), Some(line)) => Ok(Some(PatternMatch { line, groups })),
            (_, last) => {
                consumed.extend(last);
                Self::timed_out(pattern.as_str(), timeout, consumed, on_timeout, None)
            }
        }
    }

    /// Collects a run of lines matching `pattern`.
    ///
    /// Each read waits at most `per_read`; the whole call is bounded by
    /// `total`. The run ends at the first non-matching line (which is put
    /// back on the queue) or when a read times out. In
    /// [`FilterMode::LeastOne`] both are ignored until the first match.
    pub async fn filter_read(
        &self,
        pattern: &Regex,
        per_read: Duration,
        total: Duration,
        mode: FilterMode,
        on_timeout: OnTimeout,
    ) -> Result<Vec<RawLine>> {
        let deadline = Instant::now() + total;
        let mut matched = Vec::new();
        let mut skipped = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let Some(line) = self.queue.read(per_read.min(remaining)).await else {
                if matched.is_empty() && mode == FilterMode::LeastOne {
                    continue;
                }
                break;
            };

            if pattern.is_match(line.text()) {
                matched.push(line);
                continue;
            }

            if matched.is_empty() && mode == FilterMode::LeastOne {
                skipped.push(line);
                continue;
            }

            self.queue.unread(line).await;
            break;
        }

        if matched.is_empty() {
            return Self::timed_out(pattern.as_str(), total, skipped, on_timeout, Vec::new());
        }
        Ok(matched)
    }
}
