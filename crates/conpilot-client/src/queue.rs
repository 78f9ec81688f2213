//! Bounded FIFO of console lines.
//!
//! The reader daemon is the only producer; any number of foreground tasks
//! consume. The queue mutex is the client's "atomic" lock: a group of lines
//! pushed together and a full drain each happen under a single acquisition,
//! so a drain never observes half of a repaired group. It is never held
//! across a socket read.
//!
//! When full, the oldest line is dropped and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use conpilot_core::RawLine;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

/// Thread-safe queue of received console lines.
#[derive(Debug)]
pub struct LineQueue {
    lines: Mutex<VecDeque<RawLine>>,
    notify: Notify,
    capacity: usize,
    next_seq: AtomicU64,
    dropped: AtomicU64,
}

impl LineQueue {
    /// Creates a queue holding at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            next_seq: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends one line.
    pub async fn push(&self, text: String) {
        self.push_all(vec![text]).await;
    }

    /// Appends a group of lines under one lock acquisition.
    pub async fn push_all(&self, texts: Vec<String>) {
        if texts.is_empty() {
            return;
        }

        let mut dropped = 0u64;
        {
            let mut lines = self.lines.lock().await;
            for text in texts {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                if lines.len() >= self.capacity {
                    lines.pop_front();
                    dropped += 1;
                }
                lines.push_back(RawLine::new(seq, text));
            }
        }

        if dropped > 0 {
            let total = self.dropped.fetch_add(dropped, Ordering::Relaxed) + dropped;
            warn!(dropped, total, capacity = self.capacity, "Line queue full, dropped oldest lines");
        }

        self.notify.notify_waiters();
    }

    /// Puts a line back at the head of the queue.
    ///
    /// Used by waiters that read one line too many.
    pub async fn unread(&self, line: RawLine) {
        {
            let mut lines = self.lines.lock().await;
            if lines.len() >= self.capacity {
                // The unread line is older than anything queued
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            lines.push_front(line);
        }
        self.notify.notify_waiters();
    }

    /// Pops one line, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout; a received line is always `Some`, even if
    /// its text is empty.
    pub async fn read(&self, timeout: Duration) -> Option<RawLine> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking, so a push between the
            // check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(line) = self.lines.lock().await.pop_front() {
                return Some(line);
            }

            if timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Drains every queued line.
    ///
    /// If the queue is empty, waits up to `grace` for at least one line to
    /// arrive, then drains whatever is there. Never waits beyond `grace`.
    pub async fn read_all(&self, grace: Duration) -> Vec<RawLine> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let mut lines = self.lines.lock().await;
            if !lines.is_empty() || grace.is_zero() {
                return lines.drain(..).collect();
            }
        }

        let _ = tokio::time::timeout(grace, notified).await;
        self.lines.lock().await.drain(..).collect()
    }

    /// Discards all buffered lines and returns how many were dropped.
    pub async fn clear(&self) -> usize {
        let mut lines = self.lines.lock().await;
        let count = lines.len();
        lines.clear();
        count
    }

    /// Number of lines currently buffered.
    pub async fn len(&self) -> usize {
        self.lines.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.lines.lock().await.is_empty()
    }

    /// Total lines dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn texts(lines: &[RawLine]) -> Vec<&str> {
        lines.iter().map(RawLine::text).collect()
    }

    #[tokio::test]
    async fn test_fifo_order_and_sequence() {
        let queue = LineQueue::new(16);
        queue.push("one".to_string()).await;
        queue.push_all(vec!["two".to_string(), "three".to_string()]).await;

        let first = queue.read(Duration::ZERO).await.unwrap();
        let second = queue.read(Duration::ZERO).await.unwrap();
        assert_eq!(first.text(), "one");
        assert_eq!(second.text(), "two");
        assert!(second.seq() > first.seq());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_read_times_out_when_empty() {
        let queue = LineQueue::new(4);
        let start = Instant::now();
        assert!(queue.read(Duration::from_millis(50)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_empty_line_is_distinct_from_timeout() {
        let queue = LineQueue::new(4);
        queue.push(String::new()).await;
        let line = queue.read(Duration::ZERO).await;
        assert_eq!(line.map(|l| l.into_text()), Some(String::new()));
    }

    #[tokio::test]
    async fn test_read_wakes_on_push() {
        let queue = Arc::new(LineQueue::new(4));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push("late".to_string()).await;
        });

        let line = queue.read(Duration::from_secs(2)).await.unwrap();
        assert_eq!(line.text(), "late");
    }

    #[tokio::test]
    async fn test_clear_then_read_all_is_empty() {
        let queue = LineQueue::new(8);
        queue
            .push_all(vec!["a".to_string(), "b".to_string()])
            .await;
        assert_eq!(queue.clear().await, 2);
        assert!(queue.read_all(Duration::ZERO).await.is_empty());
        // Idempotent
        assert_eq!(queue.clear().await, 0);
        assert!(queue.read_all(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn test_read_all_drains_in_order() {
        let queue = LineQueue::new(8);
        queue
            .push_all(vec!["a".to_string(), "b".to_string(), "c".to_string()])
            .await;
        let lines = queue.read_all(Duration::from_millis(10)).await;
        assert_eq!(texts(&lines), vec!["a", "b", "c"]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_read_all_waits_for_grace() {
        let queue = Arc::new(LineQueue::new(8));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push("x".to_string()).await;
        });

        let lines = queue.read_all(Duration::from_secs(2)).await;
        assert_eq!(texts(&lines), vec!["x"]);
    }

    #[tokio::test]
    async fn test_read_all_respects_grace_bound() {
        let queue = LineQueue::new(8);
        let start = Instant::now();
        assert!(queue.read_all(Duration::from_millis(30)).await.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let queue = LineQueue::new(2);
        queue
            .push_all(vec!["1".to_string(), "2".to_string(), "3".to_string()])
            .await;
        assert_eq!(queue.dropped(), 1);
        let lines = queue.read_all(Duration::ZERO).await;
        assert_eq!(texts(&lines), vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_unread_goes_to_front() {
        let queue = LineQueue::new(8);
        queue.push_all(vec!["a".to_string(), "b".to_string()]).await;
        let a = queue.read(Duration::ZERO).await.unwrap();
        queue.unread(a).await;
        let lines = queue.read_all(Duration::ZERO).await;
        assert_eq!(texts(&lines), vec!["a", "b"]);
    }
}
