//! Background reader daemon.
//!
//! One task per connected client. It decodes the console byte stream into
//! lines, answers telnet negotiation, repairs lines split by kernel log
//! output and pushes the result into the [`LineQueue`]. On EOF or a read
//! error it asks the connection manager for one reconnect and resumes with
//! the new session.
//!
//! The loop never returns an error; every failure is logged and either
//! retried or ends the task when the client is closed.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conpilot_core::ConsoleConfig;
use conpilot_protocol::{LineRepairer, TelnetEvent, TelnetLineCodec};

use crate::connection::{ConnectionManager, ReaderHalf};
use crate::queue::LineQueue;

type LineStream = FramedRead<ReaderHalf, TelnetLineCodec>;

/// Outcome of one loop iteration, acted on once the stream borrow ends.
enum Step {
    Cancelled,
    NewSession,
    Idle,
    Tick,
    Event(TelnetEvent),
    Lost(String),
}

/// Reads console lines until cancelled.
pub struct ReaderDaemon {
    manager: Arc<ConnectionManager>,
    queue: Arc<LineQueue>,
    repairer: LineRepairer,
    cancel: CancellationToken,
    read_timeout: Duration,
    partial_flush: Duration,
    debug: bool,
}

impl ReaderDaemon {
    pub fn new(
        config: &ConsoleConfig,
        manager: Arc<ConnectionManager>,
        queue: Arc<LineQueue>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            queue,
            repairer: LineRepairer::new(&config.prompts),
            cancel,
            read_timeout: config.read_timeout,
            partial_flush: config.partial_flush,
            debug: config.debug,
        }
    }

    /// Spawns the daemon on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the token is cancelled or the client is deactivated.
    pub async fn run(mut self) {
        info!(endpoint = %self.manager.endpoint(), "Reader daemon started");

        let mut current: Option<(u64, LineStream)> = None;
        let mut last_generation = self.manager.generation();

        while !self.cancel.is_cancelled() && self.manager.is_active() {
            if current.is_none() {
                match self.manager.take_reader().await {
                    Some((generation, half)) => {
                        debug!(generation, "Reader attached to session");
                        last_generation = generation;
                        current = Some((generation, FramedRead::new(half, TelnetLineCodec::new())));
                    }
                    None => {
                        self.recover(last_generation).await;
                        last_generation = self.manager.generation();
                    }
                }
                continue;
            }
            let Some((generation, stream)) = current.as_mut() else {
                continue;
            };

            let generation = *generation;
            // A partial line only counts as idle once it has sat through a
            // whole window; one that shows up mid-window waits for the next.
            let holding = stream.decoder().has_partial() || self.repairer.has_pending();
            let idle = self.partial_flush.min(self.read_timeout);

            let step = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => Step::Cancelled,

                _ = self.manager.reader_ready() => Step::NewSession,

                result = timeout(idle, stream.next()) => match result {
                    Err(_) if holding => Step::Idle,
                    Err(_) => Step::Tick,
                    Ok(Some(Ok(event))) => Step::Event(event),
                    Ok(Some(Err(e))) => Step::Lost(e.to_string()),
                    Ok(None) => Step::Lost("end of stream".to_string()),
                },
            };

            match step {
                Step::Cancelled => break,
                Step::NewSession => {
                    // The write path may have reconnected underneath us
                    if let Some((next, half)) = self.manager.take_reader().await {
                        if let Some((_, mut old)) = current.take() {
                            self.flush_partial(&mut old).await;
                        }
                        debug!(from = generation, to = next, "Reader switched to new session");
                        last_generation = next;
                        current = Some((next, FramedRead::new(half, TelnetLineCodec::new())));
                    }
                }
                Step::Idle => {
                    if let Some((_, stream)) = current.as_mut() {
                        self.flush_partial(stream).await;
                    }
                }
                Step::Tick => {}
                Step::Event(TelnetEvent::Line(line)) => {
                    let lines = self.repairer.push(line);
                    self.deliver(lines).await;
                }
                Step::Event(TelnetEvent::Reply(reply)) => {
                    debug!(bytes = reply.len(), "Refusing telnet option");
                    self.manager.write_raw(&reply).await;
                }
                Step::Lost(reason) => {
                    if let Some((_, mut old)) = current.take() {
                        self.flush_partial(&mut old).await;
                    }
                    if self.cancel.is_cancelled() || !self.manager.is_active() {
                        break;
                    }
                    warn!(generation, reason = %reason, "Console read failed");
                    last_generation = generation;
                }
            }
        }

        let leftover = self.repairer.flush();
        self.deliver(leftover).await;
        info!(
            repaired = self.repairer.repaired_count(),
            "Reader daemon stopped"
        );
    }

    /// Emits any partial line and any held repair.
    async fn flush_partial(&mut self, stream: &mut LineStream) {
        let mut lines = Vec::new();
        if let Some(partial) = stream.decoder_mut().take_partial() {
            lines.extend(self.repairer.push(partial));
        }
        lines.extend(self.repairer.flush());
        self.deliver(lines).await;
    }

    async fn deliver(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        if self.debug {
            for line in &lines {
                debug!(line = %line, "rx");
            }
        }
        self.queue.push_all(lines).await;
    }

    /// One reconnect attempt; backs off when it fails. Cancellation
    /// abandons both the reconnect and the backoff.
    async fn recover(&self, failed_generation: u64) {
        if !self.manager.is_active() {
            return;
        }
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = self.manager.reconnect(failed_generation) => result,
        };
        if let Err(e) = result {
            error!(error = %e, "Reconnect failed, will retry");
            let backoff = self.manager.retry_policy().max_delay;
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = sleep(backoff) => {}
            }
        }
    }
}
