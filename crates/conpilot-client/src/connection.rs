//! Transport lifecycle: open, probe, write, reconnect, shut down.
//!
//! The `ConnectionManager` owns the write half of the current transport
//! session behind the transport lock. Every write, open and reconnect takes
//! that lock, so bytes from two callers can never interleave and two
//! reconnects can never race.
//!
//! Each successful open bumps a generation counter and parks the new read
//! half in a hand-off slot for the reader daemon. A reconnect request names
//! the generation it saw fail; if a newer one already exists the request is
//! a no-op, which keeps a read failure and a write failure on the same dead
//! socket from reconnecting twice.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Transport errors are mapped to `ConsoleError` and logged

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use conpilot_core::{ConnectionState, ConsoleConfig, RetryPolicy};
use conpilot_protocol::{escape_iac, NOP_PROBE};

use crate::error::{ConsoleError, Result};
use crate::transport::{BoxedStream, Connector};

/// Read half handed from the manager to the reader daemon.
pub(crate) type ReaderHalf = ReadHalf<BoxedStream>;

/// The live write side of one transport session.
struct Link {
    writer: WriteHalf<BoxedStream>,
    generation: u64,
}

/// Owner of the console transport.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    write_timeout: Duration,
    debug: bool,

    /// Transport lock
    link: Mutex<Option<Link>>,

    /// Newest read half not yet picked up by the reader
    handoff: Mutex<Option<(u64, ReaderHalf)>>,
    handoff_ready: Notify,

    state: AtomicU8,
    active: AtomicBool,
    generation: AtomicU64,
    reconnects: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: &ConsoleConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            retry: config.retry.clone(),
            write_timeout: config.write_timeout,
            debug: config.debug,
            link: Mutex::new(None),
            handoff: Mutex::new(None),
            handoff_ready: Notify::new(),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            active: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.swap(state.as_u8(), Ordering::SeqCst);
        if previous != state.as_u8() {
            debug!(
                from = %ConnectionState::from_u8(previous),
                to = %state,
                "Connection state changed"
            );
        }
    }

    /// True while the client wants a live connection (between connect and close).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Non-failing liveness check.
    pub fn is_connected(&self) -> bool {
        self.is_active() && self.state().is_connected()
    }

    /// Generation of the newest successfully opened session.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Reconnects performed since construction (the initial open excluded).
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn default_write_timeout(&self) -> Duration {
        self.write_timeout
    }

    // ------------------------------------------------------------------------
    // Open / Reconnect
    // ------------------------------------------------------------------------

    /// Opens a fresh session, replacing any existing one.
    pub async fn open(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        self.reopen_locked(&mut link).await
    }

    /// Reopens the session after a failure observed on `failed_generation`.
    ///
    /// Does nothing if a newer session already replaced the failed one.
    pub async fn reconnect(&self, failed_generation: u64) -> Result<()> {
        if !self.is_active() {
            return Err(ConsoleError::NotConnected);
        }

        let mut link = self.link.lock().await;
        if let Some(current) = link.as_ref() {
            if current.generation != failed_generation {
                debug!(
                    failed_generation,
                    current = current.generation,
                    "Session already replaced, skipping reconnect"
                );
                return Ok(());
            }
        }

        self.reconnects.fetch_add(1, Ordering::SeqCst);
        warn!(
            endpoint = %self.connector.endpoint(),
            failed_generation,
            "Reconnecting console transport"
        );
        self.reopen_locked(&mut link).await
    }

    /// Opens and probes a new session under the held transport lock.
    ///
    /// Retries with exponential backoff up to the configured attempt count.
    async fn reopen_locked(&self, link: &mut MutexGuard<'_, Option<Link>>) -> Result<()> {
        if let Some(old) = link.take() {
            drop_link(old).await;
        }
        self.set_state(ConnectionState::Connecting);

        let attempts = self.retry.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            debug!(attempt, endpoint = %self.connector.endpoint(), "Opening console session");

            match self.open_once().await {
                Ok((reader, writer)) => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    **link = Some(Link { writer, generation });
                    *self.handoff.lock().await = Some((generation, reader));
                    self.handoff_ready.notify_one();
                    self.set_state(ConnectionState::Connected);
                    info!(
                        endpoint = %self.connector.endpoint(),
                        generation,
                        attempt,
                        "Console session established"
                    );
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Console open attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                sleep(self.retry.delay_after(attempt)).await;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Err(ConsoleError::Connection {
            address: self.connector.endpoint(),
            attempts,
            reason: last_error,
        })
    }

    /// One connect + liveness probe.
    ///
    /// A successful TCP open does not prove the gateway is serving the
    /// port, so a telnet NOP is written and flushed before the session is
    /// accepted.
    async fn open_once(&self) -> std::io::Result<(ReaderHalf, WriteHalf<BoxedStream>)> {
        let stream = self.connector.connect().await?;
        let (reader, mut writer) = tokio::io::split(stream);
        write_with_timeout(&mut writer, &NOP_PROBE, self.write_timeout).await?;
        Ok((reader, writer))
    }

    /// Takes the newest read half, if one is waiting.
    pub(crate) async fn take_reader(&self) -> Option<(u64, ReaderHalf)> {
        self.handoff.lock().await.take()
    }

    /// Resolves once a new read half has been parked.
    pub(crate) async fn reader_ready(&self) {
        self.handoff_ready.notified().await;
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Writes `data` to the console, escaping telnet IAC bytes.
    ///
    /// On a transport error the session is reopened once and the write is
    /// retried once; a second failure surfaces as `WriteTimeout`.
    pub async fn write(&self, data: &[u8], write_timeout: Duration) -> Result<()> {
        if !self.is_active() {
            return Err(ConsoleError::NotConnected);
        }

        let payload = escape_iac(data);
        if self.debug {
            debug!(bytes = payload.len(), data = %String::from_utf8_lossy(data).escape_debug(), "tx");
        }

        let mut link = self.link.lock().await;

        let first_error = match link.as_mut() {
            Some(current) => {
                match write_with_timeout(&mut current.writer, &payload, write_timeout).await {
                    Ok(()) => return Ok(()),
                    Err(e) => e.to_string(),
                }
            }
            None => "no open session".to_string(),
        };

        warn!(error = %first_error, "Console write failed, reconnecting once");
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.reopen_locked(&mut link).await {
            return Err(ConsoleError::WriteTimeout {
                timeout: write_timeout,
                reason: format!("{first_error}; reconnect failed: {e}"),
            });
        }

        match link.as_mut() {
            Some(current) => write_with_timeout(&mut current.writer, &payload, write_timeout)
                .await
                .map_err(|e| ConsoleError::WriteTimeout {
                    timeout: write_timeout,
                    reason: format!("retry after reconnect failed: {e}"),
                }),
            None => Err(ConsoleError::WriteTimeout {
                timeout: write_timeout,
                reason: first_error,
            }),
        }
    }

    /// Writes protocol bytes (negotiation replies) without escaping or
    /// reconnecting. Failures are left for the reader to notice.
    pub(crate) async fn write_raw(&self, data: &[u8]) {
        let mut link = self.link.lock().await;
        if let Some(current) = link.as_mut() {
            if let Err(e) = write_with_timeout(&mut current.writer, data, self.write_timeout).await {
                debug!(error = %e, "Failed to write telnet reply");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Clears the active flag and closes the transport.
    ///
    /// Returns by `deadline` even if a writer or reconnect still holds the
    /// transport lock; that session is then left to be dropped by its holder.
    pub async fn shutdown(&self, deadline: Instant) {
        self.set_active(false);

        match timeout_at(deadline, self.link.lock()).await {
            Ok(mut link) => {
                if let Some(old) = link.take() {
                    let _ = timeout_at(deadline, drop_link(old)).await;
                }
            }
            Err(_) => warn!("Transport lock busy during shutdown, leaving writer to be dropped"),
        }

        if let Ok(mut handoff) = timeout_at(deadline, self.handoff.lock()).await {
            handoff.take();
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Writes and flushes with a deadline; an elapsed deadline becomes `TimedOut`.
async fn write_with_timeout(
    writer: &mut WriteHalf<BoxedStream>,
    data: &[u8],
    budget: Duration,
) -> std::io::Result<()> {
    match timeout(budget, async {
        writer.write_all(data).await?;
        writer.flush().await
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("write not accepted within {budget:?}"),
        )),
    }
}

async fn drop_link(mut old: Link) {
    // Best effort; the peer may already be gone
    let _ = timeout(Duration::from_secs(1), old.writer.shutdown()).await;
    debug!(generation = old.generation, "Closed console session");
}
