//! The console client facade.
//!
//! `ConsoleClient` ties the connection manager, reader daemon, line queue
//! and pattern waiter together and is the only type most callers need.
//! It is `Send + Sync`; share it behind an `Arc` to drive one console from
//! several tasks.
//!
//! # Locks
//!
//! - transport lock (inside [`ConnectionManager`]) serializes writes and reconnects
//! - queue lock (inside [`LineQueue`]) makes pushes and drains atomic
//! - command lock (here) keeps one framed command or reset in flight at a time
//!
//! Plain writes and waits do not take the command lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conpilot_core::{ConnectionState, ConsoleConfig, RawLine};

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::queue::LineQueue;
use crate::reader::ReaderDaemon;
use crate::transport::{Connector, TcpConnector};
use crate::waiter::{FilterMode, OnTimeout, PatternMatch, PatternWaiter};

struct ReaderTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Automation client for one serial console.
pub struct ConsoleClient {
    pub(crate) config: ConsoleConfig,
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) queue: Arc<LineQueue>,
    pub(crate) waiter: PatternWaiter,
    reader: Mutex<Option<ReaderTask>>,
    pub(crate) command_lock: Mutex<()>,
    nonce: AtomicU64,
    pub(crate) last_output: std::sync::Mutex<Option<String>>,
}

impl ConsoleClient {
    /// Creates a client for the TCP console gateway named in `config`.
    ///
    /// Nothing is opened until [`connect`](Self::connect).
    pub fn new(config: ConsoleConfig) -> Result<Self> {
        let connector = TcpConnector::new(config.host.clone(), config.port, config.connect_timeout);
        Self::with_connector(config, Arc::new(connector))
    }

    /// Creates a client that opens sessions through `connector`.
    pub fn with_connector(config: ConsoleConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let manager = Arc::new(ConnectionManager::new(&config, connector));
        let queue = Arc::new(LineQueue::new(config.queue_capacity));
        let waiter = PatternWaiter::new(Arc::clone(&queue));

        Ok(Self {
            config,
            manager,
            queue,
            waiter,
            reader: Mutex::new(None),
            command_lock: Mutex::new(()),
            nonce: AtomicU64::new(1),
            last_output: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Opens the console session and starts the reader daemon.
    ///
    /// Calling it on a connected client replaces the session.
    pub async fn connect(&self) -> Result<()> {
        let mut reader = self.reader.lock().await;
        if let Some(task) = reader.take() {
            debug!("Replacing existing console session");
            self.stop_reader(task, Instant::now() + self.config.close_timeout)
                .await;
        }

        self.manager.set_active(true);
        if let Err(e) = self.manager.open().await {
            self.manager.set_active(false);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let handle = ReaderDaemon::new(
            &self.config,
            Arc::clone(&self.manager),
            Arc::clone(&self.queue),
            cancel.clone(),
        )
        .spawn();
        *reader = Some(ReaderTask { handle, cancel });

        info!(endpoint = %self.manager.endpoint(), "Console connected");
        Ok(())
    }

    /// Stops the reader and closes the transport.
    ///
    /// The whole call shares one `close_timeout` deadline; a reader that has
    /// not finished by then is aborted. Safe to call more than once.
    pub async fn close(&self) {
        let deadline = Instant::now() + self.config.close_timeout;
        self.manager.set_active(false);

        let task = match timeout_at(deadline, self.reader.lock()).await {
            Ok(mut reader) => reader.take(),
            Err(_) => {
                warn!("Console connect still in progress, closing transport only");
                None
            }
        };
        // Cancel first so a reader stuck reconnecting lets go of the transport lock
        if let Some(task) = &task {
            task.cancel.cancel();
        }

        self.manager.shutdown(deadline).await;
        if let Some(task) = task {
            self.stop_reader(task, deadline).await;
        }
        info!(endpoint = %self.manager.endpoint(), "Console closed");
    }

    async fn stop_reader(&self, task: ReaderTask, deadline: Instant) {
        task.cancel.cancel();
        self.manager.set_active(false);

        let abort = task.handle.abort_handle();
        match timeout_at(deadline, task.handle).await {
            Ok(Ok(())) => debug!("Reader daemon joined"),
            Ok(Err(e)) => warn!(error = %e, "Reader daemon ended abnormally"),
            Err(_) => {
                warn!(
                    timeout = ?self.config.close_timeout,
                    "Reader daemon did not stop in time, aborting"
                );
                abort.abort();
            }
        }
    }

    /// Non-failing liveness check.
    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Reconnects performed since the client was created.
    pub fn reconnect_count(&self) -> u64 {
        self.manager.reconnect_count()
    }

    /// Lines dropped because the queue was full.
    pub fn dropped_lines(&self) -> u64 {
        self.queue.dropped()
    }

    // ------------------------------------------------------------------------
    // Raw I/O
    // ------------------------------------------------------------------------

    /// Writes raw bytes with the configured write timeout.
    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.manager.write(data.as_ref(), self.config.write_timeout).await
    }

    pub async fn write_with_timeout(&self, data: impl AsRef<[u8]>, write_timeout: Duration) -> Result<()> {
        self.manager.write(data.as_ref(), write_timeout).await
    }

    /// Writes `line` followed by a newline.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write(data).await
    }

    /// Reads one line, or `None` once `timeout` passes.
    pub async fn read(&self, timeout: Duration) -> Option<RawLine> {
        self.queue.read(timeout).await
    }

    /// Drains the queue, waiting up to the configured grace if it is empty.
    pub async fn read_all(&self) -> Vec<RawLine> {
        self.queue.read_all(self.config.drain_grace).await
    }

    /// Discards buffered output; returns how many lines were dropped.
    pub async fn clear(&self) -> usize {
        self.queue.clear().await
    }

    // ------------------------------------------------------------------------
    // Waits
    // ------------------------------------------------------------------------

    pub async fn wait_for_string(
        &self,
        needle: &str,
        timeout: Duration,
        on_timeout: OnTimeout,
    ) -> Result<Option<RawLine>> {
        self.waiter.wait_for_string(needle, timeout, on_timeout).await
    }

    pub async fn wait_for_string_return_all(
        &self,
        needle: &str,
        timeout: Duration,
        on_timeout: OnTimeout,
    ) -> Result<Vec<RawLine>> {
        self.waiter
            .wait_for_string_return_all(needle, timeout, on_timeout)
            .await
    }

    /// Like [`wait_for_filtered_string`](Self::wait_for_filtered_string),
    /// compiling `pattern` first.
    pub async fn wait_for_regex(
        &self,
        pattern: &str,
        timeout: Duration,
        on_timeout: OnTimeout,
    ) -> Result<Option<PatternMatch>> {
        let regex = Regex::new(pattern)?;
        self.waiter
            .wait_for_filtered_string(&regex, timeout, on_timeout)
            .await
    }

    pub async fn wait_for_filtered_string(
        &self,
        pattern: &Regex,
        timeout: Duration,
        on_timeout: OnTimeout,
    ) -> Result<Option<PatternMatch>> {
        self.waiter
            .wait_for_filtered_string(pattern, timeout, on_timeout)
            .await
    }

    pub async fn filter_read(
        &self,
        pattern: &Regex,
        per_read: Duration,
        total: Duration,
        mode: FilterMode,
        on_timeout: OnTimeout,
    ) -> Result<Vec<RawLine>> {
        self.waiter
            .filter_read(pattern, per_read, total, mode, on_timeout)
            .await
    }

    // ------------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------------

    pub(crate) fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// Raw output captured by the most recent framed command.
    pub fn last_output(&self) -> Option<String> {
        self.last_output
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_last_output(&self, output: String) {
        if let Ok(mut guard) = self.last_output.lock() {
            *guard = Some(output);
        }
    }
}

impl Drop for ConsoleClient {
    fn drop(&mut self) {
        self.manager.set_active(false);
        if let Some(task) = self.reader.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ConsoleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleClient")
            .field("endpoint", &self.manager.endpoint())
            .field("state", &self.manager.state())
            .finish_non_exhaustive()
    }
}
