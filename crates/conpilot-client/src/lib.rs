//! conpilot Client - Async automation client for serial consoles
//!
//! Drives a device console exposed by a telnet console gateway: a
//! background reader turns the byte stream into lines, callers wait for
//! patterns in those lines and run shell commands framed with a sentinel.
//!
//! # Architecture
//!
//! ```text
//! callers (scripts, tests, CLI)
//!     │ write / run            ▲ wait_for_* / read
//!     ▼                        │
//! ConnectionManager      PatternWaiter
//!     │  ▲ read half             ▲
//!     │  └──── ReaderDaemon ──► LineQueue
//!     ▼         decode, repair
//! console gateway (telnet)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use conpilot_client::{ConsoleClient, OnTimeout};
//! use conpilot_core::ConsoleConfig;
//! use std::time::Duration;
//!
//! # async fn demo() -> conpilot_client::Result<()> {
//! let client = ConsoleClient::new(ConsoleConfig::new("10.0.0.5", 7001))?;
//! client.connect().await?;
//! client.reset_session().await?;
//! let (uname, code) = client.run_with_exit_code("uname -a").await?;
//! println!("{uname} (exit {code})");
//! client
//!     .wait_for_string("eth0: link up", Duration::from_secs(30), OnTimeout::Raise)
//!     .await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod queue;
pub mod reader;
pub mod reset;
pub mod transport;
pub mod waiter;

#[cfg(test)]
mod testing;

pub use client::ConsoleClient;
pub use command::{CommandOutput, CommandRequest};
pub use connection::ConnectionManager;
pub use error::{ConsoleError, Result};
pub use queue::LineQueue;
pub use reader::ReaderDaemon;
pub use reset::RESET_ATTEMPTS;
pub use transport::{BoxedStream, ConsoleStream, Connector, TcpConnector};
pub use waiter::{FilterMode, OnTimeout, PatternMatch, PatternWaiter};

pub use conpilot_protocol::ConsoleState;
