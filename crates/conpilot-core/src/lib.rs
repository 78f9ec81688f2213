//! conpilot Core - Shared types for serial console automation
//!
//! This crate provides the domain types shared between the protocol
//! layer (conpilot-protocol), the async client (conpilot-client) and
//! the `conpilot` binary.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()` or `todo!()` outside of tests.

pub mod config;
pub mod error;
pub mod line;
pub mod state;

// Re-exports for convenience
pub use config::{
    default_config_path, ConsoleConfig, ConsoleConfigFile, DeviceFamily, RetryPolicy,
    DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY,
};
pub use error::{ConfigError, ConfigResult};
pub use line::{join_lines, RawLine};
pub use state::ConnectionState;
