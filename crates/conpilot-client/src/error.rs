//! Error types for the console client.
//!
//! Transport-level failures are retried once (reconnect) before they reach
//! the caller; pattern-wait timeouts are surfaced directly. Every timeout
//! carries the lines consumed while waiting so a failed script step can be
//! diagnosed from the error alone.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::time::Duration;

use conpilot_core::ConfigError;
use conpilot_protocol::ConsoleState;
use thiserror::Error;

// ============================================================================
// Console Error Type
// ============================================================================

/// Console client errors.
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// The console gateway could not be reached after bounded retries.
    #[error("Failed to connect to console {address} after {attempts} attempt(s): {reason}")]
    Connection {
        address: String,
        attempts: u32,
        reason: String,
    },

    /// A write was not accepted, even after one reconnect and retry.
    #[error("Write to console timed out after {timeout:?}: {reason}")]
    WriteTimeout { timeout: Duration, reason: String },

    /// An expected pattern was not observed within its budget.
    ///
    /// For framed commands this is also how a lost sentinel (desync)
    /// shows up: it cannot be told apart from a slow command.
    #[error("Timed out after {timeout:?} waiting for {pattern:?} ({} line(s) captured)", .captured.len())]
    WaitTimeout {
        pattern: String,
        timeout: Duration,
        captured: Vec<String>,
    },

    /// The client has not been connected, or was closed.
    #[error("Console is not connected")]
    NotConnected,

    /// A regex supplied by the caller did not compile.
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Output arrived but did not have the expected shape.
    #[error("Unexpected console output: {reason}")]
    UnexpectedOutput { reason: String, output: String },

    /// A framed command exited with a non-zero status.
    #[error("Command {command:?} exited with status {exit_code}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    /// Session reset gave up without reaching a prompt.
    #[error("Session reset failed after {attempts} attempt(s); console shows {last_state}")]
    ResetFailed {
        attempts: u32,
        last_state: ConsoleState,
    },

    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ConsoleError {
    /// Returns the output captured before the failure, if any.
    pub fn captured_output(&self) -> Option<String> {
        match self {
            Self::WaitTimeout { captured, .. } => Some(captured.join("\n")),
            Self::UnexpectedOutput { output, .. } | Self::CommandFailed { output, .. } => {
                Some(output.clone())
            }
            _ => None,
        }
    }

    /// Returns true for timeouts (write or wait).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::WriteTimeout { .. } | Self::WaitTimeout { .. })
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Convenience Result type alias for console operations.
pub type Result<T> = std::result::Result<T, ConsoleError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let error = ConsoleError::Connection {
            address: "10.0.0.5:7001".to_string(),
            attempts: 3,
            reason: "connection refused".to_string(),
        };
        let display = error.to_string();
        assert!(display.contains("10.0.0.5:7001"));
        assert!(display.contains("3 attempt(s)"));
        assert!(display.contains("connection refused"));
    }

    #[test]
    fn test_wait_timeout_carries_capture() {
        let error = ConsoleError::WaitTimeout {
            pattern: "login:".to_string(),
            timeout: Duration::from_secs(2),
            captured: vec!["U-Boot 2021.01".to_string(), "Hit any key".to_string()],
        };
        assert!(error.to_string().contains("2 line(s) captured"));
        assert!(error.is_timeout());
        assert_eq!(
            error.captured_output().as_deref(),
            Some("U-Boot 2021.01\nHit any key")
        );
    }

    #[test]
    fn test_command_failed_display() {
        let error = ConsoleError::CommandFailed {
            command: "ls /missing".to_string(),
            exit_code: 2,
            output: "ls: /missing: No such file or directory".to_string(),
        };
        assert!(error.to_string().contains("status 2"));
        assert!(!error.is_timeout());
        assert!(error.captured_output().unwrap().contains("No such file"));
    }

    #[test]
    fn test_invalid_pattern_from_regex() {
        let regex_error = regex::Regex::new("(unclosed").unwrap_err();
        let error: ConsoleError = regex_error.into();
        assert!(matches!(error, ConsoleError::InvalidPattern(_)));
    }

    #[test]
    fn test_result_type_alias_err() {
        fn returns_err() -> Result<()> {
            Err(ConsoleError::NotConnected)
        }
        assert!(returns_err().is_err());
    }
}
