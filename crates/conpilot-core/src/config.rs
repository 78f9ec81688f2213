//! Console client configuration.
//!
//! [`ConsoleConfig`] is the in-memory form consumed by the client. It can be
//! built in code (`ConsoleConfig::new(host, port)` plus struct update syntax)
//! or loaded from a TOML file via [`ConsoleConfigFile`], whose durations are
//! expressed in milliseconds.
//!
//! ```toml
//! host = "10.0.0.12"
//! port = 7001
//! family = "shell"
//! prompts = ["root@dut:~#"]
//! password = "secret"
//! command_timeout_ms = 60000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default telnet port.
pub const DEFAULT_PORT: u16 = 23;

/// Default capacity of the line queue before the oldest lines are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

// ============================================================================
// Device Family
// ============================================================================

/// Selects the session-reset profile used to return a console to its prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    /// Linux/BusyBox login shell.
    #[default]
    Shell,
    /// U-Boot style bootloader prompt.
    Bootloader,
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell => f.write_str("shell"),
            Self::Bootloader => f.write_str("bootloader"),
        }
    }
}

impl FromStr for DeviceFamily {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shell" => Ok(Self::Shell),
            "bootloader" | "uboot" | "u-boot" => Ok(Self::Bootloader),
            other => Err(ConfigError::InvalidFieldValue {
                field: "family".to_string(),
                value: other.to_string(),
                expected: "shell or bootloader".to_string(),
            }),
        }
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Bounded retry with exponential backoff for opening the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total connection attempts before giving up (at least 1).
    pub attempts: u32,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Upper bound for the delay between attempts.
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

// ============================================================================
// Console Config
// ============================================================================

/// Configuration for one console client.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleConfig {
    /// Console gateway host name or address.
    pub host: String,

    /// Console gateway TCP port.
    pub port: u16,

    /// Log every received and transmitted line at debug level.
    pub debug: bool,

    /// Timeout for a single TCP connect attempt.
    pub connect_timeout: Duration,

    /// Retry behavior for `connect()` and reconnects.
    pub retry: RetryPolicy,

    /// Upper bound for one reader iteration before it re-checks the active flag.
    pub read_timeout: Duration,

    /// Idle time after which a partial line (e.g. `login: `) is emitted.
    pub partial_flush: Duration,

    /// Default budget for a single transport write.
    pub write_timeout: Duration,

    /// Maximum time `close()` waits for the reader task to finish.
    pub close_timeout: Duration,

    /// Maximum number of buffered lines before the oldest are dropped.
    pub queue_capacity: usize,

    /// Default timeout for framed commands.
    pub command_timeout: Duration,

    /// Grace period used by `read_all` when the queue is momentarily empty.
    pub drain_grace: Duration,

    /// Known shell prompts, used by the log-interleave repair heuristic.
    pub prompts: Vec<String>,

    /// Session-reset profile selector.
    pub family: DeviceFamily,

    /// Login name sent when a reset lands on a login prompt.
    pub username: Option<String>,

    /// Password sent when a reset lands on a password prompt.
    pub password: Option<String>,
}

impl ConsoleConfig {
    /// Creates a configuration with defaults for everything but the endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks field values that would make the client misbehave.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.host.trim().is_empty() {
            return Err(invalid("host", &self.host, "a non-empty host name"));
        }
        if self.port == 0 {
            return Err(invalid("port", "0", "a port in 1..=65535"));
        }
        if self.retry.attempts == 0 {
            return Err(invalid("connect_attempts", "0", "at least 1"));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(invalid(
                "retry_multiplier",
                &self.retry.multiplier.to_string(),
                "a value >= 1.0",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "0", "at least 1"));
        }
        if self.read_timeout.is_zero() {
            return Err(invalid("read_timeout_ms", "0", "a positive duration"));
        }
        if self.partial_flush.is_zero() {
            return Err(invalid("partial_flush_ms", "0", "a positive duration"));
        }
        Ok(())
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            debug: false,
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            read_timeout: Duration::from_secs(5),
            partial_flush: Duration::from_millis(300),
            write_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(60),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            command_timeout: Duration::from_secs(30),
            drain_grace: Duration::from_millis(200),
            prompts: Vec::new(),
            family: DeviceFamily::default(),
            username: None,
            password: None,
        }
    }
}

fn invalid(field: &str, value: &str, expected: &str) -> ConfigError {
    ConfigError::InvalidFieldValue {
        field: field.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

// ============================================================================
// File Form
// ============================================================================

/// On-disk TOML form of [`ConsoleConfig`].
///
/// Every field is optional; missing fields take the defaults of
/// `ConsoleConfig::default()`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsoleConfigFile {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub connect_attempts: Option<u32>,
    #[serde(default)]
    pub retry_initial_delay_ms: Option<u64>,
    #[serde(default)]
    pub retry_max_delay_ms: Option<u64>,
    #[serde(default)]
    pub retry_multiplier: Option<f64>,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub partial_flush_ms: Option<u64>,
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    #[serde(default)]
    pub close_timeout_ms: Option<u64>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    #[serde(default)]
    pub drain_grace_ms: Option<u64>,
    #[serde(default)]
    pub prompts: Option<Vec<String>>,
    #[serde(default)]
    pub family: Option<DeviceFamily>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ConsoleConfigFile {
    /// Parses the TOML text of a config file.
    pub fn parse(contents: &str, path: &Path) -> ConfigResult<Self> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads and parses a config file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    /// Converts into a validated [`ConsoleConfig`].
    pub fn into_config(self) -> ConfigResult<ConsoleConfig> {
        let defaults = ConsoleConfig::default();
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };

        let config = ConsoleConfig {
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            debug: self.debug.unwrap_or(defaults.debug),
            connect_timeout: ms(self.connect_timeout_ms, defaults.connect_timeout),
            retry: RetryPolicy {
                attempts: self.connect_attempts.unwrap_or(defaults.retry.attempts),
                initial_delay: ms(self.retry_initial_delay_ms, defaults.retry.initial_delay),
                max_delay: ms(self.retry_max_delay_ms, defaults.retry.max_delay),
                multiplier: self.retry_multiplier.unwrap_or(defaults.retry.multiplier),
            },
            read_timeout: ms(self.read_timeout_ms, defaults.read_timeout),
            partial_flush: ms(self.partial_flush_ms, defaults.partial_flush),
            write_timeout: ms(self.write_timeout_ms, defaults.write_timeout),
            close_timeout: ms(self.close_timeout_ms, defaults.close_timeout),
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity),
            command_timeout: ms(self.command_timeout_ms, defaults.command_timeout),
            drain_grace: ms(self.drain_grace_ms, defaults.drain_grace),
            prompts: self.prompts.unwrap_or(defaults.prompts),
            family: self.family.unwrap_or(defaults.family),
            username: self.username.or(defaults.username),
            password: self.password.or(defaults.password),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Returns the default config file location (`<config_dir>/conpilot/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("conpilot").join("config.toml"))
}
