//! Framed shell commands.
//!
//! A command is written with a sentinel echo appended; its output is
//! everything between the echoed command line and the sentinel. Because the
//! sentinel is built at runtime from two halves, the echoed command line
//! never contains it and only the shell's real output can end the wait.
//!
//! ```text
//! ls /tmp; PRE=__CONPILOT && echo "$PRE"_DONE_7__
//!                      \___ shell prints __CONPILOT_DONE_7__ when ls is done
//! ```

use std::time::Duration;

use tracing::{debug, warn};

use conpilot_core::{join_lines, RawLine};
use conpilot_protocol::{parse_exit_code, starts_with_timestamp, CommandFrame};

use crate::client::ConsoleClient;
use crate::error::{ConsoleError, Result};
use crate::waiter::OnTimeout;

/// Options for one framed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    command: String,
    timeout: Option<Duration>,
    capture_exit_code: bool,
    keep_log_lines: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
            capture_exit_code: false,
            keep_log_lines: false,
        }
    }

    /// Overrides the configured command timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Also fetch the command's exit status.
    #[must_use]
    pub fn capture_exit_code(mut self) -> Self {
        self.capture_exit_code = true;
        self
    }

    /// Keep kernel log lines (`[ 12.34] ...`) in the output.
    ///
    /// Needed for commands whose own output is timestamped, such as `dmesg`.
    #[must_use]
    pub fn keep_log_lines(mut self) -> Self {
        self.keep_log_lines = true;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Result of a framed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Output printed by the command, lines joined with `\n`.
    pub stdout: String,
    /// Exit status, when requested.
    pub exit_code: Option<i32>,
    /// Every line consumed while waiting, the sentinel line included.
    pub raw: Vec<RawLine>,
}

impl CommandOutput {
    /// True when the exit status was captured and is zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

impl ConsoleClient {
    /// Runs `command` and returns its output.
    ///
    /// Lines starting with a kernel timestamp (`[   12.345678] ...`) are
    /// treated as console noise and dropped, which includes the command's
    /// own output for things like `dmesg`. Use [`CommandRequest::keep_log_lines`]
    /// with [`execute`](Self::execute) to keep them.
    pub async fn run(&self, command: &str) -> Result<String> {
        let output = self.execute(CommandRequest::new(command)).await?;
        Ok(output.stdout)
    }

    /// Runs `command` and returns its output and exit status.
    pub async fn run_with_exit_code(&self, command: &str) -> Result<(String, i32)> {
        let output = self
            .execute(CommandRequest::new(command).capture_exit_code())
            .await?;
        let code = output.exit_code.unwrap_or(-1);
        Ok((output.stdout, code))
    }

    /// Runs `command`, failing with [`ConsoleError::CommandFailed`] on a
    /// non-zero exit status.
    pub async fn run_checked(&self, command: &str) -> Result<String> {
        let (stdout, exit_code) = self.run_with_exit_code(command).await?;
        if exit_code != 0 {
            return Err(ConsoleError::CommandFailed {
                command: command.to_string(),
                exit_code,
                output: stdout,
            });
        }
        Ok(stdout)
    }

    /// Runs one framed command.
    ///
    /// Kernel log lines are dropped from `stdout` unless the request asks
    /// for [`keep_log_lines`](CommandRequest::keep_log_lines); `raw` always
    /// has them.
    ///
    /// Holds the command lock for the whole exchange, so commands issued
    /// from several tasks run one after another.
    pub async fn execute(&self, request: CommandRequest) -> Result<CommandOutput> {
        let _guard = self.command_lock.lock().await;
        let timeout = request.timeout.unwrap_or(self.config.command_timeout);

        let mut frame = CommandFrame::new(&request.command, self.next_nonce());
        if request.capture_exit_code {
            frame = frame.with_exit_code();
        }

        let (stdout, raw) = self
            .exchange(&frame, timeout, request.keep_log_lines)
            .await?;

        let exit_code = if request.capture_exit_code {
            let query = CommandFrame::exit_code_query(self.next_nonce());
            let (text, _) = self.exchange(&query, timeout, false).await?;
            match parse_exit_code(&text) {
                Some(code) => Some(code),
                None => {
                    return Err(ConsoleError::UnexpectedOutput {
                        reason: "exit status is not a number".to_string(),
                        output: text,
                    })
                }
            }
        } else {
            None
        };

        debug!(command = %frame.command(), ?exit_code, lines = raw.len(), "Command finished");
        Ok(CommandOutput {
            stdout,
            exit_code,
            raw,
        })
    }

    /// Clears stale output, writes one frame and collects its output.
    async fn exchange(
        &self,
        frame: &CommandFrame,
        timeout: Duration,
        keep_log_lines: bool,
    ) -> Result<(String, Vec<RawLine>)> {
        let stale = self.queue.clear().await;
        if stale > 0 {
            debug!(lines = stale, "Discarded stale output before command");
        }

        self.write(frame.wire_text()).await?;

        let sentinel = frame.sentinel();
        let raw = self
            .waiter
            .wait_for_string_return_all(&sentinel, timeout, OnTimeout::Raise)
            .await
            .map_err(|e| {
                warn!(command = %frame.command(), error = %e, "Command did not complete");
                e
            })?;

        let kept: Vec<RawLine> = raw
            .iter()
            .filter(|line| {
                keep_log_lines || !starts_with_timestamp(line.text()) || line.contains(&sentinel)
            })
            .cloned()
            .collect();
        let block = join_lines(&kept);
        self.set_last_output(block.clone());

        match frame.extract_output(&block) {
            Some(stdout) => Ok((stdout, raw)),
            None => Err(ConsoleError::UnexpectedOutput {
                reason: format!("sentinel {sentinel} not found in captured output"),
                output: block,
            }),
        }
    }
}
