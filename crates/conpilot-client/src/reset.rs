//! Session reset: bring the console back to an interactive prompt.
//!
//! Each attempt interrupts whatever is running, waits for the console to go
//! quiet and classifies the last line it printed. Login and password
//! prompts are answered from the configured credentials; continuation
//! prompts and silence get another interrupt.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use conpilot_core::RawLine;
use conpilot_protocol::{ConsoleState, ResetProfile};

use crate::client::ConsoleClient;
use crate::error::{ConsoleError, Result};

/// Interrupt/classify rounds before giving up.
pub const RESET_ATTEMPTS: u32 = 5;

/// Upper bound for collecting the response to one round.
const MAX_SETTLE_WINDOW: Duration = Duration::from_secs(5);

impl ConsoleClient {
    /// Returns the console to a shell (or bootloader) prompt.
    ///
    /// Holds the command lock, so no framed command runs concurrently.
    pub async fn reset_session(&self) -> Result<ConsoleState> {
        let _guard = self.command_lock.lock().await;
        let profile = ResetProfile::for_family(self.config.family, &self.config.prompts);
        info!(family = %profile.family(), "Resetting console session");

        let mut interrupt = true;
        let mut state = ConsoleState::Unknown;

        for attempt in 1..=RESET_ATTEMPTS {
            if interrupt {
                self.queue.clear().await;
                self.write(profile.interrupt()).await?;
            }

            let lines = self.collect_until_quiet().await;
            let texts: Vec<&str> = lines.iter().map(RawLine::text).collect();
            state = profile.classify(&texts);
            debug!(attempt, %state, lines = lines.len(), "Console state after reset round");

            match state {
                ConsoleState::Prompt => {
                    info!(attempt, "Console at prompt");
                    return Ok(state);
                }
                ConsoleState::LoginPrompt => {
                    let username = self.config.username.as_deref().ok_or_else(|| {
                        ConsoleError::UnexpectedOutput {
                            reason: "console asks for a login but no username is configured"
                                .to_string(),
                            output: texts.join("\n"),
                        }
                    })?;
                    self.send_line(username).await?;
                    interrupt = false;
                }
                ConsoleState::PasswordPrompt => {
                    let password = self.config.password.as_deref().ok_or_else(|| {
                        ConsoleError::UnexpectedOutput {
                            reason: "console asks for a password but none is configured"
                                .to_string(),
                            output: texts.join("\n"),
                        }
                    })?;
                    self.send_line(password).await?;
                    interrupt = false;
                }
                ConsoleState::Continuation | ConsoleState::Unknown => {
                    interrupt = true;
                }
            }
        }

        warn!(attempts = RESET_ATTEMPTS, %state, "Console reset gave up");
        Err(ConsoleError::ResetFailed {
            attempts: RESET_ATTEMPTS,
            last_state: state,
        })
    }

    /// Reads until no line arrives for one settle interval.
    ///
    /// The reader emits an unterminated prompt within two partial-flush
    /// windows, so the interval covers both plus the drain grace.
    async fn collect_until_quiet(&self) -> Vec<RawLine> {
        let settle = self.config.partial_flush * 2 + self.config.drain_grace;
        let deadline = Instant::now() + MAX_SETTLE_WINDOW.max(settle * 2);
        let mut lines = Vec::new();

        while Instant::now() < deadline {
            match self.queue.read(settle).await {
                Some(line) => lines.push(line),
                None => break,
            }
        }
        lines
    }
}
