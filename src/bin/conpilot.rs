//! conpilot - drive a device serial console from the command line
//!
//! Connects to a telnet console gateway, performs one action and exits.
//!
//! # Usage
//!
//! ```bash
//! # Run a command on the device and exit with its status
//! conpilot --host 10.0.0.5 --port 7001 exec uname -a
//!
//! # Wait up to 120s for the device to finish booting
//! conpilot expect "login:" --timeout 120
//!
//! # Wait for a regex
//! conpilot expect --regex 'inet (\d+\.\d+\.\d+\.\d+)'
//!
//! # Follow console output for a minute
//! conpilot tail --duration 60
//!
//! # Get back to a clean prompt (interrupt, log in if needed)
//! conpilot reset
//!
//! # Enable debug logging of every line sent and received
//! conpilot --debug exec dmesg
//! RUST_LOG=conpilot_client=trace conpilot tail
//! ```
//!
//! Settings not given on the command line come from
//! `~/.config/conpilot/config.toml` (or `--config PATH`).

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use conpilot_client::{ConsoleClient, OnTimeout};
use conpilot_core::{default_config_path, ConsoleConfig, ConsoleConfigFile, DeviceFamily};

// ============================================================================
// CLI Arguments
// ============================================================================

/// Expect-style automation for serial consoles behind telnet gateways
#[derive(Parser, Debug)]
#[command(name = "conpilot", version, about)]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Console gateway host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Console gateway port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Device family used by `reset` (shell, bootloader)
    #[arg(long, global = true)]
    family: Option<DeviceFamily>,

    /// Log every line sent and received
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a shell command, print its output, exit with its status
    Exec {
        /// Command and arguments, joined with spaces
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,

        /// Seconds to wait for the command to finish
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Wait for a line containing PATTERN and print it
    Expect {
        pattern: String,

        /// Treat PATTERN as a regular expression
        #[arg(long)]
        regex: bool,

        /// Seconds to wait
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },
    /// Print console output as it arrives
    Tail {
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Interrupt whatever runs and return to a prompt
    Reset,
    /// Write TEXT followed by a newline
    Send { text: String },
}

// ============================================================================
// Configuration
// ============================================================================

fn load_config(args: &Args) -> Result<ConsoleConfig> {
    let path = args.config.clone().or_else(default_config_path);

    let mut config = match path {
        Some(path) if path.exists() => {
            debug!(path = %path.display(), "Loading configuration");
            ConsoleConfigFile::load(&path)?.into_config()?
        }
        Some(path) if args.config.is_some() => {
            bail!("Configuration file {} does not exist", path.display())
        }
        _ => ConsoleConfig::default(),
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(family) = args.family {
        config.family = family;
    }
    config.debug |= args.debug;

    config.validate().context("Invalid console configuration")?;
    Ok(config)
}

fn init_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().or_else(|_| {
                EnvFilter::try_new(format!("conpilot={level},conpilot_client={level}"))
            })?,
        )
        .init();
    Ok(())
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug)?;

    let config = load_config(&args)?;
    let address = config.address();
    info!(address = %address, version = env!("CARGO_PKG_VERSION"), "conpilot starting");

    let client = ConsoleClient::new(config)?;
    client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to console at {address}"))?;

    let result = run(&client, args.command).await;
    client.close().await;

    let code = result?;
    if code != 0 {
        process::exit(code);
    }
    Ok(())
}

/// Runs one subcommand; returns the process exit status.
async fn run(client: &ConsoleClient, command: Command) -> Result<i32> {
    match command {
        Command::Exec { command, timeout } => {
            let line = command.join(" ");
            let mut request = conpilot_client::CommandRequest::new(line).capture_exit_code();
            if let Some(secs) = timeout {
                request = request.timeout(Duration::from_secs(secs));
            }
            let output = client.execute(request).await.context("Command failed")?;
            if !output.stdout.is_empty() {
                println!("{}", output.stdout);
            }
            Ok(output.exit_code.unwrap_or(0))
        }
        Command::Expect {
            pattern,
            regex,
            timeout,
        } => {
            let timeout = Duration::from_secs(timeout);
            let line = if regex {
                let regex = Regex::new(&pattern).context("Invalid regular expression")?;
                client
                    .wait_for_filtered_string(&regex, timeout, OnTimeout::Raise)
                    .await?
                    .map(|found| found.line)
            } else {
                client
                    .wait_for_string(&pattern, timeout, OnTimeout::Raise)
                    .await?
            };
            if let Some(line) = line {
                println!("{line}");
            }
            Ok(0)
        }
        Command::Tail { duration } => {
            let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
            loop {
                let poll = match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        remaining.min(Duration::from_secs(1))
                    }
                    None => Duration::from_secs(1),
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted");
                        break;
                    }
                    line = client.read(poll) => {
                        if let Some(line) = line {
                            println!("{line}");
                        }
                    }
                }
            }
            Ok(0)
        }
        Command::Reset => {
            let state = client.reset_session().await.context("Reset failed")?;
            println!("console at {state}");
            Ok(0)
        }
        Command::Send { text } => {
            client.send_line(&text).await?;
            Ok(0)
        }
    }
}
