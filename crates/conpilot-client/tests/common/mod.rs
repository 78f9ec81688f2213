//! A scripted fake console gateway for integration tests.
//!
//! Listens on a local TCP port and behaves like a tiny BusyBox shell behind
//! a telnet gateway: it echoes input after a prompt, understands the
//! sentinel framing written by the client, and can inject kernel log noise,
//! split output lines, require a login or drop the connection.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conpilot_core::{ConsoleConfig, RetryPolicy};
use conpilot_protocol::{TelnetEvent, TelnetLineCodec};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

pub const PROMPT: &str = "root@fake:~# ";
pub const NOISE: &str = "[    3.141592] random: crng init done";
pub const DMESG: [&str; 2] = [
    "[    0.000000] Booting Linux on physical CPU 0x0",
    "[    1.250000] eth0: link up, 1000Mbps",
];
pub const SPLIT_NOISE: &str = "[    5.000001] usb 1-1: new high-speed USB device number 2";

/// Behavior switches for the fake console.
#[derive(Debug, Clone, Default)]
pub struct FakeOptions {
    /// Print a kernel log line before every command's output.
    pub noise: bool,
    /// Split the first output line of each command with a kernel log line.
    pub split_output: bool,
    /// Drop the first connection after answering this many framed commands.
    pub drop_after: Option<usize>,
    /// Require `login:` / `Password:` before the shell, with these credentials.
    pub login: Option<(String, String)>,
    /// Accept connections but never send or answer anything.
    pub silent: bool,
}

/// A running fake console.
pub struct FakeConsole {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
}

impl FakeConsole {
    pub async fn start(options: FakeOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake console");
        let port = listener.local_addr().expect("local addr").port();
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let accept_connections = Arc::clone(&connections);
        let accept_received = Arc::clone(&received);
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok(pair) => pair,
                        Err(_) => break,
                    },
                };
                let index = accept_connections.fetch_add(1, Ordering::SeqCst);
                let session = Session {
                    options: options.clone(),
                    first_connection: index == 0,
                    received: Arc::clone(&accept_received),
                    cancel: accept_cancel.clone(),
                };
                tokio::spawn(session.run(socket));
            }
        });

        Self {
            port,
            connections,
            received,
            cancel,
        }
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every line the console received, in order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().expect("received lock").clone()
    }

    /// Client configuration pointing at this console, with short timings.
    pub fn config(&self) -> ConsoleConfig {
        let mut config = ConsoleConfig::new("127.0.0.1", self.port);
        config.connect_timeout = Duration::from_secs(2);
        config.retry = RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        };
        config.read_timeout = Duration::from_millis(500);
        config.partial_flush = Duration::from_millis(50);
        config.write_timeout = Duration::from_secs(2);
        config.close_timeout = Duration::from_secs(2);
        config.command_timeout = Duration::from_secs(5);
        config.drain_grace = Duration::from_millis(100);
        config.prompts = vec![PROMPT.trim().to_string()];
        config
    }
}

impl Drop for FakeConsole {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    LoggedOut,
    AwaitUser,
    AwaitPassword,
    Shell,
}

struct Session {
    options: FakeOptions,
    first_connection: bool,
    received: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
}

impl Session {
    async fn run(self, socket: tokio::net::TcpStream) {
        let (reader, mut writer) = socket.into_split();
        let mut lines = FramedRead::new(reader, TelnetLineCodec::new());

        let mut stage = if self.options.login.is_some() {
            Stage::LoggedOut
        } else {
            Stage::Shell
        };
        if stage == Stage::Shell && !self.options.silent {
            let _ = writer.write_all(PROMPT.as_bytes()).await;
        }

        let mut exit_code_var = 0;
        let mut framed_answered = 0usize;

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = lines.next() => event,
            };
            let line = match event {
                Some(Ok(TelnetEvent::Line(line))) => line,
                Some(Ok(TelnetEvent::Reply(_))) => continue,
                _ => return,
            };
            self.received.lock().expect("received lock").push(line.clone());

            if self.options.silent {
                continue;
            }

            let interrupted = line.contains('\u{3}');
            let current = stage;
            let reply = match current {
                Stage::LoggedOut => {
                    stage = Stage::AwaitUser;
                    "^C\r\nfake login: ".to_string()
                }
                Stage::AwaitUser if interrupted => "^C\r\nfake login: ".to_string(),
                Stage::AwaitUser => {
                    stage = Stage::AwaitPassword;
                    format!("{line}\r\nPassword: ")
                }
                Stage::AwaitPassword => {
                    let expected = self.options.login.as_ref().map(|(_, p)| p.as_str());
                    if interrupted || Some(line.as_str()) != expected {
                        stage = Stage::AwaitUser;
                        "\r\nLogin incorrect\r\nfake login: ".to_string()
                    } else {
                        stage = Stage::Shell;
                        format!("\r\n{PROMPT}")
                    }
                }
                Stage::Shell if interrupted => format!("^C\r\n{PROMPT}"),
                Stage::Shell => {
                    let reply = self.shell_reply(&line, &mut exit_code_var).await;
                    if reply.framed {
                        framed_answered += 1;
                    }
                    reply.text
                }
            };

            if writer.write_all(reply.as_bytes()).await.is_err() {
                return;
            }

            if self.first_connection && self.options.drop_after == Some(framed_answered) {
                let _ = writer.shutdown().await;
                return;
            }
        }
    }

    async fn shell_reply(&self, line: &str, exit_code_var: &mut i32) -> Reply {
        let mut text = format!("{line}\r\n");

        let (command, sentinel, capture) = match parse_frame(line) {
            Some(frame) => (frame.command, Some(frame.sentinel), frame.capture),
            None => (line.to_string(), None, false),
        };

        let (output, code) = evaluate(&command, *exit_code_var).await;
        if capture {
            *exit_code_var = code;
        }

        if self.options.noise {
            text.push_str(NOISE);
            text.push_str("\r\n");
        }
        for (i, out) in output.iter().enumerate() {
            if i == 0 && self.options.split_output && out.len() >= 2 {
                let (head, tail) = out.split_at(out.len() / 2);
                text.push_str(&format!("{head}{SPLIT_NOISE}\r\n{tail}\r\n"));
            } else {
                text.push_str(out);
                text.push_str("\r\n");
            }
        }
        if let Some(sentinel) = &sentinel {
            text.push_str(sentinel);
            text.push_str("\r\n");
        }
        text.push_str(PROMPT);

        Reply {
            text,
            framed: sentinel.is_some(),
        }
    }
}

struct Reply {
    text: String,
    framed: bool,
}

struct Frame {
    command: String,
    sentinel: String,
    capture: bool,
}

/// Undoes the client's framing: `{cmd}; [EXITCODE=$?; ]PRE={head} && echo "$PRE"{tail}`.
fn parse_frame(line: &str) -> Option<Frame> {
    let (before, after) = line.rsplit_once("PRE=")?;
    let (head, echo) = after.split_once(" && echo ")?;
    let sentinel = echo.replace("\"$PRE\"", head);

    let (before, capture) = match before.strip_suffix("EXITCODE=$?; ") {
        Some(rest) => (rest, true),
        None => (before, false),
    };
    let command = before.trim_end().trim_end_matches(';').trim().to_string();

    Some(Frame {
        command,
        sentinel,
        capture,
    })
}

/// A handful of BusyBox builtins.
async fn evaluate(command: &str, exit_code_var: i32) -> (Vec<String>, i32) {
    let mut words = command.split_whitespace();
    let Some(program) = words.next() else {
        return (Vec::new(), 0);
    };
    let args: Vec<&str> = words.collect();

    match program {
        "echo" if args == ["$EXITCODE"] => (vec![exit_code_var.to_string()], 0),
        "echo" => (vec![args.join(" ")], 0),
        "dmesg" => (DMESG.iter().map(|line| line.to_string()).collect(), 0),
        "true" => (Vec::new(), 0),
        "false" => (Vec::new(), 1),
        "seq" => {
            let n: u32 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
            ((1..=n).map(|i| i.to_string()).collect(), 0)
        }
        "sleep" => {
            let secs: f64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0.0);
            sleep(Duration::from_secs_f64(secs)).await;
            (Vec::new(), 0)
        }
        "ls" if args.first().is_some_and(|a| a.starts_with("/missing")) => (
            vec![format!("ls: {}: No such file or directory", args[0])],
            2,
        ),
        _ => (vec![format!("sh: {program}: not found")], 127),
    }
}
