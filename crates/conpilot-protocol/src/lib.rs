//! conpilot Protocol - Console stream codec and command framing
//!
//! This crate holds the I/O-free pieces of the console protocol:
//!
//! - `telnet` - telnet-aware line decoder for the raw byte stream
//! - `repair` - reassembly of lines split by interleaved kernel log output
//! - `framing` - sentinel framing of shell commands and output extraction
//! - `classify` - console state recognition for session reset
//!
//! Everything here is synchronous and deterministic; the async client in
//! `conpilot-client` drives it.

pub mod classify;
pub mod error;
pub mod framing;
pub mod repair;
pub mod telnet;

pub use classify::{ConsoleState, ResetProfile, INTERRUPT};
pub use error::CodecError;
pub use framing::{parse_exit_code, CommandFrame};
pub use repair::{find_interleave, starts_with_timestamp, LineRepairer};
pub use telnet::{escape_iac, TelnetEvent, TelnetLineCodec, MAX_LINE_LENGTH, NOP_PROBE};
