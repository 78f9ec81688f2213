//! Telnet-aware line codec.
//!
//! Serial-to-network gateways speak a thin telnet layer over TCP. The
//! console itself never sends anything but text, so this codec only does
//! enough telnet to stay out of the way:
//!
//! - `IAC IAC` decodes to a literal `0xFF` data byte
//! - `IAC DO x` is refused with `IAC WONT x`, `IAC WILL x` with `IAC DONT x`
//! - `IAC WONT` / `IAC DONT` need no answer
//! - subnegotiation (`IAC SB … IAC SE`) and other commands are discarded
//!
//! Data bytes are split into lines on `\n`. Trailing `\r` and NUL bytes are
//! stripped, and text is decoded as lossy UTF-8. Lines longer than the
//! configured limit are emitted in pieces.

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::CodecError;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const NOP: u8 = 241;
pub const SE: u8 = 240;

/// Harmless no-op written after every open to verify the session is live.
pub const NOP_PROBE: [u8; 2] = [IAC, NOP];

/// Maximum decoded line length (64 KiB)
pub const MAX_LINE_LENGTH: usize = 65_536;

/// Output of the telnet line codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetEvent {
    /// One complete console line, terminator removed.
    Line(String),

    /// Negotiation answer that must be written back to the peer.
    Reply(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Data,
    Iac,
    Negotiate(u8),
    Subnegotiation,
    SubnegotiationIac,
}

/// Incremental decoder for a telnet console stream.
///
/// Consumes every byte it is given; an unterminated line is kept inside the
/// codec and can be retrieved with [`TelnetLineCodec::take_partial`] once the
/// stream goes idle.
#[derive(Debug)]
pub struct TelnetLineCodec {
    line: Vec<u8>,
    state: ParseState,
    max_line_length: usize,
}

impl TelnetLineCodec {
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            line: Vec::new(),
            state: ParseState::Data,
            max_line_length: max_line_length.max(1),
        }
    }

    /// Returns the buffered partial line, if any, and clears it.
    ///
    /// Used for prompts that are written without a trailing newline.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.line.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.line);
        let text = finish_line(bytes);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Returns true when a partial line is buffered.
    pub fn has_partial(&self) -> bool {
        !self.line.is_empty()
    }

    fn emit_line(&mut self) -> TelnetEvent {
        TelnetEvent::Line(finish_line(std::mem::take(&mut self.line)))
    }
}

impl Default for TelnetLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TelnetLineCodec {
    type Item = TelnetEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut consumed = 0;
        let mut event = None;

        for &byte in src.iter() {
            consumed += 1;
            match self.state {
                ParseState::Data => match byte {
                    IAC => self.state = ParseState::Iac,
                    b'\n' => {
                        event = Some(self.emit_line());
                    }
                    _ => {
                        self.line.push(byte);
                        if self.line.len() >= self.max_line_length {
                            event = Some(self.emit_line());
                        }
                    }
                },
                ParseState::Iac => match byte {
                    IAC => {
                        self.state = ParseState::Data;
                        self.line.push(IAC);
                    }
                    DO | DONT | WILL | WONT => self.state = ParseState::Negotiate(byte),
                    SB => self.state = ParseState::Subnegotiation,
                    _ => self.state = ParseState::Data,
                },
                ParseState::Negotiate(verb) => {
                    self.state = ParseState::Data;
                    if let Some(reply) = refusal(verb, byte) {
                        event = Some(TelnetEvent::Reply(reply));
                    }
                }
                ParseState::Subnegotiation => {
                    if byte == IAC {
                        self.state = ParseState::SubnegotiationIac;
                    }
                }
                ParseState::SubnegotiationIac => {
                    self.state = if byte == SE {
                        ParseState::Data
                    } else {
                        ParseState::Subnegotiation
                    };
                }
            }

            if event.is_some() {
                break;
            }
        }

        src.advance(consumed);
        Ok(event)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        Ok(self.take_partial().map(TelnetEvent::Line))
    }
}

/// Builds the refusal for a negotiation request, if one is owed.
fn refusal(verb: u8, option: u8) -> Option<Vec<u8>> {
    match verb {
        DO => Some(vec![IAC, WONT, option]),
        WILL => Some(vec![IAC, DONT, option]),
        _ => None,
    }
}

fn finish_line(mut bytes: Vec<u8>) -> String {
    bytes.retain(|&b| b != 0);
    while bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Escapes outgoing data so literal `0xFF` bytes are not read as commands.
pub fn escape_iac(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    out
}
