//! Protocol-layer error types.

use thiserror::Error;

/// Errors surfaced by the console line codec.
///
/// Decoding itself cannot fail; the only error source is the underlying
/// transport, which `FramedRead` routes through the codec error type.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}
