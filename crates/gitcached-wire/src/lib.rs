//! Pkt-line framing for the git daemon protocol.
//!
//! All git smart-protocol traffic is carried in pkt-line frames: a
//! 4-digit lower-hex length prefix (counting itself), or the literal
//! `0000` flush marker. Pack transfer additionally multiplexes three
//! sideband channels inside frame payloads, selected by the first
//! payload byte (1 = pack data, 2 = progress text, 3 = fatal error).
//!
//! This crate provides the frame type, an incremental decoder that is
//! safe against arbitrary chunk boundaries, and [`PktStream`], a framed
//! duplex stream usable over both sockets and child-process pipes.

mod codec;
mod frame;
mod stream;

pub use codec::{FrameDecoder, FrameEvent};
pub use frame::{Band, Frame, FLUSH_BYTES, MAX_PAYLOAD_LEN};
pub use stream::{DynPktStream, DynReader, DynWriter, PktStream, StreamEvent};

use thiserror::Error;

/// Errors produced while decoding pkt-line data.
#[derive(Debug, Error)]
pub enum WireError {
    /// The 4-byte length prefix was not valid, or declared a length the
    /// protocol reserves (1 through 3).
    #[error("invalid pkt-line length prefix {prefix:?}")]
    InvalidLength {
        /// The offending prefix bytes, lossily decoded.
        prefix: String,
    },

    /// I/O failure on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
