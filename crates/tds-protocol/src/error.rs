//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while decoding or encoding TDS wire structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Not enough bytes to decode the structure.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown packet type byte.
    #[error("unknown packet type 0x{0:02x}")]
    InvalidPacketType(u8),

    /// Packet type that a server never sends.
    #[error("unexpected packet type 0x{0:02x} from server")]
    UnexpectedPacketType(u8),

    /// Packet length outside the legal range.
    #[error("invalid network packet length {0}")]
    InvalidLength(usize),

    /// Expected an end-of-data token.
    #[error("expecting a DONE token, found 0x{0:02x}")]
    ExpectedDone(u8),

    /// Unknown protocol version.
    #[error("unsupported TDS version 0x{0:08x}")]
    UnsupportedVersion(u32),
}
