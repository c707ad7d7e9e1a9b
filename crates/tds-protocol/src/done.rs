//! End-of-data (DONE) marker.
//!
//! Every server reply is terminated by a DONE-family token. The transport
//! never parses token streams, but cancellation bookkeeping needs to look at
//! the status word of the trailing DONE token.

use bitflags::bitflags;
use bytes::Buf;

use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// DONE token: end of a statement.
pub const DONE_TOKEN: u8 = 0xFD;

/// DONEPROC token: end of a stored procedure.
pub const DONEPROC_TOKEN: u8 = 0xFE;

/// DONEINPROC token: end of a statement inside a stored procedure.
pub const DONEINPROC_TOKEN: u8 = 0xFF;

bitflags! {
    /// Status word of a DONE-family token.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DoneStatus: u16 {
        /// More result sets follow.
        const MORE_RESULTS = 0x0001;
        /// An error occurred.
        const ERROR = 0x0002;
        /// The row count field is valid.
        const ROW_COUNT_VALID = 0x0010;
        /// The operation was canceled.
        const CANCELED = 0x0020;
    }
}

/// Check whether a token byte starts a DONE-family token.
#[must_use]
pub const fn is_done_token(token: u8) -> bool {
    token >= DONE_TOKEN
}

/// A decoded DONE-family token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// The token byte (`DONE`, `DONEPROC` or `DONEINPROC`).
    pub token: u8,
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count, meaningful when `ROW_COUNT_VALID` is set.
    pub row_count: u64,
}

impl Done {
    /// Decode a DONE-family token, including its token byte.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        let needed = version.done_token_length();
        if src.remaining() < needed {
            return Err(ProtocolError::IncompletePacket {
                expected: needed,
                actual: src.remaining(),
            });
        }

        let token = src.get_u8();
        if !is_done_token(token) {
            return Err(ProtocolError::ExpectedDone(token));
        }
        let status = DoneStatus::from_bits_retain(src.get_u16_le());
        let cur_cmd = src.get_u16_le();
        let row_count = if needed == 13 {
            src.get_u64_le()
        } else {
            u64::from(src.get_u32_le())
        };

        Ok(Self {
            token,
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Whether the server acknowledged a cancel with this token.
    #[must_use]
    pub const fn is_cancel_ack(&self) -> bool {
        self.status.contains(DoneStatus::CANCELED)
    }

    /// Whether further result sets follow on the same reply.
    #[must_use]
    pub const fn has_more_results(&self) -> bool {
        self.status.contains(DoneStatus::MORE_RESULTS)
    }
}

/// Check the raw bytes of a DONE-family token for the canceled bit.
///
/// `tail` must start at the token byte.
pub fn tail_is_cancel_ack(tail: &[u8]) -> Result<bool, ProtocolError> {
    match tail {
        [token, ..] if !is_done_token(*token) => Err(ProtocolError::ExpectedDone(*token)),
        [_, status, ..] => Ok(*status as u16 & DoneStatus::CANCELED.bits() != 0),
        _ => Err(ProtocolError::IncompletePacket {
            expected: 2,
            actual: tail.len(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_legacy_done() {
        let raw = [0xFD, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let done = Done::decode(&mut &raw[..], TdsVersion::V7_1).unwrap();
        assert!(done.is_cancel_ack());
        assert!(!done.has_more_results());
        assert_eq!(done.row_count, 0);
    }

    #[test]
    fn test_decode_wide_row_count() {
        let raw = [0xFE, 0x11, 0x00, 0xC1, 0x00, 5, 0, 0, 0, 0, 0, 0, 0];
        let done = Done::decode(&mut &raw[..], TdsVersion::V7_4).unwrap();
        assert_eq!(done.token, DONEPROC_TOKEN);
        assert!(done.has_more_results());
        assert!(done.status.contains(DoneStatus::ROW_COUNT_VALID));
        assert_eq!(done.cur_cmd, 0xC1);
        assert_eq!(done.row_count, 5);
    }

    #[test]
    fn test_decode_rejects_other_tokens() {
        let raw = [0xD1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            Done::decode(&mut &raw[..], TdsVersion::V5_0),
            Err(ProtocolError::ExpectedDone(0xD1))
        );
    }

    #[test]
    fn test_tail_is_cancel_ack() {
        assert!(tail_is_cancel_ack(&[0xFD, 0x20, 0, 0]).unwrap());
        assert!(!tail_is_cancel_ack(&[0xFF, 0x01, 0, 0]).unwrap());
        assert!(tail_is_cancel_ack(&[0x79, 0x20]).is_err());
        assert!(tail_is_cancel_ack(&[0xFD]).is_err());
    }
}
