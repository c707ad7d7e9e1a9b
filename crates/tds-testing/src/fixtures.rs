//! Reply fixtures.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::done::DONE_TOKEN;
use tds_protocol::{DoneStatus, TdsVersion};

/// Encode a DONE token in the layout of `version`.
pub fn done(status: DoneStatus, row_count: u64, version: TdsVersion) -> Bytes {
    let mut buf = BytesMut::with_capacity(version.done_token_length());
    buf.put_u8(DONE_TOKEN);
    buf.put_u16_le(status.bits());
    buf.put_u16_le(0);
    if version.done_token_length() == 13 {
        buf.put_u64_le(row_count);
    } else {
        buf.put_u32_le(row_count as u32);
    }
    buf.freeze()
}

/// A final DONE token.
pub fn done_final(version: TdsVersion) -> Bytes {
    done(DoneStatus::empty(), 0, version)
}

/// The DONE token a server sends to acknowledge a cancel.
pub fn cancel_ack(version: TdsVersion) -> Bytes {
    done(DoneStatus::CANCELED, 0, version)
}

/// `body` followed by a final DONE token.
pub fn reply_with_done(body: &[u8], version: TdsVersion) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + version.done_token_length());
    buf.put_slice(body);
    buf.put_slice(&done_final(version));
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_layouts() {
        assert_eq!(done_final(TdsVersion::V7_1).len(), 9);
        assert_eq!(done_final(TdsVersion::V7_4).len(), 13);

        let ack = cancel_ack(TdsVersion::V7_1);
        assert_eq!(&ack[..3], &[0xFD, 0x20, 0x00]);
    }
}
