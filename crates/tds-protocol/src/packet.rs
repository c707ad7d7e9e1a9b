//! TDS packet header definitions.
//!
//! Every physical packet starts with an 8-byte header:
//!
//! ```text
//! offset 0    packet type
//! offset 1    status (bit 0 set on the last segment of a message)
//! offset 2-3  total packet length including header (big-endian)
//! offset 4-5  spare, always zero
//! offset 6    protocol flag (1 for TDS 7.0 and later)
//! offset 7    spare, always zero
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// TDS packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Smallest packet size a client may negotiate.
pub const MIN_PACKET_SIZE: usize = 512;

/// Largest packet a client can emit (the length field is 16 bits).
pub const MAX_PACKET_SIZE: usize = 65535;

/// Largest frame length accepted when reading.
pub const MAX_FRAME_LENGTH: usize = 65536;

/// Default packet size used until the server negotiates another one.
pub const DEFAULT_PACKET_SIZE: usize = MIN_PACKET_SIZE;

/// Exact length of a reply packet carrying nothing but a legacy 9-byte
/// DONE token.
///
/// A reply of this length holding a DONE token with the canceled bit set,
/// arriving right after another reply finished, is an acknowledgement for a
/// cancel nobody is waiting for.
pub const STRAY_CANCEL_ACK_LENGTH: usize = 17;

/// TDS packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Language (SQL text) request.
    Query = 0x01,
    /// Pre-TDS7 login packet.
    Login = 0x02,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Server reply.
    Reply = 0x04,
    /// Cancel (attention) signal.
    Cancel = 0x06,
    /// Sybase TDS 5.0 query packet.
    SybaseQuery = 0x0F,
    /// TDS7+ login packet.
    MsLogin = 0x10,
    /// NTLM authentication response.
    NtlmAuth = 0x11,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Query),
            0x02 => Ok(Self::Login),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::Reply),
            0x06 => Ok(Self::Cancel),
            0x0F => Ok(Self::SybaseQuery),
            0x10 => Ok(Self::MsLogin),
            0x11 => Ok(Self::NtlmAuth),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }

    /// Whether a server may legitimately send a packet of this type.
    ///
    /// Some servers (IBM Netcool OMNIbus) answer with `SybaseQuery` packets.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        matches!(
            self,
            Self::Login | Self::Query | Self::SybaseQuery | Self::Reply
        )
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// Normal packet, more packets to follow.
        const NORMAL = 0x00;
        /// Last segment of a logical message.
        const END_OF_MESSAGE = 0x01;
    }
}

/// TDS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header.
    pub length: u16,
    /// Set for TDS 7.0 and later.
    pub tds7: bool,
}

impl PacketHeader {
    /// Create a new packet header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            tds7: false,
        }
    }

    /// Parse a packet header from bytes.
    ///
    /// Unknown status bits are retained; only the last-segment bit carries
    /// meaning to the transport.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: PACKET_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status = PacketStatus::from_bits_retain(src.get_u8());
        let length = src.get_u16();
        if (length as usize) < PACKET_HEADER_SIZE {
            return Err(ProtocolError::InvalidLength(length as usize));
        }
        src.advance(2);
        let tds7 = src.get_u8() != 0;
        src.advance(1);

        Ok(Self {
            packet_type,
            status,
            length,
            tds7,
        })
    }

    /// Encode the packet header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(0);
        dst.put_u8(u8::from(self.tds7));
        dst.put_u8(0);
    }

    /// Encode the packet header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Read the big-endian length field of a raw header without validating
    /// anything else.
    #[must_use]
    pub fn peek_length(raw: &[u8]) -> Option<usize> {
        match raw {
            [_, _, hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo]) as usize),
            _ => None,
        }
    }

    /// Get the payload length (total length minus header).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Set the protocol flag.
    #[must_use]
    pub const fn with_tds7(mut self, tds7: bool) -> Self {
        self.tds7 = tds7;
        self
    }

    /// Build the header of a CANCEL packet.
    #[must_use]
    pub const fn cancel(tds7: bool) -> Self {
        Self {
            packet_type: PacketType::Cancel,
            status: PacketStatus::END_OF_MESSAGE,
            length: PACKET_HEADER_SIZE as u16,
            tds7,
        }
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self::new(
            PacketType::Query,
            PacketStatus::END_OF_MESSAGE,
            PACKET_HEADER_SIZE as u16,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            packet_type: PacketType::Query,
            status: PacketStatus::END_OF_MESSAGE,
            length: 100,
            tds7: true,
        };

        let bytes = header.encode_to_bytes();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);
        assert_eq!(&bytes[..], &[0x01, 0x01, 0x00, 0x64, 0x00, 0x00, 0x01, 0x00]);

        let mut cursor = bytes.as_ref();
        let decoded = PacketHeader::decode(&mut cursor).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_cancel_header_layout() {
        let bytes = PacketHeader::cancel(false).encode_to_bytes();
        assert_eq!(&bytes[..], &[0x06, 0x01, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00]);

        let bytes = PacketHeader::cancel(true).encode_to_bytes();
        assert_eq!(bytes[6], 1);
    }

    #[test]
    fn test_payload_length() {
        let header = PacketHeader::new(PacketType::Query, PacketStatus::END_OF_MESSAGE, 100);
        assert_eq!(header.payload_length(), 92);
    }

    #[test]
    fn test_short_length_rejected() {
        let raw = [0x04, 0x01, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00];
        let mut cursor = &raw[..];
        assert!(matches!(
            PacketHeader::decode(&mut cursor),
            Err(ProtocolError::InvalidLength(7))
        ));
    }

    #[test]
    fn test_peek_length() {
        assert_eq!(PacketHeader::peek_length(&[4, 1, 0x02, 0x00]), Some(512));
        assert_eq!(PacketHeader::peek_length(&[4, 1, 0x02]), None);
    }

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::from_u8(0x01).unwrap(), PacketType::Query);
        assert_eq!(PacketType::from_u8(0x0F).unwrap(), PacketType::SybaseQuery);
        assert!(PacketType::from_u8(0xFF).is_err());
        assert!(PacketType::Reply.is_readable());
        assert!(!PacketType::Cancel.is_readable());
    }

    fn packet_type() -> impl Strategy<Value = PacketType> {
        prop_oneof![
            Just(PacketType::Query),
            Just(PacketType::Login),
            Just(PacketType::Rpc),
            Just(PacketType::Reply),
            Just(PacketType::Cancel),
            Just(PacketType::SybaseQuery),
            Just(PacketType::MsLogin),
            Just(PacketType::NtlmAuth),
        ]
    }

    proptest! {
        #[test]
        fn prop_header_encode_decode_agree(
            packet_type in packet_type(),
            last in any::<bool>(),
            length in (PACKET_HEADER_SIZE as u16)..=u16::MAX,
            tds7 in any::<bool>(),
        ) {
            let status = if last { PacketStatus::END_OF_MESSAGE } else { PacketStatus::NORMAL };
            let header = PacketHeader::new(packet_type, status, length).with_tds7(tds7);
            let bytes = header.encode_to_bytes();
            prop_assert_eq!(PacketHeader::peek_length(&bytes), Some(length as usize));
            let decoded = PacketHeader::decode(&mut bytes.as_ref()).unwrap();
            prop_assert_eq!(decoded, header);
            prop_assert_eq!(decoded.is_last(), last);
        }
    }
}
