//! TDS packet codec implementation.

use bytes::{BufMut, BytesMut};
use tds_protocol::packet::{
    MAX_FRAME_LENGTH, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
};
use tds_protocol::ProtocolError;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// A full physical packet: the 8-byte header followed by its payload.
///
/// The header's length field always equals the frame length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    frame: BytesMut,
}

impl Packet {
    /// Build a packet from a header and payload, fixing up the length field.
    #[must_use]
    pub fn new(header: PacketHeader, payload: &[u8]) -> Self {
        let total = PACKET_HEADER_SIZE + payload.len();
        let mut frame = BytesMut::with_capacity(total);
        PacketHeader {
            length: total as u16,
            ..header
        }
        .encode(&mut frame);
        frame.put_slice(payload);
        Self { frame }
    }

    /// Wrap a raw frame, checking the length field against the buffer.
    pub fn from_frame(frame: BytesMut) -> Result<Self> {
        let length = PacketHeader::peek_length(&frame).ok_or(ProtocolError::IncompletePacket {
            expected: PACKET_HEADER_SIZE,
            actual: frame.len(),
        })?;
        if length < PACKET_HEADER_SIZE || length != frame.len() {
            return Err(ProtocolError::InvalidLength(length).into());
        }
        Ok(Self { frame })
    }

    /// Build a CANCEL packet.
    #[must_use]
    pub fn cancel(tds7: bool) -> Self {
        Self::new(PacketHeader::cancel(tds7), &[])
    }

    /// Raw packet type byte.
    #[must_use]
    pub fn type_byte(&self) -> u8 {
        self.frame[0]
    }

    /// Packet type, if known.
    #[must_use]
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.type_byte()).ok()
    }

    /// Whether this is the last packet of a logical message.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.frame[1] & PacketStatus::END_OF_MESSAGE.bits() != 0
    }

    /// Set or clear the last-packet flag.
    pub fn set_last(&mut self, last: bool) {
        if last {
            self.frame[1] |= PacketStatus::END_OF_MESSAGE.bits();
        } else {
            self.frame[1] &= !PacketStatus::END_OF_MESSAGE.bits();
        }
    }

    /// Total frame length including the header.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    /// Whether the packet carries no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frame.len() == PACKET_HEADER_SIZE
    }

    /// Payload bytes after the header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.frame[PACKET_HEADER_SIZE..]
    }

    /// The whole frame, header included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// Consume the packet and return its frame.
    #[must_use]
    pub fn into_frame(self) -> BytesMut {
        self.frame
    }
}

/// TDS packet codec for tokio-util framing.
///
/// The decoder rejects frames whose length is outside `8..=65536` and, unless
/// built with [`TdsCodec::any_type`], packet types a server never sends.
#[derive(Debug, Clone)]
pub struct TdsCodec {
    max_frame_length: usize,
    server_types_only: bool,
}

impl TdsCodec {
    /// Create a codec for reading server replies.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
            server_types_only: true,
        }
    }

    /// Accept every known packet type, as a server reading client requests
    /// would.
    #[must_use]
    pub fn any_type(mut self) -> Self {
        self.server_types_only = false;
        self
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let packet_type = PacketType::from_u8(src[0])?;
        if self.server_types_only && !packet_type.is_readable() {
            return Err(ProtocolError::UnexpectedPacketType(src[0]).into());
        }

        let length = u16::from_be_bytes([src[2], src[3]]) as usize;
        if length < PACKET_HEADER_SIZE || length > self.max_frame_length {
            return Err(ProtocolError::InvalidLength(length).into());
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let frame = src.split_to(length);

        tracing::trace!(
            packet_type = ?packet_type,
            length = length,
            last = frame[1] & PacketStatus::END_OF_MESSAGE.bits() != 0,
            "decoded TDS packet"
        );

        Ok(Some(Packet { frame }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::ConnectionClosed),
        }
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        if item.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::InvalidLength(item.len()).into());
        }

        dst.extend_from_slice(&item.frame);

        tracing::trace!(
            packet_type = item.type_byte(),
            length = item.len(),
            last = item.is_last(),
            "encoded TDS packet"
        );

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn reply_frame(status: u8, payload: &[u8]) -> BytesMut {
        let mut data = BytesMut::new();
        data.put_u8(PacketType::Reply as u8);
        data.put_u8(status);
        data.put_u16((PACKET_HEADER_SIZE + payload.len()) as u16);
        data.put_u16(0);
        data.put_u8(1);
        data.put_u8(0);
        data.put_slice(payload);
        data
    }

    #[test]
    fn test_decode_packet() {
        let mut codec = TdsCodec::new();
        let mut data = reply_frame(1, b"test");

        let packet = codec.decode(&mut data).unwrap().unwrap();
        assert_eq!(packet.packet_type(), Some(PacketType::Reply));
        assert!(packet.is_last());
        assert_eq!(packet.payload(), b"test");
        assert!(data.is_empty());
    }

    #[test]
    fn test_incomplete_packet() {
        let mut codec = TdsCodec::new();
        let mut data = reply_frame(1, b"test");
        data.truncate(10);

        assert!(codec.decode(&mut data).unwrap().is_none());
        assert!(matches!(
            codec.decode_eof(&mut data),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_rejects_short_length() {
        let mut codec = TdsCodec::new();
        let mut data = reply_frame(1, b"");
        data[3] = 4;

        assert!(matches!(
            codec.decode(&mut data),
            Err(Error::Protocol(ProtocolError::InvalidLength(4)))
        ));
    }

    #[test]
    fn test_rejects_client_packet_types() {
        let mut data = reply_frame(1, b"");
        data[0] = PacketType::Cancel as u8;

        assert!(matches!(
            TdsCodec::new().decode(&mut data.clone()),
            Err(Error::Protocol(ProtocolError::UnexpectedPacketType(0x06)))
        ));
        assert!(TdsCodec::new().any_type().decode(&mut data).unwrap().is_some());

        let mut unknown = reply_frame(1, b"");
        unknown[0] = 0x42;
        assert!(matches!(
            TdsCodec::new().decode(&mut unknown),
            Err(Error::Protocol(ProtocolError::InvalidPacketType(0x42)))
        ));
    }

    #[test]
    fn test_encode_packet() {
        let mut codec = TdsCodec::new();
        let header = PacketHeader::new(PacketType::Query, PacketStatus::END_OF_MESSAGE, 0);
        let packet = Packet::new(header, b"test");
        assert_eq!(packet.len(), 12);

        let mut dst = BytesMut::new();
        codec.encode(packet, &mut dst).unwrap();
        assert_eq!(&dst[..4], &[0x01, 0x01, 0x00, 0x0C]);
    }

    #[test]
    fn test_set_last_preserves_other_bits() {
        let mut packet = Packet::from_frame(reply_frame(0x09, b"x")).unwrap();
        packet.set_last(false);
        assert_eq!(packet.as_bytes()[1], 0x08);
        packet.set_last(true);
        assert_eq!(packet.as_bytes()[1], 0x09);
    }

    #[test]
    fn test_from_frame_checks_length() {
        let mut frame = reply_frame(1, b"abc");
        frame.truncate(9);
        assert!(Packet::from_frame(frame).is_err());
        assert!(Packet::from_frame(BytesMut::from(&[4u8, 1][..])).is_err());
    }
}
