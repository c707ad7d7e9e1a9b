//! Scripted server end of an in-memory connection.
//!
//! ```rust,ignore
//! let (client, server) = tokio::io::duplex(64 * 1024);
//! let mut peer = MockTdsPeer::new(server);
//!
//! let request = peer.read_request().await?;
//! peer.send_reply(&fixtures::reply_with_done(b"", TdsVersion::V7_1)).await?;
//! ```

use bytes::{Bytes, BytesMut};
use tds_protocol::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MockServerError, Result};

/// One physical packet as seen by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Decoded header.
    pub header: PacketHeader,
    /// Payload after the header.
    pub payload: Bytes,
}

impl RawPacket {
    /// Whether the last-segment flag is set.
    pub fn is_last(&self) -> bool {
        self.header.is_last()
    }
}

/// A request reassembled from its packets.
#[derive(Debug, Clone)]
pub struct Request {
    /// Type of the first packet.
    pub packet_type: PacketType,
    /// Concatenated payloads.
    pub payload: Bytes,
    /// Packets the request arrived in.
    pub packets: Vec<RawPacket>,
}

/// Server end of a connection, driven step by step by a test.
#[derive(Debug)]
pub struct MockTdsPeer<S> {
    stream: S,
    packet_size: usize,
    tds7: bool,
}

impl<S> MockTdsPeer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap the server end of a connection. Replies use 512-byte packets.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            packet_size: 512,
            tds7: true,
        }
    }

    /// Set the packet size used by [`send_reply`](Self::send_reply).
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the protocol flag written in reply headers.
    pub fn with_tds7(mut self, tds7: bool) -> Self {
        self.tds7 = tds7;
        self
    }

    /// Read one physical packet.
    pub async fn read_packet(&mut self) -> Result<RawPacket> {
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        self.stream.read_exact(&mut raw).await?;
        let header = PacketHeader::decode(&mut &raw[..])
            .map_err(|e| MockServerError::Protocol(e.to_string()))?;

        let mut payload = vec![0u8; header.payload_length()];
        self.stream.read_exact(&mut payload).await?;
        tracing::trace!(
            packet_type = ?header.packet_type,
            length = header.length,
            last = header.is_last(),
            "peer received packet"
        );
        Ok(RawPacket {
            header,
            payload: payload.into(),
        })
    }

    /// Read packets up to and including the last one of a request.
    pub async fn read_request(&mut self) -> Result<Request> {
        let mut packets = Vec::new();
        let mut payload = BytesMut::new();
        loop {
            let packet = self.read_packet().await?;
            payload.extend_from_slice(&packet.payload);
            let last = packet.is_last();
            packets.push(packet);
            if last {
                break;
            }
        }
        Ok(Request {
            packet_type: packets[0].header.packet_type,
            payload: payload.freeze(),
            packets,
        })
    }

    /// Read packets until a CANCEL arrives, returning what came before it.
    pub async fn read_until_cancel(&mut self) -> Result<Vec<RawPacket>> {
        let mut before = Vec::new();
        loop {
            let packet = self.read_packet().await?;
            if packet.header.packet_type == PacketType::Cancel {
                return Ok(before);
            }
            before.push(packet);
        }
    }

    /// Write one reply packet.
    pub async fn send_packet(&mut self, payload: &[u8], last: bool) -> Result<()> {
        self.write_packet(PacketType::Reply, payload, last).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write `payload` as a reply cut into packets of the configured size.
    pub async fn send_reply(&mut self, payload: &[u8]) -> Result<()> {
        let chunk = self.packet_size - PACKET_HEADER_SIZE;
        let mut chunks = payload.chunks(chunk).peekable();
        if chunks.peek().is_none() {
            self.write_packet(PacketType::Reply, &[], true).await?;
        }
        while let Some(part) = chunks.next() {
            let last = chunks.peek().is_none();
            self.write_packet(PacketType::Reply, part, last).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Write raw bytes.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Close the server end.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn write_packet(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        last: bool,
    ) -> Result<()> {
        let status = if last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        let length = u16::try_from(PACKET_HEADER_SIZE + payload.len())
            .map_err(|_| MockServerError::Protocol("reply packet too large".into()))?;
        let header = PacketHeader::new(packet_type, status, length).with_tds7(self.tds7);

        let mut buf = BytesMut::with_capacity(length as usize);
        header.encode(&mut buf);
        buf.extend_from_slice(payload);
        self.stream.write_all(&buf).await?;
        Ok(())
    }
}
