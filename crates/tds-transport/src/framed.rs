//! Framed packet halves for async I/O.
//!
//! The physical stream is split so a CANCEL packet can be written through
//! [`PacketWriter`] while another task is blocked in [`PacketReader`].

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{Error, Result};
use crate::packet_codec::{Packet, TdsCodec};

/// A read-only packet stream for receiving TDS packets.
pub struct PacketReader<T> {
    inner: FramedRead<T, TdsCodec>,
}

impl<T> PacketReader<T>
where
    T: AsyncRead + Unpin,
{
    /// Create a new packet reader over the given transport.
    pub fn new(transport: T) -> Self {
        Self::with_codec(transport, TdsCodec::new())
    }

    /// Create a new packet reader with a custom codec.
    pub fn with_codec(transport: T, codec: TdsCodec) -> Self {
        Self {
            inner: FramedRead::new(transport, codec),
        }
    }

    /// Read the next full packet.
    ///
    /// End of stream is reported as [`Error::ConnectionClosed`]. Cancel safe:
    /// partially received frames stay buffered.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        match self.inner.next().await {
            Some(result) => result,
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Get a reference to the underlying transport.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }
}

impl<T> std::fmt::Debug for PacketReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("buffered", &self.inner.read_buffer().len())
            .finish_non_exhaustive()
    }
}

/// A write-only packet sink for sending TDS packets.
pub struct PacketWriter<T> {
    inner: FramedWrite<T, TdsCodec>,
}

impl<T> PacketWriter<T>
where
    T: AsyncWrite + Unpin,
{
    /// Create a new packet writer over the given transport.
    pub fn new(transport: T) -> Self {
        Self {
            inner: FramedWrite::new(transport, TdsCodec::new()),
        }
    }

    /// Queue a packet without flushing.
    pub async fn write_packet(&mut self, packet: Packet) -> Result<()> {
        self.inner.feed(packet).await
    }

    /// Flush queued packets to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        SinkExt::<Packet>::flush(&mut self.inner).await
    }

    /// Flush and shut down the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        SinkExt::<Packet>::close(&mut self.inner).await
    }
}

impl<T> std::fmt::Debug for PacketWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter").finish_non_exhaustive()
    }
}
