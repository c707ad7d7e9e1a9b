//! Request side of a logical stream.
//!
//! [`RequestStream`] turns a sequence of primitive writes into physical
//! packets. A packet is emitted as soon as the buffer is full and more data
//! arrives; [`RequestStream::flush`] emits the final packet of the request,
//! which makes the stream the owner of the reply.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use encoding_rs::Encoding;
use rust_decimal::Decimal;
use tds_protocol::codec::{ucs2_byte_len, write_ucs2, write_ucs2_units};
use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
use tds_protocol::version::{ServerType, TdsVersion};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::config::validate_packet_size;
use crate::error::{Error, Result};
use crate::mux::{Multiplexer, Registration, StreamId};
use crate::packet_codec::Packet;

/// Writer for the requests of one logical stream.
pub struct RequestStream<T> {
    mux: Multiplexer<T>,
    registration: Arc<Registration>,
    buffer: BytesMut,
    capacity: usize,
    max_capacity: usize,
    packet_type: PacketType,
    tds_version: TdsVersion,
    server_type: ServerType,
    charset: &'static Encoding,
    max_precision: u8,
    closed: bool,
}

impl<T> std::fmt::Debug for RequestStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestStream")
            .field("id", &self.registration.id())
            .field("packet_type", &self.packet_type)
            .field("buffered", &(self.buffer.len() - PACKET_HEADER_SIZE))
            .field("capacity", &self.capacity)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<T> RequestStream<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub(crate) fn new(mux: Multiplexer<T>, registration: Arc<Registration>) -> Self {
        let (capacity, max_capacity) = mux.packet_sizes();
        let mut buffer = BytesMut::with_capacity(capacity);
        buffer.put_bytes(0, PACKET_HEADER_SIZE);

        Self {
            tds_version: mux.tds_version(),
            server_type: mux.server_type(),
            charset: mux.charset(),
            max_precision: mux.max_precision(),
            mux,
            registration,
            buffer,
            capacity,
            max_capacity,
            packet_type: PacketType::Query,
            closed: false,
        }
    }

    /// Id of the logical stream.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.registration.id()
    }

    /// The multiplexer this stream writes to.
    #[must_use]
    pub fn multiplexer(&self) -> &Multiplexer<T> {
        &self.mux
    }

    /// Set the type of the packets that follow.
    pub fn set_packet_type(&mut self, packet_type: PacketType) {
        self.packet_type = packet_type;
    }

    /// Current packet size, header included.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.capacity
    }

    /// Grow the packet size.
    ///
    /// Requests smaller than the data already buffered, or equal to the
    /// current size, are ignored.
    pub fn set_buffer_size(&mut self, size: usize) -> Result<()> {
        if size < self.buffer.len() || size == self.capacity {
            return Ok(());
        }
        validate_packet_size(size)?;
        if size > self.max_capacity {
            return Err(Error::Config(format!(
                "packet size {size} exceeds negotiated maximum {}",
                self.max_capacity
            )));
        }
        if size > self.buffer.capacity() {
            self.buffer.reserve(size - self.buffer.len());
        }
        self.capacity = size;
        Ok(())
    }

    /// Maximum decimal precision.
    #[must_use]
    pub fn max_precision(&self) -> u8 {
        self.max_precision
    }

    /// Set the maximum decimal precision, 28 or 38.
    pub fn set_max_precision(&mut self, precision: u8) {
        self.max_precision = precision;
    }

    /// Protocol version the stream encodes for.
    #[must_use]
    pub fn tds_version(&self) -> TdsVersion {
        self.tds_version
    }

    /// Server family the stream encodes for.
    #[must_use]
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// Write one byte.
    pub async fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value]).await
    }

    /// Write a little-endian `i16`.
    pub async fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes()).await
    }

    /// Write a little-endian `i32`.
    pub async fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes()).await
    }

    /// Write a little-endian `i64`.
    pub async fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes()).await
    }

    /// Write a little-endian IEEE 754 `f32`.
    pub async fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes()).await
    }

    /// Write a little-endian IEEE 754 `f64`.
    pub async fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes()).await
    }

    /// Write raw bytes, emitting full packets as needed.
    pub async fn write_bytes(&mut self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let room = self.capacity - self.buffer.len();
            if room == 0 {
                self.put_packet(false).await?;
                continue;
            }
            let n = room.min(src.len());
            self.buffer.put_slice(&src[..n]);
            src = &src[n..];
        }
        Ok(())
    }

    /// Write up to `len` bytes of `src`, zero-padding to `len`.
    pub async fn write_bytes_padded(&mut self, src: &[u8], len: usize) -> Result<()> {
        let n = src.len().min(len);
        self.write_bytes(&src[..n]).await?;
        self.write_zeros(len - n).await
    }

    async fn write_zeros(&mut self, mut count: usize) -> Result<()> {
        while count > 0 {
            let room = self.capacity - self.buffer.len();
            if room == 0 {
                self.put_packet(false).await?;
                continue;
            }
            let n = room.min(count);
            self.buffer.put_bytes(0, n);
            count -= n;
        }
        Ok(())
    }

    /// Write a string: UCS-2LE on 7.0 and later, otherwise in the legacy
    /// codepage.
    pub async fn write_str(&mut self, s: &str) -> Result<()> {
        if self.tds_version.is_unicode() {
            let mut encoded = Vec::with_capacity(ucs2_byte_len(s));
            write_ucs2(&mut encoded, s);
            self.write_bytes(&encoded).await
        } else {
            self.write_ascii(s).await
        }
    }

    /// Write UTF-16 code units as UCS-2LE.
    pub async fn write_chars(&mut self, units: &[u16]) -> Result<()> {
        let mut encoded = Vec::with_capacity(units.len() * 2);
        write_ucs2_units(&mut encoded, units);
        self.write_bytes(&encoded).await
    }

    /// Write a string in the legacy codepage.
    ///
    /// Characters the codepage cannot represent are written as numeric
    /// character references, as `encoding_rs` does.
    pub async fn write_ascii(&mut self, s: &str) -> Result<()> {
        let (encoded, _, unmappable) = self.charset.encode(s);
        if unmappable {
            tracing::debug!(
                stream = %self.id(),
                charset = self.charset.name(),
                "string contains characters outside the codepage"
            );
        }
        self.write_bytes(&encoded).await
    }

    /// Write a decimal as length, sign and magnitude. `None` writes a zero
    /// length.
    ///
    /// SQL Server expects sign 1 for positive values and a little-endian
    /// magnitude; Sybase expects sign 1 for negative values and a big-endian
    /// magnitude.
    pub async fn write_decimal(&mut self, value: Option<&Decimal>) -> Result<()> {
        let Some(value) = value else {
            return self.write_u8(0).await;
        };
        let encoded = encode_decimal(value, self.max_precision, self.server_type)?;
        self.write_bytes(&encoded).await
    }

    /// Copy exactly `len` bytes from `reader`.
    ///
    /// Fails if the reader ends early or has data left over.
    pub async fn write_from_reader<R>(&mut self, reader: &mut R, len: u64) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut remaining = len;
        let mut chunk = [0u8; 4096];
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(chunk.len(), |r| r.min(chunk.len()));
            let n = reader.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(Error::Encoding(format!(
                    "data in stream less than specified by length ({} of {len} bytes)",
                    len - remaining
                )));
            }
            self.write_bytes(&chunk[..n]).await?;
            remaining -= n as u64;
        }

        let mut extra = [0u8; 1];
        if reader.read(&mut extra).await? != 0 {
            return Err(Error::Encoding(format!(
                "more data in stream than specified by length ({len} bytes)"
            )));
        }
        Ok(())
    }

    /// Emit the final packet of the request.
    pub async fn flush(&mut self) -> Result<()> {
        self.put_packet(true).await
    }

    /// Close the writer. Buffered data is dropped.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed || self.registration.is_released()
    }

    async fn put_packet(&mut self, last: bool) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StreamClosed(self.id()));
        }

        let status = if last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        // Capacity never exceeds MAX_PACKET_SIZE.
        let length = self.buffer.len() as u16;
        let header = PacketHeader::new(self.packet_type, status, length)
            .with_tds7(self.tds_version.header_flag());
        let mut dst = &mut self.buffer[..PACKET_HEADER_SIZE];
        header.encode(&mut dst);

        let frame = self.buffer.split();
        self.buffer.reserve(self.capacity);
        self.buffer.put_bytes(0, PACKET_HEADER_SIZE);

        let packet = Packet::from_frame(frame)?;
        self.mux.send_packet(self.id(), packet).await
    }
}

fn encode_decimal(value: &Decimal, max_precision: u8, server_type: ServerType) -> Result<Vec<u8>> {
    let max_len = if max_precision <= 28 { 13 } else { 17 };
    let mantissa = value.mantissa();
    let magnitude = magnitude_bytes(mantissa.unsigned_abs());
    let len = magnitude.len() + 1;
    if len > max_len {
        return Err(Error::Encoding(format!(
            "decimal {value} needs {len} bytes, maximum is {max_len}"
        )));
    }

    let negative = mantissa < 0;
    let mut out = Vec::with_capacity(len + 1);
    out.push(len as u8);
    match server_type {
        ServerType::Sybase => {
            out.push(u8::from(negative));
            out.extend_from_slice(&magnitude);
        }
        ServerType::SqlServer => {
            out.push(u8::from(!negative));
            out.extend(magnitude.iter().rev());
        }
    }
    Ok(out)
}

/// Big-endian magnitude in the shortest form that still reads as positive
/// two's complement.
fn magnitude_bytes(value: u128) -> Vec<u8> {
    let raw = value.to_be_bytes();
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len() - 1);
    let mut out = Vec::with_capacity(raw.len() - start + 1);
    if raw[start] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(&raw[start..]);
    out
}
