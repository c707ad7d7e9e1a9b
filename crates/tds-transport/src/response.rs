//! Response side of a logical stream.

use std::sync::Arc;

use bytes::{Buf, Bytes};
use encoding_rs::Encoding;
use tds_protocol::codec::read_ucs2;
use tds_protocol::done::Done;
use tds_protocol::packet::PACKET_HEADER_SIZE;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::mux::{Multiplexer, Registration, StreamId};

/// Reader over the reply packets of one logical stream.
///
/// Reads cross packet boundaries transparently; the next packet is fetched
/// from the multiplexer when the current one is exhausted.
pub struct ResponseStream<T> {
    mux: Multiplexer<T>,
    registration: Arc<Registration>,
    packet: Bytes,
    pos: usize,
    closed: bool,
}

impl<T> std::fmt::Debug for ResponseStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("id", &self.registration.id())
            .field("remaining", &self.remaining())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<T> ResponseStream<T> {
    fn remaining(&self) -> usize {
        self.packet.len().saturating_sub(self.pos)
    }
}

impl<T> ResponseStream<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub(crate) fn new(mux: Multiplexer<T>, registration: Arc<Registration>) -> Self {
        Self {
            mux,
            registration,
            packet: Bytes::new(),
            pos: 0,
            closed: false,
        }
    }

    /// Id of the logical stream.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.registration.id()
    }

    /// Read one byte.
    pub async fn read_u8(&mut self) -> Result<u8> {
        self.fill().await?;
        let byte = self.packet[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    /// Look at the next byte without consuming it.
    pub async fn peek(&mut self) -> Result<u8> {
        self.fill().await?;
        Ok(self.packet[self.pos])
    }

    /// Read a little-endian `i16`.
    pub async fn read_i16(&mut self) -> Result<i16> {
        let mut raw = [0u8; 2];
        self.read_bytes(&mut raw).await?;
        Ok(i16::from_le_bytes(raw))
    }

    /// Read a little-endian `i32`.
    pub async fn read_i32(&mut self) -> Result<i32> {
        let mut raw = [0u8; 4];
        self.read_bytes(&mut raw).await?;
        Ok(i32::from_le_bytes(raw))
    }

    /// Read a little-endian `i64`.
    pub async fn read_i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        self.read_bytes(&mut raw).await?;
        Ok(i64::from_le_bytes(raw))
    }

    /// Read a little-endian `f32`.
    pub async fn read_f32(&mut self) -> Result<f32> {
        let mut raw = [0u8; 4];
        self.read_bytes(&mut raw).await?;
        Ok(f32::from_le_bytes(raw))
    }

    /// Read a little-endian `f64`.
    pub async fn read_f64(&mut self) -> Result<f64> {
        let mut raw = [0u8; 8];
        self.read_bytes(&mut raw).await?;
        Ok(f64::from_le_bytes(raw))
    }

    /// Fill `dst` completely.
    pub async fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < dst.len() {
            self.fill().await?;
            let n = self.remaining().min(dst.len() - off);
            dst[off..off + n].copy_from_slice(&self.packet[self.pos..self.pos + n]);
            self.pos += n;
            off += n;
        }
        Ok(())
    }

    /// Read a string of `chars` characters: UCS-2LE on 7.0 and later,
    /// otherwise `chars` bytes in the connection codepage.
    pub async fn read_string(&mut self, chars: usize) -> Result<String> {
        if self.mux.tds_version().is_unicode() {
            self.read_unicode_string(chars).await
        } else {
            let charset = self.mux.charset();
            self.read_non_unicode_string(chars, charset).await
        }
    }

    /// Read `chars` UCS-2LE characters.
    pub async fn read_unicode_string(&mut self, chars: usize) -> Result<String> {
        let mut raw = vec![0u8; chars * 2];
        self.read_bytes(&mut raw).await?;
        read_ucs2(&mut raw.as_slice(), chars)
            .ok_or_else(|| Error::Encoding("invalid UCS-2 string".into()))
    }

    /// Read `len` bytes and decode them with `encoding`.
    pub async fn read_non_unicode_string(
        &mut self,
        len: usize,
        encoding: &'static Encoding,
    ) -> Result<String> {
        let mut raw = vec![0u8; len];
        self.read_bytes(&mut raw).await?;
        let (decoded, _) = encoding.decode_without_bom_handling(&raw);
        Ok(decoded.into_owned())
    }

    /// Fill `dst` with UTF-16 code units.
    pub async fn read_chars(&mut self, dst: &mut [u16]) -> Result<()> {
        let mut raw = vec![0u8; dst.len() * 2];
        self.read_bytes(&mut raw).await?;
        let mut src = raw.as_slice();
        for unit in dst.iter_mut() {
            *unit = src.get_u16_le();
        }
        Ok(())
    }

    /// Skip `n` bytes.
    pub async fn skip(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            self.fill().await?;
            let step = self.remaining().min(n);
            self.pos += step;
            n -= step;
        }
        Ok(())
    }

    /// Skip a string of `chars` characters.
    pub async fn skip_string(&mut self, chars: usize) -> Result<()> {
        if self.mux.tds_version().is_unicode() {
            self.skip(chars * 2).await
        } else {
            self.skip(chars).await
        }
    }

    /// Record the end-of-data marker that ends the current result.
    pub fn finish_response(&self, done: &Done) {
        self.registration
            .controller()
            .finish_response(done.is_cancel_ack(), done.has_more_results());
    }

    /// Release the logical stream.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.packet = Bytes::new();
        self.pos = 0;
        if self.registration.mark_released() {
            self.mux.close_stream(self.id()).await?;
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<()> {
        while self.remaining() == 0 {
            if self.closed {
                return Err(Error::StreamClosed(self.id()));
            }
            let packet = self.mux.get_net_packet(self.id()).await?;
            self.packet = packet.into_frame().freeze();
            self.pos = PACKET_HEADER_SIZE;
        }
        Ok(())
    }
}
