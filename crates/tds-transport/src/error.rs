//! Transport error types.

use std::io;

use tds_protocol::ProtocolError;
use tds_tls::TlsError;
use thiserror::Error;

use crate::mux::StreamId;

/// Errors surfaced by the packet transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The server closed the connection, or the transport was force-closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed packet or token on the wire.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A stream tried to read a reply without having sent a request.
    #[error("stream {stream} is reading without having sent a request")]
    NoRequest {
        /// The offending stream.
        stream: StreamId,
    },

    /// The stream id was never registered or has been released.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// The stream facade was closed.
    #[error("stream {0} is closed")]
    StreamClosed(StreamId),

    /// A stream tried to read before its request was flushed.
    #[error("request on stream {0} is incomplete")]
    RequestIncomplete(StreamId),

    /// The query timeout elapsed; the reply was canceled and discarded.
    #[error("query timed out")]
    Timeout,

    /// A value could not be encoded for the wire.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS upgrade failed.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// IO error on the physical transport.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the physical transport is unusable after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::Protocol(_) | Self::Tls(_) | Self::Io(_)
        )
    }

    /// Whether this error reports an elapsed timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether the connection to the server was lost.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Whether the server violated the wire protocol.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::ConnectionClosed.is_fatal());
        assert!(Error::ConnectionClosed.is_connection_lost());
        assert!(Error::Protocol(ProtocolError::InvalidLength(3)).is_protocol_error());
        assert!(!Error::Timeout.is_fatal());
        assert!(Error::Timeout.is_timeout());

        let timed_out = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "read"));
        assert!(timed_out.is_timeout());
        assert!(timed_out.is_fatal());
        assert!(!timed_out.is_connection_lost());

        assert!(!Error::RequestIncomplete(StreamId::new(1)).is_fatal());
    }
}
