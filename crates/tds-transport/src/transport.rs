//! Physical transports.
//!
//! [`Transport`] is the byte stream a [`Multiplexer`] runs over: a TCP
//! socket, a TLS session on top of one, a Unix domain socket or a Windows
//! named pipe. The variant is chosen from [`TransportConfig`] at connect time.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tds_tls::{TlsConnector, TlsStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};

use crate::config::{MuxConfig, TransportConfig, TransportKind};
use crate::error::{Error, Result};
use crate::mux::Multiplexer;

/// A connected physical transport.
#[derive(Debug)]
#[non_exhaustive]
pub enum Transport {
    /// Plain TCP.
    Tcp(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
    /// Unix domain socket.
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    /// Windows named pipe, local or remote.
    #[cfg(windows)]
    NamedPipe(tokio::net::windows::named_pipe::NamedPipeClient),
}

impl Transport {
    /// Open the transport described by `config`.
    pub async fn connect(config: &TransportConfig) -> Result<Self> {
        config.validate()?;

        match &config.kind {
            TransportKind::Tcp => {
                let tcp = connect_tcp(config).await?;
                if !config.encrypt {
                    return Ok(Self::Tcp(tcp));
                }
                let connector = TlsConnector::new(config.tls.clone())?;
                let tls = timeout(config.connect_timeout, connector.connect(tcp, &config.host))
                    .await
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")
                    })??;
                tracing::debug!(host = %config.host, "TLS established");
                Ok(Self::Tls(Box::new(tls)))
            }
            TransportKind::NamedPipe => connect_pipe(config).await,
            TransportKind::UnixSocket(path) => connect_unix(config, path).await,
        }
    }

    /// Whether the transport is encrypted.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl Multiplexer<Transport> {
    /// Open a physical transport and start multiplexing over it.
    pub async fn connect(transport: &TransportConfig, config: MuxConfig) -> Result<Self> {
        config.validate()?;
        let stream = Transport::connect(transport).await?;
        Self::new(stream, config)
    }
}

async fn connect_tcp(config: &TransportConfig) -> Result<TcpStream> {
    let deadline = Instant::now() + config.connect_timeout;
    let addrs: Vec<_> = timeout(
        config.connect_timeout,
        tokio::net::lookup_host((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "host lookup timed out"))??
    .collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", config.host),
        )
        .into());
    }

    let mut last_error = None;
    for (i, addr) in addrs.iter().enumerate() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        let slice = left / (addrs.len() - i) as u32;

        tracing::debug!(%addr, timeout = ?slice, "connecting");
        match timeout(slice, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(config.tcp_nodelay)?;
                return Ok(stream);
            }
            Ok(Err(e)) => {
                tracing::debug!(%addr, error = %e, "connect failed");
                last_error = Some(e);
            }
            Err(_) => {
                tracing::debug!(%addr, "connect timed out");
                last_error = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ));
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
        .into())
}

#[cfg(windows)]
async fn connect_pipe(config: &TransportConfig) -> Result<Transport> {
    use std::time::Duration;

    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;

    let name = config.pipe_name();
    let deadline = Instant::now() + config.connect_timeout;
    tracing::debug!(pipe = %name, "opening named pipe");
    loop {
        match ClientOptions::new().open(&name) {
            Ok(pipe) => return Ok(Transport::NamedPipe(pipe)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "named pipe busy").into());
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(not(windows))]
async fn connect_pipe(config: &TransportConfig) -> Result<Transport> {
    Err(Error::Config(format!(
        "named pipe {} is only available on Windows",
        config.pipe_name()
    )))
}

#[cfg(unix)]
async fn connect_unix(config: &TransportConfig, path: &std::path::Path) -> Result<Transport> {
    tracing::debug!(path = %path.display(), "connecting to unix socket");
    let stream = timeout(config.connect_timeout, tokio::net::UnixStream::connect(path))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    Ok(Transport::Unix(stream))
}

#[cfg(not(unix))]
async fn connect_unix(_config: &TransportConfig, path: &std::path::Path) -> Result<Transport> {
    Err(Error::Config(format!(
        "unix socket {} is not available on this platform",
        path.display()
    )))
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(windows)]
            Self::NamedPipe(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(windows)]
            Self::NamedPipe(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            #[cfg(windows)]
            Self::NamedPipe(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(windows)]
            Self::NamedPipe(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
