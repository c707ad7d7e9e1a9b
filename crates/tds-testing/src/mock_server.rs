//! Mock TDS server over TCP.
//!
//! Every request is answered with its own payload followed by a final DONE
//! token; a CANCEL is answered with a cancel acknowledgement. Received
//! requests are recorded and can be inspected with
//! [`MockTdsServer::next_request`].
//!
//! ```rust,ignore
//! let server = MockTdsServer::start(MockServerConfig::default()).await?;
//! let transport = TransportConfig::new(server.host(), server.port());
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tds_protocol::{PacketType, TdsVersion};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::error::{MockServerError, Result};
use crate::fixtures;
use crate::mock_peer::{MockTdsPeer, Request};

/// Mock server settings.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Reply packet size.
    pub packet_size: usize,
    /// Protocol version that decides the DONE layout and header flag.
    pub tds_version: TdsVersion,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            packet_size: 512,
            tds_version: TdsVersion::V7_1,
        }
    }
}

/// A mock TDS server listening on a local port.
pub struct MockTdsServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    requests: Mutex<mpsc::UnboundedReceiver<Request>>,
    connection_count: Arc<Mutex<usize>>,
}

impl MockTdsServer {
    /// Start the mock server on an available port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);
        let connection_count = Arc::new(Mutex::new(0usize));

        let server = Self {
            addr,
            shutdown_tx: shutdown_tx.clone(),
            requests: Mutex::new(request_rx),
            connection_count: connection_count.clone(),
        };

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _peer_addr)) => {
                                let config = config.clone();
                                let count = connection_count.clone();
                                let requests = request_tx.clone();
                                tokio::spawn(async move {
                                    *count.lock().await += 1;
                                    if let Err(e) = handle_connection(stream, &config, requests).await {
                                        tracing::debug!("Connection error: {}", e);
                                    }
                                    let mut c = count.lock().await;
                                    *c = c.saturating_sub(1);
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Ok(server)
    }

    /// Get the server's listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the host string for connection configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Get the current connection count.
    pub async fn connection_count(&self) -> usize {
        *self.connection_count.lock().await
    }

    /// Wait for the next request received on any connection.
    pub async fn next_request(&self) -> Result<Request> {
        self.requests
            .lock()
            .await
            .recv()
            .await
            .ok_or(MockServerError::Stopped)
    }

    /// Stop the server.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: &MockServerConfig,
    requests: mpsc::UnboundedSender<Request>,
) -> Result<()> {
    let version = config.tds_version;
    let mut peer = MockTdsPeer::new(stream)
        .with_packet_size(config.packet_size)
        .with_tds7(version.header_flag());

    loop {
        let request = match peer.read_request().await {
            Ok(request) => request,
            Err(MockServerError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e),
        };

        if request.packet_type == PacketType::Cancel {
            peer.send_reply(&fixtures::cancel_ack(version)).await?;
        } else {
            let reply = fixtures::reply_with_done(&request.payload, version);
            peer.send_reply(&reply).await?;
        }

        if requests.send(request).is_err() {
            tracing::debug!("request log dropped");
        }
    }

    Ok(())
}
