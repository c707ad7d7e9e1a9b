//! Transport configuration.

use std::path::PathBuf;
use std::time::Duration;

use encoding_rs::{Encoding, WINDOWS_1252};
use tds_protocol::packet::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use tds_protocol::version::{ServerType, TdsVersion};
use tds_tls::TlsConfig;

use crate::error::{Error, Result};

/// Limits for buffering replies that arrive for a stream that is not reading.
#[derive(Debug, Clone)]
pub struct SpillConfig {
    /// Bytes of buffered packets kept in memory across all transports before
    /// queues start spilling to disk (default: 100 000).
    pub memory_budget: usize,
    /// Packets a stream keeps in memory before it may spill (default: 8).
    pub min_memory_packets: usize,
    /// Directory for spill files (default: the system temp directory).
    pub buffer_dir: Option<PathBuf>,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            memory_budget: 100_000,
            min_memory_packets: 8,
            buffer_dir: None,
        }
    }
}

impl SpillConfig {
    /// Create a spill configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the in-memory budget in bytes.
    #[must_use]
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Set the minimum number of in-memory packets per stream.
    #[must_use]
    pub fn min_memory_packets(mut self, packets: usize) -> Self {
        self.min_memory_packets = packets;
        self
    }

    /// Set the directory used for spill files.
    #[must_use]
    pub fn buffer_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.buffer_dir = Some(dir.into());
        self
    }
}

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Packet size used by new request streams (default: 512).
    pub packet_size: usize,
    /// Largest packet size a request stream may grow to (default: 65 535).
    pub max_packet_size: usize,
    /// Negotiated protocol version.
    pub tds_version: TdsVersion,
    /// Server family.
    pub server_type: ServerType,
    /// Codepage for strings on pre-7.0 protocol versions.
    pub charset: &'static Encoding,
    /// Maximum decimal precision negotiated with the server (default: 38).
    pub max_precision: u8,
    /// Fails a physical read that stalls this long (default: none).
    pub socket_timeout: Option<Duration>,
    /// Spill cache settings.
    pub spill: SpillConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            max_packet_size: MAX_PACKET_SIZE,
            tds_version: TdsVersion::default(),
            server_type: ServerType::default(),
            charset: WINDOWS_1252,
            max_precision: 38,
            socket_timeout: None,
            spill: SpillConfig::default(),
        }
    }
}

impl MuxConfig {
    /// Create a multiplexer configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the packet size for new request streams.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the maximum packet size.
    #[must_use]
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the protocol version.
    #[must_use]
    pub fn tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Set the server family.
    #[must_use]
    pub fn server_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    /// Set the legacy codepage.
    #[must_use]
    pub fn charset(mut self, charset: &'static Encoding) -> Self {
        self.charset = charset;
        self
    }

    /// Set the maximum decimal precision.
    #[must_use]
    pub fn max_precision(mut self, precision: u8) -> Self {
        self.max_precision = precision;
        self
    }

    /// Set the socket read timeout.
    #[must_use]
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Set the spill cache settings.
    #[must_use]
    pub fn spill(mut self, spill: SpillConfig) -> Self {
        self.spill = spill;
        self
    }

    /// Check the configuration for values the wire cannot carry.
    pub fn validate(&self) -> Result<()> {
        validate_packet_size(self.max_packet_size)?;
        validate_packet_size(self.packet_size)?;
        if self.packet_size > self.max_packet_size {
            return Err(Error::Config(format!(
                "packet size {} exceeds maximum {}",
                self.packet_size, self.max_packet_size
            )));
        }
        if !(1..=38).contains(&self.max_precision) {
            return Err(Error::Config(format!(
                "max precision {} outside 1..=38",
                self.max_precision
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_packet_size(size: usize) -> Result<()> {
    if (MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "packet size {size} outside {MIN_PACKET_SIZE}..={MAX_PACKET_SIZE}"
        )))
    }
}

/// Kind of physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// TCP socket, optionally upgraded to TLS.
    #[default]
    Tcp,
    /// Windows named pipe, local or remote.
    NamedPipe,
    /// Unix domain socket at the given path.
    UnixSocket(PathBuf),
}

/// Physical transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port (default: 1433).
    pub port: u16,
    /// Connection kind.
    pub kind: TransportKind,
    /// Named instance, used to build the pipe name.
    pub instance: Option<String>,
    /// Time allowed to establish the connection (default: 15s).
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm (default: true).
    pub tcp_nodelay: bool,
    /// Upgrade the TCP connection to TLS.
    pub encrypt: bool,
    /// TLS settings used when `encrypt` is set.
    pub tls: TlsConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: ServerType::SqlServer.default_port(),
            kind: TransportKind::Tcp,
            instance: None,
            connect_timeout: Duration::from_secs(15),
            tcp_nodelay: true,
            encrypt: false,
            tls: TlsConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Create a TCP configuration for the given host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the connection kind.
    #[must_use]
    pub fn kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the named instance.
    #[must_use]
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    #[must_use]
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Enable TLS with the given settings.
    #[must_use]
    pub fn encrypt(mut self, tls: TlsConfig) -> Self {
        self.encrypt = true;
        self.tls = tls;
        self
    }

    /// Name of the SQL Server pipe for this host and instance.
    ///
    /// `\\host\pipe\sql\query` for the default instance and
    /// `\\host\pipe\MSSQL$instance\sql\query` for a named one.
    #[must_use]
    pub fn pipe_name(&self) -> String {
        let host = if self.host.eq_ignore_ascii_case("localhost") {
            "."
        } else {
            self.host.as_str()
        };
        match &self.instance {
            Some(instance) => format!(r"\\{host}\pipe\MSSQL${instance}\sql\query"),
            None => format!(r"\\{host}\pipe\sql\query"),
        }
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect timeout must be positive".into()));
        }
        if self.encrypt && self.kind != TransportKind::Tcp {
            return Err(Error::Config("TLS requires a TCP transport".into()));
        }
        Ok(())
    }
}
