//! # tds-tls
//!
//! TLS upgrade for the physical TDS transport.
//!
//! The transport layer connects a TCP socket and, when encryption is
//! requested, hands it to [`TlsConnector::connect`] before any TDS packet is
//! exchanged. Certificates are validated against the Mozilla root store
//! unless custom roots are configured.
//!
//! ```rust,ignore
//! use tds_tls::{TlsConfig, TlsConnector, TlsVersion};
//!
//! let connector = TlsConnector::new(
//!     TlsConfig::new().min_protocol_version(TlsVersion::Tls13),
//! )?;
//! let tls_stream = connector.connect(tcp_stream, "db.example.com").await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;

pub use config::{TlsConfig, TlsVersion};
pub use connector::TlsConnector;
pub use error::TlsError;

pub use rustls::pki_types::CertificateDer;
pub use tokio_rustls::client::TlsStream;
