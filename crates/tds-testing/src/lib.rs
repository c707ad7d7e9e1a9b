//! # tds-testing
//!
//! Test infrastructure for the TDS packet transport.
//!
//! - [`MockTdsPeer`]: the server end of an in-memory or TCP connection,
//!   driven packet by packet from a test
//! - [`MockTdsServer`]: a TCP server that echoes requests back with a final
//!   DONE token and acknowledges cancels
//! - [`fixtures`]: DONE token and reply builders
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_testing::{MockTdsPeer, fixtures};
//!
//! let (client, server) = tokio::io::duplex(64 * 1024);
//! let mut peer = MockTdsPeer::new(server);
//! // hand `client` to the multiplexer...
//! let request = peer.read_request().await?;
//! peer.send_reply(&fixtures::reply_with_done(&request.payload, version)).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod fixtures;
pub mod mock_peer;
pub mod mock_server;

pub use error::{MockServerError, Result};
pub use mock_peer::{MockTdsPeer, RawPacket, Request};
pub use mock_server::{MockServerConfig, MockTdsServer};
