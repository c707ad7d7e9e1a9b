//! # tds-protocol
//!
//! Wire definitions for the Tabular Data Stream (TDS) protocol spoken by
//! Microsoft SQL Server and Sybase.
//!
//! This crate provides `no_std` compatible packet headers, packet types,
//! protocol versions and the end-of-data marker used by the transport layer.
//!
//! ## Features
//!
//! - `std` (default): Enable standard library support
//! - `alloc`: Enable allocation without full std (requires `alloc` crate)
//!
//! ## Design Philosophy
//!
//! This crate is intentionally IO-agnostic. It contains no networking logic and
//! makes no assumptions about the async runtime. The `tds-transport` crate
//! builds the multiplexed packet transport on top of it.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{PacketHeader, PacketStatus, PacketType};
//!
//! let header = PacketHeader::new(PacketType::Query, PacketStatus::END_OF_MESSAGE, 100)
//!     .with_tds7(true);
//! let bytes = header.encode_to_bytes();
//! assert_eq!(bytes[0], 0x01);
//! assert_eq!(&bytes[2..4], &[0x00, 0x64]);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod codec;
pub mod done;
pub mod error;
pub mod packet;
mod prelude;
pub mod version;

pub use done::{Done, DoneStatus};
pub use error::ProtocolError;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_FRAME_LENGTH, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE,
    PacketHeader, PacketStatus, PacketType, STRAY_CANCEL_ACK_LENGTH,
};
pub use version::{ServerType, TdsVersion};
