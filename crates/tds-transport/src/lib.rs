//! # tds-transport
//!
//! Multiplexed packet transport for TDS (SQL Server and Sybase).
//!
//! One physical connection carries many logical streams. Each stream writes
//! its request through a [`RequestStream`], which cuts it into physical
//! packets, and reads the reply through a [`ResponseStream`]. The
//! [`Multiplexer`] decides who may write next and who owns the next reply
//! packet, buffering whatever cannot be delivered yet in a spill cache that
//! overflows from memory to temporary files.
//!
//! ## Architecture
//!
//! ```text
//! RequestStream ─┐                         ┌─ spill cache (memory → disk)
//!                ├─ Multiplexer ─ TdsCodec ─ Transport (TCP / TLS / pipe)
//! ResponseStream ┘        └─ CancelController per stream
//! ```
//!
//! ### Cancellation
//!
//! The transport is split into read and write halves so a CANCEL packet can
//! be sent while another task is blocked reading. The acknowledgement is
//! consumed by whichever task reads the reply; callers keep reading until
//! they see the terminating DONE token.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_transport::{MuxConfig, Multiplexer, TransportConfig};
//!
//! let mux = Multiplexer::connect(&TransportConfig::new("db", 1433), MuxConfig::new()).await?;
//! let mut request = mux.request_stream().await?;
//! request.write_str("SELECT 1").await?;
//! request.flush().await?;
//!
//! let mut response = mux.response_stream(request.id())?;
//! let token = response.read_u8().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod framed;
pub mod mux;
pub mod packet_codec;
pub mod request;
pub mod response;
mod spill;
pub mod timer;
pub mod transport;

pub use cancel::CancelController;
pub use config::{MuxConfig, SpillConfig, TransportConfig, TransportKind};
pub use error::{Error, Result};
pub use framed::{PacketReader, PacketWriter};
pub use mux::{MuxStats, Multiplexer, StreamId};
pub use packet_codec::{Packet, TdsCodec};
pub use request::RequestStream;
pub use response::ResponseStream;
pub use spill::SpillBudget;
pub use timer::TimerGuard;
pub use transport::Transport;
