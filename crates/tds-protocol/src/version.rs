//! TDS protocol version and server family definitions.

use core::fmt;

use crate::error::ProtocolError;

/// TDS protocol version.
///
/// The raw value is the version number as it appears in a TDS 7.x login
/// acknowledgement; legacy versions use the same layout so that ordering
/// between all versions is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 4.2 (SQL Server 6.5, Sybase 10)
    pub const V4_2: Self = Self(0x04020000);

    /// TDS 5.0 (Sybase 11+)
    pub const V5_0: Self = Self(0x05000000);

    /// TDS 7.0 (SQL Server 7.0)
    pub const V7_0: Self = Self(0x70000000);

    /// TDS 7.1 (SQL Server 2000)
    pub const V7_1: Self = Self(0x71000001);

    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x72090002);

    /// TDS 7.3A (SQL Server 2008)
    pub const V7_3A: Self = Self(0x730A0003);

    /// TDS 7.3B (SQL Server 2008 R2)
    pub const V7_3B: Self = Self(0x730B0003);

    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x74000004);

    /// Create a new TDS version from raw bytes.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Get the raw version value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if strings travel as UCS-2 little-endian (TDS 7.0 and later).
    #[must_use]
    pub const fn is_unicode(self) -> bool {
        self.0 >= Self::V7_0.0
    }

    /// Value of the protocol flag at header offset 6.
    #[must_use]
    pub const fn header_flag(self) -> bool {
        self.is_unicode()
    }

    /// Length of a DONE-family token, including the token byte.
    ///
    /// TDS 7.2 widened the row count from 4 to 8 bytes.
    #[must_use]
    pub const fn done_token_length(self) -> usize {
        if self.0 >= Self::V7_2.0 { 13 } else { 9 }
    }

    /// Parse a version from its usual short spelling (`"4.2"`, `"7.1"` ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "4.2" => Some(Self::V4_2),
            "5.0" => Some(Self::V5_0),
            "7.0" => Some(Self::V7_0),
            "7.1" | "8.0" => Some(Self::V7_1),
            "7.2" => Some(Self::V7_2),
            "7.3" | "7.3A" => Some(Self::V7_3A),
            "7.3B" => Some(Self::V7_3B),
            "7.4" => Some(Self::V7_4),
            _ => None,
        }
    }

    /// Validate a raw version against the known set.
    pub fn from_raw(raw: u32) -> Result<Self, ProtocolError> {
        let known = [
            Self::V4_2,
            Self::V5_0,
            Self::V7_0,
            Self::V7_1,
            Self::V7_2,
            Self::V7_3A,
            Self::V7_3B,
            Self::V7_4,
        ];
        known
            .into_iter()
            .find(|v| v.0 == raw)
            .ok_or(ProtocolError::UnsupportedVersion(raw))
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_1
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::V4_2 => "4.2",
            Self::V5_0 => "5.0",
            Self::V7_0 => "7.0",
            Self::V7_1 => "7.1",
            Self::V7_2 => "7.2",
            Self::V7_3A => "7.3A",
            Self::V7_3B => "7.3B",
            Self::V7_4 => "7.4",
            _ => return write!(f, "0x{:08x}", self.0),
        };
        write!(f, "TDS {name}")
    }
}

/// Server family on the other end of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerType {
    /// Microsoft SQL Server.
    #[default]
    SqlServer,
    /// Sybase ASE / Anywhere.
    Sybase,
}

impl ServerType {
    /// Default TCP port for this server family.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::SqlServer => 1433,
            Self::Sybase => 7100,
        }
    }
}
