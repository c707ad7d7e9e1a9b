//! Codec utilities for TDS string encoding.
//!
//! TDS 7.0 and later carry every character as two little-endian bytes
//! (UCS-2LE). Legacy versions use a server codepage, which is handled by the
//! transport layer.

use bytes::{Buf, BufMut};

use crate::prelude::*;

/// Write a string as UCS-2LE without a length prefix.
///
/// Characters outside the basic multilingual plane are written as their
/// UTF-16 surrogate pair.
pub fn write_ucs2(dst: &mut impl BufMut, s: &str) {
    for c in s.encode_utf16() {
        dst.put_u16_le(c);
    }
}

/// Write raw UTF-16 code units as UCS-2LE.
pub fn write_ucs2_units(dst: &mut impl BufMut, units: &[u16]) {
    for &c in units {
        dst.put_u16_le(c);
    }
}

/// Read a UCS-2LE string of `char_count` characters.
///
/// Unpaired surrogates are replaced with U+FFFD.
pub fn read_ucs2(src: &mut impl Buf, char_count: usize) -> Option<String> {
    if src.remaining() < char_count * 2 {
        return None;
    }

    let mut units = Vec::with_capacity(char_count);
    for _ in 0..char_count {
        units.push(src.get_u16_le());
    }

    Some(String::from_utf16_lossy(&units))
}

/// Number of bytes a string occupies as UCS-2LE.
#[must_use]
pub fn ucs2_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_ucs2_roundtrip() {
        let original = "Hello, 世界!";
        let mut buf = BytesMut::new();
        write_ucs2(&mut buf, original);
        assert_eq!(buf.len(), ucs2_byte_len(original));
        assert_eq!(&buf[..4], &[b'H', 0, b'e', 0]);

        let count = original.encode_utf16().count();
        let mut cursor = buf.freeze();
        assert_eq!(read_ucs2(&mut cursor, count).unwrap(), original);
    }

    #[test]
    fn test_read_ucs2_short_input() {
        let mut cursor = &[0x41u8, 0x00, 0x42][..];
        assert!(read_ucs2(&mut cursor, 2).is_none());
    }

    #[test]
    fn test_ucs2_byte_len() {
        assert_eq!(ucs2_byte_len("Hello"), 10);
        assert_eq!(ucs2_byte_len("世界"), 4);
    }
}
