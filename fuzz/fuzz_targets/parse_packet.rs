#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::{PacketHeader, PacketType};

fuzz_target!(|data: &[u8]| {
    // Fuzz packet header parsing
    if data.len() >= 8 {
        let mut cursor = data;
        if let Ok(header) = PacketHeader::decode(&mut cursor) {
            let _ = header.payload_length();
            let _ = header.encode_to_bytes();
        }
        let _ = PacketHeader::peek_length(data);
    }
    if let Some(&first) = data.first() {
        let _ = PacketType::from_u8(first).map(PacketType::is_readable);
    }
});
