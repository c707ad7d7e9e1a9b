#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::done::tail_is_cancel_ack;
use tds_protocol::{Done, TdsVersion};

fuzz_target!(|data: &[u8]| {
    // Both DONE layouts
    for version in [TdsVersion::V7_1, TdsVersion::V7_4] {
        let mut cursor = data;
        let _ = Done::decode(&mut cursor, version);
    }
    let _ = tail_is_cancel_ack(data);
});
