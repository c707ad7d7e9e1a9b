#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::codec::read_ucs2;

fuzz_target!(|data: &[u8]| {
    let mut cursor = data;
    let _ = read_ucs2(&mut cursor, data.len() / 2);
});
