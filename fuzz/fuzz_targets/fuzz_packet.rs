#![no_main]

use libfuzzer_sys::fuzz_target;
use peerwire::core::packet::Packet;

fuzz_target!(|data: &[u8]| {
    // Frame parsing must reject, never panic
    let _ = Packet::from_bytes(data);
});
