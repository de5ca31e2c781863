#![no_main]

use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;
use peerwire::protocol::handshake::{open_sealed, KeyPair};

static KEY_PAIR: Lazy<KeyPair> = Lazy::new(KeyPair::generate);

fuzz_target!(|data: &[u8]| {
    // Forged session-key envelopes must fail to open
    assert!(open_sealed(&KEY_PAIR, data).is_err());
});
