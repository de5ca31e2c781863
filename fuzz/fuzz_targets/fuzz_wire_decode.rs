#![no_main]

use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;
use peerwire::core::wire::WireCodec;
use peerwire::utils::crypto::SessionCipher;
use peerwire::TypeRegistry;
use std::sync::Arc;

static CODEC: Lazy<WireCodec> = Lazy::new(|| {
    let mut registry = TypeRegistry::new();
    let _ = registry.register(
        r#"{"messages":[
            {"id":1,"name":"Everything","arguments":[
                {"name":"a","type":"int16"},{"name":"b","type":"int32"},
                {"name":"c","type":"int64"},{"name":"d","type":"float32"},
                {"name":"e","type":"float64"},{"name":"f","type":"bool"},
                {"name":"g","type":"byte"},{"name":"h","type":"string"},
                {"name":"i","type":"byte[]"},{"name":"j","type":"string[]"}]},
            {"id":2,"name":"Sealed","arguments":[
                {"name":"k","type":"string[]","encrypt":true}]}]}"#,
    );
    WireCodec::new(Arc::new(registry))
});

static CIPHER: Lazy<SessionCipher> = Lazy::new(|| SessionCipher::from_key([3u8; 32]));

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must encode back to the same bytes
    if let Ok(message) = CODEC.decode(data, &SessionCipher::NoKey) {
        if let Ok(encoded) = CODEC.encode(&message, &SessionCipher::NoKey) {
            assert_eq!(&encoded[..], data);
        }
    }
    let _ = CODEC.decode(data, &CIPHER);
});
