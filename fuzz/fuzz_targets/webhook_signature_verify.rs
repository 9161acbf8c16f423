#![no_main]

use iris_connectors::{compute_sha256_hmac_signature_header, verify_sha256_hmac_signature};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let (secret_bytes, body) = data.split_at(data.len().min(16));
    let secret = String::from_utf8_lossy(secret_bytes).into_owned();

    // Arbitrary header text must fail cleanly, never panic.
    let garbage_header = String::from_utf8_lossy(body).into_owned();
    let _ = verify_sha256_hmac_signature(body, &garbage_header, &secret);

    let Ok(header) = compute_sha256_hmac_signature_header(body, &secret) else {
        return;
    };
    assert!(verify_sha256_hmac_signature(body, &header, &secret).is_ok());
    assert!(verify_sha256_hmac_signature(body, &header, &format!("{secret}x")).is_err());

    let mut tampered = body.to_vec();
    tampered.push(0x2e);
    assert!(verify_sha256_hmac_signature(&tampered, &header, &secret).is_err());
});
