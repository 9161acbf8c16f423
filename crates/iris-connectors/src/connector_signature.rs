//! HMAC webhook signature helpers shared by the Graph-API providers.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::connector_contract::{ChannelProvider, SignatureEnforcement};

/// Header carrying the Graph-API payload signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Applies the shared authenticity policy for HMAC-signed providers.
///
/// A present header and secret must verify in every mode. When either is
/// absent, strict mode rejects the request and permissive mode accepts it
/// with a warning. The bypass only ever covers missing material, never a
/// failed verification.
pub(crate) fn verify_graph_signature(
    provider: ChannelProvider,
    app_secret: Option<&str>,
    headers: &BTreeMap<String, String>,
    raw_body: &[u8],
    enforcement: SignatureEnforcement,
) -> bool {
    let signature_header = headers.get(SIGNATURE_HEADER).map(String::as_str);
    let app_secret = app_secret.map(str::trim).filter(|value| !value.is_empty());
    match (signature_header, app_secret) {
        (Some(signature_header), Some(secret)) => {
            match verify_sha256_hmac_signature(raw_body, signature_header, secret) {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(
                        provider = provider.as_str(),
                        %error,
                        "webhook signature verification failed"
                    );
                    false
                }
            }
        }
        (signature_header, _) => {
            let missing = if signature_header.is_none() {
                "signature header"
            } else {
                "app secret"
            };
            match enforcement {
                SignatureEnforcement::Strict => {
                    tracing::warn!(
                        provider = provider.as_str(),
                        missing,
                        "rejecting webhook without verifiable signature"
                    );
                    false
                }
                SignatureEnforcement::Permissive => {
                    tracing::warn!(
                        provider = provider.as_str(),
                        missing,
                        "accepting unverified webhook under permissive signature policy"
                    );
                    true
                }
            }
        }
    }
}

/// Verifies a `sha256=<hex>` signature header against `payload` using a
/// shared secret. Comparison is constant-time via the hmac verifier.
pub fn verify_sha256_hmac_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
) -> Result<()> {
    let digest_hex = signature_header
        .strip_prefix("sha256=")
        .ok_or_else(|| anyhow!("signature must use sha256=<hex> format"))?;
    let signature_bytes = decode_hex(digest_hex)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .context("failed to initialize hmac verifier")?;
    mac.update(payload);
    mac.verify_slice(&signature_bytes)
        .map_err(|_| anyhow!("signature verification failed"))
}

/// Computes the `sha256=<hex>` header value a provider would attach to
/// `payload`. Used by tests and webhook self-checks.
pub fn compute_sha256_hmac_signature_header(payload: &[u8], secret: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .context("failed to initialize hmac signer")?;
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    let mut encoded = String::with_capacity(digest.len() * 2 + 7);
    encoded.push_str("sha256=");
    for byte in digest {
        encoded.push_str(&format!("{byte:02x}"));
    }
    Ok(encoded)
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("signature digest cannot be empty");
    }
    if trimmed.len() % 2 != 0 {
        bail!("signature digest must have an even number of hex characters");
    }
    let mut bytes = Vec::with_capacity(trimmed.len() / 2);
    let mut index = 0usize;
    while index < trimmed.len() {
        let next = index.saturating_add(2);
        let chunk = &trimmed[index..next];
        let byte = u8::from_str_radix(chunk, 16)
            .with_context(|| format!("invalid hex byte '{}' in signature digest", chunk))?;
        bytes.push(byte);
        index = next;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_signature_round_trip_verifies() {
        let payload = br#"{"entry":[{"id":"1"}]}"#;
        let header = compute_sha256_hmac_signature_header(payload, "top-secret").expect("sign");
        assert!(header.starts_with("sha256="));
        verify_sha256_hmac_signature(payload, &header, "top-secret").expect("verify");
    }

    #[test]
    fn unit_signature_rejects_flipped_payload_byte() {
        let payload = br#"{"entry":[{"id":"1"}]}"#.to_vec();
        let header = compute_sha256_hmac_signature_header(&payload, "top-secret").expect("sign");
        let mut tampered = payload.clone();
        tampered[2] ^= 0x01;
        assert!(verify_sha256_hmac_signature(&tampered, &header, "top-secret").is_err());
    }

    #[test]
    fn unit_signature_rejects_wrong_secret() {
        let payload = b"body";
        let header = compute_sha256_hmac_signature_header(payload, "secret-a").expect("sign");
        assert!(verify_sha256_hmac_signature(payload, &header, "secret-b").is_err());
    }

    #[test]
    fn unit_signature_requires_sha256_prefix_and_valid_hex() {
        assert!(verify_sha256_hmac_signature(b"body", "md5=abcd", "secret").is_err());
        assert!(verify_sha256_hmac_signature(b"body", "sha256=", "secret").is_err());
        assert!(verify_sha256_hmac_signature(b"body", "sha256=abc", "secret").is_err());
        assert!(verify_sha256_hmac_signature(b"body", "sha256=zz00", "secret").is_err());
    }

    fn signed_headers(payload: &[u8], secret: &str) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert(
            SIGNATURE_HEADER.to_string(),
            compute_sha256_hmac_signature_header(payload, secret).expect("sign"),
        );
        headers
    }

    #[test]
    fn unit_graph_signature_verifies_present_material_in_both_modes() {
        let payload = b"{\"object\":\"page\"}";
        let headers = signed_headers(payload, "secret");
        for enforcement in [SignatureEnforcement::Strict, SignatureEnforcement::Permissive] {
            assert!(verify_graph_signature(
                ChannelProvider::Facebook,
                Some("secret"),
                &headers,
                payload,
                enforcement,
            ));
        }
    }

    #[test]
    fn unit_graph_signature_missing_header_splits_on_enforcement() {
        let payload = b"{}";
        let headers = BTreeMap::new();
        assert!(!verify_graph_signature(
            ChannelProvider::Whatsapp,
            Some("secret"),
            &headers,
            payload,
            SignatureEnforcement::Strict,
        ));
        assert!(verify_graph_signature(
            ChannelProvider::Whatsapp,
            Some("secret"),
            &headers,
            payload,
            SignatureEnforcement::Permissive,
        ));
    }

    #[test]
    fn unit_graph_signature_never_bypasses_a_failed_verification() {
        let payload = b"{\"object\":\"page\"}";
        let mut headers = signed_headers(payload, "secret");
        headers.insert(SIGNATURE_HEADER.to_string(), "sha256=00ff".to_string());
        assert!(!verify_graph_signature(
            ChannelProvider::Instagram,
            Some("secret"),
            &headers,
            payload,
            SignatureEnforcement::Permissive,
        ));
    }
}
