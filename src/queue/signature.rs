//! Webhook signature scheme
//!
//! Every message the durable queue delivers carries an
//! `upstash-signature: v1=<hex>` header: HMAC-SHA256 of the raw body under
//! the shared signing key. Verification is mandatory for all
//! `/api/tasks/*` paths and uses a constant-time comparison.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "upstash-signature";

/// Sign a raw payload, producing the `v1=<hex>` header value.
pub fn sign(signing_key: &str, raw_body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_body);
    format!("v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header against the raw body.
pub fn verify(signing_key: &str, signature_header: &str, raw_body: &[u8]) -> bool {
    let expected = sign(signing_key, raw_body);
    constant_time_compare(&expected, signature_header.trim())
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let body = br#"{"taskId":"t-1"}"#;
        let header = sign("secret", body);
        assert!(header.starts_with("v1="));
        assert!(verify("secret", &header, body));
    }

    #[test]
    fn wrong_key_fails() {
        let body = b"payload";
        let header = sign("secret", body);
        assert!(!verify("other", &header, body));
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign("secret", b"payload");
        assert!(!verify("secret", &header, b"payload2"));
    }

    #[test]
    fn malformed_header_fails() {
        assert!(!verify("secret", "v1=nothex", b"payload"));
        assert!(!verify("secret", "", b"payload"));
    }

    #[test]
    fn compare_is_length_sensitive() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
