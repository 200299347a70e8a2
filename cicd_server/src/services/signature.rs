//! HMAC-SHA256 webhook signatures (`sha256=<hex>` over the raw body).
//!
//! Used for both outbound notification signing and inbound webhook
//! verification, so the two can never drift apart.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature, inbound and outbound.
pub const SIGNATURE_HEADER: &str = "X-Opsdeck-Signature";

/// Sign `body` with `secret`, returning `sha256=<hex>`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length; new_from_slice cannot fail here.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` signature over `body`. Comparison is constant-time.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(sig) = signature.trim().strip_prefix("sha256=") else {
        return false;
    };
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Constant-time equality for webhook tokens.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_then_verify() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let sig = sign("s3cret", body);
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(verify("s3cret", body, &sig));
    }

    #[test]
    fn test_one_byte_change_invalidates_signature() {
        let body = br#"{"ref":"refs/heads/main"}"#.to_vec();
        let sig = sign("s3cret", &body);
        let mut altered = body.clone();
        altered[3] ^= 0x20;
        assert!(!verify("s3cret", &altered, &sig));
    }

    #[test]
    fn test_signature_over_secret_alone_is_rejected() {
        let body = br#"{"branch":"main"}"#;
        let secret_only = sign("s3cret", b"s3cret");
        assert!(!verify("s3cret", body, &secret_only));
    }

    #[test]
    fn test_wrong_secret_and_malformed_headers() {
        let body = b"payload";
        let sig = sign("a", body);
        assert!(!verify("b", body, &sig));
        assert!(!verify("a", body, sig.trim_start_matches("sha256=")));
        assert!(!verify("a", body, "sha256=zz"));
        assert!(!verify("a", body, ""));
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc123", "abc123"));
        assert!(!tokens_match("abc123", "abc124"));
        assert!(!tokens_match("abc123", "abc12"));
    }
}
