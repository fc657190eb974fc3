//! Webhook signature verification
//!
//! Senders sign the raw request body with HMAC using a shared secret and put
//! the hex digest in one of two header families. SHA-256 headers win when a
//! request carries both.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use tracing::warn;

pub const SHA256_HEADERS: [&str; 2] = ["x-hub-signature-256", "x-webhook-signature256"];
pub const SHA1_HEADERS: [&str; 2] = ["x-hub-signature", "x-webhook-signature"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Sha256,
}

impl Algorithm {
    fn prefix(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1=",
            Self::Sha256 => "sha256=",
        }
    }
}

/// Check `provided` (bare hex or `sha256=`-style prefixed hex) against the
/// HMAC of `raw_body`. The comparison runs in constant time.
pub fn verify(raw_body: &[u8], secret: &str, provided: &str, algorithm: Algorithm) -> bool {
    if raw_body.is_empty() || secret.is_empty() {
        return false;
    }
    let provided = provided.trim();
    let hex_digest = provided.strip_prefix(algorithm.prefix()).unwrap_or(provided);
    if hex_digest.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(hex_digest) else {
        warn!("Webhook signature is not valid hex");
        return false;
    };

    match algorithm {
        Algorithm::Sha1 => check::<Hmac<Sha1>>(raw_body, secret, &expected),
        Algorithm::Sha256 => check::<Hmac<Sha256>>(raw_body, secret, &expected),
    }
}

fn check<M: Mac + hmac::digest::KeyInit>(raw_body: &[u8], secret: &str, expected: &[u8]) -> bool {
    let Ok(mut mac) = <M as Mac>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(expected).is_ok()
}

/// Find the signature header to check, preferring SHA-256
pub fn signature_from_headers(headers: &HeaderMap) -> Option<(Algorithm, &str)> {
    let find = |names: &[&str]| {
        names
            .iter()
            .filter_map(|name| headers.get(*name))
            .find_map(|value| value.to_str().ok())
            .filter(|value| !value.trim().is_empty())
    };

    find(&SHA256_HEADERS)
        .map(|sig| (Algorithm::Sha256, sig))
        .or_else(|| find(&SHA1_HEADERS).map(|sig| (Algorithm::Sha1, sig)))
}

#[cfg(test)]
pub(crate) fn sign(raw_body: &[u8], secret: &str, algorithm: Algorithm) -> String {
    let bytes = match algorithm {
        Algorithm::Sha1 => {
            let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(secret.as_bytes()).unwrap();
            mac.update(raw_body);
            mac.finalize().into_bytes().to_vec()
        }
        Algorithm::Sha256 => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()).unwrap();
            mac.update(raw_body);
            mac.finalize().into_bytes().to_vec()
        }
    };
    format!("{}{}", algorithm.prefix(), hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"zen":"Design for failure."}"#;

    #[test]
    fn test_verify_sha256_and_byte_flip() {
        let sig = sign(BODY, "s3cret", Algorithm::Sha256);
        assert!(verify(BODY, "s3cret", &sig, Algorithm::Sha256));

        let mut tampered = BODY.to_vec();
        tampered[3] ^= 0x01;
        assert!(!verify(&tampered, "s3cret", &sig, Algorithm::Sha256));
        assert!(!verify(BODY, "other", &sig, Algorithm::Sha256));
    }

    #[test]
    fn test_verify_sha1_bare_hex() {
        let sig = sign(BODY, "s3cret", Algorithm::Sha1);
        let bare = sig.strip_prefix("sha1=").unwrap();
        assert!(verify(BODY, "s3cret", bare, Algorithm::Sha1));
        assert!(verify(BODY, "s3cret", &sig, Algorithm::Sha1));
    }

    #[test]
    fn test_verify_rejects_bad_input() {
        let sig = sign(BODY, "s3cret", Algorithm::Sha256);
        assert!(!verify(BODY, "s3cret", "", Algorithm::Sha256));
        assert!(!verify(BODY, "s3cret", "sha256=", Algorithm::Sha256));
        assert!(!verify(BODY, "s3cret", "sha256=zz", Algorithm::Sha256));
        assert!(!verify(b"", "s3cret", &sig, Algorithm::Sha256));
        // Digest from the wrong algorithm
        assert!(!verify(BODY, "s3cret", &sig, Algorithm::Sha1));
    }

    #[test]
    fn test_header_detection_prefers_sha256() {
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature", "sha1=aa".parse().unwrap());
        assert_eq!(signature_from_headers(&headers), Some((Algorithm::Sha1, "sha1=aa")));

        headers.insert("x-hub-signature-256", "sha256=bb".parse().unwrap());
        assert_eq!(
            signature_from_headers(&headers),
            Some((Algorithm::Sha256, "sha256=bb"))
        );
    }

    #[test]
    fn test_header_detection_blog_family() {
        let mut headers = HeaderMap::new();
        headers.insert("x-webhook-signature256", "cc".parse().unwrap());
        assert_eq!(signature_from_headers(&headers), Some((Algorithm::Sha256, "cc")));

        assert_eq!(signature_from_headers(&HeaderMap::new()), None);
    }
}
