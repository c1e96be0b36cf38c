//! Webhook signature verification
//!
//! HMAC-SHA256 over the raw request body. Accepts both the
//! `sha256=<hex>` header format and bare hex, and compares in constant
//! time. With no secret configured, verification is skipped (development
//! mode) and a warning is logged once per process.

use crate::error::{AnalyzerError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub struct WebhookSecurity {
    secret: Option<String>,
    warned_no_secret: AtomicBool,
}

impl WebhookSecurity {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            warned_no_secret: AtomicBool::new(false),
        }
    }

    pub fn is_enforcing(&self) -> bool {
        self.secret.is_some()
    }

    /// Verify a request body against the signature header.
    pub fn verify(&self, payload: &[u8], signature: Option<&str>) -> Result<()> {
        let Some(secret) = &self.secret else {
            if !self.warned_no_secret.swap(true, Ordering::Relaxed) {
                warn!("no webhook secret configured, signature verification disabled");
            }
            return Ok(());
        };

        let signature = signature
            .ok_or_else(|| AnalyzerError::Signature("missing signature header".into()))?;
        let provided = signature.strip_prefix("sha256=").unwrap_or(signature);

        let expected = compute_signature(payload, secret)?;
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            warn!("invalid webhook signature");
            return Err(AnalyzerError::Signature("signature mismatch".into()));
        }
        debug!("webhook signature verified");
        Ok(())
    }
}

/// Generate the `sha256=<hex>` header value for a payload.
pub fn generate_signature(payload: &[u8], secret: &str) -> Result<String> {
    Ok(format!("sha256={}", compute_signature(payload, secret)?))
}

fn compute_signature(payload: &[u8], secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AnalyzerError::Signature(format!("invalid secret: {e}")))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Length-then-bytes comparison without data-dependent early exit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_accepted_in_both_formats() {
        let security = WebhookSecurity::new(Some("secret".into()));
        let body = br#"{"type":"INSERT"}"#;
        let header = generate_signature(body, "secret").unwrap();

        assert!(security.verify(body, Some(&header)).is_ok());
        // Bare hex without the prefix is also accepted.
        let bare = header.strip_prefix("sha256=").unwrap();
        assert!(security.verify(body, Some(bare)).is_ok());
    }

    #[test]
    fn wrong_secret_rejected() {
        let security = WebhookSecurity::new(Some("right".into()));
        let body = b"payload";
        let header = generate_signature(body, "wrong").unwrap();
        match security.verify(body, Some(&header)).unwrap_err() {
            AnalyzerError::Signature(_) => {}
            other => panic!("expected Signature, got {other:?}"),
        }
    }

    #[test]
    fn tampered_body_rejected() {
        let security = WebhookSecurity::new(Some("secret".into()));
        let header = generate_signature(b"original", "secret").unwrap();
        assert!(security.verify(b"tampered", Some(&header)).is_err());
    }

    #[test]
    fn missing_signature_rejected_when_enforcing() {
        let security = WebhookSecurity::new(Some("secret".into()));
        assert!(security.verify(b"body", None).is_err());
    }

    #[test]
    fn no_secret_skips_verification() {
        let security = WebhookSecurity::new(None);
        assert!(!security.is_enforcing());
        assert!(security.verify(b"anything", None).is_ok());
        assert!(security.verify(b"anything", Some("sha256=junk")).is_ok());
    }

    #[test]
    fn empty_secret_means_disabled() {
        let security = WebhookSecurity::new(Some(String::new()));
        assert!(!security.is_enforcing());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
