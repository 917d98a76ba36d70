//! Time-limited object references
//!
//! Binary attachments are never embedded in inference requests. Each one is
//! handed over as a URL carrying an expiry and an HMAC-SHA256 tag over the
//! object key and expiry, which the object host verifies with the shared
//! secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Signing errors
#[derive(Debug, Error, PartialEq)]
pub enum SignError {
    #[error("No signing secret configured")]
    MissingSecret,

    #[error("Signing secret rejected")]
    InvalidSecret,

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Expiry out of range for TTL of {0} seconds")]
    ExpiryOutOfRange(u64),
}

/// A short-lived reference granting read access to one stored object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub url: String,
    pub content_type: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues time-limited object references
pub trait ObjectUrlSigner: Send + Sync {
    fn sign(&self, object_key: &str, content_type: &str) -> Result<ObjectRef, SignError>;
}

/// HMAC-signed URLs under a fixed base URL
pub struct HmacUrlSigner {
    base_url: String,
    secret: Option<String>,
    ttl_secs: u64,
}

impl HmacUrlSigner {
    pub fn new(base_url: impl Into<String>, secret: Option<String>, ttl_secs: u64) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            secret: secret.filter(|s| !s.trim().is_empty()),
            ttl_secs,
        }
    }

    fn mac(secret: &str, object_key: &str, expires: i64) -> Result<HmacSha256, SignError> {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignError::InvalidSecret)?;
        mac.update(object_key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// Check a signature issued by this signer
    pub fn verify(&self, object_key: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        let Some(secret) = &self.secret else {
            return false;
        };
        if now.timestamp() > expires {
            return false;
        }
        let Ok(tag) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        match Self::mac(secret, normalize_key(object_key), expires) {
            Ok(mac) => mac.verify_slice(&tag).is_ok(),
            Err(_) => false,
        }
    }

    fn sign_at(
        &self,
        object_key: &str,
        content_type: &str,
        now: DateTime<Utc>,
    ) -> Result<ObjectRef, SignError> {
        let secret = self.secret.as_deref().ok_or(SignError::MissingSecret)?;
        let key = normalize_key(object_key);
        if key.is_empty() || key.split('/').any(|segment| segment == "..") {
            return Err(SignError::InvalidKey(object_key.to_string()));
        }

        let expires_at = i64::try_from(self.ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or(SignError::ExpiryOutOfRange(self.ttl_secs))?;
        let expires = expires_at.timestamp();
        let tag = Self::mac(secret, key, expires)?.finalize().into_bytes();

        Ok(ObjectRef {
            url: format!(
                "{}/{}?expires={}&signature={}",
                self.base_url,
                key,
                expires,
                URL_SAFE_NO_PAD.encode(tag)
            ),
            content_type: content_type.to_string(),
            expires_at,
        })
    }
}

impl ObjectUrlSigner for HmacUrlSigner {
    fn sign(&self, object_key: &str, content_type: &str) -> Result<ObjectRef, SignError> {
        self.sign_at(object_key, content_type, Utc::now())
    }
}

fn normalize_key(object_key: &str) -> &str {
    object_key.trim().trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> HmacUrlSigner {
        HmacUrlSigner::new("https://objects.example/", Some("s3cret".to_string()), 600)
    }

    #[test]
    fn test_signed_url_shape() {
        let now = Utc::now();
        let reference = signer().sign_at("/tickets/42.jpg", "image/jpeg", now).unwrap();
        assert!(reference
            .url
            .starts_with("https://objects.example/tickets/42.jpg?expires="));
        assert!(reference.url.contains("&signature="));
        assert_eq!(reference.expires_at, now + Duration::seconds(600));
        assert_eq!(reference.content_type, "image/jpeg");
    }

    #[test]
    fn test_signature_verifies_until_expiry() {
        let signer = signer();
        let now = Utc::now();
        let reference = signer.sign_at("tickets/42.jpg", "image/jpeg", now).unwrap();
        let expires = reference.expires_at.timestamp();
        let signature = reference.url.rsplit("signature=").next().unwrap();

        assert!(signer.verify("tickets/42.jpg", expires, signature, now));
        assert!(!signer.verify("tickets/43.jpg", expires, signature, now));
        assert!(!signer.verify("tickets/42.jpg", expires + 60, signature, now));
        assert!(!signer.verify(
            "tickets/42.jpg",
            expires,
            signature,
            now + Duration::seconds(601)
        ));
    }

    #[test]
    fn test_signature_is_hmac_sha256_of_key_and_expiry() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let reference = signer().sign_at("tickets/42.jpg", "image/jpeg", now).unwrap();
        let signature = reference.url.rsplit("signature=").next().unwrap();

        let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
        mac.update(b"tickets/42.jpg\n1700000600");
        let expected = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        assert_eq!(signature, expected);

        let other = HmacUrlSigner::new("https://objects.example", Some("other".to_string()), 600);
        assert!(!other.verify("tickets/42.jpg", 1_700_000_600, signature, now));
    }

    #[test]
    fn test_garbled_signature_rejected() {
        let signer = signer();
        let now = Utc::now();
        let expires = now.timestamp() + 600;
        assert!(!signer.verify("tickets/42.jpg", expires, "not base64!", now));
        assert!(!signer.verify("tickets/42.jpg", expires, "", now));
    }

    #[test]
    fn test_oversized_ttl_is_an_error() {
        let signer = HmacUrlSigner::new("https://objects.example", Some("k".to_string()), u64::MAX);
        assert_eq!(
            signer.sign("a.jpg", "image/jpeg").unwrap_err(),
            SignError::ExpiryOutOfRange(u64::MAX)
        );

        let signer = HmacUrlSigner::new("https://objects.example", Some("k".to_string()), i64::MAX as u64);
        assert!(matches!(
            signer.sign("a.jpg", "image/jpeg"),
            Err(SignError::ExpiryOutOfRange(_))
        ));
    }

    #[test]
    fn test_missing_secret_cannot_sign() {
        let signer = HmacUrlSigner::new("https://objects.example", None, 600);
        assert_eq!(
            signer.sign("tickets/1.jpg", "image/jpeg").unwrap_err(),
            SignError::MissingSecret
        );
    }

    #[test]
    fn test_path_traversal_rejected() {
        let err = signer().sign("../etc/passwd", "image/png").unwrap_err();
        assert!(matches!(err, SignError::InvalidKey(_)));
    }
}
