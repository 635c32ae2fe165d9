//! Bypass token signing.
//!
//! A pass is `base64url(payload).base64url(hmac_sha256(payload))` where the
//! payload is a JSON claim set. Verification is constant-time through the
//! hmac crate. A valid signature alone is not admission: the token must
//! still be present (unconsumed) in the store.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a bypass token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassClaims {
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PassError {
    #[error("malformed pass")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("pass expired")]
    Expired,
}

/// Mints and verifies bypass tokens with a shared secret.
#[derive(Clone)]
pub struct PassSigner {
    key: Vec<u8>,
}

impl PassSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    pub fn mint(&self, event_id: Uuid, user_id: Uuid, ttl: Duration) -> String {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(300));
        let claims = PassClaims {
            event_id,
            user_id,
            issued_at: now,
            expires_at: now + ttl,
        };
        let payload = serde_json::to_vec(&claims).expect("pass claims serialize");
        let signature = self.sign(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    pub fn verify(&self, token: &str) -> Result<PassClaims, PassError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(PassError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| PassError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| PassError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| PassError::BadSignature)?;

        let claims: PassClaims =
            serde_json::from_slice(&payload).map_err(|_| PassError::Malformed)?;
        if claims.expires_at <= Utc::now() {
            return Err(PassError::Expired);
        }
        Ok(claims)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "queue-pass-secret-queue-pass-secret";

    #[test]
    fn mint_verify_round_trip() {
        let signer = PassSigner::new(SECRET);
        let (event, user) = (Uuid::new_v4(), Uuid::new_v4());
        let token = signer.mint(event, user, Duration::from_secs(300));

        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.event_id, event);
        assert_eq!(claims.user_id, user);
        assert!(claims.expires_at > claims.issued_at);
    }

    #[test]
    fn rejects_tampered_payload() {
        let signer = PassSigner::new(SECRET);
        let token = signer.mint(Uuid::new_v4(), Uuid::new_v4(), Duration::from_secs(300));
        let (_payload, signature) = token.split_once('.').unwrap();

        let forged_claims = PassClaims {
            event_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::hours(10),
        };
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        let forged = format!("{}.{}", forged_payload, signature);

        assert_eq!(signer.verify(&forged), Err(PassError::BadSignature));
    }

    #[test]
    fn rejects_wrong_secret() {
        let signer = PassSigner::new(SECRET);
        let other = PassSigner::new("a-completely-different-signing-key");
        let token = signer.mint(Uuid::new_v4(), Uuid::new_v4(), Duration::from_secs(300));
        assert_eq!(other.verify(&token), Err(PassError::BadSignature));
    }

    #[test]
    fn rejects_expired_token() {
        let signer = PassSigner::new(SECRET);
        let token = signer.mint(Uuid::new_v4(), Uuid::new_v4(), Duration::ZERO);
        assert_eq!(signer.verify(&token), Err(PassError::Expired));
    }

    #[test]
    fn rejects_garbage() {
        let signer = PassSigner::new(SECRET);
        assert_eq!(signer.verify("not-a-token"), Err(PassError::Malformed));
        assert_eq!(signer.verify("a.b"), Err(PassError::Malformed));
    }
}
