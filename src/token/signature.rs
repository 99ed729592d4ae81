//! Post-auth token signature contract.
//!
//! The signature is HMAC-SHA-256 over the canonical JSON of
//! `{expired_at, tenant_id, user_id}` — keys sorted lexicographically, no
//! insignificant whitespace — rendered as lowercase hex. The canonical string
//! must be byte-identical in every implementation that issues or verifies
//! tokens; `expired_at` is signed exactly as it appears in the token, never
//! reparsed or reformatted.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::error::{AppError, AppResult};

use super::codec;

type HmacSha256 = Hmac<Sha256>;

/// Canonical signing payload. Field declaration order is the lexicographic
/// key order, which serde_json preserves.
#[derive(Serialize)]
struct CanonicalClaims<'a> {
    expired_at: &'a str,
    tenant_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
}

/// Builds the canonical JSON string the signature is computed over.
pub fn canonical_message(
    tenant_id: &str,
    user_id: Option<i64>,
    expired_at: &str,
) -> AppResult<String> {
    let claims = CanonicalClaims {
        expired_at,
        tenant_id,
        user_id,
    };
    Ok(serde_json::to_string(&claims)?)
}

/// Computes the lowercase-hex HMAC-SHA-256 signature for a token payload.
pub fn compute_signature(
    tenant_id: &str,
    user_id: Option<i64>,
    expired_at: &str,
    secret: &str,
) -> AppResult<String> {
    let message = canonical_message(tenant_id, user_id, expired_at)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::internal(format!("HMAC init failed: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// One-way correlation handle for a post-auth token: SHA-256 of the raw
/// token string, lowercase hex. Safe to log and persist.
pub fn token_id(raw_token: &str) -> String {
    hex::encode(Sha256::digest(raw_token.as_bytes()))
}

/// Why a token was rejected. Carried into the fail event's `data` payload;
/// never surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Malformed,
    Incomplete,
    Expired,
    BadSignature,
    TenantMismatch,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Malformed => "malformed",
            RejectReason::Incomplete => "incomplete",
            RejectReason::Expired => "expired",
            RejectReason::BadSignature => "bad_signature",
            RejectReason::TenantMismatch => "tenant_mismatch",
        }
    }
}

/// Outcome of post-auth token validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Accepted {
        tenant_id: String,
        user_id: Option<i64>,
        token_id: String,
    },
    Rejected(RejectReason),
}

/// Verifies post-auth tokens against the shared secret.
///
/// The secret is threaded in explicitly at construction and never read from
/// ambient state on the hot path. Validation is CPU-bound and performs no I/O.
pub struct SignatureValidator {
    secret: String,
}

impl SignatureValidator {
    pub fn new(config: &Config) -> Self {
        Self {
            secret: config.signature_key.clone(),
        }
    }

    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Fail-fast validation; the first failing step determines the reason.
    pub fn validate(&self, token: &str, expected_tenant: &str, now: DateTime<Utc>) -> Validation {
        // 1. Decode
        let claims = match codec::decode_post_auth(token) {
            Ok(claims) => claims,
            Err(_) => return Validation::Rejected(RejectReason::Malformed),
        };

        // 2. Required fields
        let (Some(tenant_id), Some(expired_at), Some(signature)) =
            (&claims.tenant_id, &claims.expired_at, &claims.signature)
        else {
            return Validation::Rejected(RejectReason::Incomplete);
        };

        // 3. Parseable expiry
        let expiry = match codec::parse_timestamp(expired_at) {
            Ok(expiry) => expiry,
            Err(_) => return Validation::Rejected(RejectReason::Malformed),
        };

        // 4. Not expired
        if expiry < now {
            return Validation::Rejected(RejectReason::Expired);
        }

        // 5. Signature, constant-time
        let expected = match compute_signature(tenant_id, claims.user_id, expired_at, &self.secret)
        {
            Ok(expected) => expected,
            Err(_) => return Validation::Rejected(RejectReason::BadSignature),
        };
        let matches: bool = expected.as_bytes().ct_eq(signature.as_bytes()).into();
        if !matches {
            return Validation::Rejected(RejectReason::BadSignature);
        }

        // 6. Tenant isolation
        if tenant_id != expected_tenant {
            return Validation::Rejected(RejectReason::TenantMismatch);
        }

        Validation::Accepted {
            tenant_id: tenant_id.clone(),
            user_id: claims.user_id,
            token_id: token_id(token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use chrono::Duration;

    const SECRET: &str = "naglfar-test-secret";

    fn validator() -> SignatureValidator {
        SignatureValidator::with_secret(SECRET)
    }

    fn valid_token(now: DateTime<Utc>) -> String {
        codec::encode_post_auth("store-1", 1001, now + Duration::minutes(5), SECRET).unwrap()
    }

    #[test]
    fn test_acceptance() {
        let now = Utc::now();
        let token = valid_token(now);

        match validator().validate(&token, "store-1", now) {
            Validation::Accepted {
                tenant_id,
                user_id,
                token_id: tid,
            } => {
                assert_eq!(tenant_id, "store-1");
                assert_eq!(user_id, Some(1001));
                assert_eq!(tid, token_id(&token));
                assert_eq!(tid.len(), 64);
            }
            other => panic!("expected Accepted, got {:?}", other),
        }
    }

    #[test]
    fn test_expired_token() {
        let now = Utc::now();
        let token =
            codec::encode_post_auth("store-1", 1001, now - Duration::minutes(1), SECRET).unwrap();

        assert_eq!(
            validator().validate(&token, "store-1", now),
            Validation::Rejected(RejectReason::Expired)
        );
    }

    #[test]
    fn test_tampered_signature() {
        let now = Utc::now();
        let token = valid_token(now);

        // Flip one character of the embedded signature
        let json = String::from_utf8(BASE64.decode(&token).unwrap()).unwrap();
        let mut claims: codec::PostAuthClaims = serde_json::from_str(&json).unwrap();
        let mut sig = claims.signature.unwrap();
        let flipped = if sig.ends_with('0') { 'f' } else { '0' };
        sig.pop();
        sig.push(flipped);
        claims.signature = Some(sig);
        let tampered = BASE64.encode(serde_json::to_string(&claims).unwrap());

        assert_eq!(
            validator().validate(&tampered, "store-1", now),
            Validation::Rejected(RejectReason::BadSignature)
        );
    }

    #[test]
    fn test_tenant_isolation() {
        let now = Utc::now();
        let token = valid_token(now);

        assert_eq!(
            validator().validate(&token, "store-2", now),
            Validation::Rejected(RejectReason::TenantMismatch)
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert_eq!(
            validator().validate("!!definitely-not-base64!!", "store-1", Utc::now()),
            Validation::Rejected(RejectReason::Malformed)
        );
    }

    #[test]
    fn test_missing_signature_is_incomplete() {
        let token = BASE64.encode(
            br#"{"tenant_id":"store-1","user_id":1001,"expired_at":"2030-01-01T00:00:00.000Z"}"#,
        );
        assert_eq!(
            validator().validate(&token, "store-1", Utc::now()),
            Validation::Rejected(RejectReason::Incomplete)
        );
    }

    #[test]
    fn test_unparseable_expiry_is_malformed() {
        let token = BASE64.encode(
            br#"{"tenant_id":"store-1","user_id":1,"expired_at":"soon","signature":"00"}"#,
        );
        assert_eq!(
            validator().validate(&token, "store-1", Utc::now()),
            Validation::Rejected(RejectReason::Malformed)
        );
    }

    #[test]
    fn test_canonical_message_shape() {
        let msg = canonical_message("store-1", Some(1001), "2030-01-02T03:04:05.000Z").unwrap();
        assert_eq!(
            msg,
            r#"{"expired_at":"2030-01-02T03:04:05.000Z","tenant_id":"store-1","user_id":1001}"#
        );
    }
}
