//! Token encoding and decoding.
//!
//! Both token formats are a base64 encoding of a flat JSON object. This
//! module knows nothing about HTTP or the broker; signature verification
//! lives in [`super::signature`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PRE_AUTH_TOKEN_TTL_MINUTES;
use crate::error::{AppError, AppResult};

/// Pre-auth token payload (E-TOKEN).
///
/// Unsigned, carries no authority: it only correlates a caller across the
/// redirect round-trip to the auth backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreAuthClaims {
    pub expiry_date: String,
    pub tenant_id: String,
}

impl PreAuthClaims {
    pub fn expiry(&self) -> AppResult<DateTime<Utc>> {
        parse_timestamp(&self.expiry_date)
    }
}

/// Post-auth token payload (AUTH-TOKEN), as decoded from the wire.
///
/// Fields are optional at this layer; presence is enforced by the
/// validator so that a structurally valid token with missing fields is
/// rejected as `incomplete` rather than `malformed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostAuthClaims {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub expired_at: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Mints a fresh pre-auth token valid for 15 minutes from `now`.
pub fn encode_pre_auth(tenant_id: &str, now: DateTime<Utc>) -> AppResult<String> {
    let claims = PreAuthClaims {
        expiry_date: format_timestamp(now + Duration::minutes(PRE_AUTH_TOKEN_TTL_MINUTES)),
        tenant_id: tenant_id.to_string(),
    };
    let json = serde_json::to_string(&claims)?;
    Ok(BASE64.encode(json.as_bytes()))
}

pub fn decode_pre_auth(token: &str) -> AppResult<PreAuthClaims> {
    let json = decode_base64_json(token)?;
    let claims: PreAuthClaims = serde_json::from_str(&json)
        .map_err(|e| AppError::MalformedToken(format!("invalid pre-auth payload: {}", e)))?;
    Ok(claims)
}

/// Builds a signed post-auth token. The gateway itself only verifies tokens;
/// this encoder exists for the signature contract tests and tooling that
/// needs to produce tokens the way the auth backend does.
pub fn encode_post_auth(
    tenant_id: &str,
    user_id: i64,
    expired_at: DateTime<Utc>,
    secret: &str,
) -> AppResult<String> {
    let expired_at = format_timestamp(expired_at);
    let signature = super::signature::compute_signature(tenant_id, Some(user_id), &expired_at, secret)?;
    let claims = PostAuthClaims {
        tenant_id: Some(tenant_id.to_string()),
        user_id: Some(user_id),
        expired_at: Some(expired_at),
        signature: Some(signature),
    };
    let json = serde_json::to_string(&claims)?;
    Ok(BASE64.encode(json.as_bytes()))
}

pub fn decode_post_auth(token: &str) -> AppResult<PostAuthClaims> {
    let json = decode_base64_json(token)?;
    let claims: PostAuthClaims = serde_json::from_str(&json)
        .map_err(|e| AppError::MalformedToken(format!("invalid post-auth payload: {}", e)))?;
    Ok(claims)
}

fn decode_base64_json(token: &str) -> AppResult<String> {
    let bytes = BASE64
        .decode(token.trim())
        .map_err(|e| AppError::MalformedToken(format!("invalid base64: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| AppError::MalformedToken(format!("invalid utf-8: {}", e)))
}

/// Renders a timestamp the way the auth backend does: UTC, microsecond
/// precision, trailing `Z`. Microsecond precision is what makes two
/// consecutively minted pre-auth tokens distinct.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn parse_timestamp(raw: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::MalformedToken(format!("invalid timestamp {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_pre_auth_round_trip() {
        let now = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        let token = encode_pre_auth("store-1", now).unwrap();
        let claims = decode_pre_auth(&token).unwrap();

        assert_eq!(claims.tenant_id, "store-1");
        assert_eq!(claims.expiry().unwrap(), now + Duration::minutes(15));
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        let err = decode_pre_auth("not!!base64").unwrap_err();
        assert!(matches!(err, AppError::MalformedToken(_)));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let token = BASE64.encode(b"plainly not json");
        let err = decode_pre_auth(&token).unwrap_err();
        assert!(matches!(err, AppError::MalformedToken(_)));
    }

    #[test]
    fn test_pre_auth_requires_fields() {
        let token = BASE64.encode(br#"{"tenant_id": "store-1"}"#);
        let err = decode_pre_auth(&token).unwrap_err();
        assert!(matches!(err, AppError::MalformedToken(_)));
    }

    #[test]
    fn test_post_auth_decode_tolerates_missing_fields() {
        // Presence is the validator's concern (reason=incomplete), not the codec's.
        let token = BASE64.encode(br#"{"tenant_id": "store-1"}"#);
        let claims = decode_post_auth(&token).unwrap();
        assert_eq!(claims.tenant_id.as_deref(), Some("store-1"));
        assert!(claims.signature.is_none());
    }

    #[test]
    fn test_timestamp_format_microseconds() {
        let ts = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(ts), "2030-01-02T03:04:05.000000Z");
        assert_eq!(parse_timestamp("2030-01-02T03:04:05.000000Z").unwrap(), ts);
        // Millisecond-precision issuers parse too
        assert_eq!(parse_timestamp("2030-01-02T03:04:05.000Z").unwrap(), ts);
    }
}
