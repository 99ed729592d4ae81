//! Golden vectors for the token signature contract.
//!
//! These signatures were produced independently of this codebase; any
//! implementation that issues or verifies tokens must reproduce them
//! bit-for-bit.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;

use naglfar::token::signature::{canonical_message, compute_signature, token_id};
use naglfar::token::{SignatureValidator, Validation};

#[test]
fn test_golden_vector_1() {
    let signature = compute_signature(
        "store-1",
        Some(1001),
        "2030-01-02T03:04:05.000Z",
        "naglfar-test-secret",
    )
    .unwrap();

    assert_eq!(
        signature,
        "cf004ed8bf16b2b894da0aea768cbcfbe7979e0766ce3c5a9a0c24f38b6b88ad"
    );
}

#[test]
fn test_golden_vector_2() {
    let signature = compute_signature(
        "store-2",
        Some(42),
        "2026-06-15T12:00:00.000Z",
        "another-secret",
    )
    .unwrap();

    assert_eq!(
        signature,
        "9e47591b3295d58d143f6548c9093af0c31f92e6e1d97a2eb00c798fcbeba404"
    );
}

#[test]
fn test_canonical_message_is_compact_and_sorted() {
    let msg = canonical_message("store-1", Some(1001), "2030-01-02T03:04:05.000Z").unwrap();
    assert_eq!(
        msg,
        r#"{"expired_at":"2030-01-02T03:04:05.000Z","tenant_id":"store-1","user_id":1001}"#
    );
    assert!(!msg.contains(' '));
}

#[test]
fn test_signature_is_deterministic() {
    let a = compute_signature("store-1", Some(7), "2030-01-01T00:00:00.000Z", "secret-16-chars!")
        .unwrap();
    let b = compute_signature("store-1", Some(7), "2030-01-01T00:00:00.000Z", "secret-16-chars!")
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn test_expired_at_is_signed_verbatim() {
    // Millisecond and microsecond renderings of the same instant must not
    // produce the same signature: the string is signed as-is.
    let millis =
        compute_signature("store-1", Some(1), "2030-01-01T00:00:00.000Z", "naglfar-test-secret")
            .unwrap();
    let micros = compute_signature(
        "store-1",
        Some(1),
        "2030-01-01T00:00:00.000000Z",
        "naglfar-test-secret",
    )
    .unwrap();
    assert_ne!(millis, micros);
}

#[test]
fn test_token_id_golden_vector() {
    assert_eq!(
        token_id("dGVzdA=="),
        "2b200a668f372eb923099cbdb250d0aa340de0163088de1e23482b1a4c50ae9b"
    );
}

#[test]
fn test_validator_accepts_externally_built_token() {
    // Simulates the auth backend: build the token JSON by hand around a
    // recomputed signature, then run it through the validator.
    let secret = "naglfar-test-secret";
    let expired_at = "2030-01-02T03:04:05.000Z";
    let signature = compute_signature("store-1", Some(1001), expired_at, secret).unwrap();
    let json = format!(
        r#"{{"tenant_id":"store-1","user_id":1001,"expired_at":"{}","signature":"{}"}}"#,
        expired_at, signature
    );
    let token = BASE64.encode(json.as_bytes());

    let validator = SignatureValidator::with_secret(secret);
    match validator.validate(&token, "store-1", Utc::now()) {
        Validation::Accepted {
            tenant_id, user_id, ..
        } => {
            assert_eq!(tenant_id, "store-1");
            assert_eq!(user_id, Some(1001));
        }
        other => panic!("expected Accepted, got {:?}", other),
    }
}
