//! JWKS documents and cache entries.
//!
//! A [`Jwks`] is the raw key-set document an issuer publishes; keys are
//! kept as generic JSON objects so unknown fields survive a cache
//! round-trip. [`JwksCacheEntry`] adds the expiry bookkeeping the key
//! cache persists alongside the document.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Result, SciTokenError},
    key::algorithm_name,
};

/// Default lifetime of a cache entry fetched without explicit cache
/// directives: 4 days.
///
/// After this the entry is expired and [`crate::JwksCache::get_cached_jwks`]
/// reports an empty key set for the issuer.
pub const DEFAULT_JWKS_EXPIRY_SECS: i64 = 4 * 24 * 3600;

/// Default interval before a cache entry becomes due for a refresh
/// attempt: 600 seconds.
///
/// Between `next_update_at` and `expires_at` the entry is stale-but-usable:
/// key resolution attempts a refresh first and falls back to the cached
/// keys if the fetch fails.
pub const DEFAULT_JWKS_NEXT_UPDATE_SECS: i64 = 600;

/// A JSON Web Key Set as published by an issuer.
///
/// Keys are stored as raw JSON objects; see [`decoding_key_from_jwk`] for
/// the conversion into a verification key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Jwks {
    /// The member keys, verbatim from the source document.
    #[serde(default)]
    pub keys: Vec<Value>,
}

impl Jwks {
    /// A key set with no keys, as reported for absent or expired cache
    /// entries.
    #[must_use]
    pub fn empty() -> Self {
        Self { keys: Vec::new() }
    }

    /// Whether the key set contains no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Parses a raw JWKS document.
    ///
    /// # Errors
    ///
    /// Returns [`SciTokenError::Parse`] if the document is not valid JSON
    /// or lacks the JWKS shape.
    pub fn parse(document: &str) -> Result<Self> {
        serde_json::from_str(document)
            .map_err(|e| SciTokenError::parse(format!("invalid JWKS document: {e}")))
    }

    /// Iterates the keys matching a `kid`, or every key when the token
    /// carried no `kid` header.
    pub(crate) fn candidates<'a>(
        &'a self,
        kid: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Value> + 'a {
        self.keys.iter().filter(move |jwk| match kid {
            Some(kid) => jwk.get("kid").and_then(Value::as_str) == Some(kid),
            None => true,
        })
    }
}

/// One persisted key-cache entry: an issuer's JWKS plus expiry bookkeeping.
///
/// Invariant: `expires_at >= fetched_at` and `next_update_at >= fetched_at`
/// whenever the entry is produced by [`JwksCacheEntry::fresh`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JwksCacheEntry {
    /// The issuer this entry belongs to (also the store key).
    pub issuer: String,
    /// The raw key-set document.
    pub jwks: Jwks,
    /// When the document was fetched or supplied.
    pub fetched_at: DateTime<Utc>,
    /// When the cached keys stop being served at all.
    pub expires_at: DateTime<Utc>,
    /// When the entry becomes due for a refresh attempt.
    pub next_update_at: DateTime<Utc>,
}

impl JwksCacheEntry {
    /// Builds an entry with the standard directive-less lifetime policy:
    /// `expires_at = now + 4 days`, `next_update_at = now + 600 s`.
    ///
    /// Used both for freshly fetched documents and caller-supplied ones —
    /// there are no HTTP cache-control headers to trust in either case.
    #[must_use]
    pub fn fresh(issuer: impl Into<String>, jwks: Jwks, now: DateTime<Utc>) -> Self {
        Self {
            issuer: issuer.into(),
            jwks,
            fetched_at: now,
            expires_at: now + Duration::seconds(DEFAULT_JWKS_EXPIRY_SECS),
            next_update_at: now + Duration::seconds(DEFAULT_JWKS_NEXT_UPDATE_SECS),
        }
    }

    /// Whether the entry has passed its hard expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether the entry is due for a refresh attempt.
    #[must_use]
    pub fn needs_update(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_update_at
    }
}

/// Converts one JWK into a verification key for the given algorithm.
///
/// RSA keys (`kty: RSA`) pair with RS256 via their `n`/`e` components;
/// P-256 EC keys (`kty: EC`, `crv: P-256`) pair with ES256 via `x`/`y`.
/// A JWK carrying an explicit `alg` member must name the same algorithm.
///
/// # Errors
///
/// Returns [`SciTokenError::KeyFormat`] if the JWK is missing required
/// members, names a different algorithm, or its components are invalid.
pub fn decoding_key_from_jwk(jwk: &Value, algorithm: Algorithm) -> Result<DecodingKey> {
    if let Some(alg) = jwk.get("alg").and_then(Value::as_str)
        && alg != algorithm_name(algorithm)
    {
        return Err(SciTokenError::key_format(format!(
            "JWK is for algorithm '{alg}', token uses '{}'",
            algorithm_name(algorithm)
        )));
    }

    let kty = jwk
        .get("kty")
        .and_then(Value::as_str)
        .ok_or_else(|| SciTokenError::key_format("JWK missing 'kty' member"))?;

    let member = |name: &str| -> Result<&str> {
        jwk.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| SciTokenError::key_format(format!("JWK missing '{name}' member")))
    };

    match (kty, algorithm) {
        ("RSA", Algorithm::RS256) => {
            DecodingKey::from_rsa_components(member("n")?, member("e")?)
                .map_err(|e| SciTokenError::key_format(format!("invalid RSA components: {e}")))
        },
        ("EC", Algorithm::ES256) => {
            let crv = member("crv")?;
            if crv != "P-256" {
                return Err(SciTokenError::key_format(format!(
                    "unsupported EC curve '{crv}' (only P-256)"
                )));
            }
            DecodingKey::from_ec_components(member("x")?, member("y")?)
                .map_err(|e| SciTokenError::key_format(format!("invalid EC components: {e}")))
        },
        (kty, alg) => Err(SciTokenError::key_format(format!(
            "key type '{kty}' does not pair with algorithm '{}'",
            algorithm_name(alg)
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testutil::{TEST_EC_X, TEST_EC_Y, test_jwks};

    #[test]
    fn test_parse_jwks() {
        let jwks = Jwks::parse(r#"{"keys":[{"kty":"EC","kid":"a"}]}"#).unwrap();
        assert_eq!(jwks.keys.len(), 1);
    }

    #[test]
    fn test_parse_jwks_missing_keys_member_is_empty() {
        let jwks = Jwks::parse("{}").unwrap();
        assert!(jwks.is_empty());
    }

    #[test]
    fn test_parse_jwks_invalid_json() {
        assert!(matches!(Jwks::parse("nope"), Err(SciTokenError::Parse { .. })));
    }

    #[test]
    fn test_candidates_by_kid() {
        let jwks = Jwks {
            keys: vec![json!({"kid": "a"}), json!({"kid": "b"}), json!({"kid": "a"})],
        };
        assert_eq!(jwks.candidates(Some("a")).count(), 2);
        assert_eq!(jwks.candidates(Some("missing")).count(), 0);
        assert_eq!(jwks.candidates(None).count(), 3);
    }

    #[test]
    fn test_fresh_entry_invariants() {
        let now = Utc::now();
        let entry = JwksCacheEntry::fresh("https://issuer.example", Jwks::empty(), now);
        assert!(entry.expires_at >= entry.fetched_at);
        assert!(entry.next_update_at >= entry.fetched_at);
        assert!(!entry.is_expired(now));
        assert!(!entry.needs_update(now));
        assert!(entry.needs_update(now + Duration::seconds(DEFAULT_JWKS_NEXT_UPDATE_SECS)));
        assert!(entry.is_expired(now + Duration::seconds(DEFAULT_JWKS_EXPIRY_SECS + 1)));
    }

    #[test]
    fn test_entry_serde_round_trip() {
        let entry = JwksCacheEntry::fresh("https://issuer.example", test_jwks("kid-1"), Utc::now());
        let encoded = serde_json::to_string(&entry).unwrap();
        let decoded: JwksCacheEntry = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_decoding_key_from_ec_jwk() {
        let jwk = json!({"kty": "EC", "crv": "P-256", "kid": "k", "x": TEST_EC_X, "y": TEST_EC_Y});
        assert!(decoding_key_from_jwk(&jwk, Algorithm::ES256).is_ok());
    }

    #[test]
    fn test_decoding_key_alg_mismatch() {
        let jwk = json!({"kty": "EC", "crv": "P-256", "alg": "ES384", "x": TEST_EC_X, "y": TEST_EC_Y});
        let result = decoding_key_from_jwk(&jwk, Algorithm::ES256);
        assert!(matches!(result, Err(SciTokenError::KeyFormat { .. })));
    }

    #[test]
    fn test_decoding_key_kty_algorithm_mismatch() {
        let jwk = json!({"kty": "RSA", "n": "abc", "e": "AQAB"});
        let result = decoding_key_from_jwk(&jwk, Algorithm::ES256);
        assert!(matches!(result, Err(SciTokenError::KeyFormat { .. })));
    }

    #[test]
    fn test_decoding_key_unsupported_curve() {
        let jwk = json!({"kty": "EC", "crv": "P-384", "x": "a", "y": "b"});
        let result = decoding_key_from_jwk(&jwk, Algorithm::ES256);
        assert!(
            matches!(&result, Err(SciTokenError::KeyFormat { message }) if message.contains("P-256"))
        );
    }

    #[test]
    fn test_decoding_key_missing_member() {
        let jwk = json!({"kty": "EC", "crv": "P-256", "x": TEST_EC_X});
        let result = decoding_key_from_jwk(&jwk, Algorithm::ES256);
        assert!(
            matches!(&result, Err(SciTokenError::KeyFormat { message }) if message.contains("'y'"))
        );
    }
}
