//! Token validation: signature, temporal claims, and caller-registered
//! claim checks.
//!
//! A [`Validator`] is configured once (profile, time override, leeway,
//! checks, critical claims) and then drives any number of independent
//! [`validate`](Validator::validate) calls. Validation never mutates the
//! token.

use std::collections::BTreeSet;

use chrono::Utc;
use jsonwebtoken::{Algorithm, Validation};
use serde_json::Value;

use crate::{
    error::{Result, SciTokenError},
    key_cache::JwksCache,
    profile::Profile,
    token::Token,
};

/// A caller-registered predicate run against one claim's value.
///
/// Implemented for free by any `Fn(&Value) -> Result<(), String>` closure;
/// implement the trait directly for stateful checks.
pub trait ClaimCheck: Send + Sync {
    /// Checks the claim value, returning a failure message on rejection.
    fn check(&self, value: &Value) -> std::result::Result<(), String>;
}

impl<F> ClaimCheck for F
where
    F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync,
{
    fn check(&self, value: &Value) -> std::result::Result<(), String> {
        self(value)
    }
}

/// Validates decoded tokens against signature, temporal, and
/// caller-supplied claim requirements.
///
/// The check sequence for [`validate`](Self::validate) is fixed: profile
/// gate, key resolution (via the injected [`JwksCache`]), signature,
/// `exp`/`nbf`/`iat`, profile-required claims, registered checks in
/// registration order (first failure wins), then critical-claim presence.
pub struct Validator {
    profile: Profile,
    time_override: Option<i64>,
    leeway: i64,
    checks: Vec<(String, Box<dyn ClaimCheck>)>,
    critical_claims: BTreeSet<String>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    /// Creates a validator that accepts any recognized profile, uses the
    /// real clock, and has no registered checks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            profile: Profile::Compat,
            time_override: None,
            leeway: 0,
            checks: Vec::new(),
            critical_claims: BTreeSet::new(),
        }
    }

    /// Restricts acceptance to exactly one profile. `Compat` (the default)
    /// accepts any profile the codec could decode.
    pub fn set_token_profile(&mut self, profile: Profile) {
        self.profile = profile;
    }

    /// Overrides "now" for expiry and not-before checks, enabling
    /// retroactive validity queries.
    pub fn set_time(&mut self, unix_timestamp: i64) {
        self.time_override = Some(unix_timestamp);
    }

    /// Sets the clock-skew leeway, in seconds, applied to `exp`, `nbf`,
    /// and `iat` checks. Defaults to 0.
    pub fn set_leeway(&mut self, seconds: i64) {
        self.leeway = seconds;
    }

    /// Registers a check run against the named claim when it is present.
    ///
    /// Checks run in registration order; the first failure aborts
    /// validation with [`SciTokenError::CheckFailed`].
    pub fn add(&mut self, claim: impl Into<String>, check: impl ClaimCheck + 'static) {
        self.checks.push((claim.into(), Box::new(check)));
    }

    /// Marks claims that must be present for validation to succeed, in the
    /// spirit of RFC 7519 `crit` handling. Any registered check for a
    /// critical claim still runs through the normal check sequence.
    pub fn add_critical_claims<I, S>(&mut self, claims: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_claims.extend(claims.into_iter().map(Into::into));
    }

    /// Validates a decoded token.
    ///
    /// # Errors
    ///
    /// In check order:
    /// - [`SciTokenError::ClaimMissing`] — no `iss`, no `exp`, or an
    ///   absent critical claim.
    /// - [`SciTokenError::UnknownProfile`] — token profile does not match
    ///   the configured one.
    /// - [`SciTokenError::Parse`] — the token has no serialized form.
    /// - [`SciTokenError::UnsupportedAlgorithm`] — algorithm outside the
    ///   acceptance policy.
    /// - [`SciTokenError::KeyNotFound`] — no usable verification key,
    ///   including after network degradation.
    /// - [`SciTokenError::SignatureInvalid`] — signature mismatch.
    /// - [`SciTokenError::ExpiredToken`] / [`SciTokenError::NotYetValid`]
    ///   — temporal claim failure under the configured time and leeway.
    /// - [`SciTokenError::CheckFailed`] — first failing registered check.
    #[tracing::instrument(skip(self, token, key_cache), fields(profile = %self.profile))]
    pub async fn validate(&self, token: &Token, key_cache: &JwksCache) -> Result<()> {
        let issuer = token.get_claim_string("iss")?;

        if self.profile != Profile::Compat {
            match token.profile() {
                Some(profile) if profile == self.profile => {},
                Some(profile) => {
                    return Err(SciTokenError::unknown_profile(format!(
                        "token is {profile}, validator requires {}",
                        self.profile
                    )));
                },
                None => {
                    return Err(SciTokenError::unknown_profile(
                        "token has no resolved profile",
                    ));
                },
            }
        }

        let raw = token
            .raw()
            .ok_or_else(|| SciTokenError::parse("token has no serialized form to verify"))?;
        let algorithm = token
            .algorithm()
            .ok_or_else(|| SciTokenError::unsupported_algorithm("token has no algorithm"))?;

        let key = key_cache.resolve_key(issuer, token.kid(), algorithm).await?;
        verify_signature(raw, &key, algorithm)?;

        self.check_temporal_claims(token)?;

        match token.profile() {
            Some(Profile::SciTokens2) => {
                require_claim(token, "aud")?;
            },
            Some(Profile::Wlcg1) => {
                require_claim(token, "sub")?;
                require_claim(token, "aud")?;
            },
            _ => {},
        }

        for (claim, check) in &self.checks {
            if let Some(value) = token.get_claim(claim)
                && let Err(message) = check.check(value)
            {
                tracing::debug!(claim, message, "registered claim check failed");
                return Err(SciTokenError::check_failed(claim, message));
            }
        }

        for claim in &self.critical_claims {
            if token.get_claim(claim).is_none() {
                return Err(SciTokenError::claim_missing(claim));
            }
        }

        Ok(())
    }

    fn check_temporal_claims(&self, token: &Token) -> Result<()> {
        let now = self.time_override.unwrap_or_else(|| Utc::now().timestamp());

        let exp = token.get_expiration()?;
        if exp + self.leeway <= now {
            return Err(SciTokenError::ExpiredToken);
        }

        for claim in ["nbf", "iat"] {
            if let Some(value) = token.get_claim(claim) {
                let timestamp = value
                    .as_i64()
                    .ok_or_else(|| SciTokenError::claim_type(claim, "an integer"))?;
                if timestamp - self.leeway > now {
                    return Err(SciTokenError::NotYetValid);
                }
            }
        }

        Ok(())
    }
}

fn require_claim(token: &Token, claim: &str) -> Result<()> {
    if token.get_claim(claim).is_none() {
        return Err(SciTokenError::claim_missing(claim));
    }
    Ok(())
}

/// Verifies only the signature; temporal and audience claims are checked
/// separately so the configured time override and leeway apply uniformly.
fn verify_signature(raw: &str, key: &jsonwebtoken::DecodingKey, algorithm: Algorithm) -> Result<()> {
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    if let Err(err) = jsonwebtoken::decode::<Value>(raw, key, &validation) {
        // Header and payload already decoded cleanly at deserialize time,
        // so a base64 failure here can only be a corrupted signature
        // segment. Any corruption reports as SignatureInvalid, never as a
        // parse-level kind.
        return Err(match err.kind() {
            jsonwebtoken::errors::ErrorKind::Base64(_)
            | jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                SciTokenError::SignatureInvalid
            },
            _ => err.into(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        key_cache::{JwksCache, MemoryJwksStore},
        testutil::{FailingJwksFetcher, TEST_ISSUER, test_jwks, test_key_material},
    };

    async fn cache_with_test_key(kid: &str) -> JwksCache {
        let cache = JwksCache::new(Arc::new(MemoryJwksStore::new()), Arc::new(FailingJwksFetcher));
        cache.set_jwks(TEST_ISSUER, test_jwks(kid)).await.unwrap();
        cache
    }

    fn signed_token(kid: &str) -> Token {
        let mut token = Token::with_signing_key(Arc::new(test_key_material(kid)));
        token.set_claim_string("iss", TEST_ISSUER);
        token.set_claim_string("sub", "alice");
        token.set_claim_string("aud", "https://storage.example");
        token.serialize().unwrap();
        token
    }

    #[tokio::test]
    async fn test_validate_accepts_good_token() {
        let cache = cache_with_test_key("kid-1").await;
        let token = signed_token("kid-1");
        Validator::new().validate(&token, &cache).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_rejects_expired_token() {
        let cache = cache_with_test_key("kid-1").await;
        let token = signed_token("kid-1");

        let mut validator = Validator::new();
        validator.set_time(Utc::now().timestamp() + 7200);
        let result = validator.validate(&token, &cache).await;
        assert!(matches!(result, Err(SciTokenError::ExpiredToken)));
    }

    #[tokio::test]
    async fn test_validate_rejects_not_yet_valid_token() {
        let cache = cache_with_test_key("kid-1").await;
        let token = signed_token("kid-1");

        // Before the token's iat.
        let mut validator = Validator::new();
        validator.set_time(Utc::now().timestamp() - 3600);
        let result = validator.validate(&token, &cache).await;
        assert!(matches!(result, Err(SciTokenError::NotYetValid)));
    }

    #[tokio::test]
    async fn test_leeway_tolerates_clock_skew() {
        let cache = cache_with_test_key("kid-1").await;
        let token = signed_token("kid-1");

        let mut validator = Validator::new();
        validator.set_time(Utc::now().timestamp() - 30);
        validator.set_leeway(60);
        validator.validate(&token, &cache).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_unknown_kid_is_key_not_found() {
        let cache = cache_with_test_key("other-kid").await;
        let token = signed_token("kid-1");
        let result = Validator::new().validate(&token, &cache).await;
        assert!(matches!(result, Err(SciTokenError::KeyNotFound { .. })));
    }

    #[tokio::test]
    async fn test_validate_profile_restriction() {
        let cache = cache_with_test_key("kid-1").await;
        let token = signed_token("kid-1"); // COMPAT-serialized, i.e. SciTokens 1.0

        let mut validator = Validator::new();
        validator.set_token_profile(Profile::Wlcg1);
        let result = validator.validate(&token, &cache).await;
        assert!(matches!(result, Err(SciTokenError::UnknownProfile { .. })));
    }

    #[tokio::test]
    async fn test_registered_check_runs_and_fails() {
        let cache = cache_with_test_key("kid-1").await;
        let token = signed_token("kid-1");

        let mut validator = Validator::new();
        validator.add("sub", |value: &Value| {
            if value.as_str() == Some("bob") { Ok(()) } else { Err("subject is not bob".into()) }
        });

        let result = validator.validate(&token, &cache).await;
        assert!(
            matches!(&result, Err(SciTokenError::CheckFailed { claim, message })
                if claim == "sub" && message == "subject is not bob")
        );
    }

    #[tokio::test]
    async fn test_registered_check_skips_absent_claim() {
        let cache = cache_with_test_key("kid-1").await;
        let token = signed_token("kid-1");

        let mut validator = Validator::new();
        validator.add("group", |_: &Value| Err("never reached".into()));
        validator.validate(&token, &cache).await.unwrap();
    }

    #[tokio::test]
    async fn test_checks_run_in_registration_order() {
        let cache = cache_with_test_key("kid-1").await;
        let token = signed_token("kid-1");

        let mut validator = Validator::new();
        validator.add("sub", |_: &Value| Err("first".into()));
        validator.add("sub", |_: &Value| Err("second".into()));

        let result = validator.validate(&token, &cache).await;
        assert!(
            matches!(&result, Err(SciTokenError::CheckFailed { message, .. }) if message == "first")
        );
    }

    #[tokio::test]
    async fn test_critical_claim_must_be_present() {
        let cache = cache_with_test_key("kid-1").await;
        let token = signed_token("kid-1");

        let mut validator = Validator::new();
        validator.add_critical_claims(["wlcg.groups"]);

        let result = validator.validate(&token, &cache).await;
        assert!(
            matches!(&result, Err(SciTokenError::ClaimMissing { claim }) if claim == "wlcg.groups")
        );

        // The same token passes once the claim is present.
        let mut token = Token::with_signing_key(Arc::new(test_key_material("kid-1")));
        token.set_claim_string("iss", TEST_ISSUER);
        token.set_claim_string_list("wlcg.groups", ["/cms"]);
        token.serialize().unwrap();
        validator.validate(&token, &cache).await.unwrap();
    }

    #[tokio::test]
    async fn test_unserialized_token_is_rejected() {
        let cache = cache_with_test_key("kid-1").await;
        let mut token = Token::new();
        token.set_claim_string("iss", TEST_ISSUER);
        token.set_claim("exp", json!(Utc::now().timestamp() + 600));

        let result = Validator::new().validate(&token, &cache).await;
        assert!(matches!(result, Err(SciTokenError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_validation_is_repeatable() {
        // A validator returns to its configured state after each call.
        let cache = cache_with_test_key("kid-1").await;
        let token = signed_token("kid-1");
        let validator = Validator::new();
        validator.validate(&token, &cache).await.unwrap();
        validator.validate(&token, &cache).await.unwrap();
    }
}
