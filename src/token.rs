//! Token claim set, compact serialization, and profile-aware decoding.
//!
//! A [`Token`] owns a mutable claim set plus an optional signing key.
//! [`Token::serialize`] produces the signed compact form under the
//! configured profile; [`Token::deserialize`] decodes header and payload
//! and resolves the token's profile but deliberately does **not** verify
//! the signature — that is [`crate::Validator`]'s job once a verification
//! key has been resolved.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, Header};
use serde_json::{Map, Value, json};

use crate::{
    error::{Result, SciTokenError},
    key::{KeyMaterial, validate_algorithm},
    profile::{Profile, encode_scope, parse_scope},
};

/// Default token lifetime used to derive `exp` when none is set: 600 seconds.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 600;

/// A bearer token: a claim set plus serialization state.
///
/// Freshly created tokens are empty; claims are populated through the
/// typed setters and serialized with [`serialize`](Self::serialize).
/// Decoded tokens additionally carry the raw compact string, the header
/// `kid`/`alg`, and the profile resolved during deserialization.
#[derive(Default)]
pub struct Token {
    claims: Map<String, Value>,
    signing_key: Option<Arc<KeyMaterial>>,
    serialize_profile: Profile,
    deserialize_profile: Profile,
    lifetime: Option<u64>,
    decoded_profile: Option<Profile>,
    kid: Option<String>,
    alg: Option<Algorithm>,
    raw: Option<String>,
}

impl Token {
    /// Creates an empty token with no signing key bound.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty token that will sign with the given key material.
    #[must_use]
    pub fn with_signing_key(key: Arc<KeyMaterial>) -> Self {
        Self { signing_key: Some(key), ..Self::default() }
    }

    /// Sets a claim to an arbitrary JSON value, replacing any prior value.
    pub fn set_claim(&mut self, name: impl Into<String>, value: Value) {
        self.claims.insert(name.into(), value);
    }

    /// Returns a claim's raw JSON value, if present.
    #[must_use]
    pub fn get_claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    /// Sets a claim to a string value.
    pub fn set_claim_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.claims.insert(name.into(), Value::String(value.into()));
    }

    /// Returns a claim as a string.
    ///
    /// # Errors
    ///
    /// [`SciTokenError::ClaimMissing`] if absent,
    /// [`SciTokenError::ClaimType`] if present but not a string.
    pub fn get_claim_string(&self, name: &str) -> Result<&str> {
        match self.claims.get(name) {
            None => Err(SciTokenError::claim_missing(name)),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(SciTokenError::claim_type(name, "a string")),
        }
    }

    /// Sets a claim to an ordered list of strings.
    pub fn set_claim_string_list<I, S>(&mut self, name: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list: Vec<Value> = values.into_iter().map(|v| Value::String(v.into())).collect();
        self.claims.insert(name.into(), Value::Array(list));
    }

    /// Returns a claim as an ordered list of strings.
    ///
    /// # Errors
    ///
    /// [`SciTokenError::ClaimMissing`] if absent,
    /// [`SciTokenError::ClaimType`] if present but not a list of strings.
    pub fn get_claim_string_list(&self, name: &str) -> Result<Vec<&str>> {
        let value = self.claims.get(name).ok_or_else(|| SciTokenError::claim_missing(name))?;
        let items = value
            .as_array()
            .ok_or_else(|| SciTokenError::claim_type(name, "a list of strings"))?;
        items
            .iter()
            .map(|item| {
                item.as_str().ok_or_else(|| SciTokenError::claim_type(name, "a list of strings"))
            })
            .collect()
    }

    /// Returns the `exp` claim as a Unix timestamp.
    ///
    /// # Errors
    ///
    /// [`SciTokenError::ClaimMissing`] if the token carries no `exp`,
    /// [`SciTokenError::ClaimType`] if `exp` is not an integer.
    pub fn get_expiration(&self) -> Result<i64> {
        match self.claims.get("exp") {
            None => Err(SciTokenError::claim_missing("exp")),
            Some(value) => {
                value.as_i64().ok_or_else(|| SciTokenError::claim_type("exp", "an integer"))
            },
        }
    }

    /// Sets the lifetime used to derive `exp = iat + lifetime` at serialize
    /// time when `exp` has not been set explicitly. Defaults to
    /// [`DEFAULT_TOKEN_LIFETIME_SECS`].
    pub fn set_lifetime(&mut self, seconds: u64) {
        self.lifetime = Some(seconds);
    }

    /// Sets the profile used by [`serialize`](Self::serialize).
    /// `Compat` (the default) serializes as SciTokens 1.0.
    pub fn set_serialize_profile(&mut self, profile: Profile) {
        self.serialize_profile = profile;
    }

    /// Restricts [`deserialize_into`](Self::deserialize_into) to a single
    /// accepted profile. `Compat` (the default) accepts any recognized
    /// profile.
    pub fn set_deserialize_profile(&mut self, profile: Profile) {
        self.deserialize_profile = profile;
    }

    /// The profile resolved for this token (set by serialize/deserialize).
    #[must_use]
    pub fn profile(&self) -> Option<Profile> {
        self.decoded_profile
    }

    /// The serialized compact form, if this token has been serialized or
    /// deserialized.
    #[must_use]
    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub(crate) fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    pub(crate) fn algorithm(&self) -> Option<Algorithm> {
        self.alg
    }

    /// Signs the claim set and produces the compact token string.
    ///
    /// `iat` defaults to the current time and `exp` to `iat + lifetime`
    /// when not already set; both derived values are written back into the
    /// claim set. The `scope` claim, if present, is re-encoded into the
    /// target profile's vocabulary, and profile marker claims
    /// (`ver`/`wlcg.ver`) and the `typ` header are stamped per profile.
    ///
    /// # Errors
    ///
    /// - [`SciTokenError::Signing`] if no private key is bound.
    /// - [`SciTokenError::ProfileEncoding`] if the claim set cannot be
    ///   represented in the target profile (missing `iss`, or missing
    ///   `aud`/`sub` where the profile requires them).
    /// - [`SciTokenError::MalformedScope`] if the `scope` claim does not
    ///   parse.
    pub fn serialize(&mut self) -> Result<String> {
        let key = self
            .signing_key
            .as_ref()
            .filter(|k| k.can_sign())
            .ok_or_else(|| SciTokenError::signing("no private key bound to this token"))?;
        let encoding_key = key
            .encoding_key()
            .ok_or_else(|| SciTokenError::signing("no private key bound to this token"))?;

        // COMPAT means "library default" on the serialize side.
        let profile = match self.serialize_profile {
            Profile::Compat => Profile::SciTokens1,
            other => other,
        };

        // Check every precondition and compute derived values before the
        // first claim write, so a failed serialize leaves the claim set
        // untouched.
        if !self.claims.contains_key("iss") {
            return Err(SciTokenError::profile_encoding("token has no 'iss' claim"));
        }
        match profile {
            Profile::SciTokens2 => {
                if !self.claims.contains_key("aud") {
                    return Err(SciTokenError::profile_encoding(
                        "SciTokens 2.0 requires an 'aud' claim",
                    ));
                }
            },
            Profile::Wlcg1 => {
                for required in ["sub", "aud"] {
                    if !self.claims.contains_key(required) {
                        return Err(SciTokenError::profile_encoding(format!(
                            "WLCG profile requires a '{required}' claim"
                        )));
                    }
                }
            },
            Profile::SciTokens1 | Profile::AtJwt | Profile::Compat => {},
        }

        let reencoded_scope = match self.claims.get("scope") {
            None => None,
            Some(scope) => {
                let scope = scope
                    .as_str()
                    .ok_or_else(|| SciTokenError::claim_type("scope", "a string"))?;
                let authorizations = parse_scope(profile, scope)?;
                Some(encode_scope(profile, &authorizations)?)
            },
        };

        let iat = match self.claims.get("iat").and_then(Value::as_i64) {
            Some(iat) => iat,
            None => {
                let now = Utc::now().timestamp();
                self.claims.insert("iat".to_owned(), json!(now));
                now
            },
        };
        if !self.claims.contains_key("exp") {
            let lifetime = self.lifetime.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
            self.claims.insert("exp".to_owned(), json!(iat + lifetime as i64));
        }

        match profile {
            Profile::SciTokens1 => {
                self.claims.insert("ver".to_owned(), json!("scitokens:1.0"));
            },
            Profile::SciTokens2 => {
                self.claims.insert("ver".to_owned(), json!("scitokens:2.0"));
            },
            Profile::Wlcg1 => {
                self.claims.insert("wlcg.ver".to_owned(), json!("1.0"));
            },
            Profile::AtJwt | Profile::Compat => {},
        }

        if let Some(encoded) = reencoded_scope {
            self.claims.insert("scope".to_owned(), Value::String(encoded));
        }

        let mut header = Header::new(key.algorithm());
        header.kid = Some(key.key_id().to_owned());
        header.typ = Some(profile.typ_header().to_owned());

        let raw = jsonwebtoken::encode(&header, &Value::Object(self.claims.clone()), encoding_key)?;

        self.kid = Some(key.key_id().to_owned());
        self.alg = Some(key.algorithm());
        self.decoded_profile = Some(profile);
        self.raw = Some(raw.clone());
        Ok(raw)
    }

    /// Decodes a compact token string into a fresh token, accepting any
    /// recognized profile.
    ///
    /// See [`deserialize_into`](Self::deserialize_into) for semantics and
    /// error taxonomy.
    pub fn deserialize(raw: &str, allowed_issuers: &[&str]) -> Result<Self> {
        let mut token = Self::new();
        token.deserialize_into(raw, allowed_issuers)?;
        Ok(token)
    }

    /// Decodes a compact token string into this token, replacing its claim
    /// set but keeping its configured profiles, lifetime, and signing key.
    ///
    /// Resolves the effective profile in order: the configured
    /// `deserialize_profile` when not COMPAT, then the `typ` header (which
    /// is authoritative, RFC 8725 Section 3.11), then claim markers in
    /// fixed precedence SciTokens 2.0, WLCG 1.0, SciTokens 1.0. The
    /// signature is **not** verified here.
    ///
    /// # Errors
    ///
    /// - [`SciTokenError::Parse`] for a malformed compact encoding.
    /// - [`SciTokenError::UnsupportedAlgorithm`] for a header algorithm
    ///   outside the acceptance policy (including `none` and HS*).
    /// - [`SciTokenError::UnknownProfile`] when the token does not match
    ///   the required profile, or its `typ` header names an unrecognized
    ///   format.
    /// - [`SciTokenError::IssuerNotAllowed`] when `allowed_issuers` is
    ///   non-empty and does not contain the token's `iss`.
    pub fn deserialize_into(&mut self, raw: &str, allowed_issuers: &[&str]) -> Result<()> {
        let mut segments = raw.split('.');
        let (header_b64, payload_b64) = match (segments.next(), segments.next(), segments.next()) {
            (Some(h), Some(p), Some(s)) if !s.is_empty() && segments.next().is_none() => (h, p),
            _ => {
                return Err(SciTokenError::parse(
                    "token is not a three-segment compact JWS",
                ));
            },
        };

        let header = decode_json_segment(header_b64, "header")?;
        let payload = decode_json_segment(payload_b64, "payload")?;

        let alg_name = header
            .get("alg")
            .and_then(Value::as_str)
            .ok_or_else(|| SciTokenError::parse("token header has no 'alg' member"))?;
        let alg = validate_algorithm(alg_name)?;
        let kid = header.get("kid").and_then(Value::as_str).map(str::to_owned);
        let typ = header.get("typ").and_then(Value::as_str);

        let Value::Object(claims) = payload else {
            return Err(SciTokenError::parse("token payload is not a JSON object"));
        };

        let detected = detect_profile(typ, &claims)?;
        if self.deserialize_profile != Profile::Compat && detected != self.deserialize_profile {
            return Err(SciTokenError::unknown_profile(format!(
                "token is {detected}, validator requires {}",
                self.deserialize_profile
            )));
        }

        let issuer = claims
            .get("iss")
            .and_then(Value::as_str)
            .ok_or_else(|| SciTokenError::claim_missing("iss"))?;
        if !allowed_issuers.is_empty() && !allowed_issuers.contains(&issuer) {
            return Err(SciTokenError::issuer_not_allowed(issuer));
        }

        self.claims = claims;
        self.decoded_profile = Some(detected);
        self.kid = kid;
        self.alg = Some(alg);
        self.raw = Some(raw.to_owned());
        Ok(())
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("claims", &self.claims)
            .field("profile", &self.decoded_profile)
            .field("kid", &self.kid)
            .field("can_sign", &self.signing_key.as_ref().is_some_and(|k| k.can_sign()))
            .finish()
    }
}

fn decode_json_segment(segment: &str, what: &str) -> Result<Value> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| SciTokenError::parse(format!("invalid base64 in token {what}: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SciTokenError::parse(format!("invalid JSON in token {what}: {e}")))
}

/// Resolves a token's profile from its `typ` header and claim markers.
///
/// The `typ` header, when present and recognized, is authoritative; an
/// unrecognized `typ` fails rather than falling back to claim heuristics.
/// With no deciding `typ`, markers are tried in fixed precedence:
/// SciTokens 2.0 (`ver: scitokens:2.0`), WLCG (`wlcg.ver`), then
/// SciTokens 1.0 as the fallback grammar.
fn detect_profile(typ: Option<&str>, claims: &Map<String, Value>) -> Result<Profile> {
    match typ {
        Some("at+jwt" | "application/at+jwt") => return Ok(Profile::AtJwt),
        Some("JWT" | "jwt") | None => {},
        Some(other) => {
            return Err(SciTokenError::unknown_profile(format!(
                "unrecognized typ header '{other}'"
            )));
        },
    }

    if claims.get("ver").and_then(Value::as_str) == Some("scitokens:2.0") {
        return Ok(Profile::SciTokens2);
    }
    if claims.contains_key("wlcg.ver") {
        return Ok(Profile::Wlcg1);
    }
    Ok(Profile::SciTokens1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::testutil::{TEST_ISSUER, test_key_material};

    fn signed_token(profile: Profile) -> Token {
        let mut token = Token::with_signing_key(Arc::new(test_key_material("kid-1")));
        token.set_serialize_profile(profile);
        token.set_claim_string("iss", TEST_ISSUER);
        token.set_claim_string("sub", "alice");
        token.set_claim_string("aud", "https://storage.example");
        token
    }

    #[test]
    fn test_claim_string_accessors() {
        let mut token = Token::new();
        token.set_claim_string("iss", TEST_ISSUER);

        assert_eq!(token.get_claim_string("iss").unwrap(), TEST_ISSUER);
        assert!(matches!(
            token.get_claim_string("sub"),
            Err(SciTokenError::ClaimMissing { .. })
        ));

        token.set_claim("count", json!(3));
        assert!(matches!(
            token.get_claim_string("count"),
            Err(SciTokenError::ClaimType { .. })
        ));
    }

    #[test]
    fn test_claim_string_list_accessors() {
        let mut token = Token::new();
        token.set_claim_string_list("aud", ["a", "b"]);
        assert_eq!(token.get_claim_string_list("aud").unwrap(), vec!["a", "b"]);

        token.set_claim("aud", json!(["a", 2]));
        assert!(matches!(
            token.get_claim_string_list("aud"),
            Err(SciTokenError::ClaimType { .. })
        ));
    }

    #[test]
    fn test_get_expiration() {
        let mut token = Token::new();
        assert!(matches!(token.get_expiration(), Err(SciTokenError::ClaimMissing { .. })));
        token.set_claim("exp", json!(1_700_000_000));
        assert_eq!(token.get_expiration().unwrap(), 1_700_000_000);
    }

    #[test]
    fn test_serialize_requires_signing_key() {
        let mut token = Token::new();
        token.set_claim_string("iss", TEST_ISSUER);
        assert!(matches!(token.serialize(), Err(SciTokenError::Signing { .. })));
    }

    #[test]
    fn test_serialize_requires_issuer() {
        let mut token = Token::with_signing_key(Arc::new(test_key_material("kid-1")));
        assert!(matches!(token.serialize(), Err(SciTokenError::ProfileEncoding { .. })));
    }

    #[test]
    fn test_serialize_derives_exp_from_lifetime() {
        let mut token = signed_token(Profile::Compat);
        token.set_lifetime(120);
        token.serialize().unwrap();

        let iat = token.get_claim("iat").and_then(Value::as_i64).unwrap();
        assert_eq!(token.get_expiration().unwrap(), iat + 120);
    }

    #[test]
    fn test_serialize_keeps_explicit_exp() {
        let mut token = signed_token(Profile::Compat);
        token.set_claim("exp", json!(1_999_999_999));
        token.serialize().unwrap();
        assert_eq!(token.get_expiration().unwrap(), 1_999_999_999);
    }

    #[test]
    fn test_round_trip_compat_is_scitokens1() {
        let mut token = signed_token(Profile::Compat);
        token.set_claim_string("scope", "storage.read:/data write");
        let raw = token.serialize().unwrap();

        let decoded = Token::deserialize(&raw, &[]).unwrap();
        assert_eq!(decoded.profile(), Some(Profile::SciTokens1));
        // COMPAT serialization projects to the 1.0 vocabulary.
        assert_eq!(decoded.get_claim_string("scope").unwrap(), "read:/data write");
        assert_eq!(decoded.get_claim_string("iss").unwrap(), TEST_ISSUER);
    }

    #[test]
    fn test_round_trip_scitokens2_marker() {
        let mut token = signed_token(Profile::SciTokens2);
        token.set_claim_string("scope", "read:/data");
        let raw = token.serialize().unwrap();

        let decoded = Token::deserialize(&raw, &[]).unwrap();
        assert_eq!(decoded.profile(), Some(Profile::SciTokens2));
        assert_eq!(decoded.get_claim_string("ver").unwrap(), "scitokens:2.0");
        assert_eq!(decoded.get_claim_string("scope").unwrap(), "storage.read:/data");
    }

    #[test]
    fn test_round_trip_wlcg_marker() {
        let mut token = signed_token(Profile::Wlcg1);
        let raw = token.serialize().unwrap();

        let decoded = Token::deserialize(&raw, &[]).unwrap();
        assert_eq!(decoded.profile(), Some(Profile::Wlcg1));
        assert_eq!(decoded.get_claim_string("wlcg.ver").unwrap(), "1.0");
    }

    #[test]
    fn test_round_trip_at_jwt_typ_header() {
        let mut token = signed_token(Profile::AtJwt);
        let raw = token.serialize().unwrap();

        let decoded = Token::deserialize(&raw, &[]).unwrap();
        assert_eq!(decoded.profile(), Some(Profile::AtJwt));
    }

    #[test]
    fn test_serialize_scitokens2_requires_audience() {
        let mut token = Token::with_signing_key(Arc::new(test_key_material("kid-1")));
        token.set_serialize_profile(Profile::SciTokens2);
        token.set_claim_string("iss", TEST_ISSUER);
        assert!(matches!(token.serialize(), Err(SciTokenError::ProfileEncoding { .. })));

        // The failed serialize must not have stamped any derived claims.
        assert!(token.get_claim("iat").is_none());
        assert!(token.get_claim("exp").is_none());
        assert!(token.get_claim("ver").is_none());
    }

    #[test]
    fn test_failed_serialize_leaves_claims_untouched() {
        let mut token = Token::with_signing_key(Arc::new(test_key_material("kid-1")));
        token.set_serialize_profile(Profile::Wlcg1);
        token.set_claim_string("iss", TEST_ISSUER);
        token.set_claim_string("sub", "alice");
        token.set_claim_string("aud", "any");
        token.set_claim_string("scope", "storage.read:relative-path");

        assert!(matches!(token.serialize(), Err(SciTokenError::MalformedScope { .. })));

        assert!(token.get_claim("iat").is_none());
        assert!(token.get_claim("exp").is_none());
        assert!(token.get_claim("wlcg.ver").is_none());
        assert_eq!(token.get_claim_string("scope").unwrap(), "storage.read:relative-path");
    }

    #[test]
    fn test_serialize_wlcg_requires_subject() {
        let mut token = Token::with_signing_key(Arc::new(test_key_material("kid-1")));
        token.set_serialize_profile(Profile::Wlcg1);
        token.set_claim_string("iss", TEST_ISSUER);
        token.set_claim_string("aud", "any");
        assert!(matches!(token.serialize(), Err(SciTokenError::ProfileEncoding { .. })));
    }

    #[test]
    fn test_deserialize_rejects_malformed_encoding() {
        for raw in ["", "only-one", "two.parts", "a.b.", "a.b.c.d", "!!.??.sig"] {
            let result = Token::deserialize(raw, &[]);
            assert!(
                matches!(&result, Err(SciTokenError::Parse { .. })),
                "expected ParseError for {raw:?}, got {result:?}"
            );
        }
    }

    #[test]
    fn test_deserialize_rejects_forbidden_algorithm() {
        // Hand-built unsigned token with alg: none.
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"iss":"{TEST_ISSUER}"}}"#));
        let raw = format!("{header}.{payload}.x");

        let result = Token::deserialize(&raw, &[]);
        assert!(matches!(result, Err(SciTokenError::UnsupportedAlgorithm { .. })));
    }

    #[test]
    fn test_deserialize_unknown_typ_is_authoritative() {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"ES256","typ":"secevent+jwt"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"iss":"{TEST_ISSUER}"}}"#));
        let raw = format!("{header}.{payload}.x");

        let result = Token::deserialize(&raw, &[]);
        assert!(matches!(result, Err(SciTokenError::UnknownProfile { .. })));
    }

    #[test]
    fn test_deserialize_profile_restriction() {
        let mut token = signed_token(Profile::SciTokens2);
        let raw = token.serialize().unwrap();

        let mut strict = Token::new();
        strict.set_deserialize_profile(Profile::Wlcg1);
        let result = strict.deserialize_into(&raw, &[]);
        assert!(matches!(result, Err(SciTokenError::UnknownProfile { .. })));

        let mut matching = Token::new();
        matching.set_deserialize_profile(Profile::SciTokens2);
        matching.deserialize_into(&raw, &[]).unwrap();
        assert_eq!(matching.profile(), Some(Profile::SciTokens2));
    }

    #[test]
    fn test_deserialize_issuer_allow_list() {
        let mut token = signed_token(Profile::Compat);
        let raw = token.serialize().unwrap();

        assert!(Token::deserialize(&raw, &[TEST_ISSUER]).is_ok());
        assert!(Token::deserialize(&raw, &[]).is_ok(), "empty allow-list accepts any issuer");

        let result = Token::deserialize(&raw, &["https://other.example"]);
        assert!(
            matches!(&result, Err(SciTokenError::IssuerNotAllowed { issuer }) if issuer == TEST_ISSUER)
        );
    }

    #[test]
    fn test_deserialize_does_not_verify_signature() {
        let mut token = signed_token(Profile::Compat);
        let raw = token.serialize().unwrap();

        // Corrupt the signature; decoding must still succeed.
        let mut segments: Vec<&str> = raw.split('.').collect();
        let garbled = format!("{}AAAA", &segments[2][..segments[2].len() - 4]);
        segments[2] = &garbled;
        let corrupted = segments.join(".");

        assert!(Token::deserialize(&corrupted, &[]).is_ok());
    }
}
