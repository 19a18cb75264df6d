//! Key material and algorithm acceptance policy.
//!
//! [`KeyMaterial`] binds a key ID and algorithm to PEM-derived signing
//! and verification keys. Algorithm checks implement RFC 8725 guidance:
//! symmetric algorithms and `none` are always rejected.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use zeroize::Zeroizing;

use crate::error::{Result, SciTokenError};

/// JWT algorithms that are never accepted, for security reasons.
///
/// - `none`: no signature verification (trivially bypassable)
/// - `HS256`, `HS384`, `HS512`: symmetric algorithms (shared secret vulnerability)
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Accepted JWT algorithms.
///
/// SciTokens issuers publish RSA and P-256 keys, so RS256 and ES256 are
/// supported end-to-end. Per RFC 8725 Section 3.1, anything this library
/// does not fully implement is rejected up front rather than failing
/// confusingly at the signature verification stage.
pub const ACCEPTED_ALGORITHMS: &[&str] = &["RS256", "ES256"];

/// Validate a JWT algorithm name against the acceptance policy.
///
/// # Errors
///
/// Returns [`SciTokenError::UnsupportedAlgorithm`] if the algorithm is
/// forbidden (`none`, HS*) or not in [`ACCEPTED_ALGORITHMS`].
///
/// # Examples
///
/// ```
/// use scitokens::key::validate_algorithm;
///
/// assert!(validate_algorithm("ES256").is_ok());
/// assert!(validate_algorithm("HS256").is_err());
/// assert!(validate_algorithm("none").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<Algorithm> {
    if FORBIDDEN_ALGORITHMS.contains(&alg) {
        return Err(SciTokenError::unsupported_algorithm(format!(
            "Algorithm '{}' is not allowed for security reasons",
            alg
        )));
    }

    match alg {
        "RS256" => Ok(Algorithm::RS256),
        "ES256" => Ok(Algorithm::ES256),
        other => Err(SciTokenError::unsupported_algorithm(format!(
            "Algorithm '{}' is not in accepted list (only RS256 and ES256 are supported)",
            other
        ))),
    }
}

/// Returns the canonical name of an accepted algorithm.
pub(crate) fn algorithm_name(alg: Algorithm) -> &'static str {
    match alg {
        Algorithm::RS256 => "RS256",
        Algorithm::ES256 => "ES256",
        // Anything else is rejected by validate_algorithm before reaching here.
        _ => "unknown",
    }
}

/// An immutable key ID / algorithm / key pair used to sign or verify tokens.
///
/// Constructed once from PEM-encoded material and never mutated. A
/// `KeyMaterial` with a private half can sign ([`can_sign`](Self::can_sign));
/// one with only a public half can verify locally-held tokens.
pub struct KeyMaterial {
    key_id: String,
    algorithm: Algorithm,
    decoding_key: Option<DecodingKey>,
    encoding_key: Option<EncodingKey>,
}

impl KeyMaterial {
    /// Creates key material from PEM-encoded public and/or private keys.
    ///
    /// At least one of `public_pem` / `private_pem` must be supplied. RSA
    /// keys pair with `RS256`; P-256 EC keys pair with `ES256`.
    ///
    /// # Errors
    ///
    /// Returns [`SciTokenError::UnsupportedAlgorithm`] for an algorithm
    /// outside the acceptance policy, and [`SciTokenError::KeyFormat`] if
    /// the PEM contents cannot be parsed for that algorithm or both key
    /// halves are absent.
    pub fn new(
        key_id: impl Into<String>,
        algorithm: &str,
        public_pem: Option<&str>,
        private_pem: Option<&str>,
    ) -> Result<Self> {
        let algorithm = validate_algorithm(algorithm)?;

        if public_pem.is_none() && private_pem.is_none() {
            return Err(SciTokenError::key_format(
                "at least one of public or private key contents is required",
            ));
        }

        let decoding_key = public_pem
            .map(|pem| match algorithm {
                Algorithm::RS256 => DecodingKey::from_rsa_pem(pem.as_bytes()),
                _ => DecodingKey::from_ec_pem(pem.as_bytes()),
            })
            .transpose()
            .map_err(|e| SciTokenError::key_format(format!("public key: {}", e)))?;

        let encoding_key = private_pem
            .map(|pem| {
                // Copy into a zeroizing buffer so the transient PEM bytes are
                // scrubbed once the EncodingKey has been constructed.
                let pem: Zeroizing<Vec<u8>> = Zeroizing::new(pem.as_bytes().to_vec());
                match algorithm {
                    Algorithm::RS256 => EncodingKey::from_rsa_pem(&pem),
                    _ => EncodingKey::from_ec_pem(&pem),
                }
            })
            .transpose()
            .map_err(|e| SciTokenError::key_format(format!("private key: {}", e)))?;

        Ok(Self { key_id: key_id.into(), algorithm, decoding_key, encoding_key })
    }

    /// The key identifier, emitted as the `kid` header on signed tokens.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The signing/verification algorithm this key pairs with.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Whether a private key is bound, i.e. this material can sign tokens.
    #[must_use]
    pub fn can_sign(&self) -> bool {
        self.encoding_key.is_some()
    }

    /// The verification key, if a public half was supplied.
    #[must_use]
    pub fn decoding_key(&self) -> Option<&DecodingKey> {
        self.decoding_key.as_ref()
    }

    pub(crate) fn encoding_key(&self) -> Option<&EncodingKey> {
        self.encoding_key.as_ref()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key contents are deliberately not printed.
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("can_sign", &self.can_sign())
            .finish()
    }
}
