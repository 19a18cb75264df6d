//! Error types for token issuance, validation, and enforcement.
//!
//! Every fallible operation in this crate reports failure through
//! [`SciTokenError`]; no operation leaves its receiver in a partially
//! mutated state on failure.

use thiserror::Error;

/// Errors raised by token, validator, enforcer, and key cache operations.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]` — new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SciTokenError {
    /// Key material could not be parsed (bad PEM/JWK, unknown algorithm name).
    #[error("Invalid key material: {message}")]
    KeyFormat {
        /// Description of what was wrong with the key material.
        message: String,
    },

    /// A claim exists but has the wrong JSON type for the requested access.
    #[error("Claim '{claim}' is not {expected}")]
    ClaimType {
        /// The claim that was accessed.
        claim: String,
        /// The type the caller asked for (e.g. "a string").
        expected: String,
    },

    /// A required claim is absent.
    #[error("Missing claim: {claim}")]
    ClaimMissing {
        /// The claim that was not found.
        claim: String,
    },

    /// Malformed compact token encoding (structure, base64, or JSON).
    #[error("Invalid token format: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },

    /// The token matches no recognized profile, or not the requested one.
    #[error("Unknown token profile: {message}")]
    UnknownProfile {
        /// Description of why profile resolution failed.
        message: String,
    },

    /// The token's issuer is not in the caller's allow-list, or does not
    /// match the enforcer's configured issuer.
    #[error("Issuer not allowed: {issuer}")]
    IssuerNotAllowed {
        /// The rejected issuer.
        issuer: String,
    },

    /// A scope entry cannot be split into action and resource under the
    /// profile's grammar.
    #[error("Malformed scope entry: {entry}")]
    MalformedScope {
        /// The offending scope entry.
        entry: String,
    },

    /// Token serialization failed (no private key bound, or the signing
    /// primitive rejected the operation).
    #[error("Signing error: {message}")]
    Signing {
        /// Description of the signing failure.
        message: String,
    },

    /// The claim set cannot be represented in the target profile.
    #[error("Profile encoding error: {message}")]
    ProfileEncoding {
        /// Description of what could not be encoded.
        message: String,
    },

    /// Signature verification failed.
    #[error("Invalid signature")]
    SignatureInvalid,

    /// The token's `exp` claim is in the past.
    #[error("Token expired")]
    ExpiredToken,

    /// The token's `nbf` (or `iat`) claim is in the future.
    #[error("Token not yet valid")]
    NotYetValid,

    /// No usable verification key could be resolved for the token.
    #[error("Verification key not found: {kid}")]
    KeyNotFound {
        /// The key ID that could not be resolved (`<any>` when the token
        /// carried no `kid` header).
        kid: String,
    },

    /// The token's audience does not intersect the enforcer's audience set.
    #[error("Audience mismatch: {message}")]
    AudienceMismatch {
        /// Description of the expected/actual audiences.
        message: String,
    },

    /// JWKS fetch or cache persistence failure. Always non-fatal for key
    /// resolution — the cache degrades to stale/empty state.
    #[error("Key cache I/O error: {message}")]
    CacheIo {
        /// Description of the I/O failure.
        message: String,
    },

    /// Algorithm not in the accepted list (see [`crate::key::ACCEPTED_ALGORITHMS`]).
    #[error("Unsupported algorithm: {message}")]
    UnsupportedAlgorithm {
        /// Description of the rejected algorithm.
        message: String,
    },

    /// A caller-registered claim check rejected the claim's value.
    #[error("Claim '{claim}' failed validation: {message}")]
    CheckFailed {
        /// The claim the check was registered for.
        claim: String,
        /// The message produced by the failing check.
        message: String,
    },
}

impl SciTokenError {
    /// Creates a [`SciTokenError::KeyFormat`] error.
    pub fn key_format(message: impl Into<String>) -> Self {
        Self::KeyFormat { message: message.into() }
    }

    /// Creates a [`SciTokenError::ClaimType`] error.
    pub fn claim_type(claim: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::ClaimType { claim: claim.into(), expected: expected.into() }
    }

    /// Creates a [`SciTokenError::ClaimMissing`] error.
    pub fn claim_missing(claim: impl Into<String>) -> Self {
        Self::ClaimMissing { claim: claim.into() }
    }

    /// Creates a [`SciTokenError::Parse`] error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }

    /// Creates a [`SciTokenError::UnknownProfile`] error.
    pub fn unknown_profile(message: impl Into<String>) -> Self {
        Self::UnknownProfile { message: message.into() }
    }

    /// Creates a [`SciTokenError::IssuerNotAllowed`] error.
    pub fn issuer_not_allowed(issuer: impl Into<String>) -> Self {
        Self::IssuerNotAllowed { issuer: issuer.into() }
    }

    /// Creates a [`SciTokenError::MalformedScope`] error.
    pub fn malformed_scope(entry: impl Into<String>) -> Self {
        Self::MalformedScope { entry: entry.into() }
    }

    /// Creates a [`SciTokenError::Signing`] error.
    pub fn signing(message: impl Into<String>) -> Self {
        Self::Signing { message: message.into() }
    }

    /// Creates a [`SciTokenError::ProfileEncoding`] error.
    pub fn profile_encoding(message: impl Into<String>) -> Self {
        Self::ProfileEncoding { message: message.into() }
    }

    /// Creates a [`SciTokenError::KeyNotFound`] error.
    pub fn key_not_found(kid: impl Into<String>) -> Self {
        Self::KeyNotFound { kid: kid.into() }
    }

    /// Creates a [`SciTokenError::AudienceMismatch`] error.
    pub fn audience_mismatch(message: impl Into<String>) -> Self {
        Self::AudienceMismatch { message: message.into() }
    }

    /// Creates a [`SciTokenError::CacheIo`] error.
    pub fn cache_io(message: impl Into<String>) -> Self {
        Self::CacheIo { message: message.into() }
    }

    /// Creates a [`SciTokenError::UnsupportedAlgorithm`] error.
    pub fn unsupported_algorithm(message: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm { message: message.into() }
    }

    /// Creates a [`SciTokenError::CheckFailed`] error.
    pub fn check_failed(claim: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CheckFailed { claim: claim.into(), message: message.into() }
    }
}

impl From<jsonwebtoken::errors::Error> for SciTokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature => SciTokenError::SignatureInvalid,
            ErrorKind::ExpiredSignature => SciTokenError::ExpiredToken,
            ErrorKind::ImmatureSignature => SciTokenError::NotYetValid,
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                SciTokenError::unsupported_algorithm("Algorithm not supported")
            },
            ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat => {
                SciTokenError::key_format(format!("JOSE key error: {}", err))
            },
            ErrorKind::RsaFailedSigning => SciTokenError::signing("RSA signing failed"),
            _ => SciTokenError::parse(format!("JWT error: {}", err)),
        }
    }
}

/// Result type alias for token operations.
pub type Result<T> = std::result::Result<T, SciTokenError>;
