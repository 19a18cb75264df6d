//! # SciTokens
//!
//! Issuance, validation, and enforcement of scope-based bearer tokens in
//! the SciTokens / WLCG / AT-JWT family.
//!
//! This crate provides:
//! - **Token codec**: typed claim access, multi-profile serialize and
//!   deserialize ([`Token`])
//! - **Profile resolution**: translation between each profile's scope
//!   encoding and canonical [`Authorization`] entries
//! - **Validation**: signature, temporal, and caller-registered claim
//!   checks ([`Validator`])
//! - **Key cache**: per-issuer JWKS caching with refresh-on-demand and
//!   graceful degradation ([`JwksCache`])
//! - **Enforcement**: ACL generation and access testing against an
//!   issuer/audience context ([`Enforcer`])
//!
//! ## Features
//!
//! - Only asymmetric algorithms (RS256, ES256) are supported
//! - Symmetric algorithms (HS256, etc.) and `none` are explicitly rejected
//! - JWKS fetch failures degrade to cached keys; staleness is visible as
//!   an empty key set, never a network error mid-validation
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scitokens::{Acl, Enforcer, HttpJwksFetcher, JwksCache, MemoryJwksStore, Token};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Arc::new(JwksCache::new(
//!     Arc::new(MemoryJwksStore::new()),
//!     Arc::new(HttpJwksFetcher::new()?),
//! ));
//!
//! let token = Token::deserialize("eyJ0eXAiOiJKV1QiLCJhbGciOiJFUzI1NiJ9...", &[])?;
//! let enforcer = Enforcer::new("https://cms.example.org", ["https://storage.example"], cache);
//!
//! if enforcer.test(&token, &Acl::new("read", "/store/user/alice")).await? {
//!     println!("access granted");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Error types.
pub mod error;
/// ACL generation and testing.
pub mod enforcer;
/// JWKS documents and cache entries.
pub mod jwks;
/// Key material and algorithm policy.
pub mod key;
/// Per-issuer JWKS cache, stores, and fetchers.
pub mod key_cache;
/// Profile resolution and scope translation.
pub mod profile;
/// Token claim set and compact serialization.
pub mod token;
/// Token validation.
pub mod validator;

/// Test fixtures (enabled by the `testutil` feature).
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export key types for convenience
pub use enforcer::{Acl, Enforcer};
pub use error::{Result, SciTokenError};
pub use jwks::{Jwks, JwksCacheEntry};
pub use key::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, KeyMaterial, validate_algorithm};
pub use key_cache::{
    FileJwksStore, HttpJwksFetcher, JwksCache, JwksFetcher, JwksStore, MemoryJwksStore,
};
pub use profile::{Authorization, Profile, encode_scope, parse_scope};
pub use token::{DEFAULT_TOKEN_LIFETIME_SECS, Token};
pub use validator::{ClaimCheck, Validator};
