//! ACL generation and testing against an issuer/audience/time context.
//!
//! An [`Enforcer`] binds the expected issuer and accepted audiences at
//! construction and answers two questions about validated tokens: "what
//! does this token grant" ([`generate_acls`](Enforcer::generate_acls))
//! and "does it grant this specific access" ([`test`](Enforcer::test)).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Result, SciTokenError},
    key_cache::JwksCache,
    profile::{Profile, parse_scope, to_compat_action},
    token::Token,
    validator::Validator,
};

/// One access-control entry: an authorized action on a resource prefix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// The authorized action (e.g. `read`, `storage.create`).
    pub authz: String,
    /// The resource path prefix the action is granted on.
    pub resource: String,
}

impl Acl {
    /// Convenience constructor.
    pub fn new(authz: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { authz: authz.into(), resource: resource.into() }
    }
}

/// Enforces token authorizations for one issuer and audience set.
///
/// The audience set is a logical OR: a token matching any configured value
/// is acceptable, and an empty set accepts any audience. Under the default
/// COMPAT profile, generated ACLs are normalized to the SciTokens 1.0
/// action vocabulary regardless of the token's native profile.
pub struct Enforcer {
    issuer: String,
    audiences: Vec<String>,
    time_override: Option<i64>,
    profile: Profile,
    key_cache: Arc<JwksCache>,
}

impl Enforcer {
    /// Creates an enforcer bound to one issuer and a set of accepted
    /// audiences.
    pub fn new<I, S>(issuer: impl Into<String>, audiences: I, key_cache: Arc<JwksCache>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            issuer: issuer.into(),
            audiences: audiences.into_iter().map(Into::into).collect(),
            time_override: None,
            profile: Profile::Compat,
            key_cache,
        }
    }

    /// Overrides "now" for the internal validation, enabling retroactive
    /// queries.
    pub fn set_time(&mut self, unix_timestamp: i64) {
        self.time_override = Some(unix_timestamp);
    }

    /// Restricts enforcement to tokens of exactly one profile, and
    /// switches ACL output to that profile's native vocabulary. `Compat`
    /// (the default) accepts any profile and normalizes output to the
    /// SciTokens 1.0 vocabulary.
    pub fn set_validate_profile(&mut self, profile: Profile) {
        self.profile = profile;
    }

    /// Validates the token and maps its scope claim into ACL entries.
    ///
    /// A token with no scope claim yields an empty list.
    ///
    /// # Errors
    ///
    /// - [`SciTokenError::IssuerNotAllowed`] when the token's issuer is
    ///   not this enforcer's issuer.
    /// - [`SciTokenError::AudienceMismatch`] when the configured audience
    ///   set is non-empty and disjoint from the token's `aud`.
    /// - Any error from the internal [`Validator`] (signature, expiry,
    ///   profile, key resolution).
    /// - [`SciTokenError::MalformedScope`] for an unparseable scope claim.
    #[tracing::instrument(skip(self, token), fields(issuer = %self.issuer))]
    pub async fn generate_acls(&self, token: &Token) -> Result<Vec<Acl>> {
        let issuer = token.get_claim_string("iss")?;
        if issuer != self.issuer {
            return Err(SciTokenError::issuer_not_allowed(issuer));
        }

        let mut validator = Validator::new();
        validator.set_token_profile(self.profile);
        if let Some(time) = self.time_override {
            validator.set_time(time);
        }
        validator.validate(token, &self.key_cache).await?;

        self.check_audience(token)?;

        let Some(scope) = token.get_claim("scope") else {
            return Ok(Vec::new());
        };
        let scope =
            scope.as_str().ok_or_else(|| SciTokenError::claim_type("scope", "a string"))?;

        let token_profile = token.profile().unwrap_or(Profile::SciTokens1);
        let acls = parse_scope(token_profile, scope)?
            .into_iter()
            .map(|auth| {
                let action = match self.profile {
                    Profile::Compat => to_compat_action(&auth.action).to_owned(),
                    _ => auth.action,
                };
                Acl { authz: action, resource: auth.resource_path }
            })
            .collect();
        Ok(acls)
    }

    /// Tests whether the token grants one specific access.
    ///
    /// `Ok(false)` means the token is valid but does not cover the
    /// requested ACL; validation failures are errors, not `false`.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`generate_acls`](Self::generate_acls).
    pub async fn test(&self, token: &Token, requested: &Acl) -> Result<bool> {
        let requested_authz = match self.profile {
            Profile::Compat => to_compat_action(&requested.authz),
            _ => requested.authz.as_str(),
        };

        let granted = self.generate_acls(token).await?;
        Ok(granted.iter().any(|acl| {
            acl.authz == requested_authz && path_grants(&acl.resource, &requested.resource)
        }))
    }

    fn check_audience(&self, token: &Token) -> Result<()> {
        if self.audiences.is_empty() {
            return Ok(());
        }

        let matched = match token.get_claim("aud") {
            // Absent aud is acceptable for profiles that do not require
            // one; profiles that do have already failed validation.
            None => return Ok(()),
            Some(Value::String(aud)) => self.accepts_audience(aud),
            Some(Value::Array(auds)) => auds
                .iter()
                .filter_map(Value::as_str)
                .any(|aud| self.accepts_audience(aud)),
            Some(_) => false,
        };

        if matched {
            Ok(())
        } else {
            Err(SciTokenError::audience_mismatch(format!(
                "token audience does not include any of: {}",
                self.audiences.join(", ")
            )))
        }
    }

    fn accepts_audience(&self, aud: &str) -> bool {
        // "ANY" is the wildcard audience issuers use for untargeted tokens.
        aud == "ANY" || self.audiences.iter().any(|accepted| accepted == aud)
    }
}

/// Whether a granted resource prefix covers a requested path.
///
/// Matching is per path segment: `/foo` grants `/foo` and `/foo/bar` but
/// not `/foobar`. `/` grants everything. Trailing slashes are ignored
/// except on the root itself.
fn path_grants(granted: &str, requested: &str) -> bool {
    let granted = normalize_path(granted);
    let requested = normalize_path(requested);

    if granted == "/" {
        return true;
    }
    requested == granted
        || (requested.len() > granted.len()
            && requested.starts_with(&granted)
            && requested.as_bytes()[granted.len()] == b'/')
}

fn normalize_path(path: &str) -> String {
    let path = if path.starts_with('/') { path.to_owned() } else { format!("/{path}") };
    match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped.to_owned(),
        _ => path,
    }
}
