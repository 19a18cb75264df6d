//! Profile resolution: translating between profile-specific scope claim
//! encodings and canonical [`Authorization`] entries.
//!
//! All recognized profiles share the same surface grammar — a
//! whitespace-separated `scope` claim whose entries are
//! `action[:absolute-path]` — and differ in action vocabulary. SciTokens
//! 1.0 uses bare verbs (`read`, `write`); SciTokens 2.0 and WLCG use the
//! `storage.*` vocabulary. The COMPAT table maps between the two.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SciTokenError};

/// The token profile used for serialization, deserialization, and
/// enforcement.
///
/// `Compat` is not a token format: as a deserializer/validator setting it
/// means "accept any recognized format, preferring the `typ` header when
/// present (RFC 8725 Section 3.11)"; as a serializer setting it means "use
/// the library default" (SciTokens 1.0); as an enforcer setting it means
/// "normalize output to the SciTokens 1.0 action vocabulary".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Profile {
    /// Accept any recognized profile / produce the library default.
    #[default]
    Compat,
    /// SciTokens 1.0: bare action vocabulary (`read`, `write`).
    SciTokens1,
    /// SciTokens 2.0: `storage.*` vocabulary, `ver: scitokens:2.0` marker.
    SciTokens2,
    /// WLCG Common JWT Profile 1.0: `storage.*` vocabulary, `wlcg.ver` marker.
    Wlcg1,
    /// RFC 9068 OAuth access token (`typ: at+jwt`); no vocabulary translation.
    AtJwt,
}

impl Profile {
    /// Canonical profile name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Compat => "compat",
            Profile::SciTokens1 => "scitokens1.0",
            Profile::SciTokens2 => "scitokens2.0",
            Profile::Wlcg1 => "wlcg1.0",
            Profile::AtJwt => "at+jwt",
        }
    }

    /// The `typ` header value stamped on tokens serialized under this profile.
    pub(crate) fn typ_header(self) -> &'static str {
        match self {
            Profile::AtJwt => "at+jwt",
            _ => "JWT",
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Profile {
    type Err = SciTokenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "compat" => Ok(Profile::Compat),
            "scitokens1.0" | "scitokens1" => Ok(Profile::SciTokens1),
            "scitokens2.0" | "scitokens2" => Ok(Profile::SciTokens2),
            "wlcg1.0" | "wlcg" => Ok(Profile::Wlcg1),
            "at+jwt" | "atjwt" => Ok(Profile::AtJwt),
            other => Err(SciTokenError::unknown_profile(format!("unrecognized profile '{other}'"))),
        }
    }
}

/// Canonical authorization unit: one action granted on one resource path.
///
/// This is the common representation every profile's scope encoding is
/// translated to and from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// The granted action (e.g. `read`, `storage.write`).
    pub action: String,
    /// Absolute resource path the action applies to (`/` when the scope
    /// entry carried no path).
    pub resource_path: String,
}

impl Authorization {
    /// Convenience constructor.
    pub fn new(action: impl Into<String>, resource_path: impl Into<String>) -> Self {
        Self { action: action.into(), resource_path: resource_path.into() }
    }
}

/// Maps a `storage.*` action to its SciTokens 1.0 equivalent.
///
/// Unmapped actions pass through unchanged.
#[must_use]
pub fn to_compat_action(action: &str) -> &str {
    match action {
        "storage.read" => "read",
        "storage.write" => "write",
        other => other,
    }
}

/// Maps a SciTokens 1.0 action to its `storage.*` equivalent.
///
/// Unmapped actions pass through unchanged.
#[must_use]
pub fn from_compat_action(action: &str) -> &str {
    match action {
        "read" => "storage.read",
        "write" => "storage.write",
        other => other,
    }
}

/// Parses a profile's `scope` claim into canonical authorizations.
///
/// Entries are whitespace-separated `action[:path]`. A bare action grants
/// at `/`. No vocabulary translation is performed here; see
/// [`to_compat_action`] for the COMPAT projection applied at enforcement.
///
/// # Errors
///
/// Returns [`SciTokenError::MalformedScope`] for an entry whose action is
/// empty or whose path segment is present but not absolute.
pub fn parse_scope(_profile: Profile, scope: &str) -> Result<Vec<Authorization>> {
    scope
        .split_whitespace()
        .map(|entry| match entry.split_once(':') {
            Some((action, path)) => {
                if action.is_empty() || !path.starts_with('/') {
                    return Err(SciTokenError::malformed_scope(entry));
                }
                Ok(Authorization::new(action, path))
            },
            None => Ok(Authorization::new(entry, "/")),
        })
        .collect()
}

/// Encodes canonical authorizations as a profile's `scope` claim.
///
/// SciTokens 1.0 output uses the 1.0 vocabulary; SciTokens 2.0 and WLCG
/// output the `storage.*` vocabulary; AT-JWT passes actions through
/// untranslated. A `/` resource produces a bare action entry.
///
/// # Errors
///
/// Returns [`SciTokenError::ProfileEncoding`] if an authorization carries
/// an empty action or a non-absolute resource path.
pub fn encode_scope(profile: Profile, authorizations: &[Authorization]) -> Result<String> {
    let entries: Vec<String> = authorizations
        .iter()
        .map(|auth| {
            if auth.action.is_empty() {
                return Err(SciTokenError::profile_encoding("authorization with empty action"));
            }
            if !auth.resource_path.starts_with('/') {
                return Err(SciTokenError::profile_encoding(format!(
                    "resource path '{}' is not absolute",
                    auth.resource_path
                )));
            }
            let action = match profile {
                Profile::Compat | Profile::SciTokens1 => to_compat_action(&auth.action),
                Profile::SciTokens2 | Profile::Wlcg1 => from_compat_action(&auth.action),
                Profile::AtJwt => auth.action.as_str(),
            };
            Ok(if auth.resource_path == "/" {
                action.to_owned()
            } else {
                format!("{}:{}", action, auth.resource_path)
            })
        })
        .collect::<Result<_>>()?;

    Ok(entries.join(" "))
}
