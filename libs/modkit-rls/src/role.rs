use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::claims::{ClaimValue, Claims};
use crate::errors::{InvalidRoleError, RlsError};

/// A database role name that is safe to interpolate into statement text.
///
/// Role names cannot be bound as parameters in `SET [LOCAL] ROLE`, so the
/// value is restricted to ASCII letters, digits and underscore (`^\w+$`).
/// Validation happens only here; every `DbRole` in the process is valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DbRole(String);

impl DbRole {
    /// Validate `role` against the identifier grammar.
    ///
    /// # Errors
    /// Returns [`InvalidRoleError`] if `role` is empty or contains anything
    /// other than ASCII alphanumerics and underscore.
    pub fn parse(role: &str) -> Result<Self, InvalidRoleError> {
        if is_identifier(role) {
            Ok(Self(role.to_owned()))
        } else {
            Err(InvalidRoleError {
                role: role.to_owned(),
            })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DbRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DbRole {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DbRole::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Derive the effective role for a request.
///
/// - a non-empty string claim wins and must be a valid identifier
/// - an empty string claim disables the role override (no fallback)
/// - a missing or `null` claim falls back to `default_role`
///
/// # Errors
/// - [`RlsError::InvalidRole`] if the claim value fails the identifier grammar
/// - [`RlsError::NonStringRoleClaim`] if the claim holds a non-string value
pub fn resolve_role(
    claims: &Claims,
    role_claim: Option<&str>,
    default_role: Option<&DbRole>,
) -> Result<Option<DbRole>, RlsError> {
    let claimed = role_claim.and_then(|name| claims.get(name).map(|value| (name, value)));

    match claimed {
        None | Some((_, ClaimValue::Null)) => Ok(default_role.cloned()),
        Some((_, ClaimValue::String(role))) if role.is_empty() => Ok(None),
        Some((_, ClaimValue::String(role))) => Ok(Some(DbRole::parse(role)?)),
        Some((name, _)) => Err(RlsError::NonStringRoleClaim {
            claim: name.to_owned(),
        }),
    }
}
