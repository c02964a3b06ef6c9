use crate::claims::Claims;
use crate::config::ModuleConfig;
use crate::errors::RlsError;
use crate::role::{DbRole, resolve_role};
use crate::token::decode_payload;

/// Payload published to the session setting when no claims are available.
pub const EMPTY_CLAIMS: &str = "{}";

/// Per-request security context derived from the request's token.
///
/// Built once per request and never shared across requests.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    raw_token: Option<String>,
    claims: Claims,
    claims_payload: String,
    role: Option<DbRole>,
}

impl SecurityContext {
    /// Build the context from an optional raw token.
    ///
    /// A token that fails to decode is treated as carrying no claims: the
    /// request proceeds with the default role and an empty claims payload.
    ///
    /// # Errors
    /// Returns [`RlsError::InvalidRole`] or [`RlsError::NonStringRoleClaim`]
    /// if the role claim is unusable.
    pub fn from_token(token: Option<&str>, config: &ModuleConfig) -> Result<Self, RlsError> {
        let decoded = decode_payload(token).and_then(|payload| match payload {
            Some(text) => Claims::parse(&text).map(|claims| Some((text, claims))),
            None => Ok(None),
        });

        let (claims_payload, claims) = match decoded {
            Ok(Some((text, claims))) => (text, claims),
            Ok(None) => (EMPTY_CLAIMS.to_owned(), Claims::default()),
            Err(err) => {
                tracing::debug!(error = %err, "ignoring undecodable token claims");
                (EMPTY_CLAIMS.to_owned(), Claims::default())
            }
        };

        let role = resolve_role(
            &claims,
            config.role_claim.as_deref(),
            config.default_role.as_ref(),
        )?;

        Ok(Self {
            raw_token: token.map(str::to_owned),
            claims,
            claims_payload,
            role,
        })
    }

    #[must_use]
    pub fn raw_token(&self) -> Option<&str> {
        self.raw_token.as_deref()
    }

    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Claims as JSON text, exactly as decoded from the token.
    #[must_use]
    pub fn claims_payload(&self) -> &str {
        &self.claims_payload
    }

    #[must_use]
    pub fn role(&self) -> Option<&DbRole> {
        self.role.as_ref()
    }

    /// Split into the parts the scoped client needs.
    #[must_use]
    pub fn into_session_parts(self) -> (String, Option<DbRole>) {
        (self.claims_payload, self.role)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::claims::ClaimValue;
    use crate::config::{Preset, RlsConfig};
    use crate::token::encode_unsigned;

    fn supabase() -> ModuleConfig {
        RlsConfig {
            preset: Some(Preset::Supabase),
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    #[test]
    fn keeps_payload_text_verbatim() {
        let payload = r#"{"role": "authenticated", "sub": "u1"}"#;
        let token = encode_unsigned(payload);

        let ctx = SecurityContext::from_token(Some(&token), &supabase()).unwrap();

        assert_eq!(ctx.claims_payload(), payload);
        assert_eq!(ctx.role().map(DbRole::as_str), Some("authenticated"));
        assert_eq!(
            ctx.claims().get("sub"),
            Some(&ClaimValue::String("u1".to_owned()))
        );
        assert_eq!(ctx.raw_token(), Some(token.as_str()));
    }

    #[test]
    fn absent_token_uses_default_role() {
        let ctx = SecurityContext::from_token(None, &supabase()).unwrap();
        assert_eq!(ctx.claims_payload(), EMPTY_CLAIMS);
        assert!(ctx.claims().is_empty());
        assert_eq!(ctx.role().map(DbRole::as_str), Some("anon"));
    }

    #[test]
    fn malformed_token_is_treated_as_absent() {
        for token in ["garbage", "a.%%%.c", "e30.WzFd.x"] {
            let ctx = SecurityContext::from_token(Some(token), &supabase()).unwrap();
            assert_eq!(ctx.claims_payload(), EMPTY_CLAIMS, "token {token}");
            assert_eq!(ctx.role().map(DbRole::as_str), Some("anon"));
        }
    }

    #[test]
    fn invalid_role_claim_fails() {
        let token = encode_unsigned(r#"{"role":"bad role!"}"#);
        let err = SecurityContext::from_token(Some(&token), &supabase()).unwrap_err();
        assert!(err.is_invalid_role());
    }
}
