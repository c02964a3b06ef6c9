//! RLS module configuration.
//!
//! The raw [`RlsConfig`] is what operators write (YAML / env). It is resolved
//! once at startup into an immutable [`ModuleConfig`]:
//!
//! 1. values of the selected [`Preset`] are applied first,
//! 2. explicitly configured options override preset values field by field,
//! 3. the default role is validated against the identifier grammar.
//!
//! ```yaml
//! rls:
//!   preset: supabase
//!   db_config_name: app.claims   # overrides the preset's request.jwt.claims
//! ```

use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::role::DbRole;

/// Request attribute that carries the raw token when nothing else is configured.
pub const DEFAULT_TOKEN_ATTRIBUTE: &str = "_token";

/// Default configuration section name.
pub const CONFIG_SECTION: &str = "rls";

/// Named bundles of options for common backend conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Supabase / PostgREST conventions.
    Supabase,
}

impl Preset {
    fn options(self) -> RlsConfig {
        match self {
            Preset::Supabase => RlsConfig {
                preset: None,
                default_role: Some("anon".to_owned()),
                context_token_attribute: Some(DEFAULT_TOKEN_ATTRIBUTE.to_owned()),
                jwt_role_attribute: Some("role".to_owned()),
                db_config_name: Some("request.jwt.claims".to_owned()),
                set_role_on_connect: None,
            },
        }
    }
}

/// Raw RLS configuration as written by operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RlsConfig {
    /// Options preset applied underneath the explicit options.
    pub preset: Option<Preset>,

    /// Role used when the token carries no role claim.
    pub default_role: Option<String>,

    /// Request attribute holding the raw (already validated) token.
    pub context_token_attribute: Option<String>,

    /// Token claim holding the database role.
    pub jwt_role_attribute: Option<String>,

    /// Session setting that receives the decoded claims as JSON text.
    pub db_config_name: Option<String>,

    /// Issue `SET ROLE <default_role>` once when the pool is created.
    ///
    /// Not connection-pinned: the per-request `SET LOCAL ROLE` is what takes
    /// effect. Disabled unless set.
    pub set_role_on_connect: Option<bool>,
}

impl RlsConfig {
    /// Load the raw configuration from `section` of a figment.
    ///
    /// A missing section yields the default (empty) configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::Extract`] if the section exists but is invalid.
    pub fn from_figment(figment: &Figment, section: &str) -> Result<Self, ConfigError> {
        if !figment.contains(section) {
            return Ok(Self::default());
        }
        figment
            .extract_inner::<Self>(section)
            .map_err(|e| ConfigError::Extract {
                section: section.to_owned(),
                source: Box::new(e),
            })
    }

    /// Merge preset values under explicit options and validate the result.
    ///
    /// # Errors
    /// - [`ConfigError::InvalidDefaultRole`] if the default role is not an identifier
    /// - [`ConfigError::EmptyOption`] if a name option is set to an empty string
    pub fn resolve(self) -> Result<ModuleConfig, ConfigError> {
        let base = self.preset.map(Preset::options).unwrap_or_default();

        let default_role = self
            .default_role
            .or(base.default_role)
            .map(|r| DbRole::parse(&r))
            .transpose()
            .map_err(ConfigError::InvalidDefaultRole)?;

        let token_attribute = non_empty(
            "context_token_attribute",
            self.context_token_attribute.or(base.context_token_attribute),
        )?
        .unwrap_or_else(|| DEFAULT_TOKEN_ATTRIBUTE.to_owned());

        let role_claim = non_empty(
            "jwt_role_attribute",
            self.jwt_role_attribute.or(base.jwt_role_attribute),
        )?;

        let session_config_key =
            non_empty("db_config_name", self.db_config_name.or(base.db_config_name))?;

        let set_role_on_connect = self
            .set_role_on_connect
            .or(base.set_role_on_connect)
            .unwrap_or(false);

        Ok(ModuleConfig {
            default_role,
            token_attribute,
            role_claim,
            session_config_key,
            set_role_on_connect,
        })
    }
}

fn non_empty(option: &'static str, value: Option<String>) -> Result<Option<String>, ConfigError> {
    match value {
        Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyOption(option)),
        other => Ok(other),
    }
}

/// Resolved, immutable module configuration shared by all requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    pub default_role: Option<DbRole>,
    pub token_attribute: String,
    pub role_claim: Option<String>,
    pub session_config_key: Option<String>,
    pub set_role_on_connect: bool,
}

impl ModuleConfig {
    /// Whether requests need a context-scoped client at all.
    ///
    /// With no session key, no role claim and no default role there is
    /// nothing to inject and the raw client is published as-is.
    #[must_use]
    pub fn needs_scope(&self) -> bool {
        self.session_config_key.is_some()
            || self.role_claim.is_some()
            || self.default_role.is_some()
    }

    /// Role to apply once when the process client is created.
    #[must_use]
    pub fn startup_role(&self) -> Option<&DbRole> {
        if self.set_role_on_connect {
            self.default_role.as_ref()
        } else {
            None
        }
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            default_role: None,
            token_attribute: DEFAULT_TOKEN_ATTRIBUTE.to_owned(),
            role_claim: None,
            session_config_key: None,
            set_role_on_connect: false,
        }
    }
}
