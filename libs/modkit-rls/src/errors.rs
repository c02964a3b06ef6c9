use thiserror::Error;

/// Errors raised while extracting claims from a bearer token.
///
/// Decoding never verifies the token. These errors are recoverable: the
/// security context treats a token that fails to decode as carrying no claims.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed token: expected at least two dot-separated segments")]
    MalformedToken,

    #[error("token payload is not valid base64url: {0}")]
    InvalidBase64(String),

    #[error("token payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("token payload is not a JSON object: {0}")]
    InvalidClaims(String),
}

/// A role name that does not match the identifier grammar (`^\w+$`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid database role '{role}': only alphanumeric characters and underscore are allowed")]
pub struct InvalidRoleError {
    pub role: String,
}

/// Errors raised while loading or validating module configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid default role: {0}")]
    InvalidDefaultRole(#[source] InvalidRoleError),

    #[error("option '{0}' must not be empty when set")]
    EmptyOption(&'static str),

    #[error("failed to extract '{section}' configuration: {source}")]
    Extract {
        section: String,
        #[source]
        source: Box<figment::Error>,
    },
}

/// Request-scoped errors of the RLS layer.
#[derive(Debug, Error)]
pub enum RlsError {
    #[error(transparent)]
    InvalidRole(#[from] InvalidRoleError),

    #[error("role claim '{claim}' must be a string")]
    NonStringRoleClaim { claim: String },

    #[error("database backend '{0}' has no transaction-scoped session settings")]
    UnsupportedBackend(&'static str),

    #[error("failed to create database client: {0}")]
    Connect(#[source] sea_orm::DbErr),

    #[error("RLS middleware is not installed for this route")]
    MissingMiddleware,
}

impl RlsError {
    /// Whether this error originates from the request's own token claims.
    #[must_use]
    pub fn is_invalid_role(&self) -> bool {
        matches!(
            self,
            RlsError::InvalidRole(_) | RlsError::NonStringRoleClaim { .. }
        )
    }
}

#[cfg(feature = "axum-ext")]
impl axum::response::IntoResponse for RlsError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::response::Json;
        use serde_json::json;

        let status = match self {
            RlsError::InvalidRole(_) | RlsError::NonStringRoleClaim { .. } => StatusCode::FORBIDDEN,
            RlsError::Connect(_) => StatusCode::SERVICE_UNAVAILABLE,
            RlsError::UnsupportedBackend(_) | RlsError::MissingMiddleware => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
