//! Axum middleware and extractors for the RLS context.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::client::ProcessClient;
use crate::config::ModuleConfig;
use crate::context::SecurityContext;
use crate::errors::RlsError;
use crate::scoped::{RlsDb, SessionScope};

/// String-keyed request attributes shared between middlewares.
///
/// Upstream authentication layers store the validated raw token here under
/// the name configured as `context_token_attribute`.
#[derive(Debug, Clone, Default)]
pub struct RequestAttributes(HashMap<String, String>);

impl RequestAttributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Shared state of the RLS middleware.
#[derive(Clone)]
pub struct RlsState {
    config: Arc<ModuleConfig>,
    client: Arc<ProcessClient>,
}

impl RlsState {
    #[must_use]
    pub fn new(config: ModuleConfig, client: Arc<ProcessClient>) -> Self {
        Self {
            config: Arc::new(config),
            client,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    #[must_use]
    pub fn client(&self) -> &Arc<ProcessClient> {
        &self.client
    }

    /// Build the database handle for one request.
    ///
    /// Validation happens before anything touches the database: an invalid
    /// role fails here with zero statements sent.
    ///
    /// # Errors
    /// - [`RlsError::InvalidRole`] / [`RlsError::NonStringRoleClaim`] for unusable role claims
    /// - [`RlsError::Connect`] if the process client cannot be created
    /// - [`RlsError::UnsupportedBackend`] if scoping is configured on a non-`PostgreSQL` pool
    pub async fn handle_for(&self, token: Option<&str>) -> Result<RlsDb, RlsError> {
        if !self.config.needs_scope() {
            let conn = self.client.get().await?;
            return Ok(RlsDb::passthrough(Arc::clone(conn)));
        }

        let ctx = SecurityContext::from_token(token, &self.config)?;
        let conn = self.client.get().await?;
        RlsDb::scoped(Arc::clone(conn), SessionScope::from_context(&self.config, ctx))
    }
}

/// RLS middleware.
///
/// Reads the raw token from [`RequestAttributes`], derives the request's
/// security context and publishes an [`RlsDb`] in the request extensions.
/// Requests whose role claim fails validation are rejected before any
/// handler or database statement runs.
pub async fn rls_context(State(state): State<RlsState>, mut request: Request, next: Next) -> Response {
    let token = request
        .extensions()
        .get::<RequestAttributes>()
        .and_then(|attrs| attrs.get(&state.config.token_attribute))
        .map(str::to_owned);

    match state.handle_for(token.as_deref()).await {
        Ok(db) => {
            tracing::debug!(
                scoped = db.is_scoped(),
                role = ?db.role().map(crate::DbRole::as_str),
                "RLS context attached"
            );
            request.extensions_mut().insert(db);
            next.run(request).await
        }
        Err(err) => {
            if err.is_invalid_role() {
                tracing::warn!(error = %err, "rejecting request with invalid role claim");
            } else {
                tracing::error!(error = %err, "failed to attach RLS context");
            }
            err.into_response()
        }
    }
}

/// Extractor for the request's [`RlsDb`] - validates that the RLS middleware has run
#[derive(Debug, Clone)]
pub struct Rls(pub RlsDb);

impl<S> FromRequestParts<S> for Rls
where
    S: Send + Sync,
{
    type Rejection = RlsError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RlsDb>()
            .cloned()
            .map(Rls)
            .ok_or(RlsError::MissingMiddleware)
    }
}
