use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{Next, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::get,
};
use modkit_rls::{RequestAttributes, Rls, RlsState, rls_context};
use sea_orm::{DbBackend, DbErr, Statement};
use serde::Serialize;
use serde_json::json;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

/// Build the gateway router.
///
/// Layer order, outermost first: `SetRequestId` → `PropagateRequestId` →
/// Trace → Timeout → bearer token → RLS context → handler.
/// `/health` is served without the RLS layers.
pub fn router(state: RlsState, timeout: Duration) -> Router {
    Router::new()
        .route("/whoami", get(whoami))
        .layer(from_fn_with_state(state.clone(), rls_context))
        .layer(from_fn_with_state(state, bearer_to_attributes))
        .route("/health", get(health))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").map(str::trim))
}

/// Publish the bearer token as the configured request attribute.
///
/// The gateway sits behind an authenticating proxy; signatures are checked there.
async fn bearer_to_attributes(
    State(state): State<RlsState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(token) = extract_bearer_token(request.headers()).map(str::to_owned) {
        let mut attrs = request
            .extensions_mut()
            .remove::<RequestAttributes>()
            .unwrap_or_default();
        attrs.insert(state.config().token_attribute.clone(), token);
        request.extensions_mut().insert(attrs);
    }
    next.run(request).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct WhoAmI {
    db_user: String,
    role: Option<String>,
    claims: Option<serde_json::Value>,
}

async fn whoami(Rls(db): Rls) -> Result<Json<WhoAmI>, DbFailure> {
    let row = db
        .query_one(Statement::from_string(
            DbBackend::Postgres,
            "SELECT current_user::text AS db_user",
        ))
        .await?;
    let db_user = match row {
        Some(row) => row.try_get::<String>("", "db_user")?,
        None => String::new(),
    };

    Ok(Json(WhoAmI {
        db_user,
        role: db.role().map(ToString::to_string),
        claims: db
            .scope()
            .and_then(|s| serde_json::from_str(s.claims_payload()).ok()),
    }))
}

struct DbFailure(DbErr);

impl From<DbErr> for DbFailure {
    fn from(e: DbErr) -> Self {
        Self(e)
    }
}

impl IntoResponse for DbFailure {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "database operation failed");
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        (
            status,
            Json(json!({
                "error": "database operation failed",
                "status": status.as_u16(),
            })),
        )
            .into_response()
    }
}
