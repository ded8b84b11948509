//! Operator endpoints under `/api/admin`.
//!
//! Guarded by [`require_admin_token`] when `ADMIN_TOKEN` is configured.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::AppState;

/// Rejects with 401 unless `Authorization: Bearer <ADMIN_TOKEN>` matches.
/// A no-op when no token is configured.
pub async fn require_admin_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim);

    if presented == Some(expected) {
        next.run(req).await
    } else {
        warn!(path = %req.uri().path(), "admin request rejected");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "admin token required" })),
        )
            .into_response()
    }
}

/// Runs one lifecycle pass now and returns what it did.
pub async fn close_rounds(State(state): State<Arc<AppState>>) -> Json<Value> {
    let report = state.engine.tick(Utc::now()).await;
    info!(
        scored = report.resolution.scored.len(),
        deferred = report.resolution.deferred.len(),
        "manual close pass"
    );
    Json(json!({ "ok": true, "report": report }))
}

pub async fn prefetch_oi(State(state): State<Arc<AppState>>) -> Response {
    match state
        .source
        .resolve_current_metric(state.prefetch_policy)
        .await
    {
        Ok(oi) => {
            let host = state.cache.snapshot().last_source_host;
            Json(json!({ "ok": true, "oi": oi, "source": host })).into_response()
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "ok": false, "message": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SetOiRequest {
    pub oi: f64,
}

pub async fn set_oi(State(state): State<Arc<AppState>>, Json(body): Json<SetOiRequest>) -> Response {
    if !body.oi.is_finite() || body.oi < 0.0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "invalid oi" })),
        )
            .into_response();
    }

    let now = Utc::now();
    state.cache.set_manual(body.oi, now);
    info!(oi = body.oi, "OI set manually");
    Json(json!({ "ok": true, "oi": body.oi, "updatedAt": now })).into_response()
}
