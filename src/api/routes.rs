//! Public game endpoints.
//!
//! - `GET  /api/health`
//! - `GET  /api/rounds/current` - the open round, 404 if none
//! - `GET  /api/rounds/recent?limit=N` - newest first
//! - `GET  /api/rounds/:id/leaderboard` - scores of one round
//! - `POST /api/predictions` - `{ user, value }`
//! - `GET  /api/predictions` - guesses for the open round
//! - `GET  /api/leaderboard` - latest scored round, else open-round guesses
//! - `GET  /api/oi` - live OI with cache fallback
//! - `GET  /api/oi/status` - cache record

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::AppState;
use crate::error::{GameError, GameResult};
use crate::middleware::submitter_key;
use crate::models::RoundStatus;
use crate::oi::OiSnapshot;

const DEFAULT_RECENT_LIMIT: usize = 10;
const MAX_RECENT_LIMIT: usize = 100;

impl IntoResponse for GameError {
    fn into_response(self) -> Response {
        let status = match &self {
            GameError::DuplicatePrediction { .. } => StatusCode::CONFLICT,
            GameError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GameError::RoundNotOpen | GameError::InvalidPrediction(_) => StatusCode::BAD_REQUEST,
            GameError::RoundNotFound(_) => StatusCode::NOT_FOUND,
            GameError::SourceUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GameError::RoundAlreadyOpen
            | GameError::InvalidTransition { .. }
            | GameError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }

        let mut response = (status, Json(json!({ "message": self.to_string() }))).into_response();
        if let GameError::RateLimited { retry_after } = &self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after.as_secs().max(1)),
            );
        }
        response
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "ts": Utc::now().timestamp_millis() }))
}

pub async fn current_round(State(state): State<Arc<AppState>>) -> GameResult<Response> {
    match state.store.find_open_round().await? {
        Some(round) => Ok(Json(round).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "no open round" })),
        )
            .into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

pub async fn recent_rounds(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecentQuery>,
) -> GameResult<Json<Value>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);
    let rounds = state.store.recent_rounds(limit).await?;
    Ok(Json(json!({ "items": rounds })))
}

pub async fn round_leaderboard(
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<i64>,
) -> GameResult<Json<Value>> {
    let round = state
        .store
        .find_round(round_id)
        .await?
        .ok_or(GameError::RoundNotFound(round_id))?;
    let items = state.store.find_scores_for_round(round_id).await?;
    Ok(Json(json!({
        "roundId": round.id,
        "status": round.status,
        "actual": round.actual_oi,
        "items": items,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SubmitPredictionRequest {
    pub user: String,
    pub value: f64,
}

pub async fn submit_prediction(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<SubmitPredictionRequest>,
) -> GameResult<Json<Value>> {
    let key = submitter_key(&headers, peer.map(|ConnectInfo(addr)| addr));
    let prediction = state
        .desk
        .submit(&key, &body.user, body.value, Utc::now())
        .await?;
    Ok(Json(json!({ "ok": true, "prediction": prediction })))
}

pub async fn list_predictions(State(state): State<Arc<AppState>>) -> GameResult<Json<Value>> {
    let Some(round) = state.store.find_open_round().await? else {
        return Ok(Json(json!({ "roundId": null, "items": [] })));
    };
    let items = state.store.find_predictions_for_round(round.id).await?;
    Ok(Json(json!({ "roundId": round.id, "items": items })))
}

/// Never fails: store errors degrade to an empty board.
pub async fn leaderboard(State(state): State<Arc<AppState>>) -> Json<Value> {
    match build_leaderboard(&state).await {
        Ok(board) => Json(board),
        Err(e) => {
            warn!(error = %e, "leaderboard unavailable, serving empty board");
            Json(json!({ "items": [] }))
        }
    }
}

async fn build_leaderboard(state: &AppState) -> GameResult<Value> {
    if let Some(scored) = state.store.latest_scored_round().await? {
        let items = state.store.find_scores_for_round(scored.id).await?;
        return Ok(json!({
            "roundId": scored.id,
            "status": RoundStatus::Scored,
            "actual": scored.actual_oi,
            "items": items,
        }));
    }

    let Some(open) = state.store.find_open_round().await? else {
        return Ok(json!({ "items": [] }));
    };
    let items = state.store.find_predictions_for_round(open.id).await?;
    Ok(json!({
        "roundId": open.id,
        "status": RoundStatus::Open,
        "items": items,
    }))
}

/// Live value first; on failure the cached one with the error as `note`.
pub async fn current_oi(State(state): State<Arc<AppState>>) -> Response {
    match state.source.resolve_current_metric(state.live_policy).await {
        Ok(oi) => {
            let snap = state.cache.snapshot();
            Json(json!({
                "oi": oi,
                "source": "live",
                "host": snap.last_source_host,
                "updatedAt": snap.updated_at,
            }))
            .into_response()
        }
        Err(e) => {
            let snap = state.cache.snapshot();
            match snap.last_value {
                Some(oi) => {
                    debug!(error = %e, "serving cached OI");
                    Json(json!({
                        "oi": oi,
                        "source": "cache",
                        "host": snap.last_source_host,
                        "updatedAt": snap.updated_at,
                        "note": e.to_string(),
                    }))
                    .into_response()
                }
                None => e.into_response(),
            }
        }
    }
}

pub async fn oi_status(State(state): State<Arc<AppState>>) -> Json<OiSnapshot> {
    Json(state.cache.snapshot())
}
