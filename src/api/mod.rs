//! HTTP surface, mounted under `/api`.

pub mod admin;
pub mod routes;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::config::RetryPolicy;
use crate::oi::{MetricSource, OiCache};
use crate::rounds::{PredictionDesk, RoundEngine};
use crate::store::RoundStore;

/// Shared state for every handler.
pub struct AppState {
    pub engine: Arc<RoundEngine>,
    pub store: Arc<dyn RoundStore>,
    pub source: Arc<dyn MetricSource>,
    pub cache: Arc<OiCache>,
    pub desk: Arc<PredictionDesk>,
    pub live_policy: RetryPolicy,
    pub prefetch_policy: RetryPolicy,
    pub admin_token: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/admin/close", post(admin::close_rounds))
        .route("/admin/prefetch-oi", post(admin::prefetch_oi))
        .route("/admin/set-oi", post(admin::set_oi))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin::require_admin_token,
        ));

    let api = Router::new()
        .route("/health", get(routes::health))
        .route("/rounds/current", get(routes::current_round))
        .route("/rounds/recent", get(routes::recent_rounds))
        .route("/rounds/:id/leaderboard", get(routes::round_leaderboard))
        .route(
            "/predictions",
            get(routes::list_predictions).post(routes::submit_prediction),
        )
        .route("/leaderboard", get(routes::leaderboard))
        .route("/oi", get(routes::current_oi))
        .route("/oi/status", get(routes::oi_status))
        .merge(admin);

    Router::new().nest("/api", api).with_state(state)
}
