//! Round store
//!
//! `RoundStore` is everything the lifecycle engine, the scoring path and the
//! HTTP layer need from persistence. `SqliteRoundStore` is the production
//! implementation; `persist::SnapshotWriter` flushes it to disk.

pub mod persist;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::GameResult;
use crate::models::{Prediction, Round, RoundStatus, ScoreRow};

pub use persist::{FlushPolicy, SnapshotWriter, WriteBuffer};
pub use sqlite::SqliteRoundStore;

#[async_trait]
pub trait RoundStore: Send + Sync {
    async fn find_open_round(&self) -> GameResult<Option<Round>>;

    /// Fails with `RoundAlreadyOpen` if an open round exists.
    async fn create_round(
        &self,
        opens_at: DateTime<Utc>,
        closes_at: DateTime<Utc>,
    ) -> GameResult<Round>;

    /// Open rounds with `closes_at < now`, oldest first.
    async fn find_expired_open_rounds(&self, now: DateTime<Utc>) -> GameResult<Vec<Round>>;

    /// open → closed, recording the resolved metric.
    async fn set_round_resolved(&self, round_id: i64, actual_oi: f64) -> GameResult<()>;

    /// closed → scored.
    async fn set_round_scored(&self, round_id: i64) -> GameResult<()>;

    /// In submission order.
    async fn find_predictions_for_round(&self, round_id: i64) -> GameResult<Vec<Prediction>>;

    /// Fails with `DuplicatePrediction` if (round, participant) exists and
    /// with `RoundNotOpen` if the round is no longer open.
    async fn insert_prediction(
        &self,
        round_id: i64,
        participant: &str,
        value: f64,
        created_at: DateTime<Utc>,
    ) -> GameResult<Prediction>;

    /// Idempotent per (round, participant).
    async fn insert_scores(&self, round_id: i64, scores: &[ScoreRow]) -> GameResult<()>;

    async fn find_round(&self, round_id: i64) -> GameResult<Option<Round>>;

    async fn find_rounds_with_status(&self, status: RoundStatus) -> GameResult<Vec<Round>>;

    async fn latest_scored_round(&self) -> GameResult<Option<Round>>;

    /// Ordered by rank.
    async fn find_scores_for_round(&self, round_id: i64) -> GameResult<Vec<ScoreRow>>;

    /// Newest first.
    async fn recent_rounds(&self, limit: usize) -> GameResult<Vec<Round>>;
}
