//! Prediction intake.
//!
//! Checks run cheapest first: cooldown, then the payload itself, then the
//! open round. The store insert is the final arbiter for duplicates and for a
//! round that closed between the lookup and the write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{GameError, GameResult};
use crate::middleware::SubmissionCooldown;
use crate::models::Prediction;
use crate::store::RoundStore;

pub const MAX_PARTICIPANT_LEN: usize = 128;

pub struct PredictionDesk {
    store: Arc<dyn RoundStore>,
    cooldown: SubmissionCooldown,
}

impl PredictionDesk {
    pub fn new(store: Arc<dyn RoundStore>, cooldown: SubmissionCooldown) -> Self {
        Self { store, cooldown }
    }

    pub fn cooldown(&self) -> &SubmissionCooldown {
        &self.cooldown
    }

    pub async fn submit(
        &self,
        submitter_key: &str,
        participant: &str,
        value: f64,
        now: DateTime<Utc>,
    ) -> GameResult<Prediction> {
        self.cooldown
            .check(submitter_key)
            .map_err(|retry_after| GameError::RateLimited { retry_after })?;

        let participant = validate_participant(participant)?;
        validate_value(value)?;

        let round = self
            .store
            .find_open_round()
            .await?
            .filter(|r| r.accepts_predictions_at(now))
            .ok_or(GameError::RoundNotOpen)?;

        let prediction = self
            .store
            .insert_prediction(round.id, participant, value, now)
            .await?;

        info!(round_id = round.id, participant, value, "prediction accepted");
        Ok(prediction)
    }
}

fn validate_participant(raw: &str) -> GameResult<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GameError::InvalidPrediction("user is required".into()));
    }
    if trimmed.chars().count() > MAX_PARTICIPANT_LEN {
        debug!(len = trimmed.len(), "participant too long");
        return Err(GameError::InvalidPrediction(format!(
            "user must be at most {} characters",
            MAX_PARTICIPANT_LEN
        )));
    }
    Ok(trimmed)
}

fn validate_value(value: f64) -> GameResult<()> {
    if !value.is_finite() {
        return Err(GameError::InvalidPrediction("value must be a finite number".into()));
    }
    if value < 0.0 {
        return Err(GameError::InvalidPrediction("value must not be negative".into()));
    }
    Ok(())
}
