//! Error taxonomy for the round game.
//!
//! Store, lifecycle and submission code all speak `GameError`; the HTTP layer
//! maps each variant to a status code in `api::routes`.

use std::time::Duration;

use crate::models::RoundStatus;

pub type GameResult<T> = Result<T, GameError>;

#[derive(Debug, Clone)]
pub enum GameError {
    /// Every upstream host exhausted its retry budget.
    SourceUnavailable { last_error: String },
    /// (round, participant) already has a prediction.
    DuplicatePrediction { round_id: i64, participant: String },
    /// No round is currently accepting predictions.
    RoundNotOpen,
    /// A second open round was about to be created.
    RoundAlreadyOpen,
    /// Submitter is inside the cooldown window.
    RateLimited { retry_after: Duration },
    InvalidPrediction(String),
    /// A status update did not find the round in the expected state.
    InvalidTransition { round_id: i64, expected: RoundStatus },
    RoundNotFound(i64),
    Store(String),
}

impl std::fmt::Display for GameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceUnavailable { last_error } => {
                write!(f, "all OI sources unavailable: {}", last_error)
            }
            Self::DuplicatePrediction {
                round_id,
                participant,
            } => write!(
                f,
                "participant {} already predicted in round {}",
                participant, round_id
            ),
            Self::RoundNotOpen => write!(f, "no open round"),
            Self::RoundAlreadyOpen => write!(f, "a round is already open"),
            Self::RateLimited { retry_after } => write!(
                f,
                "too many submissions, retry in {}s",
                retry_after.as_secs().max(1)
            ),
            Self::InvalidPrediction(reason) => write!(f, "invalid prediction: {}", reason),
            Self::InvalidTransition { round_id, expected } => write!(
                f,
                "round {} is not in status {}",
                round_id,
                expected.as_str()
            ),
            Self::RoundNotFound(id) => write!(f, "round {} not found", id),
            Self::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for GameError {}

impl From<rusqlite::Error> for GameError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<std::io::Error> for GameError {
    fn from(e: std::io::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl GameError {
    /// Upstream or store hiccups. Any other error that defers a round is
    /// logged at ERROR by the lifecycle engine.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. } | Self::Store(_))
    }
}
