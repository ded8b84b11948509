//! Deterministic ranking of predictions against the resolved OI.
//!
//! Tie policy: equal diffs keep their input order (stable sort), and ranks
//! stay strictly 1..=N with no shared positions. The store hands predictions
//! over in submission order, so an earlier guess outranks a later guess with
//! the same distance.

use crate::models::{Prediction, ScoreRow};

/// Rank `predictions` by absolute distance from `actual_oi`, closest first.
pub fn score(actual_oi: f64, predictions: &[Prediction]) -> Vec<ScoreRow> {
    let mut diffs: Vec<(&str, f64)> = predictions
        .iter()
        .map(|p| (p.participant.as_str(), (p.value - actual_oi).abs()))
        .collect();

    diffs.sort_by(|a, b| a.1.total_cmp(&b.1));

    diffs
        .into_iter()
        .enumerate()
        .map(|(i, (participant, diff))| ScoreRow {
            participant: participant.to_string(),
            diff,
            rank: (i + 1) as u32,
        })
        .collect()
}
