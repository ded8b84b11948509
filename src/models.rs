use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Round status. Transitions only go forward: open → closed → scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Open,
    Closed,
    Scored,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Open => "open",
            RoundStatus::Closed => "closed",
            RoundStatus::Scored => "scored",
        }
    }

    /// The only status this one may move to.
    pub fn next(&self) -> Option<Self> {
        match self {
            RoundStatus::Open => Some(RoundStatus::Closed),
            RoundStatus::Closed => Some(RoundStatus::Scored),
            RoundStatus::Scored => None,
        }
    }
}

impl FromStr for RoundStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(RoundStatus::Open),
            "closed" => Ok(RoundStatus::Closed),
            "scored" => Ok(RoundStatus::Scored),
            other => Err(format!("unknown round status '{}'", other)),
        }
    }
}

/// One scoring period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: i64,
    pub opens_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
    pub actual_oi: Option<f64>,
    pub status: RoundStatus,
}

impl Round {
    /// Open and not yet past its close time.
    pub fn accepts_predictions_at(&self, now: DateTime<Utc>) -> bool {
        self.status == RoundStatus::Open && now < self.closes_at
    }

}

/// A participant's guess for one round. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub round_id: i64,
    #[serde(rename = "user")]
    pub participant: String,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

/// Scored distance of one prediction from the resolved OI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    #[serde(rename = "user")]
    pub participant: String,
    pub diff: f64,
    pub rank: u32,
}

pub(crate) fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
