//! Last-known-good OI value, shared by the fetch client, the lifecycle engine
//! and the HTTP handlers. Last writer wins.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Host label recorded for operator overrides.
pub const MANUAL_SOURCE: &str = "manual";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OiSnapshot {
    #[serde(rename = "oi")]
    pub last_value: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "source")]
    pub last_source_host: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct OiCache {
    inner: RwLock<OiSnapshot>,
}

impl OiCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, value: f64, host: &str, at: DateTime<Utc>) {
        let mut s = self.inner.write();
        s.last_value = Some(value);
        s.updated_at = Some(at);
        s.last_source_host = Some(host.to_string());
        s.last_error = None;
    }

    /// Keeps the last good value; only the error text changes.
    pub fn record_failure(&self, error: &str) {
        self.inner.write().last_error = Some(error.to_string());
    }

    pub fn set_manual(&self, value: f64, at: DateTime<Utc>) {
        self.record_success(value, MANUAL_SOURCE, at);
    }

    pub fn snapshot(&self) -> OiSnapshot {
        self.inner.read().clone()
    }

    /// Value and timestamp if anything was ever recorded.
    pub fn last_good(&self) -> Option<(f64, DateTime<Utc>)> {
        let s = self.inner.read();
        match (s.last_value, s.updated_at) {
            (Some(v), Some(at)) => Some((v, at)),
            _ => None,
        }
    }
}
