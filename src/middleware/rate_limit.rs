//! Submission cooldown.
//!
//! One accepted attempt per submitter key per window. Keys are client IPs (or
//! the first `X-Forwarded-For` hop), kept in memory only.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

/// Tracks the last attempt per submitter key.
#[derive(Clone)]
pub struct SubmissionCooldown {
    window: Duration,
    last_attempt: Arc<Mutex<HashMap<String, Instant>>>,
}

impl SubmissionCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_attempt: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record an attempt by `key` at `now`. Returns the remaining wait if the
    /// previous attempt is still inside the window; the rejected attempt does
    /// not extend it.
    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        if self.window.is_zero() {
            return Ok(());
        }
        let mut state = self.last_attempt.lock();

        if let Some(last) = state.get(key) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.window {
                return Err(self.window - elapsed);
            }
        }

        state.insert(key.to_string(), now);
        Ok(())
    }

    pub fn check(&self, key: &str) -> Result<(), Duration> {
        self.check_at(key, Instant::now())
    }

    /// Periodic cleanup of stale entries (call from a background task).
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.window;
        self.last_attempt
            .lock()
            .retain(|_, last| now.saturating_duration_since(*last) < window);
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.last_attempt.lock().len()
    }
}

/// First `X-Forwarded-For` hop, else the peer address, else `"unknown"`.
pub fn submitter_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_attempt_inside_window_rejected() {
        let cooldown = SubmissionCooldown::new(Duration::from_secs(30));
        let t0 = Instant::now();

        assert!(cooldown.check_at("10.0.0.1", t0).is_ok());
        let wait = cooldown
            .check_at("10.0.0.1", t0 + Duration::from_secs(10))
            .unwrap_err();
        assert_eq!(wait, Duration::from_secs(20));

        // Other submitters are independent.
        assert!(cooldown.check_at("10.0.0.2", t0 + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_allowed_again_after_window() {
        let cooldown = SubmissionCooldown::new(Duration::from_secs(30));
        let t0 = Instant::now();

        assert!(cooldown.check_at("k", t0).is_ok());
        assert!(cooldown.check_at("k", t0 + Duration::from_secs(5)).is_err());
        assert!(cooldown.check_at("k", t0 + Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_zero_window_disables() {
        let cooldown = SubmissionCooldown::new(Duration::ZERO);
        let t0 = Instant::now();
        assert!(cooldown.check_at("k", t0).is_ok());
        assert!(cooldown.check_at("k", t0).is_ok());
        assert_eq!(cooldown.tracked(), 0);
    }

    #[test]
    fn test_submitter_key_sources() {
        let peer: SocketAddr = "192.168.1.9:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(submitter_key(&headers, Some(peer)), "192.168.1.9");
        assert_eq!(submitter_key(&headers, None), "unknown");

        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(submitter_key(&headers, Some(peer)), "203.0.113.7");
    }
}
