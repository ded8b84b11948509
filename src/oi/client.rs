//! OI source client
//!
//! Walks an ordered list of redundant mirrors. Each host gets `retries + 1`
//! attempts with exponential backoff between them before the next host is
//! tried. Every attempt is bounded by a fixed timeout. A success updates the
//! shared [`OiCache`]; a total failure leaves its value untouched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::{GameError, GameResult};
use crate::oi::cache::OiCache;
use crate::oi::parse::{extract_open_interest, MetricParseError};

const USER_AGENT: &str = "Lighter-OI-Prediction/1.0 (+server)";

/// One failed attempt against one host.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    Transport(String),
    Status(u16),
    Timeout(Duration),
    Parse(MetricParseError),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Status(code) => write!(f, "HTTP {}", code),
            Self::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
            Self::Parse(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FetchError {}

/// Raw GET against a mirror. Returns the body of a 2xx response.
#[async_trait]
pub trait MetricTransport: Send + Sync {
    async fn get(&self, host: &str) -> Result<String, FetchError>;
}

/// Anything that can produce the current ground-truth metric.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn resolve_current_metric(&self, policy: RetryPolicy) -> GameResult<f64>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

#[async_trait]
impl MetricTransport for HttpTransport {
    async fn get(&self, host: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(host)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))
    }
}

pub struct OiSourceClient {
    transport: Arc<dyn MetricTransport>,
    hosts: Vec<String>,
    target_protocol: String,
    attempt_timeout: Duration,
    cache: Arc<OiCache>,
}

impl OiSourceClient {
    pub fn new(
        transport: Arc<dyn MetricTransport>,
        hosts: Vec<String>,
        target_protocol: impl Into<String>,
        attempt_timeout: Duration,
        cache: Arc<OiCache>,
    ) -> Self {
        Self {
            transport,
            hosts,
            target_protocol: target_protocol.into(),
            attempt_timeout,
            cache,
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn cache(&self) -> &Arc<OiCache> {
        &self.cache
    }

    async fn attempt(&self, host: &str) -> Result<f64, FetchError> {
        let body = match timeout(self.attempt_timeout, self.transport.get(host)).await {
            Ok(result) => result?,
            Err(_) => return Err(FetchError::Timeout(self.attempt_timeout)),
        };
        extract_open_interest(&body, &self.target_protocol).map_err(FetchError::Parse)
    }

    /// Warm the cache once; failure is only logged.
    pub async fn warmup(&self, policy: RetryPolicy) {
        match self.resolve_current_metric(policy).await {
            Ok(oi) => info!(oi, "OI cache warmed"),
            Err(e) => warn!(error = %e, "OI warmup failed"),
        }
    }
}

#[async_trait]
impl MetricSource for OiSourceClient {
    async fn resolve_current_metric(&self, policy: RetryPolicy) -> GameResult<f64> {
        let attempts = policy.attempts_per_host();
        let mut last_error: Option<String> = None;

        for host in &self.hosts {
            for attempt in 0..attempts {
                debug!(host = %host, attempt = attempt + 1, of = attempts, "OI fetch");

                match self.attempt(host).await {
                    Ok(oi) => {
                        self.cache.record_success(oi, host, Utc::now());
                        info!(host = %host, oi, "OI fetch succeeded");
                        return Ok(oi);
                    }
                    Err(e) => {
                        let msg = format!("host={} err={}", host, e);
                        warn!(host = %host, attempt = attempt + 1, error = %e, "OI fetch failed");
                        self.cache.record_failure(&msg);
                        last_error = Some(msg);

                        if attempt + 1 < attempts {
                            sleep(policy.backoff(attempt)).await;
                        }
                    }
                }
            }
        }

        Err(GameError::SourceUnavailable {
            last_error: last_error.unwrap_or_else(|| "no OI hosts configured".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    enum Reply {
        Fail,
        Body(String),
        Hang,
    }

    /// Replays scripted replies per host; unscripted attempts fail.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<HashMap<String, Vec<Reply>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn with(self, host: &str, replies: Vec<Reply>) -> Self {
            self.script.lock().insert(host.to_string(), replies);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl MetricTransport for ScriptedTransport {
        async fn get(&self, host: &str) -> Result<String, FetchError> {
            self.calls.lock().push(host.to_string());
            let reply = {
                let mut script = self.script.lock();
                match script.get_mut(host) {
                    Some(replies) if !replies.is_empty() => replies.remove(0),
                    _ => Reply::Fail,
                }
            };
            match reply {
                Reply::Fail => Err(FetchError::Status(503)),
                Reply::Body(b) => Ok(b),
                Reply::Hang => {
                    sleep(Duration::from_secs(3600)).await;
                    Err(FetchError::Transport("unreachable".into()))
                }
            }
        }
    }

    fn body(oi: f64) -> Reply {
        Reply::Body(format!(
            r#"{{"protocols":[{{"name":"Lighter","openInterest":{}}}]}}"#,
            oi
        ))
    }

    fn client(transport: Arc<ScriptedTransport>, hosts: &[&str]) -> OiSourceClient {
        OiSourceClient::new(
            transport,
            hosts.iter().map(|h| h.to_string()).collect(),
            "lighter",
            Duration::from_secs(8),
            Arc::new(OiCache::new()),
        )
    }

    #[tokio::test]
    async fn test_retry_exhaustion_attempts_twice_per_host() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = client(transport.clone(), &["h1", "h2", "h3"]);

        let err = client
            .resolve_current_metric(RetryPolicy::new(1, 0))
            .await
            .unwrap_err();

        assert!(matches!(err, GameError::SourceUnavailable { ref last_error } if last_error.contains("host=h3")));
        assert_eq!(transport.calls(), vec!["h1", "h1", "h2", "h2", "h3", "h3"]);
    }

    #[tokio::test]
    async fn test_falls_over_to_second_host() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .with("h1", vec![Reply::Fail, Reply::Fail])
                .with("h2", vec![body(250_000.0)]),
        );
        let client = client(transport.clone(), &["h1", "h2"]);

        let oi = client
            .resolve_current_metric(RetryPolicy::new(1, 0))
            .await
            .unwrap();

        assert_eq!(oi, 250_000.0);
        assert_eq!(transport.calls(), vec!["h1", "h1", "h2"]);
        let snapshot = client.cache().snapshot();
        assert_eq!(snapshot.last_value, Some(250_000.0));
        assert_eq!(snapshot.last_source_host.as_deref(), Some("h2"));
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_schema_mismatch_counts_as_failed_attempt() {
        let transport = Arc::new(ScriptedTransport::default().with(
            "h1",
            vec![
                Reply::Body(r#"{"protocols":[{"name":"Other","openInterest":1}]}"#.into()),
                body(99.0),
            ],
        ));
        let client = client(transport.clone(), &["h1"]);

        let oi = client
            .resolve_current_metric(RetryPolicy::new(1, 0))
            .await
            .unwrap();
        assert_eq!(oi, 99.0);
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_cached_value() {
        let transport = Arc::new(ScriptedTransport::default().with("h1", vec![body(10.0)]));
        let client = client(transport, &["h1"]);

        client
            .resolve_current_metric(RetryPolicy::new(0, 0))
            .await
            .unwrap();
        let err = client
            .resolve_current_metric(RetryPolicy::new(0, 0))
            .await
            .unwrap_err();

        assert!(matches!(err, GameError::SourceUnavailable { .. }));
        let snapshot = client.cache().snapshot();
        assert_eq!(snapshot.last_value, Some(10.0));
        assert!(snapshot.last_error.unwrap().contains("HTTP 503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_retries_on_same_host() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = client(transport.clone(), &["h1", "h2"]);

        let started = tokio::time::Instant::now();
        let _ = client
            .resolve_current_metric(RetryPolicy::new(2, 600))
            .await;
        let elapsed = started.elapsed();

        // 600 + 1200 per host, no sleep after a host's last attempt.
        assert_eq!(transport.calls().len(), 6);
        assert!(elapsed >= Duration::from_millis(3600), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3700), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempt_is_retried() {
        let transport = Arc::new(
            ScriptedTransport::default().with("h1", vec![Reply::Hang, body(5.0)]),
        );
        let client = client(transport.clone(), &["h1"]);

        let oi = client
            .resolve_current_metric(RetryPolicy::new(1, 100))
            .await
            .unwrap();
        assert_eq!(oi, 5.0);
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_no_hosts() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = client(transport, &[]);
        let err = client
            .resolve_current_metric(RetryPolicy::new(1, 0))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "all OI sources unavailable: no OI hosts configured");
    }
}
