//! Runtime configuration, read from the environment.

use std::env;
use std::time::Duration;

use crate::store::persist::FlushPolicy;

/// Redundant mirrors of the perps overview dataset, tried in order.
pub const DEFAULT_OI_HOSTS: &[&str] = &[
    "https://api.llama.fi/overview/perps",
    "https://cache.llama.fi/overview/perps",
    "https://yields.llama.fi/overview/perps",
];

/// Retry budget for one metric resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts per host after the first one.
    pub retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(retries: u32, base_delay_ms: u64) -> Self {
        Self {
            retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Sleep before the retry that follows attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(Duration::MAX)
    }

    pub fn attempts_per_host(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub close_hour_utc: u32,
    pub tick_interval: Duration,

    pub oi_hosts: Vec<String>,
    pub oi_target_protocol: String,
    pub oi_fetch_timeout: Duration,

    /// Lifecycle engine resolving an expired round.
    pub resolve_policy: RetryPolicy,
    /// `GET /oi` and the boot-time warmup.
    pub live_policy: RetryPolicy,
    /// Admin prefetch.
    pub prefetch_policy: RetryPolicy,

    pub submit_cooldown: Duration,
    pub flush_policy: FlushPolicy,
    pub admin_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            close_hour_utc: 18,
            tick_interval: Duration::from_secs(300),
            oi_hosts: DEFAULT_OI_HOSTS.iter().map(|h| h.to_string()).collect(),
            oi_target_protocol: "lighter".to_string(),
            oi_fetch_timeout: Duration::from_secs(8),
            resolve_policy: RetryPolicy::new(1, 600),
            live_policy: RetryPolicy::new(1, 600),
            prefetch_policy: RetryPolicy::new(3, 800),
            submit_cooldown: Duration::from_secs(30),
            flush_policy: FlushPolicy::default(),
            admin_token: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_policy(retries_key: &str, delay_key: &str, default: RetryPolicy) -> RetryPolicy {
    let retries = env_parse::<u32>(retries_key)
        .filter(|v| *v <= 10)
        .unwrap_or(default.retries);
    let base_delay = env_parse::<u64>(delay_key)
        .map(Duration::from_millis)
        .unwrap_or(default.base_delay);
    RetryPolicy {
        retries,
        base_delay,
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.close_hour_utc = env_parse::<u32>("CLOSE_HOUR_UTC")
            .filter(|h| *h < 24)
            .unwrap_or(cfg.close_hour_utc);

        cfg.tick_interval = env_parse::<u64>("ROUND_TICK_SECS")
            .filter(|v| *v >= 1)
            .map(Duration::from_secs)
            .unwrap_or(cfg.tick_interval);

        if let Ok(raw) = env::var("OI_SOURCE_HOSTS") {
            let hosts = parse_host_list(&raw);
            if !hosts.is_empty() {
                cfg.oi_hosts = hosts;
            }
        }

        cfg.oi_target_protocol = env::var("OI_TARGET_PROTOCOL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(cfg.oi_target_protocol);

        cfg.oi_fetch_timeout = env_parse::<u64>("OI_FETCH_TIMEOUT_MS")
            .filter(|v| *v >= 100)
            .map(Duration::from_millis)
            .unwrap_or(cfg.oi_fetch_timeout);

        cfg.resolve_policy = env_policy(
            "OI_RESOLVE_RETRIES",
            "OI_RESOLVE_DELAY_MS",
            cfg.resolve_policy,
        );
        cfg.live_policy = env_policy("OI_LIVE_RETRIES", "OI_LIVE_DELAY_MS", cfg.live_policy);
        cfg.prefetch_policy = env_policy(
            "OI_PREFETCH_RETRIES",
            "OI_PREFETCH_DELAY_MS",
            cfg.prefetch_policy,
        );

        cfg.submit_cooldown = env_parse::<u64>("SUBMIT_COOLDOWN_SECS")
            .map(Duration::from_secs)
            .unwrap_or(cfg.submit_cooldown);

        cfg.flush_policy.max_delay = env_parse::<u64>("DB_FLUSH_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(cfg.flush_policy.max_delay);
        cfg.flush_policy.max_pending = env_parse::<u64>("DB_FLUSH_MAX_PENDING")
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.flush_policy.max_pending);

        cfg.admin_token = env::var("ADMIN_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        cfg
    }
}

/// Split a comma separated host list, dropping blanks.
pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, 600);
        assert_eq!(policy.backoff(0), Duration::from_millis(600));
        assert_eq!(policy.backoff(1), Duration::from_millis(1200));
        assert_eq!(policy.backoff(2), Duration::from_millis(2400));
        assert_eq!(policy.attempts_per_host(), 4);
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let policy = RetryPolicy::new(1, 1000);
        assert!(policy.backoff(40) >= Duration::from_secs(3600));
        assert_eq!(RetryPolicy::new(1, 0).backoff(5), Duration::ZERO);
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.close_hour_utc, 18);
        assert_eq!(cfg.oi_hosts.len(), 3);
        assert_eq!(cfg.resolve_policy, RetryPolicy::new(1, 600));
        assert_eq!(cfg.prefetch_policy, RetryPolicy::new(3, 800));
        assert!(cfg.admin_token.is_none());
    }

    #[test]
    fn test_parse_host_list() {
        let hosts = parse_host_list(" https://a.example , ,https://b.example,");
        assert_eq!(hosts, vec!["https://a.example", "https://b.example"]);
    }
}
