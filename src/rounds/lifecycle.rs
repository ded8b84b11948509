//! Round lifecycle engine
//!
//! Keeps exactly one round open, and walks every expired round through
//! open → closed → scored once its ground truth can be resolved. A round
//! whose resolution fails stays open past its close time and is retried on the
//! next pass; one bad round never blocks the others.
//!
//! All passes go through `pass_lock`, so the scheduler and the admin close
//! endpoint never run a pass concurrently.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::error::{GameError, GameResult};
use crate::models::{Round, RoundStatus};
use crate::oi::{MetricSource, OiCache};
use crate::rounds::scoring;
use crate::store::RoundStore;

/// The first `close_hour_utc:00:00` UTC at or after `now`.
pub fn next_close_at(now: DateTime<Utc>, close_hour_utc: u32) -> DateTime<Utc> {
    let close_time = NaiveTime::from_hms_opt(close_hour_utc.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(close_time));
    if today < now {
        today + Duration::days(1)
    } else {
        today
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredRound {
    pub round_id: i64,
    pub actual_oi: f64,
    pub predictions: usize,
    /// Resolved from the cache after the live fetch failed.
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredRound {
    pub round_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolutionReport {
    pub scored: Vec<ScoredRound>,
    pub deferred: Vec<DeferredRound>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub created: Option<Round>,
    pub resolution: ResolutionReport,
}

pub struct RoundEngine {
    store: Arc<dyn RoundStore>,
    source: Arc<dyn MetricSource>,
    cache: Arc<OiCache>,
    close_hour_utc: u32,
    resolve_policy: RetryPolicy,
    pass_lock: Mutex<()>,
}

impl RoundEngine {
    pub fn new(
        store: Arc<dyn RoundStore>,
        source: Arc<dyn MetricSource>,
        cache: Arc<OiCache>,
        close_hour_utc: u32,
        resolve_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            source,
            cache,
            close_hour_utc,
            resolve_policy,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn close_hour_utc(&self) -> u32 {
        self.close_hour_utc
    }

    /// Open a new round if none is open. Returns the round it created.
    pub async fn ensure_open_round(&self, now: DateTime<Utc>) -> GameResult<Option<Round>> {
        let _pass = self.pass_lock.lock().await;
        self.ensure_open_round_inner(now).await
    }

    /// Resolve and score every open round whose close time has passed.
    pub async fn resolve_expired_rounds(&self, now: DateTime<Utc>) -> GameResult<ResolutionReport> {
        let _pass = self.pass_lock.lock().await;
        self.resolve_expired_rounds_inner(now).await
    }

    /// One scheduler tick: ensure a round is open, resolve expired rounds, and
    /// open the next round straight away if this pass scored one.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let _pass = self.pass_lock.lock().await;

        let mut created = match self.ensure_open_round_inner(now).await {
            Ok(created) => created,
            Err(e) => {
                warn!(error = %e, "ensure open round failed");
                None
            }
        };

        let resolution = match self.resolve_expired_rounds_inner(now).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "resolution pass failed");
                ResolutionReport::default()
            }
        };

        if created.is_none() && !resolution.scored.is_empty() {
            created = match self.ensure_open_round_inner(now).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "reopening round after scoring failed");
                    None
                }
            };
        }

        TickReport {
            created,
            resolution,
        }
    }

    async fn ensure_open_round_inner(&self, now: DateTime<Utc>) -> GameResult<Option<Round>> {
        if let Some(open) = self.store.find_open_round().await? {
            debug!(round_id = open.id, closes_at = %open.closes_at, "round already open");
            return Ok(None);
        }

        let closes_at = next_close_at(now, self.close_hour_utc);
        match self.store.create_round(now, closes_at).await {
            Ok(round) => {
                info!(round_id = round.id, closes_at = %round.closes_at, "opened new round");
                Ok(Some(round))
            }
            Err(GameError::RoundAlreadyOpen) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn resolve_expired_rounds_inner(
        &self,
        now: DateTime<Utc>,
    ) -> GameResult<ResolutionReport> {
        let mut report = ResolutionReport::default();

        // Rounds resolved on an earlier pass whose scoring never completed.
        match self.store.find_rounds_with_status(RoundStatus::Closed).await {
            Ok(stranded) => {
                for round in stranded {
                    let Some(actual) = round.actual_oi else {
                        report.deferred.push(DeferredRound {
                            round_id: round.id,
                            reason: "closed round has no actual OI".to_string(),
                        });
                        continue;
                    };
                    warn!(round_id = round.id, "re-scoring stranded closed round");
                    match self.score_round(round.id, actual, false).await {
                        Ok(scored) => report.scored.push(scored),
                        Err(e) => report.deferred.push(DeferredRound {
                            round_id: round.id,
                            reason: e.to_string(),
                        }),
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not list closed rounds"),
        }

        let expired = self.store.find_expired_open_rounds(now).await?;
        if expired.len() > 1 {
            warn!(count = expired.len(), "multiple expired rounds pending resolution");
        }

        for round in expired {
            match self.resolve_round(&round).await {
                Ok(scored) => report.scored.push(scored),
                Err(e) => {
                    if e.is_transient() {
                        warn!(
                            round_id = round.id,
                            error = %e,
                            "round resolution deferred to next tick"
                        );
                    } else {
                        error!(
                            round_id = round.id,
                            error = %e,
                            "round resolution failed, retrying next tick"
                        );
                    }
                    report.deferred.push(DeferredRound {
                        round_id: round.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn resolve_round(&self, round: &Round) -> GameResult<ScoredRound> {
        let (actual, from_cache) = match self
            .source
            .resolve_current_metric(self.resolve_policy)
            .await
        {
            Ok(v) => (v, false),
            Err(e) => match self.cache.last_good() {
                // Only a value observed after the close says anything about this round.
                Some((v, at)) if at >= round.closes_at => {
                    warn!(
                        round_id = round.id,
                        error = %e,
                        cached_at = %at,
                        "live OI unavailable, resolving from cache"
                    );
                    (v, true)
                }
                _ => return Err(e),
            },
        };

        self.store.set_round_resolved(round.id, actual).await?;
        info!(round_id = round.id, actual_oi = actual, from_cache, "round closed");

        self.score_round(round.id, actual, from_cache).await
    }

    async fn score_round(
        &self,
        round_id: i64,
        actual: f64,
        from_cache: bool,
    ) -> GameResult<ScoredRound> {
        let predictions = self.store.find_predictions_for_round(round_id).await?;
        let rows = scoring::score(actual, &predictions);
        self.store.insert_scores(round_id, &rows).await?;
        self.store.set_round_scored(round_id).await?;

        info!(
            round_id,
            predictions = predictions.len(),
            winner = rows.first().map(|r| r.participant.as_str()).unwrap_or("-"),
            "round scored"
        );

        Ok(ScoredRound {
            round_id,
            actual_oi: actual,
            predictions: predictions.len(),
            from_cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteRoundStore;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    /// Pops scripted results; `None` means the source is down.
    struct FakeSource {
        script: SyncMutex<Vec<Option<f64>>>,
        calls: SyncMutex<u32>,
    }

    impl FakeSource {
        fn new(script: Vec<Option<f64>>) -> Arc<Self> {
            Arc::new(Self {
                script: SyncMutex::new(script),
                calls: SyncMutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl MetricSource for FakeSource {
        async fn resolve_current_metric(&self, _policy: RetryPolicy) -> GameResult<f64> {
            *self.calls.lock() += 1;
            let next = {
                let mut script = self.script.lock();
                if script.is_empty() {
                    None
                } else {
                    script.remove(0)
                }
            };
            next.ok_or(GameError::SourceUnavailable {
                last_error: "host=fake err=down".into(),
            })
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn engine(
        store: Arc<SqliteRoundStore>,
        source: Arc<FakeSource>,
        cache: Arc<OiCache>,
    ) -> RoundEngine {
        RoundEngine::new(store, source, cache, 18, RetryPolicy::new(1, 0))
    }

    #[test]
    fn test_next_close_same_day_before_hour() {
        assert_eq!(next_close_at(at(2026, 1, 10, 9, 15), 18), at(2026, 1, 10, 18, 0));
    }

    #[test]
    fn test_next_close_rolls_to_tomorrow() {
        assert_eq!(next_close_at(at(2026, 1, 10, 18, 1), 18), at(2026, 1, 11, 18, 0));
        assert_eq!(next_close_at(at(2026, 12, 31, 23, 0), 18), at(2027, 1, 1, 18, 0));
    }

    #[test]
    fn test_next_close_exactly_on_hour() {
        assert_eq!(next_close_at(at(2026, 1, 10, 18, 0), 18), at(2026, 1, 10, 18, 0));
    }

    #[tokio::test]
    async fn test_ensure_open_round_is_idempotent() {
        let store = Arc::new(SqliteRoundStore::in_memory().unwrap());
        let engine = engine(store.clone(), FakeSource::new(vec![]), Arc::new(OiCache::new()));
        let now = at(2026, 2, 1, 10, 0);

        let created = engine.ensure_open_round(now).await.unwrap().unwrap();
        assert_eq!(created.opens_at, now);
        assert_eq!(created.closes_at, at(2026, 2, 1, 18, 0));
        assert!(engine.ensure_open_round(now).await.unwrap().is_none());
        assert_eq!(store.recent_rounds(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_round_is_closed_and_scored() {
        let store = Arc::new(SqliteRoundStore::in_memory().unwrap());
        let engine = engine(store.clone(), FakeSource::new(vec![Some(100.0)]), Arc::new(OiCache::new()));
        let round = engine
            .ensure_open_round(at(2026, 2, 1, 10, 0))
            .await
            .unwrap()
            .unwrap();
        for (who, v) in [("alice", 90.0), ("bob", 80.0), ("carol", 105.0)] {
            store
                .insert_prediction(round.id, who, v, at(2026, 2, 1, 11, 0))
                .await
                .unwrap();
        }

        let report = engine
            .resolve_expired_rounds(at(2026, 2, 1, 18, 5))
            .await
            .unwrap();
        assert_eq!(
            report.scored,
            vec![ScoredRound {
                round_id: round.id,
                actual_oi: 100.0,
                predictions: 3,
                from_cache: false,
            }]
        );

        let stored = store.find_round(round.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RoundStatus::Scored);
        assert_eq!(stored.actual_oi, Some(100.0));

        let scores = store.find_scores_for_round(round.id).await.unwrap();
        let ranking: Vec<(&str, u32)> = scores
            .iter()
            .map(|s| (s.participant.as_str(), s.rank))
            .collect();
        assert_eq!(ranking, vec![("carol", 1), ("alice", 2), ("bob", 3)]);
    }

    #[tokio::test]
    async fn test_unexpired_round_untouched() {
        let store = Arc::new(SqliteRoundStore::in_memory().unwrap());
        let source = FakeSource::new(vec![Some(1.0)]);
        let engine = engine(store.clone(), source.clone(), Arc::new(OiCache::new()));
        engine.ensure_open_round(at(2026, 2, 1, 10, 0)).await.unwrap();

        let report = engine
            .resolve_expired_rounds(at(2026, 2, 1, 17, 59))
            .await
            .unwrap();
        assert_eq!(report, ResolutionReport::default());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_resolution_keeps_round_open_until_next_tick() {
        let store = Arc::new(SqliteRoundStore::in_memory().unwrap());
        let engine = engine(store.clone(), FakeSource::new(vec![None, Some(55.0)]), Arc::new(OiCache::new()));
        let round = engine
            .ensure_open_round(at(2026, 2, 1, 10, 0))
            .await
            .unwrap()
            .unwrap();

        let first = engine.tick(at(2026, 2, 1, 18, 5)).await;
        assert!(first.created.is_none());
        assert!(first.resolution.scored.is_empty());
        assert_eq!(first.resolution.deferred.len(), 1);
        let still_open = store.find_open_round().await.unwrap().unwrap();
        assert_eq!(still_open.id, round.id);

        let second = engine.tick(at(2026, 2, 1, 18, 10)).await;
        assert_eq!(second.resolution.scored.len(), 1);
        let next = second.created.expect("next round opened in the same tick");
        assert_eq!(next.closes_at, at(2026, 2, 2, 18, 0));
        assert_eq!(
            store.find_round(round.id).await.unwrap().unwrap().status,
            RoundStatus::Scored
        );
    }

    #[tokio::test]
    async fn test_cache_fallback_only_for_post_close_values() {
        let store = Arc::new(SqliteRoundStore::in_memory().unwrap());
        let cache = Arc::new(OiCache::new());
        let engine = engine(store.clone(), FakeSource::new(vec![]), cache.clone());
        let round = engine
            .ensure_open_round(at(2026, 2, 1, 10, 0))
            .await
            .unwrap()
            .unwrap();

        // Observed before the close: not admissible.
        cache.record_success(10.0, "h1", at(2026, 2, 1, 17, 0));
        let report = engine
            .resolve_expired_rounds(at(2026, 2, 1, 18, 5))
            .await
            .unwrap();
        assert_eq!(report.deferred.len(), 1);

        // Operator override after the close resolves it.
        cache.set_manual(12.0, at(2026, 2, 1, 18, 7));
        let report = engine
            .resolve_expired_rounds(at(2026, 2, 1, 18, 10))
            .await
            .unwrap();
        assert_eq!(report.scored.len(), 1);
        assert!(report.scored[0].from_cache);
        assert_eq!(
            store.find_round(round.id).await.unwrap().unwrap().actual_oi,
            Some(12.0)
        );
    }

    #[tokio::test]
    async fn test_one_failing_round_does_not_block_others() {
        let store = Arc::new(SqliteRoundStore::in_memory().unwrap());
        let stranded = store
            .create_round(at(2026, 2, 1, 10, 0), at(2026, 2, 1, 18, 0))
            .await
            .unwrap();
        store.set_round_resolved(stranded.id, 1.0).await.unwrap();
        let expired = store
            .create_round(at(2026, 2, 2, 10, 0), at(2026, 2, 2, 18, 0))
            .await
            .unwrap();

        let engine = engine(store.clone(), FakeSource::new(vec![None]), Arc::new(OiCache::new()));
        let report = engine
            .resolve_expired_rounds(at(2026, 2, 3, 0, 0))
            .await
            .unwrap();

        assert_eq!(report.scored.len(), 1);
        assert_eq!(report.scored[0].round_id, stranded.id);
        assert_eq!(report.deferred.len(), 1);
        assert_eq!(report.deferred[0].round_id, expired.id);
        assert!(report.deferred[0].reason.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_stranded_closed_round_is_rescored() {
        let store = Arc::new(SqliteRoundStore::in_memory().unwrap());
        let round = store
            .create_round(at(2026, 2, 1, 10, 0), at(2026, 2, 1, 18, 0))
            .await
            .unwrap();
        store
            .insert_prediction(round.id, "dave", 7.0, at(2026, 2, 1, 12, 0))
            .await
            .unwrap();
        store.set_round_resolved(round.id, 10.0).await.unwrap();

        let source = FakeSource::new(vec![]);
        let engine = engine(store.clone(), source.clone(), Arc::new(OiCache::new()));
        let report = engine
            .resolve_expired_rounds(at(2026, 2, 1, 19, 0))
            .await
            .unwrap();

        assert_eq!(report.scored.len(), 1);
        assert_eq!(source.calls(), 0);
        let scores = store.find_scores_for_round(round.id).await.unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].diff, 3.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_ticks_score_round_once() {
        let store = Arc::new(SqliteRoundStore::in_memory().unwrap());
        let source = FakeSource::new(vec![Some(100.0), Some(100.0)]);
        let engine = Arc::new(engine(store.clone(), source, Arc::new(OiCache::new())));
        let round = engine
            .ensure_open_round(at(2026, 2, 1, 10, 0))
            .await
            .unwrap()
            .unwrap();
        store
            .insert_prediction(round.id, "alice", 90.0, at(2026, 2, 1, 11, 0))
            .await
            .unwrap();

        let later = at(2026, 2, 1, 18, 5);
        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.tick(later).await }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.tick(later).await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let scored = a.resolution.scored.len() + b.resolution.scored.len();
        assert_eq!(scored, 1);
        assert!(a.resolution.deferred.is_empty() && b.resolution.deferred.is_empty());
        assert_eq!(store.find_scores_for_round(round.id).await.unwrap().len(), 1);
        assert_eq!(
            store.find_rounds_with_status(RoundStatus::Open).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_at_most_one_open_round_across_ticks() {
        let store = Arc::new(SqliteRoundStore::in_memory().unwrap());
        let engine = Arc::new(engine(
            store.clone(),
            FakeSource::new(vec![Some(1.0), Some(2.0), Some(3.0)]),
            Arc::new(OiCache::new()),
        ));

        let mut now = at(2026, 3, 1, 0, 0);
        for _ in 0..(4 * 24 * 12) {
            engine.tick(now).await;
            let open = store.find_rounds_with_status(RoundStatus::Open).await.unwrap();
            assert!(open.len() <= 1);
            now += Duration::minutes(5);
        }
        let scored = store.find_rounds_with_status(RoundStatus::Scored).await.unwrap();
        assert_eq!(scored.len(), 3);
    }
}
