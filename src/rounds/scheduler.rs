//! Periodic driver for the lifecycle engine.
//!
//! Fires once immediately, then every `period`. Ticks run inline in the loop,
//! so a slow tick delays the next one instead of overlapping it; missed ticks
//! are skipped rather than replayed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::rounds::lifecycle::RoundEngine;

pub struct SchedulerHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the tick in flight (if any) completes.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "round scheduler ended abnormally");
        }
    }
}

pub fn spawn_scheduler(engine: Arc<RoundEngine>, period: Duration) -> SchedulerHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(run_scheduler(engine, period, stop_rx));
    SchedulerHandle { stop_tx, task }
}

async fn run_scheduler(
    engine: Arc<RoundEngine>,
    period: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    info!(
        period_secs = period.as_secs(),
        close_hour_utc = engine.close_hour_utc(),
        "⏱️ Round scheduler started"
    );

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = engine.tick(Utc::now()).await;
                if let Some(round) = &report.created {
                    info!(round_id = round.id, closes_at = %round.closes_at, "tick opened round");
                }
                if !report.resolution.scored.is_empty() || !report.resolution.deferred.is_empty() {
                    info!(
                        scored = report.resolution.scored.len(),
                        deferred = report.resolution.deferred.len(),
                        "tick resolution pass"
                    );
                }
            }
            _ = &mut stop_rx => {
                info!("round scheduler stopping");
                return;
            }
        }
    }
}
