//! Buffered snapshot persistence.
//!
//! Store mutations only bump a counter on [`WriteBuffer`]. A
//! [`SnapshotWriter`] task copies the in-memory database to disk once
//! `max_delay` has elapsed since the first unflushed write, or as soon as
//! `max_pending` writes have piled up. Snapshots are written to a sibling temp
//! file and renamed into place, so a crash never leaves a torn file.
//!
//! `SnapshotWriter::shutdown` flushes whatever is pending and stops the task;
//! dropping the writer without calling it still makes a last best-effort
//! flush.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, DatabaseName};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{GameError, GameResult};
use crate::store::sqlite::SqliteRoundStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub max_delay: Duration,
    pub max_pending: u64,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_millis(100),
            max_pending: 64,
        }
    }
}

/// Count of writes not yet in a snapshot.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    pending: AtomicU64,
    wake: Notify,
}

impl WriteBuffer {
    pub fn record_write(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.wake.notify_one();
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    fn take(&self) -> u64 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    fn restore(&self, n: u64) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }
}

pub struct SnapshotWriter {
    conn: Arc<Mutex<Connection>>,
    buffer: Arc<WriteBuffer>,
    path: PathBuf,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    /// Start flushing `store` to `path` under `policy`.
    pub fn spawn(store: &SqliteRoundStore, path: impl Into<PathBuf>, policy: FlushPolicy) -> Self {
        let conn = store.connection();
        let buffer = store.write_buffer();
        let path = path.into();
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(run_flush_loop(
            conn.clone(),
            buffer.clone(),
            path.clone(),
            policy,
            stop_rx,
        ));
        info!(
            path = %path.display(),
            max_delay_ms = policy.max_delay.as_millis() as u64,
            max_pending = policy.max_pending,
            "snapshot writer started"
        );

        Self {
            conn,
            buffer,
            path,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Flush now, regardless of policy. Returns how many writes were flushed.
    pub async fn flush(&self) -> GameResult<u64> {
        flush_snapshot(&self.conn, &self.buffer, &self.path).await
    }

    /// Stop the background task and flush anything still pending.
    pub async fn shutdown(mut self) -> GameResult<u64> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "snapshot task ended abnormally");
            }
        }
        let flushed = flush_snapshot(&self.conn, &self.buffer, &self.path).await?;
        info!(flushed, path = %self.path.display(), "snapshot writer stopped");
        Ok(flushed)
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();

        if self.buffer.pending() == 0 {
            return;
        }
        match self.conn.try_lock() {
            Ok(conn) => {
                let n = self.buffer.take();
                if let Err(e) = write_snapshot(&conn, &self.path) {
                    error!(error = %e, lost_writes = n, "final snapshot on drop failed");
                }
            }
            Err(_) => warn!(
                pending = self.buffer.pending(),
                "store busy on drop, final snapshot skipped"
            ),
        }
    }
}

async fn run_flush_loop(
    conn: Arc<Mutex<Connection>>,
    buffer: Arc<WriteBuffer>,
    path: PathBuf,
    policy: FlushPolicy,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = buffer.wake.notified() => {}
            _ = &mut stop_rx => return,
        }
        if buffer.pending() == 0 {
            continue;
        }

        let deadline = Instant::now() + policy.max_delay;
        while buffer.pending() < policy.max_pending {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                _ = buffer.wake.notified() => {}
                _ = &mut stop_rx => return,
            }
        }

        if let Err(e) = flush_snapshot(&conn, &buffer, &path).await {
            error!(error = %e, path = %path.display(), "snapshot flush failed");
        }
    }
}

async fn flush_snapshot(
    conn: &Arc<Mutex<Connection>>,
    buffer: &WriteBuffer,
    path: &Path,
) -> GameResult<u64> {
    let conn = conn.clone().lock_owned().await;
    let n = buffer.take();
    if n == 0 {
        return Ok(0);
    }

    // Backup and rename are blocking file I/O; the store stays locked until
    // the snapshot is in place.
    let target = path.to_path_buf();
    let written = tokio::task::spawn_blocking(move || write_snapshot(&conn, &target))
        .await
        .map_err(|e| GameError::Store(format!("snapshot task failed: {}", e)))
        .and_then(|r| r);
    if let Err(e) = written {
        buffer.restore(n);
        return Err(e);
    }
    debug!(writes = n, path = %path.display(), "snapshot flushed");
    Ok(n)
}

fn write_snapshot(conn: &Connection, path: &Path) -> GameResult<()> {
    let tmp = path.with_extension("tmp");
    if tmp.exists() {
        std::fs::remove_file(&tmp)?;
    }
    conn.backup(DatabaseName::Main, &tmp, None)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
