use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{backup::Progress, params, Connection, DatabaseName, ErrorCode, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{GameError, GameResult};
use crate::models::{millis_to_utc, Prediction, Round, RoundStatus, ScoreRow};
use crate::store::persist::WriteBuffer;
use crate::store::RoundStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS rounds (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        opens_at INTEGER NOT NULL,
        closes_at INTEGER NOT NULL,
        actual_oi REAL,
        status TEXT NOT NULL DEFAULT 'open'
            CHECK (status IN ('open', 'closed', 'scored'))
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_rounds_single_open
        ON rounds(status) WHERE status = 'open';
    CREATE INDEX IF NOT EXISTS idx_rounds_status_closes
        ON rounds(status, closes_at);

    CREATE TABLE IF NOT EXISTS predictions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        round_id INTEGER NOT NULL REFERENCES rounds(id),
        participant TEXT NOT NULL,
        value REAL NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE(round_id, participant)
    );

    CREATE TABLE IF NOT EXISTS scores (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        round_id INTEGER NOT NULL REFERENCES rounds(id),
        participant TEXT NOT NULL,
        diff REAL NOT NULL,
        rank INTEGER NOT NULL,
        UNIQUE(round_id, participant)
    );
";

const ROUND_COLUMNS: &str = "id, opens_at, closes_at, actual_oi, status";

/// SQLite-backed round store. The working set lives in an in-memory
/// connection; pair it with a [`SnapshotWriter`](crate::store::SnapshotWriter)
/// to persist it.
#[derive(Clone)]
pub struct SqliteRoundStore {
    conn: Arc<Mutex<Connection>>,
    buffer: Arc<WriteBuffer>,
}

impl SqliteRoundStore {
    pub fn in_memory() -> GameResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    /// Load a previous snapshot into memory, or start empty if there is none.
    pub fn restore_from(path: &Path) -> GameResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        if path.exists() {
            conn.restore(DatabaseName::Main, path, None::<fn(Progress)>)?;
            info!(path = %path.display(), "restored round store snapshot");
        } else {
            info!(path = %path.display(), "no snapshot found, starting empty");
        }
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> GameResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            buffer: Arc::new(WriteBuffer::default()),
        })
    }

    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    pub fn write_buffer(&self) -> Arc<WriteBuffer> {
        self.buffer.clone()
    }

    fn query_rounds(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> GameResult<Vec<Round>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, row_to_round)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn query_round(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> GameResult<Option<Round>> {
        let round = conn.query_row(sql, params, row_to_round).optional()?;
        Ok(round)
    }
}

fn row_to_round(row: &rusqlite::Row<'_>) -> rusqlite::Result<Round> {
    let status: String = row.get(4)?;
    let status = status.parse::<RoundStatus>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(4, "status".to_string(), rusqlite::types::Type::Text)
    })?;
    Ok(Round {
        id: row.get(0)?,
        opens_at: millis_to_utc(row.get(1)?),
        closes_at: millis_to_utc(row.get(2)?),
        actual_oi: row.get(3)?,
        status,
    })
}

/// Move `round_id` from `from` to its successor status, failing if the row is
/// not currently in `from`. `actual_oi` is written in the same statement.
fn advance_status(
    conn: &Connection,
    round_id: i64,
    from: RoundStatus,
    actual_oi: Option<f64>,
) -> GameResult<()> {
    let invalid = GameError::InvalidTransition {
        round_id,
        expected: from,
    };
    let Some(to) = from.next() else {
        return Err(invalid);
    };
    let changed = conn.execute(
        "UPDATE rounds SET status = ?1, actual_oi = COALESCE(?4, actual_oi)
         WHERE id = ?2 AND status = ?3",
        params![to.as_str(), round_id, from.as_str(), actual_oi],
    )?;
    if changed == 0 {
        return Err(invalid);
    }
    Ok(())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

#[async_trait]
impl RoundStore for SqliteRoundStore {
    async fn find_open_round(&self) -> GameResult<Option<Round>> {
        let conn = self.conn.lock().await;
        Self::query_round(
            &conn,
            &format!(
                "SELECT {ROUND_COLUMNS} FROM rounds WHERE status = 'open' ORDER BY id DESC LIMIT 1"
            ),
            [],
        )
    }

    async fn create_round(
        &self,
        opens_at: DateTime<Utc>,
        closes_at: DateTime<Utc>,
    ) -> GameResult<Round> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT INTO rounds (opens_at, closes_at, status) VALUES (?1, ?2, 'open')",
            params![opens_at.timestamp_millis(), closes_at.timestamp_millis()],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => return Err(GameError::RoundAlreadyOpen),
            Err(e) => return Err(e.into()),
        }
        let id = conn.last_insert_rowid();
        self.buffer.record_write();
        debug!(round_id = id, "round row inserted");

        Ok(Round {
            id,
            opens_at: millis_to_utc(opens_at.timestamp_millis()),
            closes_at: millis_to_utc(closes_at.timestamp_millis()),
            actual_oi: None,
            status: RoundStatus::Open,
        })
    }

    async fn find_expired_open_rounds(&self, now: DateTime<Utc>) -> GameResult<Vec<Round>> {
        let conn = self.conn.lock().await;
        Self::query_rounds(
            &conn,
            &format!(
                "SELECT {ROUND_COLUMNS} FROM rounds
                 WHERE status = 'open' AND closes_at < ?1
                 ORDER BY closes_at ASC, id ASC"
            ),
            params![now.timestamp_millis()],
        )
    }

    async fn set_round_resolved(&self, round_id: i64, actual_oi: f64) -> GameResult<()> {
        let conn = self.conn.lock().await;
        advance_status(&conn, round_id, RoundStatus::Open, Some(actual_oi))?;
        self.buffer.record_write();
        Ok(())
    }

    async fn set_round_scored(&self, round_id: i64) -> GameResult<()> {
        let conn = self.conn.lock().await;
        advance_status(&conn, round_id, RoundStatus::Closed, None)?;
        self.buffer.record_write();
        Ok(())
    }

    async fn find_predictions_for_round(&self, round_id: i64) -> GameResult<Vec<Prediction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT round_id, participant, value, created_at FROM predictions
             WHERE round_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![round_id], |row| {
            Ok(Prediction {
                round_id: row.get(0)?,
                participant: row.get(1)?,
                value: row.get(2)?,
                created_at: millis_to_utc(row.get(3)?),
            })
        })?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn insert_prediction(
        &self,
        round_id: i64,
        participant: &str,
        value: f64,
        created_at: DateTime<Utc>,
    ) -> GameResult<Prediction> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT INTO predictions (round_id, participant, value, created_at)
             SELECT ?1, ?2, ?3, ?4
             WHERE EXISTS (SELECT 1 FROM rounds WHERE id = ?1 AND status = 'open')",
            params![round_id, participant, value, created_at.timestamp_millis()],
        );
        match inserted {
            Ok(0) => Err(GameError::RoundNotOpen),
            Ok(_) => {
                self.buffer.record_write();
                Ok(Prediction {
                    round_id,
                    participant: participant.to_string(),
                    value,
                    created_at: millis_to_utc(created_at.timestamp_millis()),
                })
            }
            Err(e) if is_constraint_violation(&e) => Err(GameError::DuplicatePrediction {
                round_id,
                participant: participant.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_scores(&self, round_id: i64, scores: &[ScoreRow]) -> GameResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM rounds WHERE id = ?1",
                params![round_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => return Err(GameError::RoundNotFound(round_id)),
            Some("closed") => {}
            Some(_) => {
                return Err(GameError::InvalidTransition {
                    round_id,
                    expected: RoundStatus::Closed,
                })
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO scores (round_id, participant, diff, rank)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for s in scores {
                stmt.execute(params![round_id, s.participant, s.diff, s.rank])?;
            }
        }
        tx.commit()?;
        self.buffer.record_write();
        Ok(())
    }

    async fn find_round(&self, round_id: i64) -> GameResult<Option<Round>> {
        let conn = self.conn.lock().await;
        Self::query_round(
            &conn,
            &format!("SELECT {ROUND_COLUMNS} FROM rounds WHERE id = ?1"),
            params![round_id],
        )
    }

    async fn find_rounds_with_status(&self, status: RoundStatus) -> GameResult<Vec<Round>> {
        let conn = self.conn.lock().await;
        Self::query_rounds(
            &conn,
            &format!("SELECT {ROUND_COLUMNS} FROM rounds WHERE status = ?1 ORDER BY id ASC"),
            params![status.as_str()],
        )
    }

    async fn latest_scored_round(&self) -> GameResult<Option<Round>> {
        let conn = self.conn.lock().await;
        Self::query_round(
            &conn,
            &format!(
                "SELECT {ROUND_COLUMNS} FROM rounds WHERE status = 'scored' ORDER BY id DESC LIMIT 1"
            ),
            [],
        )
    }

    async fn find_scores_for_round(&self, round_id: i64) -> GameResult<Vec<ScoreRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT participant, diff, rank FROM scores WHERE round_id = ?1 ORDER BY rank ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![round_id], |row| {
            Ok(ScoreRow {
                participant: row.get(0)?,
                diff: row.get(1)?,
                rank: row.get(2)?,
            })
        })?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn recent_rounds(&self, limit: usize) -> GameResult<Vec<Round>> {
        let conn = self.conn.lock().await;
        Self::query_rounds(
            &conn,
            &format!("SELECT {ROUND_COLUMNS} FROM rounds ORDER BY id DESC LIMIT ?1"),
            params![limit as i64],
        )
    }
}
