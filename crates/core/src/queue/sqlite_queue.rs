//! SQLite-backed task queue.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error};

use crate::metrics::TASKS_PROCESSED;
use crate::sqlite::{from_db_time, from_db_time_opt, open, to_db_time};

use super::{LeasedTask, QueueError, QueueStats, Task, TaskPayload, TaskQueue};

const TASK_COLUMNS: &str =
    "id, payload, available_at, deliveries, leased_by, lease_expires_at, created_at";

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Task queue stored in a SQLite table.
pub struct SqliteTaskQueue {
    conn: Mutex<Connection>,
}

impl SqliteTaskQueue {
    pub fn new(path: &Path) -> Result<Self, QueueError> {
        let conn = open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), QueueError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                job_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                available_at TEXT NOT NULL,
                deliveries INTEGER NOT NULL DEFAULT 0,
                leased_by TEXT,
                lease_expires_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_available ON tasks(available_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id);

            CREATE TABLE IF NOT EXISTS dead_tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                job_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                error TEXT NOT NULL,
                failed_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn
            .lock()
            .map_err(|_| QueueError::Database("connection lock poisoned".to_string()))
    }

    /// Move a task that can never be handled out of the queue.
    fn dead_letter(
        tx: &rusqlite::Transaction<'_>,
        id: &str,
        error: &str,
        now: &str,
    ) -> Result<(), QueueError> {
        tx.execute(
            r#"
            INSERT INTO dead_tasks (id, kind, job_id, payload, error, failed_at)
            SELECT id, kind, job_id, payload, ?, ? FROM tasks WHERE id = ?
            "#,
            params![error, now, id],
        )?;
        tx.execute("DELETE FROM tasks WHERE id = ?", params![id])?;
        Ok(())
    }

    /// Number of tasks moved aside because their payload could not be decoded.
    pub fn dead_task_count(&self) -> Result<u64, QueueError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dead_tasks", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let payload: String = row.get(1)?;
        let available_at: String = row.get(2)?;
        let created_at: String = row.get(6)?;

        Ok(Task {
            id: row.get(0)?,
            payload: serde_json::from_str(&payload).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
            })?,
            available_at: from_db_time(&available_at),
            deliveries: row.get(3)?,
            leased_by: row.get(4)?,
            lease_expires_at: from_db_time_opt(row.get(5)?),
            created_at: from_db_time(&created_at),
        })
    }
}

impl TaskQueue for SqliteTaskQueue {
    fn enqueue(&self, payload: &TaskPayload, delay: Duration) -> Result<String, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let json = serde_json::to_string(payload)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (id, kind, job_id, payload, available_at, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                id,
                payload.kind(),
                payload.job_id(),
                json,
                to_db_time(&after(now, delay)),
                to_db_time(&now),
            ],
        )?;

        debug!(
            "Enqueued {} task {} for job {} (delay {:?})",
            payload.kind(),
            id,
            payload.job_id(),
            delay
        );
        Ok(id)
    }

    fn lease(&self, worker: &str, lease_for: Duration) -> Result<Option<LeasedTask>, QueueError> {
        let now = Utc::now();
        let now_str = to_db_time(&now);
        let expires = after(now, lease_for);

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        loop {
            // Expired leases are redelivered: their worker is presumed gone
            let candidate: Option<(String, String, String, u32)> = tx
                .query_row(
                    r#"
                    SELECT id, kind, payload, deliveries FROM tasks
                    WHERE (leased_by IS NULL AND available_at <= ?1)
                       OR (leased_by IS NOT NULL AND lease_expires_at <= ?1)
                    ORDER BY available_at, seq
                    LIMIT 1
                    "#,
                    params![now_str],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let Some((id, kind, payload_json, deliveries)) = candidate else {
                tx.commit()?;
                return Ok(None);
            };

            let payload: TaskPayload = match serde_json::from_str(&payload_json) {
                Ok(payload) => payload,
                Err(e) => {
                    Self::dead_letter(&tx, &id, &e.to_string(), &now_str)?;
                    error!("Moved undecodable {} task {} to dead_tasks: {}", kind, id, e);
                    TASKS_PROCESSED.with_label_values(&[kind.as_str(), "dead_lettered"]).inc();
                    continue;
                }
            };

            tx.execute(
                "UPDATE tasks SET leased_by = ?, lease_expires_at = ?, deliveries = deliveries + 1 WHERE id = ?",
                params![worker, to_db_time(&expires), id],
            )?;
            tx.commit()?;

            return Ok(Some(LeasedTask {
                id,
                payload,
                deliveries: deliveries + 1,
                lease_expires_at: expires,
            }));
        }
    }

    fn extend_lease(&self, id: &str, worker: &str, lease_for: Duration) -> Result<(), QueueError> {
        let expires = after(Utc::now(), lease_for);
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE tasks SET lease_expires_at = ? WHERE id = ? AND leased_by = ?",
            params![to_db_time(&expires), id, worker],
        )?;
        if rows == 0 {
            // Acked, released, or taken over after the lease ran out
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn ack(&self, id: &str) -> Result<(), QueueError> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM tasks WHERE id = ?", params![id])?;
        if rows == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn release(&self, id: &str, delay: Duration) -> Result<(), QueueError> {
        let available_at = after(Utc::now(), delay);
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE tasks SET leased_by = NULL, lease_expires_at = NULL, available_at = ? WHERE id = ?",
            params![to_db_time(&available_at), id],
        )?;
        if rows == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn pending_for_job(&self, job_id: i64) -> Result<Vec<Task>, QueueError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE job_id = ? ORDER BY seq",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![job_id], Self::row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = to_db_time(&Utc::now());
        let conn = self.conn()?;
        let (ready, delayed, leased): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN leased_by IS NULL AND available_at <= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN leased_by IS NULL AND available_at > ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN leased_by IS NOT NULL THEN 1 ELSE 0 END), 0)
            FROM tasks
            "#,
            params![now],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(QueueStats {
            ready: ready as u64,
            delayed: delayed as u64,
            leased: leased as u64,
        })
    }
}
