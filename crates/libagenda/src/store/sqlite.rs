use agenda_protocol::model::{Availability, Task, TaskMethod, TaskUpdate, Visitor, weekday_name};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use uuid::Uuid;

use super::{Storage, StoreError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS tasks (
        id          TEXT PRIMARY KEY NOT NULL,
        tid         TEXT NOT NULL UNIQUE,
        start_at    TEXT NOT NULL,
        end_at      TEXT NOT NULL,
        start_ts    INTEGER NOT NULL,
        end_ts      INTEGER NOT NULL,
        detail      TEXT NOT NULL DEFAULT '',
        method      TEXT NOT NULL,
        owner       TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_start_ts ON tasks(start_ts);
    CREATE TABLE IF NOT EXISTS availability (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        weekday         INTEGER NOT NULL,
        available_from  TEXT NOT NULL,
        available_to    TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        newest          INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE IF NOT EXISTS visitors (
        address           TEXT PRIMARY KEY NOT NULL,
        uid               TEXT NOT NULL,
        visit_count       INTEGER NOT NULL DEFAULT 0,
        has_created_task  INTEGER NOT NULL DEFAULT 0
    );";

const TASK_COLUMNS: &str = "id, tid, start_at, end_at, detail, method, owner";
const TIME_FORMAT: &str = "%H:%M:%S";

/// SQLite-backed task and availability store.
///
/// The connection sits behind a `std::sync::Mutex` and every query runs on
/// `spawn_blocking` so synchronous SQLite I/O never stalls the runtime.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create agenda tables")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .context("failed to count stored tasks")?;
        if count > 0 {
            tracing::info!(count, "loaded tasks from disk");
        }

        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    /// Replaces the authoritative availability set. Older rows are kept with
    /// `newest` cleared.
    pub async fn replace_availability(&self, rows: Vec<Availability>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("UPDATE availability SET newest = 0 WHERE newest = 1", [])?;
            for row in &rows {
                tx.execute(
                    "INSERT INTO availability (weekday, available_from, available_to, created_at, newest)
                         VALUES (?1, ?2, ?3, ?4, 1)",
                    params![
                        row.weekday,
                        row.available_from.format(TIME_FORMAT).to_string(),
                        row.available_to.format(TIME_FORMAT).to_string(),
                        row.created_at.to_rfc3339(),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Backend(format!("lock poisoned: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }

    /// Like `with_conn`, but gives up without running `f` when the lock is
    /// only obtained after `deadline`.
    async fn with_conn_until<T, F>(&self, deadline: Instant, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(move |conn| {
            if Instant::now() >= deadline {
                return Err(StoreError::Expired);
            }
            f(conn)
        })
        .await
    }
}

#[cfg(test)]
impl SqliteStorage {
    /// Hold the connection lock on another thread for `hold`, returning once
    /// it is taken.
    pub(crate) fn hold_lock(&self, hold: std::time::Duration) -> std::thread::JoinHandle<()> {
        let conn = Arc::clone(&self.conn);
        let (taken_tx, taken_rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let _guard = conn.lock();
            let _ = taken_tx.send(());
            std::thread::sleep(hold);
        });
        let _ = taken_rx.recv();
        handle
    }
}

struct TaskRow {
    id: String,
    tid: String,
    start_at: String,
    end_at: String,
    detail: String,
    method: String,
    owner: String,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tid: row.get(1)?,
            start_at: row.get(2)?,
            end_at: row.get(3)?,
            detail: row.get(4)?,
            method: row.get(5)?,
            owner: row.get(6)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        Ok(Task {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| StoreError::Backend(format!("bad task id {}: {e}", self.id)))?,
            start: parse_stored_ts(&self.start_at)?,
            end: parse_stored_ts(&self.end_at)?,
            method: TaskMethod::parse(&self.method)
                .ok_or_else(|| StoreError::Backend(format!("bad task method {}", self.method)))?,
            tid: self.tid,
            detail: self.detail,
            owner: self.owner,
        })
    }
}

fn parse_stored_ts(raw: &str) -> Result<DateTime<FixedOffset>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map_err(|e| StoreError::Backend(format!("bad timestamp {raw}: {e}")))
}

fn parse_stored_time(raw: &str) -> Result<NaiveTime, StoreError> {
    NaiveTime::parse_from_str(raw, TIME_FORMAT)
        .map_err(|e| StoreError::Backend(format!("bad time of day {raw}: {e}")))
}

fn select_task(conn: &Connection, tid: &str) -> Result<Task, StoreError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE tid = ?1"),
        [tid],
        TaskRow::read,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(tid.to_string()))?
    .into_task()
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn fetch_tasks_in_range(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<Vec<Task>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE start_ts >= ?1 AND end_ts <= ?2
                     ORDER BY start_ts, rowid"
            ))?;
            let rows = stmt
                .query_map(params![start.timestamp(), end.timestamp()], TaskRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    async fn fetch_newest_availability(&self) -> Result<Vec<Availability>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT weekday, available_from, available_to, created_at FROM availability
                     WHERE newest = 1 ORDER BY weekday, available_from",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, u8>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(weekday, from, to, created_at)| {
                    Ok(Availability {
                        weekday,
                        day_name: weekday_name(weekday).to_string(),
                        available_from: parse_stored_time(&from)?,
                        available_to: parse_stored_time(&to)?,
                        created_at: parse_stored_ts(&created_at)?.with_timezone(&Utc),
                        newest: true,
                    })
                })
                .collect()
        })
        .await
    }

    async fn fetch_task(&self, tid: &str) -> Result<Task, StoreError> {
        let tid = tid.to_string();
        self.with_conn(move |conn| select_task(conn, &tid)).await
    }

    async fn insert_task(&self, task: &Task, deadline: Instant) -> Result<(), StoreError> {
        let task = task.clone();
        self.with_conn_until(deadline, move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, tid, start_at, end_at, start_ts, end_ts, detail, method, owner)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    task.id.to_string(),
                    task.tid,
                    task.start.to_rfc3339(),
                    task.end.to_rfc3339(),
                    task.start.timestamp(),
                    task.end.timestamp(),
                    task.detail,
                    task.method.as_str(),
                    task.owner,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_task(
        &self,
        tid: &str,
        update: &TaskUpdate,
        deadline: Instant,
    ) -> Result<Task, StoreError> {
        let tid = tid.to_string();
        let update = update.clone();
        self.with_conn_until(deadline, move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET start_at = ?1, end_at = ?2, start_ts = ?3, end_ts = ?4, detail = ?5
                     WHERE tid = ?6",
                params![
                    update.start.to_rfc3339(),
                    update.end.to_rfc3339(),
                    update.start.timestamp(),
                    update.end.timestamp(),
                    update.detail,
                    tid,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(tid));
            }
            select_task(conn, &tid)
        })
        .await
    }

    async fn delete_task(&self, tid: &str, deadline: Instant) -> Result<u64, StoreError> {
        let tid = tid.to_string();
        self.with_conn_until(deadline, move |conn| {
            let removed = conn.execute("DELETE FROM tasks WHERE tid = ?1", [&tid])?;
            Ok(removed as u64)
        })
        .await
    }

    async fn record_visit(&self, uid: &str, address: &str) -> Result<Visitor, StoreError> {
        let uid = uid.to_string();
        let address = address.to_string();
        self.with_conn(move |conn| {
            let visitor = conn.query_row(
                "INSERT INTO visitors (address, uid, visit_count, has_created_task)
                     VALUES (?1, ?2, 1, 0)
                     ON CONFLICT(address) DO UPDATE SET visit_count = visit_count + 1
                     RETURNING uid, address, visit_count, has_created_task",
                params![address, uid],
                |row| {
                    Ok(Visitor {
                        uid: row.get(0)?,
                        address: row.get(1)?,
                        visit_count: row.get::<_, i64>(2)?.max(0) as u64,
                        has_created_task: row.get(3)?,
                    })
                },
            )?;
            Ok(visitor)
        })
        .await
    }

    async fn mark_visitor_booked(&self, uid: &str) -> Result<(), StoreError> {
        let uid = uid.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE visitors SET has_created_task = 1 WHERE uid = ?1",
                [&uid],
            )?;
            Ok(())
        })
        .await
    }
}
