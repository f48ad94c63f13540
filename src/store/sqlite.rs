//! Embedded relational task store backed by SQLite.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use super::models::{TaskRecord, TaskStatus, TaskUpdate};
use super::TaskStore;
use crate::errors::StoreError;
use crate::repo_url;

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(anyhow::Error::new(err))
    }
}

/// Async-safe handle to the task database.
///
/// Wraps the connection behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
struct DbHandle {
    inner: Arc<std::sync::Mutex<TaskDb>>,
}

impl DbHandle {
    fn new(db: TaskDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&TaskDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| StoreError::Database(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

struct TaskDb {
    conn: Connection,
}

impl TaskDb {
    fn new(conn: Connection) -> Result<Self, StoreError> {
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                repository_url TEXT NOT NULL,
                repository_key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                message TEXT NOT NULL DEFAULT '',
                error TEXT,
                branch_name TEXT,
                pr_url TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_repository ON tasks(repository_key);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            ",
        )?;
        Ok(())
    }

    fn insert(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let key = repo_url::normalize(&record.repository_url);
        let result = self.conn.execute(
            "INSERT INTO tasks
                (id, repository_url, repository_key, status, message, error,
                 branch_name, pr_url, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.repository_url,
                key.as_str(),
                record.status.as_str(),
                record.message,
                record.error,
                record.branch_name,
                record.pr_url,
                record.started_at.to_rfc3339(),
                record.ended_at.map(|t| t.to_rfc3339()),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateTask {
                    id: record.id.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, repository_url, status, message, error, branch_name,
                    pr_url, started_at, ended_at
             FROM tasks WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    fn update(&self, id: &str, update: TaskUpdate) -> Result<TaskRecord, StoreError> {
        let mut record = self.get(id)?.ok_or_else(|| StoreError::TaskNotFound {
            id: id.to_string(),
        })?;
        if record.status.is_terminal() {
            return Err(StoreError::TaskFinalized {
                id: id.to_string(),
                status: record.status,
            });
        }
        update.apply(&mut record);
        self.conn.execute(
            "UPDATE tasks
             SET status = ?2, message = ?3, error = ?4, branch_name = ?5,
                 pr_url = ?6, ended_at = ?7
             WHERE id = ?1",
            params![
                record.id,
                record.status.as_str(),
                record.message,
                record.error,
                record.branch_name,
                record.pr_url,
                record.ended_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(record)
    }

    fn select_where(
        &self,
        clause: &str,
        args: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let sql = format!(
            "SELECT id, repository_url, status, message, error, branch_name,
                    pr_url, started_at, ended_at
             FROM tasks {clause} ORDER BY started_at DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(args)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<TaskRecord, StoreError> {
    let status_str: String = row.get(2)?;
    let status = TaskStatus::from_str(&status_str)
        .map_err(|_| StoreError::InvalidStatus { value: status_str })?;
    let started_at: String = row.get(7)?;
    let ended_at: Option<String> = row.get(8)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        repository_url: row.get(1)?,
        status,
        message: row.get(3)?,
        error: row.get(4)?,
        branch_name: row.get(5)?,
        pr_url: row.get(6)?,
        started_at: parse_timestamp(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(anyhow::anyhow!("bad timestamp '{}': {}", raw, e)))
}

/// Task store backed by an embedded SQLite database.
#[derive(Clone)]
pub struct SqliteTaskStore {
    handle: DbHandle,
}

impl SqliteTaskStore {
    /// Open (or create) a database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Ok(Self {
            handle: DbHandle::new(TaskDb::new(conn)?),
        })
    }

    /// Create an in-memory database (for testing and ephemeral deployments).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            handle: DbHandle::new(TaskDb::new(conn)?),
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, record: TaskRecord) -> Result<(), StoreError> {
        self.handle.call(move |db| db.insert(&record)).await
    }

    async fn get(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let id = id.to_string();
        self.handle.call(move |db| db.get(&id)).await
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> Result<TaskRecord, StoreError> {
        let id = id.to_string();
        self.handle.call(move |db| db.update(&id, update)).await
    }

    async fn list_all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.handle.call(|db| db.select_where("", params![])).await
    }

    async fn list_by_repository(&self, url: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let key = repo_url::normalize(url).into_string();
        self.handle
            .call(move |db| db.select_where("WHERE repository_key = ?1", params![key]))
            .await
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        let status = status.as_str();
        self.handle
            .call(move |db| db.select_where("WHERE status = ?1", params![status]))
            .await
    }
}
