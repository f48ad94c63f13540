//! Durable persistence for task status records.
//!
//! Two interchangeable backends implement [`TaskStore`]: an embedded
//! relational store ([`sqlite::SqliteTaskStore`]) and a flat-file store
//! ([`file::FileTaskStore`]). The scheduler only ever talks to the trait.

pub mod file;
pub mod models;
pub mod sqlite;

use async_trait::async_trait;

pub use file::FileTaskStore;
pub use models::{TaskRecord, TaskStatus, TaskUpdate};
pub use sqlite::SqliteTaskStore;

use crate::errors::StoreError;

/// Durable key-value persistence for task records, keyed by task id.
///
/// Implementations must be safe for concurrent callers and must reject
/// updates to records that already reached a terminal status.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new record. Fails with [`StoreError::DuplicateTask`] if the
    /// id is already present.
    async fn create(&self, record: TaskRecord) -> Result<(), StoreError>;

    /// Fetch a record by task id.
    async fn get(&self, id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Apply a partial update and return the new record. Fails with
    /// [`StoreError::TaskFinalized`] once the record is `completed` or
    /// `failed`.
    async fn update(&self, id: &str, update: TaskUpdate) -> Result<TaskRecord, StoreError>;

    /// All records, newest first.
    async fn list_all(&self) -> Result<Vec<TaskRecord>, StoreError>;

    /// Records targeting the given repository (URL spellings are matched by
    /// normalized key).
    async fn list_by_repository(&self, url: &str) -> Result<Vec<TaskRecord>, StoreError>;

    /// Records currently in the given status.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError>;
}
