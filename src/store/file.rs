//! Flat-file task store: one JSON document per task.
//!
//! Suitable for single-process deployments and tests; the embedded
//! relational store is the default for anything long-lived.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::models::{TaskRecord, TaskStatus, TaskUpdate};
use super::TaskStore;
use crate::errors::StoreError;
use crate::repo_url;

/// Task store persisting each record as `<dir>/<task-id>.json`.
pub struct FileTaskStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles across concurrent callers.
    guard: Mutex<()>,
}

impl FileTaskStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            guard: Mutex::new(()),
        })
    }

    fn task_path(&self, id: &str) -> PathBuf {
        let safe: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<TaskRecord>, StoreError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let record = serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(record))
    }

    async fn write_record(&self, path: &Path, record: &TaskRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(record).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        tokio::fs::write(path, json)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn create(&self, record: TaskRecord) -> Result<(), StoreError> {
        let _guard = self.guard.lock().await;
        let path = self.task_path(&record.id);
        if self.read_record(&path).await?.is_some() {
            return Err(StoreError::DuplicateTask { id: record.id });
        }
        self.write_record(&path, &record).await
    }

    async fn get(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        self.read_record(&self.task_path(id)).await
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> Result<TaskRecord, StoreError> {
        let _guard = self.guard.lock().await;
        let path = self.task_path(id);
        let mut record =
            self.read_record(&path)
                .await?
                .ok_or_else(|| StoreError::TaskNotFound {
                    id: id.to_string(),
                })?;
        if record.status.is_terminal() {
            return Err(StoreError::TaskFinalized {
                id: id.to_string(),
                status: record.status,
            });
        }
        update.apply(&mut record);
        self.write_record(&path, &record).await?;
        Ok(record)
    }

    async fn list_all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(record) = self.read_record(&path).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    async fn list_by_repository(&self, url: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let key = repo_url::normalize(url);
        let mut records = self.list_all().await?;
        records.retain(|r| repo_url::normalize(&r.repository_url) == key);
        Ok(records)
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        let mut records = self.list_all().await?;
        records.retain(|r| r.status == status);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_get_update_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileTaskStore::new(dir.path()).unwrap();

        store
            .create(TaskRecord::new("t-1", "https://example.com/org/repo"))
            .await
            .unwrap();
        let fetched = store.get("t-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Pending);

        store
            .update(
                "t-1",
                TaskUpdate::new()
                    .with_status(TaskStatus::Implementing)
                    .with_message("working"),
            )
            .await
            .unwrap();
        let fetched = store.get("t-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Implementing);
        assert_eq!(fetched.message, "working");
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FileTaskStore::new(dir.path()).unwrap();
        let record = TaskRecord::new("t-1", "https://example.com/org/repo");
        store.create(record.clone()).await.unwrap();
        assert!(matches!(
            store.create(record).await.unwrap_err(),
            StoreError::DuplicateTask { .. }
        ));
    }

    #[tokio::test]
    async fn terminal_records_are_immutable() {
        let dir = tempdir().unwrap();
        let store = FileTaskStore::new(dir.path()).unwrap();
        store
            .create(TaskRecord::new("t-1", "https://example.com/org/repo"))
            .await
            .unwrap();
        store
            .update("t-1", TaskUpdate::new().with_status(TaskStatus::Completed))
            .await
            .unwrap();
        assert!(matches!(
            store
                .update("t-1", TaskUpdate::new().with_message("late"))
                .await
                .unwrap_err(),
            StoreError::TaskFinalized { .. }
        ));
    }

    #[tokio::test]
    async fn task_ids_with_path_characters_are_sanitized() {
        let dir = tempdir().unwrap();
        let store = FileTaskStore::new(dir.path()).unwrap();
        store
            .create(TaskRecord::new("a/b:c", "https://example.com/org/repo"))
            .await
            .unwrap();
        assert!(store.get("a/b:c").await.unwrap().is_some());
        // The record landed inside the store directory, not beside it.
        assert!(dir.path().join("a-b-c.json").exists());
    }

    #[tokio::test]
    async fn list_filters_by_repository_and_status() {
        let dir = tempdir().unwrap();
        let store = FileTaskStore::new(dir.path()).unwrap();
        store
            .create(TaskRecord::new("t-1", "https://example.com/org/repo.git"))
            .await
            .unwrap();
        store
            .create(TaskRecord::new("t-2", "https://example.com/other/repo"))
            .await
            .unwrap();
        store
            .update("t-2", TaskUpdate::new().with_status(TaskStatus::Planning))
            .await
            .unwrap();

        let by_repo = store
            .list_by_repository("https://EXAMPLE.com/org/repo/")
            .await
            .unwrap();
        assert_eq!(by_repo.len(), 1);
        assert_eq!(by_repo[0].id, "t-1");

        let planning = store.list_by_status(TaskStatus::Planning).await.unwrap();
        assert_eq!(planning.len(), 1);
        assert_eq!(planning[0].id, "t-2");

        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_file_surfaces_as_error() {
        let dir = tempdir().unwrap();
        let store = FileTaskStore::new(dir.path()).unwrap();
        tokio::fs::write(dir.path().join("bad.json"), "{not json")
            .await
            .unwrap();
        assert!(matches!(
            store.list_all().await.unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }
}
