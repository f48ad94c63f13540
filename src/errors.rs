//! Typed error hierarchy for the drydock scheduling core.
//!
//! Three top-level enums cover the three fallible subsystems:
//! - `StoreError` — task record persistence failures
//! - `QueueError` — enqueue failures (dequeue degrades instead of failing)
//! - `WorkspaceError` — clone/refresh failures of shared checkouts
//!
//! Lock-table operations are deliberately infallible: contention is reported
//! through return values and backend unavailability degrades to the local
//! fallback path.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::TaskStatus;

/// Errors from the task store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Task {id} already exists")]
    DuplicateTask { id: String },

    #[error("Task {id} is {status} and can no longer be updated")]
    TaskFinalized { id: String, status: TaskStatus },

    #[error("Unknown task status '{value}'")]
    InvalidStatus { value: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt task record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from task submission.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to encode task payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors from the shared workspace manager.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to clone {url}: {source}")]
    CloneFailed {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("Directory at {path} is not a usable checkout")]
    NotACheckout { path: PathBuf },

    #[error("Failed to shelve dirty state in {path}: {source}")]
    ShelveFailed {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("Workspace at {path} has uncommitted changes")]
    DirtyWorkspace { path: PathBuf },

    #[error("No usable branch in {path}")]
    NoUsableBranch { path: PathBuf },

    #[error("Branch {branch} cannot be fast-forwarded from origin")]
    NotFastForward { branch: String },

    #[error("Failed to fetch {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("Git operation failed in {path}: {source}")]
    Git {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_task_not_found_carries_id() {
        let err = StoreError::TaskNotFound { id: "t-42".into() };
        assert!(err.to_string().contains("t-42"));
    }

    #[test]
    fn store_error_finalized_names_status() {
        let err = StoreError::TaskFinalized {
            id: "t-1".into(),
            status: TaskStatus::Completed,
        };
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn queue_error_converts_from_store_error() {
        let inner = StoreError::DuplicateTask { id: "t-1".into() };
        let err: QueueError = inner.into();
        assert!(matches!(err, QueueError::Store(StoreError::DuplicateTask { .. })));
    }

    #[test]
    fn workspace_error_variants_are_matchable() {
        let err = WorkspaceError::NotACheckout {
            path: PathBuf::from("/tmp/ws"),
        };
        match &err {
            WorkspaceError::NotACheckout { path } => {
                assert_eq!(path, &PathBuf::from("/tmp/ws"));
            }
            _ => panic!("Expected NotACheckout"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::TaskNotFound { id: "x".into() });
        assert_std_error(&QueueError::Store(StoreError::TaskNotFound { id: "x".into() }));
        assert_std_error(&WorkspaceError::NoUsableBranch {
            path: PathBuf::from("/tmp"),
        });
    }
}
