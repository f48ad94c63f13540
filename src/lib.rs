//! Repository-serialized task scheduling.
//!
//! drydock accepts asynchronous work items bound to source-code
//! repositories, serializes execution per repository through TTL-leased
//! locks, and hands each task a single shared, refreshed checkout instead of
//! a fresh clone. The queue and lock table run against a shared coordination
//! backend when one is reachable and degrade to process-local state when it
//! is not.

pub mod config;
pub mod coord;
pub mod errors;
pub mod lock;
pub mod queue;
pub mod repo_url;
pub mod scheduler;
pub mod store;
pub mod workspace;

use std::sync::Arc;

pub use config::{DirtyWorkspacePolicy, DrydockConfig};
pub use errors::{QueueError, StoreError, WorkspaceError};
pub use lock::RepoLockTable;
pub use queue::{EnqueueRequest, QueuedTask, TaskQueue};
pub use scheduler::{ProcessOutcome, QueueScheduler, TaskProcessor};
pub use store::{
    FileTaskStore, SqliteTaskStore, TaskRecord, TaskStatus, TaskStore, TaskUpdate,
};
pub use workspace::{WorkspaceHandle, WorkspaceManager, WorkspaceRecord, WorkspaceState};

use coord::Coordinator;

/// Wired-together scheduling core: queue, lock table, workspace manager, and
/// scheduler sharing one configuration and one task store.
pub struct Drydock {
    pub store: Arc<dyn TaskStore>,
    pub locks: Arc<RepoLockTable>,
    pub queue: Arc<TaskQueue>,
    pub workspaces: Arc<WorkspaceManager>,
    pub scheduler: Arc<QueueScheduler>,
}

impl Drydock {
    /// Build the core against the given store and run startup housekeeping
    /// (expired-lock sweep, workspace reconciliation). Connects to the
    /// coordination backend if one is configured; an unreachable backend
    /// degrades to the in-process path rather than failing construction.
    pub async fn new(
        config: DrydockConfig,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self, WorkspaceError> {
        let coord = Arc::new(
            Coordinator::connect(
                config.redis_url.as_deref(),
                &config.key_prefix,
                config.op_timeout,
            )
            .await,
        );
        let locks = Arc::new(RepoLockTable::new(Arc::clone(&coord)));
        let queue = Arc::new(TaskQueue::new(
            coord,
            Arc::clone(&store),
            Arc::clone(&locks),
            &config,
        ));
        let workspaces = Arc::new(WorkspaceManager::new(&config)?);
        let scheduler = Arc::new(QueueScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&locks),
            Arc::clone(&workspaces),
            Arc::clone(&store),
            config,
        ));
        scheduler.startup().await;
        Ok(Self {
            store,
            locks,
            queue,
            workspaces,
            scheduler,
        })
    }
}
