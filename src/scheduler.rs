//! Poll-driven scheduler tying the queue, lock table, workspace manager, and
//! task store together.
//!
//! One recurring loop drives dequeue attempts on a fixed interval. A
//! dequeued task already holds its repository lock; the scheduler acquires a
//! ready workspace, hands both to the caller-supplied processor, records the
//! outcome, and releases the lock in all cases.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::DrydockConfig;
use crate::queue::{QueuedTask, TaskQueue};
use crate::lock::RepoLockTable;
use crate::store::{TaskStatus, TaskStore, TaskUpdate};
use crate::workspace::{WorkspaceHandle, WorkspaceManager};

/// Final result a processor reports for a task.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub message: String,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
}

/// The excluded task-processing layer, seen from the scheduler.
///
/// Implementations receive the queue entry and a ready workspace and perform
/// everything domain-specific inside it. Intermediate status transitions
/// (`pr-created`, `implementing`) are reported through the task store by the
/// processor itself; the scheduler owns the `planning`, `completed`, and
/// `failed` transitions. A processor should treat the lock TTL as its soft
/// execution budget.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(
        &self,
        task: &QueuedTask,
        workspace: &WorkspaceHandle,
    ) -> Result<ProcessOutcome>;
}

/// Fixed-interval poll loop over the task queue.
pub struct QueueScheduler {
    queue: Arc<TaskQueue>,
    locks: Arc<RepoLockTable>,
    workspaces: Arc<WorkspaceManager>,
    store: Arc<dyn TaskStore>,
    config: DrydockConfig,
    stopped: AtomicBool,
    stop_signal: Notify,
}

impl QueueScheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        locks: Arc<RepoLockTable>,
        workspaces: Arc<WorkspaceManager>,
        store: Arc<dyn TaskStore>,
        config: DrydockConfig,
    ) -> Self {
        Self {
            queue,
            locks,
            workspaces,
            store,
            config,
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
        }
    }

    /// Startup housekeeping: drop expired locks and rebuild workspace
    /// records from disk.
    pub async fn startup(&self) {
        let swept = self.locks.sweep_expired().await;
        if swept > 0 {
            info!(swept, "removed expired repository locks");
        }
        match self.workspaces.reconcile().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered, "reconciled workspaces from disk");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "workspace reconciliation failed"),
        }
    }

    /// Drive the poll loop until [`QueueScheduler::shutdown`] is called.
    pub async fn run(&self, processor: Arc<dyn TaskProcessor>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.stop_signal.notified() => break,
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            self.run_once(processor.as_ref()).await;
        }
        debug!("scheduler loop stopped");
    }

    /// Stop the poll loop after the current iteration.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_signal.notify_waiters();
    }

    /// One dequeue attempt. Returns the processed task id, or `None` when no
    /// task was ready this poll.
    pub async fn run_once(&self, processor: &dyn TaskProcessor) -> Option<String> {
        let task = self.queue.dequeue_next().await?;
        let task_id = task.task_id.clone();
        debug!(task_id, url = %task.repository_url, "processing task");

        let result = self.execute(&task, processor).await;
        let update = match result {
            Ok(outcome) => {
                let mut update = TaskUpdate::new()
                    .with_status(TaskStatus::Completed)
                    .with_message(outcome.message)
                    .with_ended_now();
                if let Some(branch) = outcome.branch_name {
                    update = update.with_branch_name(branch);
                }
                if let Some(url) = outcome.pr_url {
                    update = update.with_pr_url(url);
                }
                update
            }
            Err(err) => {
                info!(task_id, error = %format!("{err:#}"), "task failed");
                TaskUpdate::new()
                    .with_status(TaskStatus::Failed)
                    .with_error(format!("{err:#}"))
                    .with_ended_now()
            }
        };

        // Record the outcome and release the lock in all cases; a store
        // failure must not leave the repository locked.
        if let Err(err) = self.store.update(&task_id, update).await {
            warn!(task_id, error = %err, "failed to record task outcome");
        }
        self.locks.release(&task.repository_url, &task_id).await;
        Some(task_id)
    }

    async fn execute(
        &self,
        task: &QueuedTask,
        processor: &dyn TaskProcessor,
    ) -> Result<ProcessOutcome> {
        self.store
            .update(
                &task.task_id,
                TaskUpdate::new()
                    .with_status(TaskStatus::Planning)
                    .with_message("preparing workspace"),
            )
            .await
            .context("Failed to mark task planning")?;

        let workspace = tokio::time::timeout(
            self.config.op_timeout,
            self.workspaces.acquire(&task.repository_url, &task.task_id),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "workspace refresh timed out after {:?}",
                self.config.op_timeout
            )
        })?
        .context("Failed to acquire workspace")?;

        processor.process(task, &workspace).await
    }
}
