//! Priority-ordered pending-work queue.
//!
//! Entries dequeue by priority (higher first), FIFO within equal priority.
//! A successful dequeue is coupled to lock acquisition: an entry only counts
//! as removed once the repository lock is held for its task id. Entries whose
//! repository is locked go back with a short delay penalty; entries that lose
//! an acquisition race go back immediately.
//!
//! Backend layout: two Redis sorted sets, `<prefix>:queue:ready` scored by
//! priority/enqueue-time and `<prefix>:queue:delayed` scored by the epoch
//! millisecond at which the entry becomes dequeuable again. The in-process
//! fallback mirrors this with a pair of binary heaps and identical ordering
//! semantics.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DrydockConfig;
use crate::coord::Coordinator;
use crate::errors::QueueError;
use crate::lock::RepoLockTable;
use crate::store::{TaskRecord, TaskStore};

// Spacing between adjacent priorities in the backend score. Keeps the
// priority term dominant over the millisecond enqueue-time term while both
// stay inside f64's exact-integer range for realistic priorities.
const PRIORITY_WEIGHT: f64 = 1e13;

/// A task submission.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub repository_url: String,
    /// Caller-supplied id; a UUIDv4 is assigned when absent.
    pub task_id: Option<String>,
    /// Higher priorities dequeue first.
    pub priority: i64,
    /// Opaque request payload handed back to the processor at dequeue time.
    pub payload: Value,
}

impl EnqueueRequest {
    pub fn new(repository_url: impl Into<String>) -> Self {
        Self {
            repository_url: repository_url.into(),
            task_id: None,
            priority: 0,
            payload: Value::Null,
        }
    }

    pub fn with_task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A pending entry, as stored in the queue backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: String,
    pub repository_url: String,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    pub payload: Value,
}

fn ordering_score(task: &QueuedTask) -> f64 {
    task.enqueued_at.timestamp_millis() as f64 - task.priority as f64 * PRIORITY_WEIGHT
}

struct ReadyEntry {
    task: QueuedTask,
}

impl ReadyEntry {
    fn rank(&self) -> (i64, i64, &str) {
        (
            self.task.priority,
            -self.task.enqueued_at.timestamp_millis(),
            &self.task.task_id,
        )
    }
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    // Max-heap: highest priority first, earliest enqueue time within a
    // priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

struct DelayedEntry {
    ready_at: Instant,
    task: QueuedTask,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.task.task_id == other.task.task_id
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    // Reverse ordering so the heap acts as a min-heap (earliest ready first).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.task.task_id.cmp(&self.task.task_id))
    }
}

#[derive(Default)]
struct LocalQueue {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
}

impl LocalQueue {
    /// Move entries whose delay has elapsed back into the ready heap.
    fn promote(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.delayed.peek() {
            if entry.ready_at > now {
                break;
            }
            if let Some(entry) = self.delayed.pop() {
                self.ready.push(ReadyEntry { task: entry.task });
            }
        }
    }
}

/// Priority queue of pending tasks, coupled to the repository lock table.
pub struct TaskQueue {
    coord: Arc<Coordinator>,
    store: Arc<dyn TaskStore>,
    locks: Arc<RepoLockTable>,
    local: Mutex<LocalQueue>,
    requeue_delay: Duration,
    lock_ttl: Duration,
}

impl TaskQueue {
    pub fn new(
        coord: Arc<Coordinator>,
        store: Arc<dyn TaskStore>,
        locks: Arc<RepoLockTable>,
        config: &DrydockConfig,
    ) -> Self {
        Self {
            coord,
            store,
            locks,
            local: Mutex::new(LocalQueue::default()),
            requeue_delay: config.requeue_delay,
            lock_ttl: config.lock_ttl,
        }
    }

    fn ready_key(&self) -> String {
        self.coord.key("queue:ready")
    }

    fn delayed_key(&self) -> String {
        self.coord.key("queue:delayed")
    }

    /// Submit a task: persist a `pending` record and insert a queue entry.
    /// Returns the task id.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<String, QueueError> {
        let task_id = request
            .task_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.store
            .create(TaskRecord::new(&task_id, &request.repository_url))
            .await?;

        let task = QueuedTask {
            task_id: task_id.clone(),
            repository_url: request.repository_url,
            priority: request.priority,
            enqueued_at: Utc::now(),
            payload: request.payload,
        };
        self.push_ready(&task).await?;
        debug!(task_id, priority = task.priority, "task enqueued");
        Ok(task_id)
    }

    /// Remove and return the best ready entry whose repository is not locked,
    /// acquiring the repository lock for its task id in the same step.
    ///
    /// Returns `None` when the queue is empty for this poll, when the best
    /// candidate's repository is locked (the entry goes back with a delay
    /// penalty), or when the acquisition race was lost (the entry goes back
    /// immediately).
    pub async fn dequeue_next(&self) -> Option<QueuedTask> {
        let candidate = self.pop_candidate().await?;
        let url = candidate.repository_url.clone();

        if self.locks.is_locked(&url).await {
            debug!(
                task_id = %candidate.task_id,
                url,
                delay_ms = self.requeue_delay.as_millis() as u64,
                "repository locked, re-queueing with delay"
            );
            self.push_delayed(&candidate, self.requeue_delay).await;
            return None;
        }

        if self
            .locks
            .acquire(&url, &candidate.task_id, self.lock_ttl)
            .await
        {
            Some(candidate)
        } else {
            // Lost the race between the lock check and the acquire.
            debug!(task_id = %candidate.task_id, url, "lost lock race, re-queueing");
            self.push_ready_best_effort(&candidate).await;
            None
        }
    }

    /// Number of pending entries, including those under a delay penalty.
    pub async fn size(&self) -> usize {
        if let Some(mut conn) = self.coord.connection() {
            let ready: Result<i64, _> = redis::cmd("ZCARD")
                .arg(self.ready_key())
                .query_async(&mut conn)
                .await;
            let delayed: Result<i64, _> = redis::cmd("ZCARD")
                .arg(self.delayed_key())
                .query_async(&mut conn)
                .await;
            match (ready, delayed) {
                (Ok(r), Ok(d)) => return (r + d) as usize,
                (Err(err), _) | (_, Err(err)) => self.coord.mark_degraded("queue size", &err),
            }
        }
        let local = self.local.lock().await;
        local.ready.len() + local.delayed.len()
    }

    /// The first `limit` ready entries in dequeue order. Entries currently
    /// under a delay penalty are not included. Never mutates ordering.
    pub async fn peek(&self, limit: usize) -> Vec<QueuedTask> {
        if limit == 0 {
            return Vec::new();
        }
        if let Some(mut conn) = self.coord.connection() {
            let result: Result<Vec<String>, _> = redis::cmd("ZRANGE")
                .arg(self.ready_key())
                .arg(0)
                .arg(limit as i64 - 1)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(members) => {
                    return members
                        .iter()
                        .filter_map(|m| serde_json::from_str(m).ok())
                        .collect();
                }
                Err(err) => self.coord.mark_degraded("queue peek", &err),
            }
        }
        let local = self.local.lock().await;
        let mut entries: Vec<&ReadyEntry> = local.ready.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .take(limit)
            .map(|e| e.task.clone())
            .collect()
    }

    async fn pop_candidate(&self) -> Option<QueuedTask> {
        if let Some(mut conn) = self.coord.connection() {
            match self.pop_remote(&mut conn).await {
                Ok(task) => return task,
                Err(err) => self.coord.mark_degraded("queue dequeue", &err),
            }
        }
        let mut local = self.local.lock().await;
        local.promote();
        local.ready.pop().map(|e| e.task)
    }

    async fn pop_remote(
        &self,
        conn: &mut redis::aio::ConnectionManager,
    ) -> Result<Option<QueuedTask>, redis::RedisError> {
        self.promote_remote(conn).await?;
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(self.ready_key())
            .arg(1)
            .query_async(conn)
            .await?;
        let Some((member, _)) = popped.into_iter().next() else {
            return Ok(None);
        };
        match serde_json::from_str(&member) {
            Ok(task) => Ok(Some(task)),
            Err(err) => {
                warn!(error = %err, "dropping corrupt queue entry");
                Ok(None)
            }
        }
    }

    async fn promote_remote(
        &self,
        conn: &mut redis::aio::ConnectionManager,
    ) -> Result<(), redis::RedisError> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.delayed_key())
            .arg("-inf")
            .arg(now)
            .query_async(conn)
            .await?;
        for member in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.delayed_key())
                .arg(&member)
                .query_async(conn)
                .await?;
            if removed == 0 {
                // Another scheduler promoted it first.
                continue;
            }
            let score = match serde_json::from_str::<QueuedTask>(&member) {
                Ok(task) => ordering_score(&task),
                Err(_) => now as f64,
            };
            let _: i64 = redis::cmd("ZADD")
                .arg(self.ready_key())
                .arg(score)
                .arg(&member)
                .query_async(conn)
                .await?;
        }
        Ok(())
    }

    async fn push_ready(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let member = serde_json::to_string(task)?;
        if let Some(mut conn) = self.coord.connection() {
            let result: Result<i64, _> = redis::cmd("ZADD")
                .arg(self.ready_key())
                .arg(ordering_score(task))
                .arg(&member)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(err) => self.coord.mark_degraded("queue enqueue", &err),
            }
        }
        self.local.lock().await.ready.push(ReadyEntry {
            task: task.clone(),
        });
        Ok(())
    }

    async fn push_ready_best_effort(&self, task: &QueuedTask) {
        if let Err(err) = self.push_ready(task).await {
            warn!(task_id = %task.task_id, error = %err, "failed to re-queue entry");
        }
    }

    async fn push_delayed(&self, task: &QueuedTask, delay: Duration) {
        if let Some(mut conn) = self.coord.connection() {
            let member = match serde_json::to_string(task) {
                Ok(member) => member,
                Err(err) => {
                    warn!(task_id = %task.task_id, error = %err, "failed to encode delayed entry");
                    return;
                }
            };
            let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let result: Result<i64, _> = redis::cmd("ZADD")
                .arg(self.delayed_key())
                .arg(ready_at as f64)
                .arg(&member)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(_) => return,
                Err(err) => self.coord.mark_degraded("queue delay", &err),
            }
        }
        self.local.lock().await.delayed.push(DelayedEntry {
            ready_at: Instant::now() + delay,
            task: task.clone(),
        });
    }
}
