//! End-to-end scenarios for the scheduling core.
//!
//! These tests run against the in-process coordination fallback (no backend
//! configured), an in-memory SQLite task store, and real git repositories in
//! temporary directories.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use drydock::{
    Drydock, DrydockConfig, EnqueueRequest, ProcessOutcome, QueuedTask, SqliteTaskStore,
    TaskProcessor, TaskStatus, TaskStore, WorkspaceHandle,
};
use git2::Repository;
use tempfile::tempdir;
use tokio::sync::Mutex;

fn commit_file(repo_dir: &Path, name: &str, content: &str, msg: &str) {
    let repo = Repository::open(repo_dir).unwrap();
    std::fs::write(repo_dir.join(name), content).unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("test", "test@test.com").unwrap();
    if let Ok(head) = repo.head() {
        let parent = head.peel_to_commit().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
            .unwrap();
    } else {
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
            .unwrap();
    }
}

fn init_origin(base: &Path) -> String {
    let origin = base.join("origin");
    let repo = Repository::init(&origin).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    drop(config);
    drop(repo);
    commit_file(&origin, "README.md", "hello\n", "init");
    origin.to_string_lossy().to_string()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn core(base: &Path) -> Drydock {
    init_tracing();
    let config = DrydockConfig::default()
        .with_workspace_root(base.join("ws"))
        .with_poll_interval(Duration::from_millis(20))
        .with_requeue_delay(Duration::from_millis(30))
        .with_lock_ttl(Duration::from_secs(60));
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
    Drydock::new(config, store).await.unwrap()
}

/// Records which tasks ran, in order.
struct RecordingProcessor {
    seen: Mutex<Vec<String>>,
}

impl RecordingProcessor {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TaskProcessor for RecordingProcessor {
    async fn process(
        &self,
        task: &QueuedTask,
        workspace: &WorkspaceHandle,
    ) -> Result<ProcessOutcome> {
        assert!(workspace.path.join(".git").exists());
        self.seen.lock().await.push(task.task_id.clone());
        Ok(ProcessOutcome {
            message: format!("processed {}", task.task_id),
            branch_name: Some(workspace.branch.clone()),
            pr_url: None,
        })
    }
}

/// Holds each task mid-flight until the test lets it finish, so a lock can
/// be observed while genuinely held.
struct GatedProcessor {
    started: tokio::sync::Notify,
    release: tokio::sync::Notify,
}

impl GatedProcessor {
    fn new() -> Self {
        Self {
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        }
    }
}

#[async_trait]
impl TaskProcessor for GatedProcessor {
    async fn process(
        &self,
        task: &QueuedTask,
        _workspace: &WorkspaceHandle,
    ) -> Result<ProcessOutcome> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(ProcessOutcome {
            message: format!("processed {}", task.task_id),
            ..ProcessOutcome::default()
        })
    }
}

#[tokio::test]
async fn same_repository_tasks_run_one_at_a_time() {
    let dir = tempdir().unwrap();
    let origin = init_origin(dir.path());
    let core = core(dir.path()).await;

    core.queue
        .enqueue(
            EnqueueRequest::new(&origin)
                .with_task_id("high")
                .with_priority(5),
        )
        .await
        .unwrap();
    core.queue
        .enqueue(
            EnqueueRequest::new(&origin)
                .with_task_id("low")
                .with_priority(1),
        )
        .await
        .unwrap();

    // First poll: the high-priority task dequeues, acquires the lock, and
    // parks inside the processor with the lock held.
    let gated = Arc::new(GatedProcessor::new());
    let first = tokio::spawn({
        let scheduler = Arc::clone(&core.scheduler);
        let gated = Arc::clone(&gated);
        async move { scheduler.run_once(gated.as_ref()).await }
    });
    gated.started.notified().await;
    assert_eq!(core.locks.holder(&origin).await.as_deref(), Some("high"));

    // Second poll while the lock is held: the other entry returns to the
    // queue with a delay penalty and this poll yields nothing.
    let plain = RecordingProcessor::new();
    assert!(core.scheduler.run_once(&plain).await.is_none());

    // Let the first task finish; its lock is released.
    gated.release.notify_one();
    assert_eq!(first.await.unwrap().as_deref(), Some("high"));
    assert!(!core.locks.is_locked(&origin).await);

    // After the penalty elapses the blocked task runs.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(core.scheduler.run_once(&plain).await.as_deref(), Some("low"));

    for id in ["high", "low"] {
        let record = core.store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed, "task {id}");
        assert!(record.ended_at.is_some());
    }
    assert!(!core.locks.is_locked(&origin).await);
}

#[tokio::test]
async fn equivalent_url_spellings_share_lock_and_workspace() {
    let dir = tempdir().unwrap();
    let origin = init_origin(dir.path());
    let core = core(dir.path()).await;
    let processor = RecordingProcessor::new();

    // The same repository spelled two ways: trailing slash and unchanged.
    core.queue
        .enqueue(
            EnqueueRequest::new(format!("{origin}/"))
                .with_task_id("a")
                .with_priority(2),
        )
        .await
        .unwrap();
    core.queue
        .enqueue(EnqueueRequest::new(&origin).with_task_id("b"))
        .await
        .unwrap();

    // Task a parks mid-flight holding the lock under its spelling; the
    // other spelling observes the same lock and task b cannot dequeue.
    let gated = Arc::new(GatedProcessor::new());
    let first = tokio::spawn({
        let scheduler = Arc::clone(&core.scheduler);
        let gated = Arc::clone(&gated);
        async move { scheduler.run_once(gated.as_ref()).await }
    });
    gated.started.notified().await;
    assert!(core.locks.is_locked(&origin).await);
    assert!(core.locks.is_locked(&format!("{origin}/")).await);
    assert!(core.scheduler.run_once(&processor).await.is_none());

    gated.release.notify_one();
    assert_eq!(first.await.unwrap().as_deref(), Some("a"));

    // Same lock key released: task b runs after its penalty.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let second = core.scheduler.run_once(&processor).await;
    assert_eq!(second.as_deref(), Some("b"));

    // One workspace, not two.
    assert_eq!(core.workspaces.list().await.len(), 1);
}

#[tokio::test]
async fn backend_unavailable_from_the_start_still_schedules() {
    let dir = tempdir().unwrap();
    let origin = init_origin(dir.path());

    // Point the queue at a coordination backend that does not exist; every
    // operation must degrade to the in-process path.
    let config = DrydockConfig::default()
        .with_redis_url("redis://192.0.2.1:1/")
        .with_op_timeout(Duration::from_millis(200))
        .with_workspace_root(dir.path().join("ws"))
        .with_requeue_delay(Duration::from_millis(30));
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
    let core = Drydock::new(config, store).await.unwrap();
    let processor = RecordingProcessor::new();

    core.queue
        .enqueue(
            EnqueueRequest::new(&origin)
                .with_task_id("second")
                .with_priority(1),
        )
        .await
        .unwrap();
    core.queue
        .enqueue(
            EnqueueRequest::new(&origin)
                .with_task_id("first")
                .with_priority(9),
        )
        .await
        .unwrap();
    assert_eq!(core.queue.size().await, 2);

    // Priority ordering holds on the fallback path.
    assert_eq!(
        core.scheduler.run_once(&processor).await.as_deref(),
        Some("first")
    );
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        core.scheduler.run_once(&processor).await.as_deref(),
        Some("second")
    );
}

#[tokio::test]
async fn workspace_is_reused_and_refreshed_across_tasks() {
    let dir = tempdir().unwrap();
    let origin = init_origin(dir.path());
    let core = core(dir.path()).await;
    let processor = RecordingProcessor::new();

    core.queue
        .enqueue(EnqueueRequest::new(&origin).with_task_id("t-1"))
        .await
        .unwrap();
    core.scheduler.run_once(&processor).await.unwrap();
    let first_path = core.workspaces.get(&origin).await.unwrap().path;

    // New upstream commit between tasks.
    commit_file(Path::new(&origin), "feature.txt", "new\n", "add feature");

    core.queue
        .enqueue(EnqueueRequest::new(&origin).with_task_id("t-2"))
        .await
        .unwrap();
    core.scheduler.run_once(&processor).await.unwrap();

    let record = core.workspaces.get(&origin).await.unwrap();
    assert_eq!(record.path, first_path);
    assert!(first_path.join("feature.txt").exists());
}

#[tokio::test]
async fn blocked_task_eventually_runs_under_the_poll_loop() {
    let dir = tempdir().unwrap();
    let origin = init_origin(dir.path());
    let core = core(dir.path()).await;

    // An outside holder blocks the repository, then releases it shortly
    // after; the queued task must run once the lock is gone.
    core.locks
        .acquire(&origin, "outside", Duration::from_secs(60))
        .await;
    core.queue
        .enqueue(EnqueueRequest::new(&origin).with_task_id("t-1"))
        .await
        .unwrap();

    let scheduler = Arc::clone(&core.scheduler);
    let loop_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move {
            scheduler.run(Arc::new(RecordingProcessor::new())).await;
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = core.store.get("t-1").await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Pending);

    core.locks.release(&origin, "outside").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let record = core.store.get("t-1").await.unwrap().unwrap();
        if record.status == TaskStatus::Completed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "blocked task never ran after release"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    core.scheduler.shutdown();
    loop_handle.await.unwrap();
}

#[tokio::test]
async fn expired_lease_unblocks_the_repository() {
    let dir = tempdir().unwrap();
    let origin = init_origin(dir.path());
    let core = core(dir.path()).await;
    let processor = RecordingProcessor::new();

    // A crashed worker's lease: never released, short TTL.
    core.locks
        .acquire(&origin, "crashed", Duration::from_millis(40))
        .await;
    core.queue
        .enqueue(EnqueueRequest::new(&origin).with_task_id("t-1"))
        .await
        .unwrap();

    assert!(core.scheduler.run_once(&processor).await.is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        core.scheduler.run_once(&processor).await.as_deref(),
        Some("t-1")
    );
}

#[tokio::test]
async fn status_surfaces_reflect_progress() {
    let dir = tempdir().unwrap();
    let origin = init_origin(dir.path());
    let core = core(dir.path()).await;
    let processor = RecordingProcessor::new();

    core.queue
        .enqueue(EnqueueRequest::new(&origin).with_task_id("t-1"))
        .await
        .unwrap();
    core.queue
        .enqueue(
            EnqueueRequest::new("https://example.com/other/repo").with_task_id("t-2"),
        )
        .await
        .unwrap();

    let by_repo = core.store.list_by_repository(&origin).await.unwrap();
    assert_eq!(by_repo.len(), 1);
    assert_eq!(by_repo[0].id, "t-1");

    core.scheduler.run_once(&processor).await;
    core.scheduler.run_once(&processor).await;

    let completed = core.store.list_by_status(TaskStatus::Completed).await.unwrap();
    let failed = core.store.list_by_status(TaskStatus::Failed).await.unwrap();
    // t-1 completed against the real repository; t-2 failed to clone its
    // nonexistent one. Both locks are released either way.
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, "t-1");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, "t-2");
    assert!(!core.locks.is_locked(&origin).await);
    assert!(!core.locks.is_locked("https://example.com/other/repo").await);

    assert_eq!(core.store.list_all().await.unwrap().len(), 2);
}
