//! Shared repository workspace manager.
//!
//! Maps a repository URL to a single on-disk checkout that is reused and
//! refreshed across tasks instead of re-cloned. A workspace is handed out
//! only in the `ready` state, with a clean working tree sitting on the
//! repository's primary branch, fast-forwarded from `origin`.
//!
//! Concurrent callers for the same repository are serialized on a per-entry
//! gate: the second caller waits for the in-flight clone/refresh rather than
//! triggering a duplicate. The on-disk directory itself is only ever mutated
//! by the caller holding the corresponding repository lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{BranchType, Repository, StatusOptions};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{DirtyWorkspacePolicy, DrydockConfig};
use crate::errors::WorkspaceError;
use crate::lock::RepoLockTable;
use crate::repo_url;

/// Lifecycle state of a workspace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Cloning,
    Ready,
    Refreshing,
}

/// Metadata for one shared checkout.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceRecord {
    /// Normalized repository key.
    pub key: String,
    /// Original URL, used for remote operations and lock lookups.
    pub url: String,
    pub path: PathBuf,
    pub branch: String,
    pub clean: bool,
    pub last_accessed: DateTime<Utc>,
    pub state: WorkspaceState,
}

/// What a task receives: a checkout path and the branch it sits on.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub path: PathBuf,
    pub branch: String,
}

struct WorkspaceEntry {
    record: std::sync::Mutex<Option<WorkspaceRecord>>,
    // Serializes clone/refresh per repository.
    gate: Mutex<()>,
}

impl WorkspaceEntry {
    fn new() -> Self {
        Self {
            record: std::sync::Mutex::new(None),
            gate: Mutex::new(()),
        }
    }
}

fn record_guard(entry: &WorkspaceEntry) -> MutexGuard<'_, Option<WorkspaceRecord>> {
    entry.record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Manager of shared, reusable repository checkouts under one root
/// directory.
pub struct WorkspaceManager {
    root: PathBuf,
    dirty_policy: DirtyWorkspacePolicy,
    branch_preference: Arc<Vec<String>>,
    entries: Mutex<HashMap<String, Arc<WorkspaceEntry>>>,
}

impl WorkspaceManager {
    pub fn new(config: &DrydockConfig) -> Result<Self, WorkspaceError> {
        std::fs::create_dir_all(&config.workspace_root).map_err(|source| WorkspaceError::Io {
            path: config.workspace_root.clone(),
            source,
        })?;
        Ok(Self {
            root: config.workspace_root.clone(),
            dirty_policy: config.dirty_policy,
            branch_preference: Arc::new(config.branch_preference.clone()),
            entries: Mutex::new(HashMap::new()),
        })
    }

    async fn entry_for(&self, key: &str) -> Arc<WorkspaceEntry> {
        let mut entries = self.entries.lock().await;
        Arc::clone(
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(WorkspaceEntry::new())),
        )
    }

    /// Hand out a ready checkout for the repository, cloning on first use and
    /// refreshing in place on reuse.
    pub async fn acquire(
        &self,
        url: &str,
        task_id: &str,
    ) -> Result<WorkspaceHandle, WorkspaceError> {
        let key = repo_url::normalize(url).into_string();
        let entry = self.entry_for(&key).await;
        let _gate = entry.gate.lock().await;

        let existing = record_guard(&entry).clone();
        match existing {
            Some(record) if record.path.join(".git").exists() => {
                self.refresh_existing(&entry, record, task_id).await
            }
            _ => self.clone_fresh(&entry, &key, url).await,
        }
    }

    async fn refresh_existing(
        &self,
        entry: &WorkspaceEntry,
        record: WorkspaceRecord,
        task_id: &str,
    ) -> Result<WorkspaceHandle, WorkspaceError> {
        if let Some(rec) = record_guard(entry).as_mut() {
            rec.state = WorkspaceState::Refreshing;
        }

        let url = record.url.clone();
        let path = record.path.clone();
        let task_id = task_id.to_string();
        let policy = self.dirty_policy;
        let prefs = Arc::clone(&self.branch_preference);
        let result = tokio::task::spawn_blocking(move || {
            refresh_checkout(&url, &path, &task_id, policy, &prefs)
        })
        .await
        .map_err(|e| anyhow::anyhow!("workspace refresh task panicked: {e}"))?;

        match result {
            Ok(branch) => {
                let mut guard = record_guard(entry);
                if let Some(rec) = guard.as_mut() {
                    rec.state = WorkspaceState::Ready;
                    rec.branch = branch.clone();
                    rec.clean = true;
                    rec.last_accessed = Utc::now();
                }
                debug!(key = %record.key, branch, "workspace refreshed");
                Ok(WorkspaceHandle {
                    path: record.path,
                    branch,
                })
            }
            Err(WorkspaceError::NotACheckout { path }) => {
                // Unrecoverable corruption: the directory was removed so the
                // next attempt re-clones.
                *record_guard(entry) = None;
                warn!(key = %record.key, "workspace checkout corrupt, evicted");
                Err(WorkspaceError::NotACheckout { path })
            }
            Err(err) => {
                // The record survives for the next attempt.
                let mut guard = record_guard(entry);
                if let Some(rec) = guard.as_mut() {
                    rec.state = WorkspaceState::Ready;
                    rec.clean = false;
                }
                Err(err)
            }
        }
    }

    async fn clone_fresh(
        &self,
        entry: &WorkspaceEntry,
        key: &str,
        url: &str,
    ) -> Result<WorkspaceHandle, WorkspaceError> {
        let path = self.root.join(repo_url::workspace_dir_name(url));
        *record_guard(entry) = Some(WorkspaceRecord {
            key: key.to_string(),
            url: url.to_string(),
            path: path.clone(),
            branch: String::new(),
            clean: false,
            last_accessed: Utc::now(),
            state: WorkspaceState::Cloning,
        });

        let clone_url = url.to_string();
        let clone_path = path.clone();
        let prefs = Arc::clone(&self.branch_preference);
        let result =
            tokio::task::spawn_blocking(move || clone_checkout(&clone_url, &clone_path, &prefs))
                .await
                .map_err(|e| anyhow::anyhow!("workspace clone task panicked: {e}"))?;

        match result {
            Ok(branch) => {
                let mut guard = record_guard(entry);
                if let Some(rec) = guard.as_mut() {
                    rec.state = WorkspaceState::Ready;
                    rec.branch = branch.clone();
                    rec.clean = true;
                    rec.last_accessed = Utc::now();
                }
                info!(key, path = %path.display(), branch, "workspace cloned");
                Ok(WorkspaceHandle { path, branch })
            }
            Err(err) => {
                *record_guard(entry) = None;
                Err(err)
            }
        }
    }

    /// Snapshot of all known workspaces.
    pub async fn list(&self) -> Vec<WorkspaceRecord> {
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter_map(|entry| record_guard(entry).clone())
            .collect()
    }

    /// Snapshot of the workspace for a repository, if one is known.
    pub async fn get(&self, url: &str) -> Option<WorkspaceRecord> {
        let key = repo_url::normalize(url).into_string();
        let entries = self.entries.lock().await;
        entries.get(&key).and_then(|entry| record_guard(entry).clone())
    }

    /// Delete workspaces whose last access is older than `max_age`, skipping
    /// any repository that currently holds a live lock. Returns the keys of
    /// the removed workspaces.
    pub async fn cleanup_older_than(
        &self,
        max_age: Duration,
        locks: &RepoLockTable,
    ) -> Vec<String> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - max_age;
        let candidates: Vec<(String, Arc<WorkspaceEntry>)> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };

        let mut removed = Vec::new();
        for (key, entry) in candidates {
            let Some(record) = record_guard(&entry).clone() else {
                continue;
            };
            if record.last_accessed >= cutoff {
                continue;
            }
            if locks.is_locked(&record.url).await {
                debug!(key, "skipping cleanup of locked repository");
                continue;
            }
            // Wait out any in-flight clone/refresh, then re-check.
            let _gate = entry.gate.lock().await;
            let still_old = record_guard(&entry)
                .as_ref()
                .is_some_and(|rec| rec.last_accessed < cutoff);
            if !still_old {
                continue;
            }
            if let Err(err) = std::fs::remove_dir_all(&record.path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(key, error = %err, "failed to remove workspace directory");
                continue;
            }
            *record_guard(&entry) = None;
            self.entries.lock().await.remove(&key);
            info!(key, path = %record.path.display(), "workspace evicted");
            removed.push(key);
        }
        removed
    }

    /// Rebuild workspace records from valid checkouts already present under
    /// the root directory. Returns how many were recovered.
    pub async fn reconcile(&self) -> Result<usize, WorkspaceError> {
        let root = self.root.clone();
        let found = tokio::task::spawn_blocking(move || scan_checkouts(&root))
            .await
            .map_err(|e| anyhow::anyhow!("workspace scan task panicked: {e}"))??;

        let mut recovered = 0;
        for record in found {
            let entry = self.entry_for(&record.key).await;
            let _gate = entry.gate.lock().await;
            let mut guard = record_guard(&entry);
            if guard.is_none() {
                debug!(key = %record.key, path = %record.path.display(), "workspace reconciled");
                *guard = Some(record);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    #[cfg(test)]
    pub(crate) async fn set_last_accessed(&self, url: &str, when: DateTime<Utc>) {
        let key = repo_url::normalize(url).into_string();
        let entries = self.entries.lock().await;
        if let Some(entry) = entries.get(&key)
            && let Some(rec) = record_guard(entry).as_mut()
        {
            rec.last_accessed = when;
        }
    }
}

fn git_err(path: &Path) -> impl Fn(git2::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Git {
        path: path.to_path_buf(),
        source,
    }
}

/// Clone `url` into `path`, replacing any stale directory first. Returns the
/// branch the checkout sits on.
fn clone_checkout(url: &str, path: &Path, prefs: &[String]) -> Result<String, WorkspaceError> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let repo = git2::build::RepoBuilder::new()
        .clone(url, path)
        .map_err(|source| WorkspaceError::CloneFailed {
            url: url.to_string(),
            source,
        })?;
    let branch = select_branch(&repo, prefs, path)?;
    checkout_branch(&repo, &branch, path)?;
    Ok(branch)
}

/// Refresh an existing checkout in place: shelve or reset dirty state per
/// policy, switch to the primary branch, fast-forward from origin. Returns
/// the branch the checkout sits on.
fn refresh_checkout(
    url: &str,
    path: &Path,
    task_id: &str,
    policy: DirtyWorkspacePolicy,
    prefs: &[String],
) -> Result<String, WorkspaceError> {
    let mut repo = match Repository::open(path) {
        Ok(repo) => repo,
        Err(_) => {
            // The directory is beyond use; evict it so the next attempt
            // re-clones.
            let _ = std::fs::remove_dir_all(path);
            return Err(WorkspaceError::NotACheckout {
                path: path.to_path_buf(),
            });
        }
    };

    if is_dirty(&repo, path)? {
        settle_dirty_state(&mut repo, path, task_id, policy)?;
    }

    let branch = select_branch(&repo, prefs, path)?;
    checkout_branch(&repo, &branch, path)?;
    fast_forward(&repo, &branch, url, path)?;
    Ok(branch)
}

fn is_dirty(repo: &Repository, path: &Path) -> Result<bool, WorkspaceError> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts)).map_err(git_err(path))?;
    Ok(!statuses.is_empty())
}

fn settle_dirty_state(
    repo: &mut Repository,
    path: &Path,
    task_id: &str,
    policy: DirtyWorkspacePolicy,
) -> Result<(), WorkspaceError> {
    if policy == DirtyWorkspacePolicy::FailFast {
        return Err(WorkspaceError::DirtyWorkspace {
            path: path.to_path_buf(),
        });
    }

    let sig = git2::Signature::now("drydock", "drydock@localhost").map_err(git_err(path))?;
    let message = format!("drydock: shelved for task {task_id}");
    match repo.stash_save(&sig, &message, Some(git2::StashFlags::INCLUDE_UNTRACKED)) {
        Ok(_) => {
            info!(path = %path.display(), task_id, "shelved dirty workspace state");
            Ok(())
        }
        Err(source) if policy == DirtyWorkspacePolicy::ShelveOrFail => {
            Err(WorkspaceError::ShelveFailed {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(source) => {
            // Shelving failed; discard the dirty state in favor of queue
            // liveness.
            warn!(path = %path.display(), error = %source, "shelve failed, hard-resetting workspace");
            hard_reset(repo, path)
        }
    }
}

fn hard_reset(repo: &Repository, path: &Path) -> Result<(), WorkspaceError> {
    let head = repo
        .head()
        .and_then(|h| h.peel(git2::ObjectType::Commit))
        .map_err(git_err(path))?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force().remove_untracked(true);
    repo.reset(&head, git2::ResetType::Hard, Some(&mut checkout))
        .map_err(git_err(path))
}

fn select_branch(
    repo: &Repository,
    prefs: &[String],
    path: &Path,
) -> Result<String, WorkspaceError> {
    for name in prefs {
        if repo.find_branch(name, BranchType::Local).is_ok() {
            return Ok(name.clone());
        }
    }
    let mut branches = repo
        .branches(Some(BranchType::Local))
        .map_err(git_err(path))?;
    if let Some(first) = branches.next() {
        let (branch, _) = first.map_err(git_err(path))?;
        if let Some(name) = branch.name().map_err(git_err(path))? {
            return Ok(name.to_string());
        }
    }
    Err(WorkspaceError::NoUsableBranch {
        path: path.to_path_buf(),
    })
}

fn checkout_branch(repo: &Repository, branch: &str, path: &Path) -> Result<(), WorkspaceError> {
    repo.set_head(&format!("refs/heads/{branch}"))
        .map_err(git_err(path))?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout)).map_err(git_err(path))
}

fn fast_forward(
    repo: &Repository,
    branch: &str,
    url: &str,
    path: &Path,
) -> Result<(), WorkspaceError> {
    let mut remote = repo.find_remote("origin").map_err(git_err(path))?;
    remote
        .fetch(&[branch], None, None)
        .map_err(|source| WorkspaceError::FetchFailed {
            url: url.to_string(),
            source,
        })?;

    let fetch_head = repo.find_reference("FETCH_HEAD").map_err(git_err(path))?;
    let fetched = repo
        .reference_to_annotated_commit(&fetch_head)
        .map_err(git_err(path))?;
    let (analysis, _) = repo.merge_analysis(&[&fetched]).map_err(git_err(path))?;

    if analysis.is_up_to_date() {
        return Ok(());
    }
    if !analysis.is_fast_forward() {
        return Err(WorkspaceError::NotFastForward {
            branch: branch.to_string(),
        });
    }

    let refname = format!("refs/heads/{branch}");
    let mut reference = repo.find_reference(&refname).map_err(git_err(path))?;
    reference
        .set_target(fetched.id(), "fast-forward")
        .map_err(git_err(path))?;
    repo.set_head(&refname).map_err(git_err(path))?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout)).map_err(git_err(path))
}

/// Scan the workspace root for valid checkouts and rebuild their records.
fn scan_checkouts(root: &Path) -> Result<Vec<WorkspaceRecord>, WorkspaceError> {
    let entries = std::fs::read_dir(root).map_err(|source| WorkspaceError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| WorkspaceError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(repo) = Repository::open(&path) else {
            continue;
        };
        let Some(url) = repo
            .find_remote("origin")
            .ok()
            .and_then(|r| r.url().map(str::to_string))
        else {
            continue;
        };
        let branch = repo
            .head()
            .ok()
            .and_then(|h| h.shorthand().map(str::to_string))
            .unwrap_or_default();
        let clean = is_dirty(&repo, &path).map(|dirty| !dirty).unwrap_or(false);
        let last_accessed = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        found.push(WorkspaceRecord {
            key: repo_url::normalize(&url).into_string(),
            url,
            path,
            branch,
            clean,
            last_accessed,
            state: WorkspaceState::Ready,
        });
    }
    Ok(found)
}
