//! Per-repository mutual-exclusion leases with TTL.
//!
//! A lock is a lease: it expires on its own if the holder never releases it,
//! so a crashed worker cannot starve a repository forever. Acquisition is an
//! atomic create-if-absent; release is a compare-and-delete that only takes
//! effect while the caller is still the recognized holder.
//!
//! Backend layout: one Redis string per repository at
//! `<prefix>:lock:<normalized-url>` holding the task id, with a PX expiry.
//! When the backend is unreachable the table degrades to a process-local map
//! with the same semantics; the map is owned by this instance, not shared
//! process state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::coord::Coordinator;
use crate::repo_url;

// Deletes the lock only while it is still held by the given task id.
// Handed to the backend as one script invocation so check-and-delete is
// indivisible with respect to concurrent acquires.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
struct LocalLease {
    holder: String,
    acquired_at: Instant,
    ttl: Duration,
}

impl LocalLease {
    fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() > self.ttl
    }
}

/// Table of per-repository leases.
pub struct RepoLockTable {
    coord: Arc<Coordinator>,
    local: Mutex<HashMap<String, LocalLease>>,
}

impl RepoLockTable {
    pub fn new(coord: Arc<Coordinator>) -> Self {
        Self {
            coord,
            local: Mutex::new(HashMap::new()),
        }
    }

    fn backend_key(&self, url: &str) -> String {
        self.coord
            .key(&format!("lock:{}", repo_url::normalize(url)))
    }

    /// Whether a live (non-expired) lock exists for the repository.
    pub async fn is_locked(&self, url: &str) -> bool {
        self.holder(url).await.is_some()
    }

    /// Current holder of the repository's lock, if a live lock exists.
    pub async fn holder(&self, url: &str) -> Option<String> {
        if let Some(mut conn) = self.coord.connection() {
            let key = self.backend_key(url);
            let result: Result<Option<String>, _> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(holder) => return holder,
                Err(err) => self.coord.mark_degraded("lock get", &err),
            }
        }
        self.holder_local(url).await
    }

    async fn holder_local(&self, url: &str) -> Option<String> {
        let key = repo_url::normalize(url).into_string();
        let mut table = self.local.lock().await;
        match table.get(&key) {
            Some(lease) if lease.is_expired() => {
                // Expired leases are treated as absent and cleaned up on read.
                table.remove(&key);
                None
            }
            Some(lease) => Some(lease.holder.clone()),
            None => None,
        }
    }

    /// Atomic create-if-absent. Returns false on contention, never blocks.
    pub async fn acquire(&self, url: &str, task_id: &str, ttl: Duration) -> bool {
        if let Some(mut conn) = self.coord.connection() {
            let key = self.backend_key(url);
            let ttl_ms = ttl.as_millis().max(1) as u64;
            let result: Result<Option<String>, _> = redis::cmd("SET")
                .arg(&key)
                .arg(task_id)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(reply) => {
                    let won = reply.is_some();
                    debug!(url, task_id, won, "lock acquire");
                    return won;
                }
                Err(err) => self.coord.mark_degraded("lock acquire", &err),
            }
        }
        self.acquire_local(url, task_id, ttl).await
    }

    async fn acquire_local(&self, url: &str, task_id: &str, ttl: Duration) -> bool {
        let key = repo_url::normalize(url).into_string();
        let mut table = self.local.lock().await;
        match table.get(&key) {
            Some(lease) if !lease.is_expired() => false,
            _ => {
                table.insert(
                    key,
                    LocalLease {
                        holder: task_id.to_string(),
                        acquired_at: Instant::now(),
                        ttl,
                    },
                );
                debug!(url, task_id, "lock acquired (local)");
                true
            }
        }
    }

    /// Compare-and-delete release: a no-op unless the lock is currently held
    /// by `task_id`.
    pub async fn release(&self, url: &str, task_id: &str) {
        if let Some(mut conn) = self.coord.connection() {
            let key = self.backend_key(url);
            let result: Result<i64, _> = redis::Script::new(RELEASE_SCRIPT)
                .key(&key)
                .arg(task_id)
                .invoke_async(&mut conn)
                .await;
            match result {
                Ok(deleted) => {
                    debug!(url, task_id, deleted, "lock release");
                    return;
                }
                Err(err) => self.coord.mark_degraded("lock release", &err),
            }
        }
        self.release_local(url, task_id).await;
    }

    async fn release_local(&self, url: &str, task_id: &str) {
        let key = repo_url::normalize(url).into_string();
        let mut table = self.local.lock().await;
        if let Some(lease) = table.get(&key)
            && !lease.is_expired()
            && lease.holder != task_id
        {
            // Held by someone else: leave it alone.
            return;
        }
        table.remove(&key);
    }

    /// Delete all expired locks. Returns how many were removed.
    ///
    /// The backend expires its keys on its own; the scan also drops any key
    /// that somehow lost its expiry so a malformed write cannot pin a
    /// repository forever.
    pub async fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        if let Some(mut conn) = self.coord.connection() {
            match self.sweep_remote(&mut conn).await {
                Ok(count) => removed += count,
                Err(err) => self.coord.mark_degraded("lock sweep", &err),
            }
        }
        let mut table = self.local.lock().await;
        let before = table.len();
        table.retain(|_, lease| !lease.is_expired());
        removed + (before - table.len())
    }

    async fn sweep_remote(
        &self,
        conn: &mut redis::aio::ConnectionManager,
    ) -> Result<usize, redis::RedisError> {
        let pattern = self.coord.key("lock:*");
        let mut removed = 0;
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(conn)
                .await?;
            for key in keys {
                let ttl: i64 = redis::cmd("PTTL").arg(&key).query_async(conn).await?;
                // -1: key exists without an expiry; -2: already gone.
                if ttl == -1 {
                    let deleted: i64 = redis::cmd("DEL").arg(&key).query_async(conn).await?;
                    removed += deleted as usize;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}
