//! Connection handling for the shared coordination backend.
//!
//! The lock table and task queue both run against Redis when it is
//! reachable and degrade to process-local state when it is not. This module
//! owns the connection and the degraded flag; components consult it before
//! every backend operation and report failures back through
//! [`Coordinator::mark_degraded`].
//!
//! Once degraded, a coordinator stays on the fallback path for the life of
//! the process: migrating back mid-flight would leave the two backends with
//! divergent queue and lock state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::warn;

pub struct Coordinator {
    conn: Option<ConnectionManager>,
    degraded: AtomicBool,
    prefix: String,
}

impl Coordinator {
    /// Connect to the coordination backend. A missing URL or a failed
    /// connection yields a coordinator that is degraded from the start;
    /// construction itself never fails.
    pub async fn connect(redis_url: Option<&str>, prefix: &str, timeout: Duration) -> Self {
        let conn = match redis_url {
            Some(url) => match Self::try_connect(url, timeout).await {
                Ok(conn) => Some(conn),
                Err(err) => {
                    warn!(url, error = %err, "coordination backend unreachable, using in-process fallback");
                    None
                }
            },
            None => None,
        };
        let degraded = conn.is_none();
        Self {
            conn,
            degraded: AtomicBool::new(degraded),
            prefix: prefix.to_string(),
        }
    }

    async fn try_connect(url: &str, timeout: Duration) -> Result<ConnectionManager, anyhow::Error> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(timeout, client.get_connection_manager())
            .await
            .map_err(|_| anyhow::anyhow!("connection attempt timed out after {timeout:?}"))??;
        Ok(conn)
    }

    /// Coordinator that never had a backend (for tests and single-process
    /// deployments).
    pub fn disconnected(prefix: &str) -> Self {
        Self {
            conn: None,
            degraded: AtomicBool::new(true),
            prefix: prefix.to_string(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Record a backend failure and switch to the fallback path.
    pub fn mark_degraded(&self, operation: &str, err: &redis::RedisError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(operation, error = %err, "coordination backend failed, switching to in-process fallback");
        }
    }

    /// A cloned connection handle, if the backend is still considered healthy.
    pub fn connection(&self) -> Option<ConnectionManager> {
        if self.is_degraded() {
            None
        } else {
            self.conn.clone()
        }
    }

    /// Namespaced backend key.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }
}
