use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Policy applied when a workspace has uncommitted changes at refresh time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirtyWorkspacePolicy {
    /// Shelve the dirty state; if shelving fails, hard-reset and continue.
    /// Trades loss of uncommitted changes for queue liveness.
    #[default]
    ShelveThenReset,
    /// Shelve the dirty state; if shelving fails, fail the refresh.
    ShelveOrFail,
    /// Never touch dirty state; fail the refresh immediately.
    FailFast,
}

/// Runtime configuration for the scheduling core.
///
/// Every tunable the scheduler, queue, lock table, and workspace manager
/// consume lives here; components receive the values they need at
/// construction time rather than reading ambient state.
#[derive(Debug, Clone)]
pub struct DrydockConfig {
    /// Coordination backend address. `None` runs on the in-process fallback
    /// from the start.
    pub redis_url: Option<String>,
    /// Prefix for all coordination keys, so several deployments can share
    /// one backend.
    pub key_prefix: String,
    /// Interval between scheduler dequeue attempts.
    pub poll_interval: Duration,
    /// Lease duration for repository locks.
    pub lock_ttl: Duration,
    /// Delay before a lock-blocked task becomes dequeuable again.
    pub requeue_delay: Duration,
    /// Bound on outbound operations (backend round trips, workspace refresh).
    pub op_timeout: Duration,
    /// Directory under which shared checkouts live.
    pub workspace_root: PathBuf,
    /// How to treat uncommitted changes found during workspace refresh.
    pub dirty_policy: DirtyWorkspacePolicy,
    /// Primary-branch candidates, tried in order during refresh.
    pub branch_preference: Vec<String>,
}

impl Default for DrydockConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "drydock".to_string(),
            poll_interval: Duration::from_secs(3),
            lock_ttl: Duration::from_secs(600),
            requeue_delay: Duration::from_secs(5),
            op_timeout: Duration::from_secs(30),
            workspace_root: default_workspace_root(),
            dirty_policy: DirtyWorkspacePolicy::default(),
            branch_preference: default_branch_preference(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drydock")
        .join("workspaces")
}

fn default_branch_preference() -> Vec<String> {
    ["main", "master", "trunk", "develop"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

/// Raw TOML structure for `drydock.toml`.
#[derive(Debug, Deserialize)]
struct ConfigToml {
    drydock: Option<ConfigSection>,
}

#[derive(Debug, Deserialize)]
struct ConfigSection {
    redis_url: Option<String>,
    key_prefix: Option<String>,
    poll_interval_secs: Option<u64>,
    lock_ttl_secs: Option<u64>,
    requeue_delay_secs: Option<u64>,
    op_timeout_secs: Option<u64>,
    workspace_root: Option<PathBuf>,
    dirty_policy: Option<DirtyWorkspacePolicy>,
    branch_preference: Option<Vec<String>>,
}

impl DrydockConfig {
    /// Load configuration from a `drydock.toml` file, falling back to
    /// defaults for any value the file does not set. Returns defaults if the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let toml: ConfigToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let mut config = Self::default();
        if let Some(section) = toml.drydock {
            if let Some(url) = section.redis_url {
                config.redis_url = Some(url);
            }
            if let Some(prefix) = section.key_prefix {
                config.key_prefix = prefix;
            }
            if let Some(secs) = section.poll_interval_secs {
                config.poll_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = section.lock_ttl_secs {
                config.lock_ttl = Duration::from_secs(secs);
            }
            if let Some(secs) = section.requeue_delay_secs {
                config.requeue_delay = Duration::from_secs(secs);
            }
            if let Some(secs) = section.op_timeout_secs {
                config.op_timeout = Duration::from_secs(secs);
            }
            if let Some(root) = section.workspace_root {
                config.workspace_root = root;
            }
            if let Some(policy) = section.dirty_policy {
                config.dirty_policy = policy;
            }
            if let Some(branches) = section.branch_preference {
                config.branch_preference = branches;
            }
        }

        Ok(config)
    }

    /// Set the coordination backend address.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Set the coordination key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the scheduler poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the repository lock lease duration.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the re-queue delay for lock-blocked tasks.
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// Set the bound applied to outbound operations.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Set the workspace root directory.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Set the dirty-workspace refresh policy.
    pub fn with_dirty_policy(mut self, policy: DirtyWorkspacePolicy) -> Self {
        self.dirty_policy = policy;
        self
    }
}
