use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
///
/// Statuses advance `pending → planning → pr-created → implementing` and end
/// in `completed` or `failed`. Terminal records are immutable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Planning,
    PrCreated,
    Implementing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::PrCreated => "pr-created",
            Self::Implementing => "implementing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the status is terminal (`completed` or `failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "pr-created" => Ok(Self::PrCreated),
            "implementing" => Ok(Self::Implementing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a task's identity and progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub repository_url: String,
    pub status: TaskStatus,
    pub message: String,
    pub error: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Fresh `pending` record, as created at submission time.
    pub fn new(id: impl Into<String>, repository_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            repository_url: repository_url.into(),
            status: TaskStatus::Pending,
            message: String::new(),
            error: None,
            branch_name: None,
            pr_url: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Partial update applied to a task record.
///
/// Unset fields leave the stored value unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_branch_name(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    pub fn with_pr_url(mut self, url: impl Into<String>) -> Self {
        self.pr_url = Some(url.into());
        self
    }

    pub fn with_ended_now(mut self) -> Self {
        self.ended_at = Some(Utc::now());
        self
    }

    /// Apply this update to a record in place.
    pub(crate) fn apply(self, record: &mut TaskRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(message) = self.message {
            record.message = message;
        }
        if let Some(error) = self.error {
            record.error = Some(error);
        }
        if let Some(branch) = self.branch_name {
            record.branch_name = Some(branch);
        }
        if let Some(url) = self.pr_url {
            record.pr_url = Some(url);
        }
        if let Some(ended) = self.ended_at {
            record.ended_at = Some(ended);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Planning,
            TaskStatus::PrCreated,
            TaskStatus::Implementing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn pr_created_uses_kebab_case() {
        assert_eq!(TaskStatus::PrCreated.as_str(), "pr-created");
        let json = serde_json::to_string(&TaskStatus::PrCreated).unwrap();
        assert_eq!(json, "\"pr-created\"");
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Implementing.is_terminal());
    }

    #[test]
    fn invalid_status_is_rejected() {
        assert!("cancelled".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn update_applies_only_set_fields() {
        let mut record = TaskRecord::new("t-1", "https://example.com/org/repo");
        record.message = "queued".to_string();

        TaskUpdate::new()
            .with_status(TaskStatus::Planning)
            .apply(&mut record);

        assert_eq!(record.status, TaskStatus::Planning);
        assert_eq!(record.message, "queued");
        assert!(record.error.is_none());
    }

    #[test]
    fn update_sets_terminal_fields() {
        let mut record = TaskRecord::new("t-2", "https://example.com/org/repo");
        TaskUpdate::new()
            .with_status(TaskStatus::Failed)
            .with_error("remote unreachable")
            .with_ended_now()
            .apply(&mut record);

        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("remote unreachable"));
        assert!(record.ended_at.is_some());
    }
}
