use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

/// Unique identifier of a durable task. Time-ordered (UUID v7) so storage
/// indexes and log lines sort by creation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority. Higher values are assigned to resources first.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }
}

impl Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a task.
///
/// Legal transitions:
///
/// ```text
/// pending → processing → completed | failed | timeout
/// pending | processing → cancelled
/// pending → timeout            (sweeper, task never started)
/// failed → pending             (retry, attempts remaining)
/// ```
///
/// Everything else is rejected as
/// [`TaskError::InvalidTransition`](crate::error::TaskError::InvalidTransition).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "timeout" => Some(TaskStatus::Timeout),
            _ => None,
        }
    }

    /// Terminal statuses never change again except `Failed`, which may be
    /// retried back to `Pending` while attempts remain.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Timeout
        )
    }

    /// Whether moving from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (
                TaskStatus::Pending,
                TaskStatus::Processing | TaskStatus::Cancelled | TaskStatus::Timeout
            ) | (
                TaskStatus::Processing,
                TaskStatus::Completed
                    | TaskStatus::Failed
                    | TaskStatus::Cancelled
                    | TaskStatus::Timeout
            ) | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable record of one asynchronous translation job.
///
/// Mutated only through [`TaskStore`](crate::store::TaskStore); fields are
/// public for reads, snapshots, and test assertions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Completion percentage in `[0, 100]`.
    pub progress: f32,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Age bound in seconds; the sweep pass times the task out past this.
    pub timeout_seconds: u64,
    pub client_id: String,
    pub source_lang: String,
    pub target_lang: String,
    pub via_pivot: bool,
    pub file_count: u32,
    pub total_bytes: u64,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// True when a non-terminal task has outlived its timeout budget.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.age(now) > Duration::seconds(self.timeout_seconds as i64)
    }
}

/// Parameters for creating a task. `max_retries` and `timeout_seconds`
/// default from [`TaskPolicy`](crate::config::TaskPolicy) when unset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskParams {
    pub client_id: String,
    pub source_lang: String,
    pub target_lang: String,
    pub via_pivot: bool,
    pub file_count: u32,
    pub total_bytes: u64,
    pub priority: TaskPriority,
    pub max_retries: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

impl TaskParams {
    pub fn new(
        client_id: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            via_pivot: false,
            file_count: 1,
            total_bytes: 0,
            priority: TaskPriority::Normal,
            max_retries: None,
            timeout_seconds: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_pivot(mut self, via_pivot: bool) -> Self {
        self.via_pivot = via_pivot;
        self
    }

    pub fn with_files(mut self, file_count: u32, total_bytes: u64) -> Self {
        self.file_count = file_count;
        self.total_bytes = total_bytes;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }
}
