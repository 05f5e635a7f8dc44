//! Durable task lifecycle store.
//!
//! [`TaskStore`] is the persistence seam for tasks, their queue entries,
//! and the accelerator resources the scheduler binds them to.
//! [`TaskSweeper`] carries the background sweep operations so callers that
//! only submit and query tasks never see them. The crate ships a Postgres
//! implementation behind the `postgres` feature; the testkit provides an
//! in-memory one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::task::{Task, TaskId, TaskParams, TaskPriority, TaskStatus};

/// Trait for durable task lifecycle backends.
///
/// Implementors persist tasks with their queue entries, validate status
/// transitions against the task state machine, and track accelerator
/// resources. All mutations are single-row transactions: callers touching
/// the same task serialize on its row, different tasks never block each
/// other.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task and its queue entry in one transaction.
    ///
    /// Fails with [`TaskError::CapacityExceeded`] when the number of
    /// non-terminal tasks has reached the configured `max_active_tasks`.
    async fn create(&self, params: TaskParams) -> Result<Task, TaskError>;

    /// Fetch one task.
    async fn get(&self, task_id: TaskId) -> Result<Task, TaskError>;

    /// List tasks newest-first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Task>, TaskError>;

    /// Apply a status transition, validating it against the state machine.
    ///
    /// Stamps `started_at` on entering Processing and `completed_at` on
    /// entering a terminal state; terminal entry also removes the queue
    /// entry and frees any bound resource. An illegal transition fails
    /// with [`TaskError::InvalidTransition`] and mutates nothing.
    async fn transition(
        &self,
        task_id: TaskId,
        new_status: TaskStatus,
        progress: Option<f32>,
        error: Option<String>,
    ) -> Result<Task, TaskError>;

    /// Cancel a pending or processing task.
    async fn cancel(&self, task_id: TaskId, reason: Option<String>) -> Result<Task, TaskError>;

    /// Re-enqueue a failed task for another attempt.
    ///
    /// Increments `retry_count`, resets progress and error, and restores
    /// the queue entry. Refuses with [`TaskError::RetryExhausted`] once
    /// `retry_count` has reached `max_retries`, mutating nothing.
    async fn retry(&self, task_id: TaskId) -> Result<Task, TaskError>;

    /// Update the progress of a processing task.
    async fn update_progress(
        &self,
        task_id: TaskId,
        progress: f32,
        message: Option<String>,
    ) -> Result<Task, TaskError>;

    /// Delete a task and its queue entry.
    async fn delete(&self, task_id: TaskId) -> Result<(), TaskError>;

    /// Number of non-terminal tasks.
    async fn active_count(&self) -> Result<u64, TaskError>;

    /// Per-status task counts and the success rate over finished tasks.
    async fn metrics(&self) -> Result<TaskMetrics, TaskError>;

    /// Queue occupancy and resource availability at a point in time.
    async fn queue_status(&self) -> Result<QueueSummary, TaskError>;

    /// Unassigned queue entries, highest priority first, FIFO within a
    /// priority, capped at `limit`.
    async fn pending_unassigned(&self, limit: usize) -> Result<Vec<QueueEntry>, TaskError>;

    /// Available, unbound resources ordered by free memory, most first.
    async fn available_resources(&self) -> Result<Vec<Resource>, TaskError>;

    /// Atomically bind a resource to a task and flip the task to
    /// Processing.
    ///
    /// Concurrent schedulers racing for the same entry must not
    /// double-assign; losers fail with [`TaskError::InvalidTransition`]
    /// or [`TaskError::NotFound`].
    async fn assign(&self, task_id: TaskId, resource_id: &str) -> Result<Task, TaskError>;

    /// Insert or refresh a resource from probe telemetry.
    async fn upsert_resource(&self, telemetry: ResourceTelemetry) -> Result<(), TaskError>;

    /// Flag a resource whose probe failed, keeping its last known
    /// availability.
    async fn mark_resource_stale(&self, resource_id: &str) -> Result<(), TaskError>;
}

/// Trait for the scheduler's background sweep passes.
///
/// Split from [`TaskStore`] so components that only submit and query
/// tasks are not written against reaping operations.
#[async_trait]
pub trait TaskSweeper: Send + Sync {
    /// Release the queue entries and resource bindings of terminal tasks.
    ///
    /// The only path that returns a resource to availability. Idempotent:
    /// a second call over the same state is a no-op.
    async fn release_terminal_bindings(&self) -> Result<Vec<ReleasedBinding>, TaskError>;

    /// Flip pending or processing tasks whose age (from `created_at`)
    /// exceeds their `timeout_seconds` to Timeout, returning the flipped
    /// tasks.
    async fn mark_overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError>;

    /// Delete terminal tasks that finished before `cutoff`, returning the
    /// number removed.
    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, TaskError>;
}

/// One waiting or assigned queue position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: TaskPriority,
    pub enqueued_at: DateTime<Utc>,
    /// Resource this entry is bound to, if the task is being processed.
    pub assigned_resource_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn is_assigned(&self) -> bool {
        self.assigned_resource_id.is_some()
    }
}

/// Tracked state of one accelerator resource.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: String,
    pub device_name: String,
    /// Bytes of device memory.
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    /// Device utilization fraction in `[0, 1]`.
    pub utilization: f64,
    /// Degrees Celsius, when the device reports it.
    pub temperature: Option<f64>,
    /// Whether the scheduler may bind a task to this resource.
    pub is_available: bool,
    pub current_task_id: Option<TaskId>,
    pub updated_at: DateTime<Utc>,
    /// Set when the last probe failed; `is_available` is then the last
    /// known value, not a fresh reading.
    pub stale: bool,
}

/// One probe reading for a resource, consumed by
/// [`TaskStore::upsert_resource`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceTelemetry {
    pub resource_id: String,
    pub device_name: String,
    pub memory_total: u64,
    pub memory_used: u64,
    pub utilization: f64,
    pub temperature: Option<f64>,
}

impl ResourceTelemetry {
    pub fn memory_free(&self) -> u64 {
        self.memory_total.saturating_sub(self.memory_used)
    }
}

/// Per-status task counts.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timeout: u64,
}

impl TaskMetrics {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled + self.timeout
    }

    /// Non-terminal tasks.
    pub fn active(&self) -> u64 {
        self.pending + self.processing
    }

    /// Completed fraction of finished tasks (completed, failed, or timed
    /// out; cancellations excluded). `0.0` when nothing has finished.
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed + self.timeout;
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64
        }
    }

    /// Add one task with the given status to the counts.
    pub fn count(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Timeout => self.timeout += 1,
        }
    }
}

/// Queue occupancy and resource availability at a point in time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QueueSummary {
    /// Queue entries not yet bound to a resource.
    pub waiting: usize,
    /// Queue entries bound to a resource.
    pub assigned: usize,
    pub resources_total: usize,
    pub resources_available: usize,
    pub resources_busy: usize,
    /// The store's admission limit on non-terminal tasks.
    pub max_active_tasks: usize,
}

/// A binding freed by [`TaskSweeper::release_terminal_bindings`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedBinding {
    pub task_id: TaskId,
    pub resource_id: String,
}
