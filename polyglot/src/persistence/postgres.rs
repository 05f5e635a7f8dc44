//! Postgres-backed task store.
//!
//! Every multi-step operation runs in a single transaction with row
//! locks, so concurrent schedulers sharing one database never
//! double-assign a queue entry or a resource. Queue claims use
//! `FOR UPDATE SKIP LOCKED`; losers see the entry as taken instead of
//! blocking on the winner's transaction.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{PersistenceConfig, TaskPolicy};
use crate::error::TaskError;
use crate::store::{
    QueueEntry, QueueSummary, ReleasedBinding, Resource, ResourceTelemetry, TaskMetrics,
    TaskStore, TaskSweeper,
};
use crate::task::{Task, TaskId, TaskParams, TaskPriority, TaskStatus};

impl From<sqlx::Error> for TaskError {
    fn from(err: sqlx::Error) -> Self {
        TaskError::Storage(err.into())
    }
}

/// Task store and sweeper backed by Postgres.
///
/// Wrap an existing pool with [`new`](Self::new) or open one with
/// [`connect`](Self::connect), then call
/// [`ensure_schema`](Self::ensure_schema) once before first use.
#[derive(Clone, Debug)]
pub struct PostgresTaskStore {
    pool: PgPool,
    policy: TaskPolicy,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool, policy: TaskPolicy) -> Self {
        Self { pool, policy }
    }

    /// Open a connection pool per `config` and wrap it.
    pub async fn connect(config: &PersistenceConfig, policy: TaskPolicy) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool, policy))
    }

    /// The underlying connection pool, for callers that run their own
    /// queries alongside the store.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist. Idempotent.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polyglot_tasks (
                task_id         UUID PRIMARY KEY,
                status          TEXT NOT NULL,
                priority        SMALLINT NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL,
                started_at      TIMESTAMPTZ,
                completed_at    TIMESTAMPTZ,
                progress        REAL NOT NULL DEFAULT 0,
                error_message   TEXT,
                retry_count     INTEGER NOT NULL DEFAULT 0,
                max_retries     INTEGER NOT NULL,
                timeout_seconds BIGINT NOT NULL,
                client_id       TEXT NOT NULL,
                source_lang     TEXT NOT NULL,
                target_lang     TEXT NOT NULL,
                via_pivot       BOOLEAN NOT NULL DEFAULT FALSE,
                file_count      INTEGER NOT NULL DEFAULT 0,
                total_bytes     BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating polyglot_tasks")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS polyglot_tasks_status_idx
            ON polyglot_tasks (status)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating polyglot_tasks status index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polyglot_task_queue (
                task_id              UUID PRIMARY KEY
                                     REFERENCES polyglot_tasks (task_id)
                                     ON DELETE CASCADE,
                priority             SMALLINT NOT NULL,
                enqueued_at          TIMESTAMPTZ NOT NULL,
                assigned_resource_id TEXT,
                assigned_at          TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating polyglot_task_queue")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS polyglot_task_queue_pending_idx
            ON polyglot_task_queue (priority DESC, enqueued_at)
            WHERE assigned_resource_id IS NULL
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating polyglot_task_queue pending index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polyglot_resources (
                resource_id     TEXT PRIMARY KEY,
                device_name     TEXT NOT NULL,
                memory_total    BIGINT NOT NULL,
                memory_used     BIGINT NOT NULL,
                utilization     DOUBLE PRECISION NOT NULL,
                temperature     DOUBLE PRECISION,
                is_available    BOOLEAN NOT NULL DEFAULT TRUE,
                current_task_id UUID,
                updated_at      TIMESTAMPTZ NOT NULL,
                stale           BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating polyglot_resources")?;

        Ok(())
    }

    fn priority_to_i16(priority: TaskPriority) -> i16 {
        priority as i16
    }

    fn i16_to_priority(value: i16) -> TaskPriority {
        match value {
            1 => TaskPriority::Low,
            3 => TaskPriority::High,
            4 => TaskPriority::Urgent,
            _ => TaskPriority::Normal,
        }
    }

    fn status_from_str(value: &str) -> Result<TaskStatus, TaskError> {
        TaskStatus::parse(value).ok_or_else(|| {
            TaskError::Storage(anyhow::anyhow!("unknown task status in storage: {value}"))
        })
    }

    fn task_from_row(row: &PgRow) -> Result<Task, TaskError> {
        let status: String = row.try_get("status")?;
        let priority: i16 = row.try_get("priority")?;
        let retry_count: i32 = row.try_get("retry_count")?;
        let max_retries: i32 = row.try_get("max_retries")?;
        let timeout_seconds: i64 = row.try_get("timeout_seconds")?;
        let file_count: i32 = row.try_get("file_count")?;
        let total_bytes: i64 = row.try_get("total_bytes")?;
        Ok(Task {
            task_id: TaskId(row.try_get("task_id")?),
            status: Self::status_from_str(&status)?,
            priority: Self::i16_to_priority(priority),
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            progress: row.try_get("progress")?,
            error_message: row.try_get("error_message")?,
            retry_count: retry_count.max(0) as u32,
            max_retries: max_retries.max(0) as u32,
            timeout_seconds: timeout_seconds.max(0) as u64,
            client_id: row.try_get("client_id")?,
            source_lang: row.try_get("source_lang")?,
            target_lang: row.try_get("target_lang")?,
            via_pivot: row.try_get("via_pivot")?,
            file_count: file_count.max(0) as u32,
            total_bytes: total_bytes.max(0) as u64,
        })
    }

    fn queue_entry_from_row(row: &PgRow) -> Result<QueueEntry, TaskError> {
        let priority: i16 = row.try_get("priority")?;
        Ok(QueueEntry {
            task_id: TaskId(row.try_get("task_id")?),
            priority: Self::i16_to_priority(priority),
            enqueued_at: row.try_get("enqueued_at")?,
            assigned_resource_id: row.try_get("assigned_resource_id")?,
            assigned_at: row.try_get("assigned_at")?,
        })
    }

    fn resource_from_row(row: &PgRow) -> Result<Resource, TaskError> {
        let memory_total: i64 = row.try_get("memory_total")?;
        let memory_used: i64 = row.try_get("memory_used")?;
        let memory_total = memory_total.max(0) as u64;
        let memory_used = memory_used.max(0) as u64;
        let current_task_id: Option<Uuid> = row.try_get("current_task_id")?;
        Ok(Resource {
            resource_id: row.try_get("resource_id")?,
            device_name: row.try_get("device_name")?,
            memory_total,
            memory_used,
            memory_free: memory_total.saturating_sub(memory_used),
            utilization: row.try_get("utilization")?,
            temperature: row.try_get("temperature")?,
            is_available: row.try_get("is_available")?,
            current_task_id: current_task_id.map(TaskId),
            updated_at: row.try_get("updated_at")?,
            stale: row.try_get("stale")?,
        })
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn create(&self, params: TaskParams) -> Result<Task, TaskError> {
        let mut tx = self.pool.begin().await?;

        let active: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS active
            FROM polyglot_tasks
            WHERE status IN ('pending', 'processing')
            "#,
        )
        .fetch_one(&mut *tx)
        .await?
        .try_get("active")?;
        if active.max(0) as u64 >= self.policy.max_active_tasks {
            return Err(TaskError::CapacityExceeded {
                active: active.max(0) as u64,
                limit: self.policy.max_active_tasks,
            });
        }

        let task = Task {
            task_id: TaskId::new(),
            status: TaskStatus::Pending,
            priority: params.priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            error_message: None,
            retry_count: 0,
            max_retries: params.max_retries.unwrap_or(self.policy.max_retries),
            timeout_seconds: params
                .timeout_seconds
                .unwrap_or(self.policy.timeout_seconds),
            client_id: params.client_id,
            source_lang: params.source_lang,
            target_lang: params.target_lang,
            via_pivot: params.via_pivot,
            file_count: params.file_count,
            total_bytes: params.total_bytes,
        };

        sqlx::query(
            r#"
            INSERT INTO polyglot_tasks (
                task_id, status, priority, created_at, progress, retry_count,
                max_retries, timeout_seconds, client_id, source_lang,
                target_lang, via_pivot, file_count, total_bytes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(task.task_id.0)
        .bind(task.status.as_str())
        .bind(Self::priority_to_i16(task.priority))
        .bind(task.created_at)
        .bind(task.progress)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.timeout_seconds as i64)
        .bind(&task.client_id)
        .bind(&task.source_lang)
        .bind(&task.target_lang)
        .bind(task.via_pivot)
        .bind(task.file_count as i32)
        .bind(task.total_bytes as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO polyglot_task_queue (task_id, priority, enqueued_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(task.task_id.0)
        .bind(Self::priority_to_i16(task.priority))
        .bind(task.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(task = %task.task_id, priority = %task.priority, "task created");
        Ok(task)
    }

    async fn get(&self, task_id: TaskId) -> Result<Task, TaskError> {
        let row = sqlx::query(
            r#"
            SELECT task_id, status, priority, created_at, started_at,
                   completed_at, progress, error_message, retry_count,
                   max_retries, timeout_seconds, client_id, source_lang,
                   target_lang, via_pivot, file_count, total_bytes
            FROM polyglot_tasks
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(TaskError::NotFound { task_id });
        };
        Self::task_from_row(&row)
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Task>, TaskError> {
        let limit = limit.map_or(i64::MAX, |n| n as i64);
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT task_id, status, priority, created_at, started_at,
                           completed_at, progress, error_message, retry_count,
                           max_retries, timeout_seconds, client_id, source_lang,
                           target_lang, via_pivot, file_count, total_bytes
                    FROM polyglot_tasks
                    WHERE status = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT task_id, status, priority, created_at, started_at,
                           completed_at, progress, error_message, retry_count,
                           max_retries, timeout_seconds, client_id, source_lang,
                           target_lang, via_pivot, file_count, total_bytes
                    FROM polyglot_tasks
                    ORDER BY created_at DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::task_from_row).collect()
    }

    async fn transition(
        &self,
        task_id: TaskId,
        new_status: TaskStatus,
        progress: Option<f32>,
        error: Option<String>,
    ) -> Result<Task, TaskError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT task_id, status, priority, created_at, started_at,
                   completed_at, progress, error_message, retry_count,
                   max_retries, timeout_seconds, client_id, source_lang,
                   target_lang, via_pivot, file_count, total_bytes
            FROM polyglot_tasks
            WHERE task_id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(TaskError::NotFound { task_id });
        };
        let mut task = Self::task_from_row(&row)?;

        if !task.status.can_transition_to(new_status) {
            return Err(TaskError::InvalidTransition {
                task_id,
                from: task.status,
                to: new_status,
            });
        }

        let now = Utc::now();
        let from = task.status;
        task.status = new_status;
        if new_status == TaskStatus::Processing && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if new_status.is_terminal() {
            task.completed_at = Some(now);
        }
        if new_status == TaskStatus::Completed {
            task.progress = 100.0;
        }
        if let Some(progress) = progress {
            task.progress = progress.clamp(0.0, 100.0);
        }
        if let Some(error) = error {
            task.error_message = Some(error);
        }

        sqlx::query(
            r#"
            UPDATE polyglot_tasks
            SET status = $2, progress = $3, error_message = $4,
                started_at = $5, completed_at = $6
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.0)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(&task.error_message)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&mut *tx)
        .await?;

        if task.status.is_terminal() {
            sqlx::query(r#"DELETE FROM polyglot_task_queue WHERE task_id = $1"#)
                .bind(task_id.0)
                .execute(&mut *tx)
                .await?;
            let freed = sqlx::query(
                r#"
                UPDATE polyglot_resources
                SET is_available = TRUE, current_task_id = NULL, updated_at = $2
                WHERE current_task_id = $1
                "#,
            )
            .bind(task_id.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if freed.rows_affected() > 0 {
                debug!(task = %task_id, "freed resource binding on terminal transition");
            }
        }

        tx.commit().await?;
        debug!(task = %task_id, from = %from, to = %task.status, "task transitioned");
        Ok(task)
    }

    async fn cancel(&self, task_id: TaskId, reason: Option<String>) -> Result<Task, TaskError> {
        let task = self
            .transition(task_id, TaskStatus::Cancelled, None, reason)
            .await?;
        info!(task = %task_id, "task cancelled");
        Ok(task)
    }

    async fn retry(&self, task_id: TaskId) -> Result<Task, TaskError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT task_id, status, priority, created_at, started_at,
                   completed_at, progress, error_message, retry_count,
                   max_retries, timeout_seconds, client_id, source_lang,
                   target_lang, via_pivot, file_count, total_bytes
            FROM polyglot_tasks
            WHERE task_id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(TaskError::NotFound { task_id });
        };
        let mut task = Self::task_from_row(&row)?;

        if task.status != TaskStatus::Failed {
            return Err(TaskError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        if task.retry_count >= task.max_retries {
            return Err(TaskError::RetryExhausted {
                task_id,
                retry_count: task.retry_count,
                max_retries: task.max_retries,
            });
        }

        task.status = TaskStatus::Pending;
        task.retry_count += 1;
        task.progress = 0.0;
        task.error_message = None;
        task.started_at = None;
        task.completed_at = None;

        sqlx::query(
            r#"
            UPDATE polyglot_tasks
            SET status = 'pending', retry_count = $2, progress = 0,
                error_message = NULL, started_at = NULL, completed_at = NULL
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.0)
        .bind(task.retry_count as i32)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO polyglot_task_queue (task_id, priority, enqueued_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (task_id) DO UPDATE
            SET enqueued_at = EXCLUDED.enqueued_at,
                assigned_resource_id = NULL,
                assigned_at = NULL
            "#,
        )
        .bind(task_id.0)
        .bind(Self::priority_to_i16(task.priority))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(task = %task_id, attempt = task.retry_count, "task re-enqueued for retry");
        Ok(task)
    }

    async fn update_progress(
        &self,
        task_id: TaskId,
        progress: f32,
        message: Option<String>,
    ) -> Result<Task, TaskError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT task_id, status, priority, created_at, started_at,
                   completed_at, progress, error_message, retry_count,
                   max_retries, timeout_seconds, client_id, source_lang,
                   target_lang, via_pivot, file_count, total_bytes
            FROM polyglot_tasks
            WHERE task_id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(TaskError::NotFound { task_id });
        };
        let mut task = Self::task_from_row(&row)?;

        if task.status != TaskStatus::Processing {
            return Err(TaskError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Processing,
            });
        }

        task.progress = progress.clamp(0.0, 100.0);
        sqlx::query(r#"UPDATE polyglot_tasks SET progress = $2 WHERE task_id = $1"#)
            .bind(task_id.0)
            .bind(task.progress)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if let Some(message) = message {
            debug!(task = %task_id, progress = task.progress, message = %message, "progress updated");
        }
        Ok(task)
    }

    async fn delete(&self, task_id: TaskId) -> Result<(), TaskError> {
        // The queue entry cascades; a leftover resource binding is cleared
        // by the next reap pass.
        let res = sqlx::query(r#"DELETE FROM polyglot_tasks WHERE task_id = $1"#)
            .bind(task_id.0)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(TaskError::NotFound { task_id });
        }
        debug!(task = %task_id, "task deleted");
        Ok(())
    }

    async fn active_count(&self) -> Result<u64, TaskError> {
        let active: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS active
            FROM polyglot_tasks
            WHERE status IN ('pending', 'processing')
            "#,
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("active")?;
        Ok(active.max(0) as u64)
    }

    async fn metrics(&self) -> Result<TaskMetrics, TaskError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM polyglot_tasks
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut metrics = TaskMetrics::default();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let count = count.max(0) as u64;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => metrics.pending = count,
                Some(TaskStatus::Processing) => metrics.processing = count,
                Some(TaskStatus::Completed) => metrics.completed = count,
                Some(TaskStatus::Failed) => metrics.failed = count,
                Some(TaskStatus::Cancelled) => metrics.cancelled = count,
                Some(TaskStatus::Timeout) => metrics.timeout = count,
                None => warn!(status = %status, "unknown status in task metrics"),
            }
        }
        Ok(metrics)
    }

    async fn queue_status(&self) -> Result<QueueSummary, TaskError> {
        let queue = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE assigned_resource_id IS NULL) AS waiting,
                   COUNT(*) FILTER (WHERE assigned_resource_id IS NOT NULL) AS assigned
            FROM polyglot_task_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let resources = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE is_available AND current_task_id IS NULL) AS available,
                   COUNT(*) FILTER (WHERE current_task_id IS NOT NULL) AS busy
            FROM polyglot_resources
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let waiting: i64 = queue.try_get("waiting")?;
        let assigned: i64 = queue.try_get("assigned")?;
        let total: i64 = resources.try_get("total")?;
        let available: i64 = resources.try_get("available")?;
        let busy: i64 = resources.try_get("busy")?;
        Ok(QueueSummary {
            waiting: waiting.max(0) as usize,
            assigned: assigned.max(0) as usize,
            resources_total: total.max(0) as usize,
            resources_available: available.max(0) as usize,
            resources_busy: busy.max(0) as usize,
            max_active_tasks: self.policy.max_active_tasks as usize,
        })
    }

    async fn pending_unassigned(&self, limit: usize) -> Result<Vec<QueueEntry>, TaskError> {
        let rows = sqlx::query(
            r#"
            SELECT q.task_id, q.priority, q.enqueued_at, q.assigned_resource_id,
                   q.assigned_at
            FROM polyglot_task_queue q
            JOIN polyglot_tasks t ON t.task_id = q.task_id
            WHERE q.assigned_resource_id IS NULL AND t.status = 'pending'
            ORDER BY q.priority DESC, q.enqueued_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::queue_entry_from_row).collect()
    }

    async fn available_resources(&self) -> Result<Vec<Resource>, TaskError> {
        let rows = sqlx::query(
            r#"
            SELECT resource_id, device_name, memory_total, memory_used,
                   utilization, temperature, is_available, current_task_id,
                   updated_at, stale
            FROM polyglot_resources
            WHERE is_available AND current_task_id IS NULL
            ORDER BY memory_total - memory_used DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::resource_from_row).collect()
    }

    async fn assign(&self, task_id: TaskId, resource_id: &str) -> Result<Task, TaskError> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            SELECT task_id
            FROM polyglot_task_queue
            WHERE task_id = $1 AND assigned_resource_id IS NULL
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        if claimed.is_none() {
            drop(tx);
            // Entry gone, already assigned, or claimed by a peer scheduler.
            let task = self.get(task_id).await?;
            return Err(TaskError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Processing,
            });
        }

        let row = sqlx::query(
            r#"
            SELECT task_id, status, priority, created_at, started_at,
                   completed_at, progress, error_message, retry_count,
                   max_retries, timeout_seconds, client_id, source_lang,
                   target_lang, via_pivot, file_count, total_bytes
            FROM polyglot_tasks
            WHERE task_id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(TaskError::NotFound { task_id });
        };
        let mut task = Self::task_from_row(&row)?;
        if !task.status.can_transition_to(TaskStatus::Processing) {
            return Err(TaskError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Processing,
            });
        }

        let now = Utc::now();
        let bound = sqlx::query(
            r#"
            UPDATE polyglot_resources
            SET is_available = FALSE, current_task_id = $1, updated_at = $3
            WHERE resource_id = $2 AND current_task_id IS NULL
            "#,
        )
        .bind(task_id.0)
        .bind(resource_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if bound.rows_affected() == 0 {
            return Err(TaskError::Storage(anyhow::anyhow!(
                "resource {resource_id} is unknown or already bound"
            )));
        }

        sqlx::query(
            r#"
            UPDATE polyglot_task_queue
            SET assigned_resource_id = $2, assigned_at = $3
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.0)
        .bind(resource_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        task.status = TaskStatus::Processing;
        task.started_at = Some(now);
        sqlx::query(
            r#"
            UPDATE polyglot_tasks
            SET status = 'processing', started_at = $2
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.0)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(task = %task_id, resource = %resource_id, "task assigned");
        Ok(task)
    }

    async fn upsert_resource(&self, telemetry: ResourceTelemetry) -> Result<(), TaskError> {
        // A refreshed probe never clobbers an active binding; availability
        // follows the binding, not the probe.
        sqlx::query(
            r#"
            INSERT INTO polyglot_resources (
                resource_id, device_name, memory_total, memory_used,
                utilization, temperature, is_available, current_task_id,
                updated_at, stale
            )
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, NULL, $7, FALSE)
            ON CONFLICT (resource_id) DO UPDATE
            SET device_name = EXCLUDED.device_name,
                memory_total = EXCLUDED.memory_total,
                memory_used = EXCLUDED.memory_used,
                utilization = EXCLUDED.utilization,
                temperature = EXCLUDED.temperature,
                is_available = (polyglot_resources.current_task_id IS NULL),
                updated_at = EXCLUDED.updated_at,
                stale = FALSE
            "#,
        )
        .bind(&telemetry.resource_id)
        .bind(&telemetry.device_name)
        .bind(telemetry.memory_total as i64)
        .bind(telemetry.memory_used as i64)
        .bind(telemetry.utilization)
        .bind(telemetry.temperature)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_resource_stale(&self, resource_id: &str) -> Result<(), TaskError> {
        let res = sqlx::query(
            r#"
            UPDATE polyglot_resources
            SET stale = TRUE, updated_at = $2
            WHERE resource_id = $1
            "#,
        )
        .bind(resource_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() > 0 {
            warn!(resource = %resource_id, "resource marked stale");
        }
        Ok(())
    }
}

#[async_trait]
impl TaskSweeper for PostgresTaskStore {
    async fn release_terminal_bindings(&self) -> Result<Vec<ReleasedBinding>, TaskError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT r.resource_id, r.current_task_id
            FROM polyglot_resources r
            LEFT JOIN polyglot_tasks t ON t.task_id = r.current_task_id
            WHERE r.current_task_id IS NOT NULL
              AND (t.task_id IS NULL
                   OR t.status IN ('completed', 'failed', 'cancelled', 'timeout'))
            FOR UPDATE OF r SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut released = Vec::with_capacity(rows.len());
        for row in &rows {
            let resource_id: String = row.try_get("resource_id")?;
            let bound_task: Uuid = row.try_get("current_task_id")?;
            sqlx::query(
                r#"
                UPDATE polyglot_resources
                SET is_available = TRUE, current_task_id = NULL, updated_at = $2
                WHERE resource_id = $1
                "#,
            )
            .bind(&resource_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            released.push(ReleasedBinding {
                task_id: TaskId(bound_task),
                resource_id,
            });
        }

        // Queue entries orphaned by a terminal flip that bypassed
        // `transition`.
        sqlx::query(
            r#"
            DELETE FROM polyglot_task_queue q
            USING polyglot_tasks t
            WHERE t.task_id = q.task_id
              AND t.status IN ('completed', 'failed', 'cancelled', 'timeout')
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        if !released.is_empty() {
            info!(count = released.len(), "released terminal resource bindings");
        }
        Ok(released)
    }

    async fn mark_overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            UPDATE polyglot_tasks
            SET status = 'timeout', completed_at = $1,
                error_message = COALESCE(error_message, 'task exceeded its timeout')
            WHERE status IN ('pending', 'processing')
              AND created_at + make_interval(secs => timeout_seconds::double precision) < $1
            RETURNING task_id, status, priority, created_at, started_at,
                      completed_at, progress, error_message, retry_count,
                      max_retries, timeout_seconds, client_id, source_lang,
                      target_lang, via_pivot, file_count, total_bytes
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM polyglot_task_queue q
            USING polyglot_tasks t
            WHERE t.task_id = q.task_id AND t.status = 'timeout'
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let tasks: Vec<Task> = rows
            .iter()
            .map(Self::task_from_row)
            .collect::<Result<_, _>>()?;
        for task in &tasks {
            warn!(
                task = %task.task_id,
                age_seconds = task.age(now).num_seconds(),
                "task timed out"
            );
        }
        Ok(tasks)
    }

    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, TaskError> {
        let res = sqlx::query(
            r#"
            DELETE FROM polyglot_tasks
            WHERE status IN ('completed', 'failed', 'cancelled', 'timeout')
              AND COALESCE(completed_at, created_at) < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let purged = res.rows_affected();
        if purged > 0 {
            debug!(count = purged, "purged old terminal tasks");
        }
        Ok(purged)
    }
}
