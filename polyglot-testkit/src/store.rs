//! In-memory [`TaskStore`] + [`TaskSweeper`] with the same observable
//! behavior as the Postgres implementation: admission control on create,
//! validated transitions with timestamp stamping, terminal cleanup of
//! queue entries and resource bindings, and sweep passes that leave
//! resource release to the reaper.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use polyglot::*;
use tracing::{debug, info, warn};

/// Shared, clonable in-memory task store for tests.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    policy: TaskPolicy,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    queue: HashMap<TaskId, QueueEntry>,
    resources: HashMap<String, Resource>,
}

impl std::fmt::Debug for InMemoryTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InMemoryTaskStore")
            .field("policy", &self.policy)
            .field("tasks", &inner.tasks.len())
            .field("queued", &inner.queue.len())
            .field("resources", &inner.resources.len())
            .finish()
    }
}

impl InMemoryTaskStore {
    pub fn new(policy: TaskPolicy) -> Self {
        Self {
            policy,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Snapshot one resource, bound or not, for assertions that
    /// [`TaskStore::available_resources`] cannot express.
    pub fn resource(&self, resource_id: &str) -> Option<Resource> {
        self.inner.lock().resources.get(resource_id).cloned()
    }

    /// Snapshot one queue entry.
    pub fn queue_entry(&self, task_id: TaskId) -> Option<QueueEntry> {
        self.inner.lock().queue.get(&task_id).cloned()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, params: TaskParams) -> Result<Task, TaskError> {
        let mut inner = self.inner.lock();

        let active = inner
            .tasks
            .values()
            .filter(|task| {
                matches!(task.status, TaskStatus::Pending | TaskStatus::Processing)
            })
            .count() as u64;
        if active >= self.policy.max_active_tasks {
            return Err(TaskError::CapacityExceeded {
                active,
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

        inner.queue.insert(
            task.task_id,
            QueueEntry {
                task_id: task.task_id,
                priority: task.priority,
                enqueued_at: task.created_at,
                assigned_resource_id: None,
                assigned_at: None,
            },
        );
        inner.tasks.insert(task.task_id, task.clone());
        drop(inner);

        debug!(task = %task.task_id, priority = %task.priority, "task created");
        Ok(task)
    }

    async fn get(&self, task_id: TaskId) -> Result<Task, TaskError> {
        self.inner
            .lock()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(TaskError::NotFound { task_id })
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Task>, TaskError> {
        let inner = self.inner.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| status.is_none() || status == Some(task.status))
            .cloned()
            .collect();
        drop(inner);

        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.task_id.0.cmp(&a.task_id.0))
        });
        if let Some(limit) = limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn transition(
        &self,
        task_id: TaskId,
        new_status: TaskStatus,
        progress: Option<f32>,
        error: Option<String>,
    ) -> Result<Task, TaskError> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskError::NotFound { task_id })?;

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
        let updated = task.clone();

        if updated.status.is_terminal() {
            inner.queue.remove(&task_id);
            for resource in inner.resources.values_mut() {
                if resource.current_task_id == Some(task_id) {
                    resource.is_available = true;
                    resource.current_task_id = None;
                    resource.updated_at = now;
                    debug!(task = %task_id, "freed resource binding on terminal transition");
                }
            }
        }
        drop(inner);

        debug!(task = %task_id, from = %from, to = %updated.status, "task transitioned");
        Ok(updated)
    }

    async fn cancel(&self, task_id: TaskId, reason: Option<String>) -> Result<Task, TaskError> {
        let task = self
            .transition(task_id, TaskStatus::Cancelled, None, reason)
            .await?;
        info!(task = %task_id, "task cancelled");
        Ok(task)
    }

    async fn retry(&self, task_id: TaskId) -> Result<Task, TaskError> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskError::NotFound { task_id })?;

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
        let updated = task.clone();

        inner.queue.insert(
            task_id,
            QueueEntry {
                task_id,
                priority: updated.priority,
                enqueued_at: Utc::now(),
                assigned_resource_id: None,
                assigned_at: None,
            },
        );
        drop(inner);

        info!(task = %task_id, attempt = updated.retry_count, "task re-enqueued for retry");
        Ok(updated)
    }

    async fn update_progress(
        &self,
        task_id: TaskId,
        progress: f32,
        message: Option<String>,
    ) -> Result<Task, TaskError> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskError::NotFound { task_id })?;

        if task.status != TaskStatus::Processing {
            return Err(TaskError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Processing,
            });
        }

        task.progress = progress.clamp(0.0, 100.0);
        let updated = task.clone();
        drop(inner);

        if let Some(message) = message {
            debug!(task = %task_id, progress = updated.progress, message = %message, "progress updated");
        }
        Ok(updated)
    }

    async fn delete(&self, task_id: TaskId) -> Result<(), TaskError> {
        // Queue entry goes with the task; a leftover resource binding is
        // cleared by the next reap pass.
        let mut inner = self.inner.lock();
        if inner.tasks.remove(&task_id).is_none() {
            return Err(TaskError::NotFound { task_id });
        }
        inner.queue.remove(&task_id);
        drop(inner);

        debug!(task = %task_id, "task deleted");
        Ok(())
    }

    async fn active_count(&self) -> Result<u64, TaskError> {
        let inner = self.inner.lock();
        Ok(inner
            .tasks
            .values()
            .filter(|task| {
                matches!(task.status, TaskStatus::Pending | TaskStatus::Processing)
            })
            .count() as u64)
    }

    async fn metrics(&self) -> Result<TaskMetrics, TaskError> {
        let inner = self.inner.lock();
        let mut metrics = TaskMetrics::default();
        for task in inner.tasks.values() {
            metrics.count(task.status);
        }
        Ok(metrics)
    }

    async fn queue_status(&self) -> Result<QueueSummary, TaskError> {
        let inner = self.inner.lock();
        let waiting = inner
            .queue
            .values()
            .filter(|entry| !entry.is_assigned())
            .count();
        let assigned = inner.queue.len() - waiting;
        let available = inner
            .resources
            .values()
            .filter(|r| r.is_available && r.current_task_id.is_none())
            .count();
        let busy = inner
            .resources
            .values()
            .filter(|r| r.current_task_id.is_some())
            .count();
        Ok(QueueSummary {
            waiting,
            assigned,
            resources_total: inner.resources.len(),
            resources_available: available,
            resources_busy: busy,
            max_active_tasks: self.policy.max_active_tasks as usize,
        })
    }

    async fn pending_unassigned(&self, limit: usize) -> Result<Vec<QueueEntry>, TaskError> {
        let inner = self.inner.lock();
        let mut entries: Vec<QueueEntry> = inner
            .queue
            .values()
            .filter(|entry| !entry.is_assigned())
            .filter(|entry| {
                inner
                    .tasks
                    .get(&entry.task_id)
                    .map_or(false, |task| task.status == TaskStatus::Pending)
            })
            .cloned()
            .collect();
        drop(inner);

        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
                .then(a.task_id.0.cmp(&b.task_id.0))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn available_resources(&self) -> Result<Vec<Resource>, TaskError> {
        let inner = self.inner.lock();
        let mut resources: Vec<Resource> = inner
            .resources
            .values()
            .filter(|r| r.is_available && r.current_task_id.is_none())
            .cloned()
            .collect();
        drop(inner);

        resources.sort_by(|a, b| {
            b.memory_free
                .cmp(&a.memory_free)
                .then(a.resource_id.cmp(&b.resource_id))
        });
        Ok(resources)
    }

    async fn assign(&self, task_id: TaskId, resource_id: &str) -> Result<Task, TaskError> {
        let mut inner = self.inner.lock();

        let claimable = inner
            .queue
            .get(&task_id)
            .map_or(false, |entry| !entry.is_assigned());
        if !claimable {
            // Entry gone or already assigned; report against the task.
            let Some(task) = inner.tasks.get(&task_id) else {
                return Err(TaskError::NotFound { task_id });
            };
            return Err(TaskError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Processing,
            });
        }

        let Some(status) = inner.tasks.get(&task_id).map(|task| task.status) else {
            return Err(TaskError::NotFound { task_id });
        };
        if !status.can_transition_to(TaskStatus::Processing) {
            return Err(TaskError::InvalidTransition {
                task_id,
                from: status,
                to: TaskStatus::Processing,
            });
        }

        let now = Utc::now();
        match inner.resources.get_mut(resource_id) {
            Some(resource) if resource.current_task_id.is_none() => {
                resource.is_available = false;
                resource.current_task_id = Some(task_id);
                resource.updated_at = now;
            }
            _ => {
                return Err(TaskError::Storage(anyhow::anyhow!(
                    "resource {resource_id} is unknown or already bound"
                )));
            }
        }

        if let Some(entry) = inner.queue.get_mut(&task_id) {
            entry.assigned_resource_id = Some(resource_id.to_string());
            entry.assigned_at = Some(now);
        }

        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskError::NotFound { task_id })?;
        task.status = TaskStatus::Processing;
        task.started_at = Some(now);
        let updated = task.clone();
        drop(inner);

        debug!(task = %task_id, resource = %resource_id, "task assigned");
        Ok(updated)
    }

    async fn upsert_resource(&self, telemetry: ResourceTelemetry) -> Result<(), TaskError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        match inner.resources.get_mut(&telemetry.resource_id) {
            Some(resource) => {
                // A refreshed probe never clobbers an active binding;
                // availability follows the binding, not the probe.
                resource.device_name = telemetry.device_name;
                resource.memory_total = telemetry.memory_total;
                resource.memory_used = telemetry.memory_used;
                resource.memory_free = telemetry.memory_total.saturating_sub(telemetry.memory_used);
                resource.utilization = telemetry.utilization;
                resource.temperature = telemetry.temperature;
                resource.is_available = resource.current_task_id.is_none();
                resource.updated_at = now;
                resource.stale = false;
            }
            None => {
                let memory_free = telemetry.memory_free();
                inner.resources.insert(
                    telemetry.resource_id.clone(),
                    Resource {
                        resource_id: telemetry.resource_id,
                        device_name: telemetry.device_name,
                        memory_total: telemetry.memory_total,
                        memory_used: telemetry.memory_used,
                        memory_free,
                        utilization: telemetry.utilization,
                        temperature: telemetry.temperature,
                        is_available: true,
                        current_task_id: None,
                        updated_at: now,
                        stale: false,
                    },
                );
            }
        }
        Ok(())
    }

    async fn mark_resource_stale(&self, resource_id: &str) -> Result<(), TaskError> {
        let mut inner = self.inner.lock();
        if let Some(resource) = inner.resources.get_mut(resource_id) {
            resource.stale = true;
            resource.updated_at = Utc::now();
            drop(inner);
            warn!(resource = %resource_id, "resource marked stale");
        }
        Ok(())
    }
}

#[async_trait]
impl TaskSweeper for InMemoryTaskStore {
    async fn release_terminal_bindings(&self) -> Result<Vec<ReleasedBinding>, TaskError> {
        let mut guard = self.inner.lock();
        let Inner {
            tasks,
            queue,
            resources,
        } = &mut *guard;

        let now = Utc::now();
        let mut candidates: Vec<(String, TaskId)> = resources
            .values()
            .filter_map(|resource| {
                resource
                    .current_task_id
                    .map(|task_id| (resource.resource_id.clone(), task_id))
            })
            .filter(|(_, task_id)| {
                tasks
                    .get(task_id)
                    .map_or(true, |task| task.status.is_terminal())
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut released = Vec::with_capacity(candidates.len());
        for (resource_id, task_id) in candidates {
            if let Some(resource) = resources.get_mut(&resource_id) {
                resource.is_available = true;
                resource.current_task_id = None;
                resource.updated_at = now;
            }
            released.push(ReleasedBinding {
                task_id,
                resource_id,
            });
        }

        // Queue entries orphaned by a terminal flip that bypassed
        // `transition`.
        queue.retain(|task_id, _| {
            tasks
                .get(task_id)
                .map_or(true, |task| !task.status.is_terminal())
        });
        drop(guard);

        if !released.is_empty() {
            info!(count = released.len(), "released terminal resource bindings");
        }
        Ok(released)
    }

    async fn mark_overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError> {
        let mut guard = self.inner.lock();
        let Inner { tasks, queue, .. } = &mut *guard;

        let mut flipped = Vec::new();
        for task in tasks.values_mut() {
            if task.is_overdue(now) {
                task.status = TaskStatus::Timeout;
                task.completed_at = Some(now);
                task.error_message
                    .get_or_insert_with(|| "task exceeded its timeout".to_string());
                flipped.push(task.clone());
            }
        }
        for task in &flipped {
            queue.remove(&task.task_id);
        }
        drop(guard);

        for task in &flipped {
            warn!(
                task = %task.task_id,
                age_seconds = task.age(now).num_seconds(),
                "task timed out"
            );
        }
        Ok(flipped)
    }

    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, TaskError> {
        let mut guard = self.inner.lock();
        let Inner { tasks, queue, .. } = &mut *guard;

        let doomed: Vec<TaskId> = tasks
            .values()
            .filter(|task| {
                task.is_terminal() && task.completed_at.unwrap_or(task.created_at) < cutoff
            })
            .map(|task| task.task_id)
            .collect();
        for task_id in &doomed {
            tasks.remove(task_id);
            queue.remove(task_id);
        }
        drop(guard);

        let purged = doomed.len() as u64;
        if purged > 0 {
            debug!(count = purged, "purged old terminal tasks");
        }
        Ok(purged)
    }
}
