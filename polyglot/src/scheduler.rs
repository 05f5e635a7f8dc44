//! Background scheduling for the durable task queue.
//!
//! [`QueueScheduler`] runs three loops against a [`TaskStore`]:
//!
//! - assignment (default 5 s): reap released bindings, then bind
//!   pending tasks to free resources in priority order
//! - monitor (default 10 s): refresh resource telemetry through a
//!   [`ResourceProbe`], marking unreachable resources stale
//! - sweep (default 300 s): time out overdue tasks and purge terminal
//!   rows past retention
//!
//! Every pass is also a public `run_*_pass` method so tests drive ticks
//! deterministically without sleeping. Pass errors are logged and the
//! loops keep running; only [`shutdown`](QueueScheduler::shutdown)
//! stops them.

use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::ResourceProbe;
use crate::error::TaskError;
use crate::events::{TaskEvent, TaskEventPayload, TaskEventPublisher};
use crate::store::{TaskStore, TaskSweeper};
use crate::task::TaskStatus;
use crate::telemetry;

/// Cooperative cancellation shared by the scheduler loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled. Returns immediately if already cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Loop intervals and per-pass limits for [`QueueScheduler`].
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Interval between assignment passes in milliseconds.
    pub assign_interval_ms: u64,
    /// Interval between resource monitor passes in milliseconds.
    pub monitor_interval_ms: u64,
    /// Interval between sweep passes in milliseconds.
    pub sweep_interval_ms: u64,
    /// Upper bound on tasks bound to resources in one assignment pass.
    pub max_concurrent_tasks: usize,
    /// Terminal tasks older than this are purged by the sweep pass.
    pub retention_hours: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            assign_interval_ms: 5_000,
            monitor_interval_ms: 10_000,
            sweep_interval_ms: 300_000,
            max_concurrent_tasks: 10,
            retention_hours: 24,
        }
    }
}

impl SchedulerConfig {
    pub fn with_assign_interval_ms(mut self, interval: u64) -> Self {
        self.assign_interval_ms = interval;
        self
    }

    pub fn with_monitor_interval_ms(mut self, interval: u64) -> Self {
        self.monitor_interval_ms = interval;
        self
    }

    pub fn with_sweep_interval_ms(mut self, interval: u64) -> Self {
        self.sweep_interval_ms = interval;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, limit: usize) -> Self {
        self.max_concurrent_tasks = limit;
        self
    }

    pub fn with_retention_hours(mut self, hours: u64) -> Self {
        self.retention_hours = hours;
        self
    }
}

/// Counts from one sweep pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepOutcome {
    /// Tasks flipped to Timeout by this pass.
    pub timed_out: usize,
    /// Terminal rows deleted past retention.
    pub purged: u64,
}

/// Drives assignment, monitoring, and sweeping over a task store.
///
/// The store and probe are constructor-injected; attach an event
/// publisher with [`with_events`](Self::with_events) to surface
/// lifecycle events to subscribers.
pub struct QueueScheduler<S, P> {
    config: SchedulerConfig,
    store: Arc<S>,
    probe: Arc<P>,
    events: Option<Arc<dyn TaskEventPublisher>>,
    shutdown: ShutdownToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, P> fmt::Debug for QueueScheduler<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loop_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("QueueScheduler")
            .field("config", &self.config)
            .field("store_type", &type_name::<S>())
            .field("probe_type", &type_name::<P>())
            .field("loop_count", &loop_count)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<S, P> QueueScheduler<S, P>
where
    S: TaskStore + TaskSweeper + 'static,
    P: ResourceProbe + 'static,
{
    pub fn new(config: SchedulerConfig, store: Arc<S>, probe: Arc<P>) -> Self {
        Self {
            config,
            store,
            probe,
            events: None,
            shutdown: ShutdownToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Attach an event publisher for lifecycle events.
    pub fn with_events(mut self, events: Arc<dyn TaskEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Token shared with the loops; cancelling it stops them.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    async fn publish(&self, event: TaskEvent) {
        if let Some(events) = &self.events {
            if let Err(err) = events.publish(event).await {
                debug!(error = %err, "event publish failed");
            }
        }
    }

    /// Bind pending tasks to available resources, highest priority
    /// first, most free memory first. Returns the number bound.
    ///
    /// A task that loses its assignment race is skipped without
    /// consuming a resource; any other assignment failure forfeits the
    /// resource for this pass and moves on.
    pub async fn run_assignment_pass(&self) -> Result<usize, TaskError> {
        let pending = self
            .store
            .pending_unassigned(self.config.max_concurrent_tasks)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut resources = self.store.available_resources().await?.into_iter();
        let mut resource = resources.next();
        let mut assigned = 0usize;

        for entry in pending {
            let Some(current) = resource.as_ref() else {
                debug!("no free resources left this pass");
                break;
            };
            match self.store.assign(entry.task_id, &current.resource_id).await {
                Ok(task) => {
                    assigned += 1;
                    debug!(
                        task = %task.task_id,
                        resource = %current.resource_id,
                        priority = %entry.priority,
                        "task assigned to resource"
                    );
                    self.publish(TaskEvent::new(
                        task.task_id,
                        TaskEventPayload::ResourceBound {
                            resource_id: current.resource_id.clone(),
                        },
                    ))
                    .await;
                    self.publish(TaskEvent::new(
                        task.task_id,
                        TaskEventPayload::StatusChanged {
                            from: TaskStatus::Pending,
                            to: TaskStatus::Processing,
                        },
                    ))
                    .await;
                    resource = resources.next();
                }
                Err(err) if err.is_lifecycle_misuse() => {
                    // Lost the race for this entry; the resource is still
                    // free for the next one.
                    debug!(task = %entry.task_id, error = %err, "assignment race lost");
                }
                Err(err) => {
                    warn!(
                        task = %entry.task_id,
                        resource = %current.resource_id,
                        error = %err,
                        "assignment failed"
                    );
                    resource = resources.next();
                }
            }
        }

        if assigned > 0 {
            telemetry::record_assignments(assigned);
            info!(assigned, "assignment pass bound tasks");
        }
        Ok(assigned)
    }

    /// Release resource bindings held by terminal tasks. Idempotent;
    /// returns the number released.
    pub async fn run_reap_pass(&self) -> Result<usize, TaskError> {
        let released = self.store.release_terminal_bindings().await?;
        for binding in &released {
            self.publish(TaskEvent::new(
                binding.task_id,
                TaskEventPayload::ResourceReleased {
                    resource_id: binding.resource_id.clone(),
                },
            ))
            .await;
        }
        if !released.is_empty() {
            telemetry::record_releases(released.len());
        }
        Ok(released.len())
    }

    /// Refresh telemetry for every probeable resource, plus the queue
    /// occupancy gauges. A failed probe marks that resource stale and
    /// the pass continues. Returns the number refreshed.
    pub async fn run_monitor_pass(&self) -> Result<usize, TaskError> {
        let mut refreshed = 0usize;
        for resource_id in self.probe.resource_ids() {
            match self.probe.probe(&resource_id).await {
                Ok(reading) => {
                    telemetry::set_resource_memory_free(
                        &reading.resource_id,
                        reading.memory_free(),
                    );
                    self.store.upsert_resource(reading).await?;
                    refreshed += 1;
                }
                Err(err) => {
                    warn!(resource = %resource_id, error = %err, "resource probe failed");
                    self.store.mark_resource_stale(&resource_id).await?;
                }
            }
        }

        let summary = self.store.queue_status().await?;
        telemetry::set_queue_depth(summary.waiting, summary.assigned);
        Ok(refreshed)
    }

    /// Time out overdue tasks, then purge terminal rows older than the
    /// retention window.
    pub async fn run_sweep_pass(&self) -> Result<SweepOutcome, TaskError> {
        let now = Utc::now();

        let overdue = self.store.mark_overdue_tasks(now).await?;
        for task in &overdue {
            self.publish(TaskEvent::new(task.task_id, TaskEventPayload::TimedOut))
                .await;
        }
        if !overdue.is_empty() {
            telemetry::record_timeouts(overdue.len());
        }

        let cutoff = now - chrono::Duration::hours(self.config.retention_hours as i64);
        let purged = self.store.purge_terminal_older_than(cutoff).await?;

        Ok(SweepOutcome {
            timed_out: overdue.len(),
            purged,
        })
    }

    /// Run an initial resource scan, then spawn the three loops.
    ///
    /// Call once; loops run until [`shutdown`](Self::shutdown).
    pub async fn start(self: &Arc<Self>) {
        if let Err(err) = self.run_monitor_pass().await {
            warn!(error = %err, "initial resource scan failed");
        }

        let assign_interval = Duration::from_millis(self.config.assign_interval_ms);
        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let assign_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("assignment loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(assign_interval) => {
                        if let Err(err) = this.run_reap_pass().await {
                            warn!(error = %err, "reap pass failed");
                        }
                        if let Err(err) = this.run_assignment_pass().await {
                            warn!(error = %err, "assignment pass failed");
                        }
                    }
                }
            }
        });

        let monitor_interval = Duration::from_millis(self.config.monitor_interval_ms);
        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let monitor_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("monitor loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(monitor_interval) => {
                        if let Err(err) = this.run_monitor_pass().await {
                            warn!(error = %err, "monitor pass failed");
                        }
                    }
                }
            }
        });

        let sweep_interval = Duration::from_millis(self.config.sweep_interval_ms);
        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let sweep_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("sweep loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(sweep_interval) => {
                        if let Err(err) = this.run_sweep_pass().await {
                            warn!(error = %err, "sweep pass failed");
                        }
                    }
                }
            }
        });

        let mut handles = self.handles.lock().await;
        handles.push(assign_handle);
        handles.push(monitor_handle);
        handles.push(sweep_handle);
        info!(
            assign_interval_ms = self.config.assign_interval_ms,
            monitor_interval_ms = self.config.monitor_interval_ms,
            sweep_interval_ms = self.config.sweep_interval_ms,
            "queue scheduler started"
        );
    }

    /// Cancel the loops and join them.
    pub async fn shutdown(&self) {
        info!("stopping queue scheduler");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "scheduler loop failed"),
                Err(_) => warn!("scheduler loop did not stop in time"),
            }
        }
        info!("queue scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    // Import through the external `polyglot` crate (self dev-dependency)
    // rather than `super`: polyglot-testkit's trait impls are compiled
    // against that build, so `crate`-path types would not unify with them.
    use polyglot::config::TaskPolicy;
    use polyglot::scheduler::{QueueScheduler, SchedulerConfig, ShutdownToken, SweepOutcome};
    use polyglot_testkit::{InMemoryTaskStore, MockProbe};

    fn build_scheduler(
        config: SchedulerConfig,
    ) -> Arc<QueueScheduler<InMemoryTaskStore, MockProbe>> {
        let store = Arc::new(InMemoryTaskStore::new(TaskPolicy::default()));
        let probe = Arc::new(MockProbe::new());
        Arc::new(QueueScheduler::new(config, store, probe))
    }

    #[tokio::test]
    async fn shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        token.cancel();
        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake after cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_token_returns_immediately() {
        let token = ShutdownToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already-cancelled token should not wait");
    }

    #[test]
    fn config_builders_override_defaults() {
        let config = SchedulerConfig::default()
            .with_assign_interval_ms(50)
            .with_monitor_interval_ms(75)
            .with_sweep_interval_ms(100)
            .with_max_concurrent_tasks(3)
            .with_retention_hours(1);
        assert_eq!(config.assign_interval_ms, 50);
        assert_eq!(config.monitor_interval_ms, 75);
        assert_eq!(config.sweep_interval_ms, 100);
        assert_eq!(config.max_concurrent_tasks, 3);
        assert_eq!(config.retention_hours, 1);
    }

    #[tokio::test]
    async fn passes_are_no_ops_on_an_empty_store() {
        let scheduler = build_scheduler(SchedulerConfig::default());
        assert_eq!(scheduler.run_assignment_pass().await.unwrap(), 0);
        assert_eq!(scheduler.run_reap_pass().await.unwrap(), 0);
        assert_eq!(scheduler.run_monitor_pass().await.unwrap(), 0);
        assert_eq!(
            scheduler.run_sweep_pass().await.unwrap(),
            SweepOutcome::default()
        );
    }

    #[tokio::test]
    async fn start_and_shutdown_join_all_loops() {
        let config = SchedulerConfig::default()
            .with_assign_interval_ms(10)
            .with_monitor_interval_ms(10)
            .with_sweep_interval_ms(10);
        let scheduler = build_scheduler(config);

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .expect("shutdown should join all loops");
        assert!(scheduler.shutdown_token().is_cancelled());
    }
}
