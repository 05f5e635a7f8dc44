//! Scheduler integration tests over the in-memory store.
//!
//! Covers priority-ordered assignment, resource reclamation, timeout
//! sweeping, admission control, retry exhaustion, and the event stream
//! the scheduler publishes.

use std::sync::Arc;
use std::time::Duration;

use polyglot::{
    QueueScheduler, SchedulerConfig, TaskError, TaskEvent, TaskEventBus, TaskEventPayload,
    TaskEventPublisher, TaskPolicy, TaskPriority, TaskStatus, TaskStore,
};
use polyglot_testkit::{task_params, telemetry, InMemoryTaskStore, MockProbe};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn build_scheduler(
    policy: TaskPolicy,
    probe: MockProbe,
) -> (Arc<QueueScheduler<InMemoryTaskStore, MockProbe>>, Arc<InMemoryTaskStore>) {
    let store = Arc::new(InMemoryTaskStore::new(policy));
    let scheduler = Arc::new(QueueScheduler::new(
        SchedulerConfig::default(),
        Arc::clone(&store),
        Arc::new(probe),
    ));
    (scheduler, store)
}

async fn next_event(rx: &mut broadcast::Receiver<TaskEvent>) -> Option<TaskEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[tokio::test]
async fn urgent_tasks_are_assigned_before_earlier_low_priority_ones() {
    let probe = MockProbe::new().with_device(telemetry("gpu-0", 16_000, 2_000));
    let (scheduler, store) = build_scheduler(TaskPolicy::default(), probe);
    scheduler.run_monitor_pass().await.unwrap();

    let low_a = store
        .create(task_params("client-a").with_priority(TaskPriority::Low))
        .await
        .unwrap();
    let low_b = store
        .create(task_params("client-b").with_priority(TaskPriority::Low))
        .await
        .unwrap();
    let urgent = store
        .create(task_params("client-c").with_priority(TaskPriority::Urgent))
        .await
        .unwrap();

    let assigned = scheduler.run_assignment_pass().await.unwrap();
    assert_eq!(assigned, 1, "one resource admits one task");

    assert_eq!(
        store.get(urgent.task_id).await.unwrap().status,
        TaskStatus::Processing
    );
    assert_eq!(
        store.get(low_a.task_id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(
        store.get(low_b.task_id).await.unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn equal_priorities_are_assigned_in_arrival_order() {
    let probe = MockProbe::new().with_device(telemetry("gpu-0", 16_000, 2_000));
    let (scheduler, store) = build_scheduler(TaskPolicy::default(), probe);
    scheduler.run_monitor_pass().await.unwrap();

    let first = store.create(task_params("client-a")).await.unwrap();
    let second = store.create(task_params("client-b")).await.unwrap();

    scheduler.run_assignment_pass().await.unwrap();
    assert_eq!(
        store.get(first.task_id).await.unwrap().status,
        TaskStatus::Processing
    );
    assert_eq!(
        store.get(second.task_id).await.unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn completing_a_task_frees_its_resource_for_the_next_one() {
    let probe = MockProbe::new().with_device(telemetry("gpu-0", 16_000, 2_000));
    let (scheduler, store) = build_scheduler(TaskPolicy::default(), probe);
    scheduler.run_monitor_pass().await.unwrap();

    let first = store.create(task_params("client-a")).await.unwrap();
    let second = store.create(task_params("client-b")).await.unwrap();

    assert_eq!(scheduler.run_assignment_pass().await.unwrap(), 1);
    let bound = store.resource("gpu-0").expect("resource registered");
    assert_eq!(bound.current_task_id, Some(first.task_id));
    assert!(!bound.is_available);

    store
        .transition(first.task_id, TaskStatus::Completed, None, None)
        .await
        .unwrap();
    let freed = store.resource("gpu-0").unwrap();
    assert!(freed.is_available, "terminal transition frees the binding");
    assert_eq!(freed.current_task_id, None);

    assert_eq!(scheduler.run_assignment_pass().await.unwrap(), 1);
    assert_eq!(
        store.get(second.task_id).await.unwrap().status,
        TaskStatus::Processing
    );
}

#[tokio::test]
async fn reap_recovers_bindings_left_by_deleted_tasks() {
    let probe = MockProbe::new().with_device(telemetry("gpu-0", 16_000, 2_000));
    let (scheduler, store) = build_scheduler(TaskPolicy::default(), probe);
    scheduler.run_monitor_pass().await.unwrap();

    let task = store.create(task_params("client-a")).await.unwrap();
    scheduler.run_assignment_pass().await.unwrap();
    store.delete(task.task_id).await.unwrap();

    // The store leaves the binding; the reap pass is the catch-all.
    let still_bound = store.resource("gpu-0").unwrap();
    assert_eq!(still_bound.current_task_id, Some(task.task_id));

    assert_eq!(scheduler.run_reap_pass().await.unwrap(), 1);
    let freed = store.resource("gpu-0").unwrap();
    assert!(freed.is_available);
    assert_eq!(freed.current_task_id, None);

    assert_eq!(scheduler.run_reap_pass().await.unwrap(), 0, "idempotent");
}

#[tokio::test]
async fn sweep_times_out_overdue_tasks_and_reap_frees_their_resources() {
    let probe = MockProbe::new().with_device(telemetry("gpu-0", 16_000, 2_000));
    let (scheduler, store) = build_scheduler(TaskPolicy::default(), probe);
    scheduler.run_monitor_pass().await.unwrap();

    let task = store
        .create(task_params("client-a").with_timeout_seconds(0))
        .await
        .unwrap();
    scheduler.run_assignment_pass().await.unwrap();

    let outcome = scheduler.run_sweep_pass().await.unwrap();
    assert_eq!(outcome.timed_out, 1);

    let flipped = store.get(task.task_id).await.unwrap();
    assert_eq!(flipped.status, TaskStatus::Timeout);
    assert_eq!(
        flipped.error_message.as_deref(),
        Some("task exceeded its timeout")
    );
    assert!(store.queue_entry(task.task_id).is_none());

    // The sweep leaves the binding for the reap step of the next
    // assignment tick.
    assert_eq!(
        store.resource("gpu-0").unwrap().current_task_id,
        Some(task.task_id)
    );
    assert_eq!(scheduler.run_reap_pass().await.unwrap(), 1);
    assert!(store.resource("gpu-0").unwrap().is_available);
}

#[tokio::test]
async fn sweep_purges_terminal_tasks_past_retention() {
    let probe = MockProbe::new();
    let (scheduler, store) = build_scheduler(TaskPolicy::default(), probe);

    let task = store.create(task_params("client-a")).await.unwrap();
    store.cancel(task.task_id, None).await.unwrap();

    // Within retention: kept.
    let outcome = scheduler.run_sweep_pass().await.unwrap();
    assert_eq!(outcome.purged, 0);
    assert!(store.get(task.task_id).await.is_ok());

    // Zero retention: everything terminal goes.
    let scheduler = Arc::new(
        QueueScheduler::new(
            SchedulerConfig::default().with_retention_hours(0),
            Arc::clone(&store),
            Arc::new(MockProbe::new()),
        ),
    );
    let outcome = scheduler.run_sweep_pass().await.unwrap();
    assert_eq!(outcome.purged, 1);
    assert!(matches!(
        store.get(task.task_id).await,
        Err(TaskError::NotFound { .. })
    ));
}

#[tokio::test]
async fn admission_control_refuses_past_max_active_tasks() {
    let probe = MockProbe::new();
    let (_, store) = build_scheduler(TaskPolicy::default().with_max_active_tasks(2), probe);

    store.create(task_params("client-a")).await.unwrap();
    let second = store.create(task_params("client-b")).await.unwrap();

    let err = store.create(task_params("client-c")).await.unwrap_err();
    assert!(matches!(
        err,
        TaskError::CapacityExceeded {
            active: 2,
            limit: 2
        }
    ));

    // A terminal task stops counting against the limit.
    store.cancel(second.task_id, None).await.unwrap();
    store.create(task_params("client-c")).await.unwrap();
}

#[tokio::test]
async fn retry_restores_the_queue_until_attempts_run_out() {
    let probe = MockProbe::new().with_device(telemetry("gpu-0", 16_000, 2_000));
    let (scheduler, store) = build_scheduler(TaskPolicy::default(), probe);
    scheduler.run_monitor_pass().await.unwrap();

    let task = store
        .create(task_params("client-a").with_max_retries(1))
        .await
        .unwrap();

    scheduler.run_assignment_pass().await.unwrap();
    store
        .transition(
            task.task_id,
            TaskStatus::Failed,
            None,
            Some("device fault".to_string()),
        )
        .await
        .unwrap();
    assert!(store.queue_entry(task.task_id).is_none());

    let retried = store.retry(task.task_id).await.unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.error_message, None);
    assert!(store.queue_entry(task.task_id).is_some());

    scheduler.run_assignment_pass().await.unwrap();
    store
        .transition(task.task_id, TaskStatus::Failed, None, None)
        .await
        .unwrap();

    let err = store.retry(task.task_id).await.unwrap_err();
    assert!(matches!(
        err,
        TaskError::RetryExhausted {
            retry_count: 1,
            max_retries: 1,
            ..
        }
    ));
    assert_eq!(
        store.get(task.task_id).await.unwrap().status,
        TaskStatus::Failed,
        "refused retry mutates nothing"
    );
}

#[tokio::test]
async fn cancel_clears_the_queue_entry() {
    let probe = MockProbe::new();
    let (_, store) = build_scheduler(TaskPolicy::default(), probe);

    let task = store.create(task_params("client-a")).await.unwrap();
    assert_eq!(store.queue_status().await.unwrap().waiting, 1);

    let cancelled = store
        .cancel(task.task_id, Some("caller went away".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.error_message.as_deref(), Some("caller went away"));
    assert_eq!(store.queue_status().await.unwrap().waiting, 0);
    assert_eq!(store.active_count().await.unwrap(), 0);
}

#[tokio::test]
async fn monitor_pass_registers_resources_and_marks_failed_probes_stale() {
    let probe = MockProbe::new()
        .with_device(telemetry("gpu-0", 16_000, 8_000))
        .with_device(telemetry("gpu-1", 16_000, 2_000));
    let (scheduler, store) = build_scheduler(TaskPolicy::default(), probe.clone());

    assert_eq!(scheduler.run_monitor_pass().await.unwrap(), 2);
    let available = store.available_resources().await.unwrap();
    let ids: Vec<&str> = available.iter().map(|r| r.resource_id.as_str()).collect();
    assert_eq!(ids, ["gpu-1", "gpu-0"], "most free memory first");

    probe.set_probe_failure("gpu-1", true);
    assert_eq!(scheduler.run_monitor_pass().await.unwrap(), 1);

    let stale = store.resource("gpu-1").unwrap();
    assert!(stale.stale);
    assert!(
        stale.is_available,
        "a failed probe keeps the last known availability"
    );

    probe.set_probe_failure("gpu-1", false);
    assert_eq!(scheduler.run_monitor_pass().await.unwrap(), 2);
    assert!(!store.resource("gpu-1").unwrap().stale);
}

#[tokio::test]
async fn scheduler_events_trace_the_task_lifecycle() {
    let probe = MockProbe::new().with_device(telemetry("gpu-0", 16_000, 2_000));
    let store = Arc::new(InMemoryTaskStore::new(TaskPolicy::default()));
    let bus = Arc::new(TaskEventBus::new(64));
    let mut rx = bus.subscribe();
    let scheduler = Arc::new(
        QueueScheduler::new(
            SchedulerConfig::default(),
            Arc::clone(&store),
            Arc::new(probe),
        )
        .with_events(bus as Arc<dyn TaskEventPublisher>),
    );
    scheduler.run_monitor_pass().await.unwrap();

    let task = store.create(task_params("client-a")).await.unwrap();
    scheduler.run_assignment_pass().await.unwrap();

    let bound = next_event(&mut rx).await.expect("bound event");
    assert_eq!(bound.meta.task_id, task.task_id);
    assert!(matches!(
        bound.payload,
        TaskEventPayload::ResourceBound { ref resource_id } if resource_id == "gpu-0"
    ));

    let started = next_event(&mut rx).await.expect("status event");
    assert!(matches!(
        started.payload,
        TaskEventPayload::StatusChanged {
            from: TaskStatus::Pending,
            to: TaskStatus::Processing,
        }
    ));

    store.delete(task.task_id).await.unwrap();
    scheduler.run_reap_pass().await.unwrap();

    let released = next_event(&mut rx).await.expect("released event");
    assert!(matches!(
        released.payload,
        TaskEventPayload::ResourceReleased { ref resource_id } if resource_id == "gpu-0"
    ));
}

#[tokio::test]
async fn running_loops_drain_the_queue_end_to_end() {
    let probe = MockProbe::new()
        .with_device(telemetry("gpu-0", 16_000, 2_000))
        .with_device(telemetry("gpu-1", 16_000, 2_000));
    let store = Arc::new(InMemoryTaskStore::new(TaskPolicy::default()));
    let bus = Arc::new(TaskEventBus::new(256));
    let mut rx = bus.subscribe();
    let scheduler = Arc::new(
        QueueScheduler::new(
            SchedulerConfig::default()
                .with_assign_interval_ms(10)
                .with_monitor_interval_ms(10)
                .with_sweep_interval_ms(10),
            Arc::clone(&store),
            Arc::new(probe),
        )
        .with_events(bus as Arc<dyn TaskEventPublisher>),
    );

    scheduler.start().await;

    let mut expected = Vec::new();
    for idx in 0..2 {
        let task = store
            .create(task_params(&format!("client-{idx}")))
            .await
            .unwrap();
        expected.push(task.task_id);
    }

    let wait = timeout(Duration::from_secs(5), async {
        let mut seen = 0;
        while seen < expected.len() {
            if let Some(event) = next_event(&mut rx).await {
                if matches!(event.payload, TaskEventPayload::ResourceBound { .. }) {
                    seen += 1;
                }
            }
        }
    })
    .await;
    assert!(wait.is_ok(), "timed out waiting for assignments");

    for task_id in &expected {
        assert_eq!(
            store.get(*task_id).await.unwrap().status,
            TaskStatus::Processing
        );
    }
    scheduler.shutdown().await;
}

#[tokio::test]
async fn cancelled_tasks_never_reach_assignment() {
    let probe = MockProbe::new().with_device(telemetry("gpu-0", 16_000, 2_000));
    let (scheduler, store) = build_scheduler(TaskPolicy::default(), probe);
    scheduler.run_monitor_pass().await.unwrap();

    let doomed = store
        .create(task_params("client-a").with_priority(TaskPriority::High))
        .await
        .unwrap();
    let runner_up = store.create(task_params("client-b")).await.unwrap();

    store.cancel(doomed.task_id, None).await.unwrap();

    assert_eq!(scheduler.run_assignment_pass().await.unwrap(), 1);
    assert_eq!(
        store.get(doomed.task_id).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert_eq!(
        store.get(runner_up.task_id).await.unwrap().status,
        TaskStatus::Processing,
        "the resource goes to the next entry instead"
    );
}

#[tokio::test]
async fn queue_status_reflects_assignment_state() {
    let probe = MockProbe::new().with_device(telemetry("gpu-0", 16_000, 2_000));
    let (scheduler, store) = build_scheduler(TaskPolicy::default(), probe);
    scheduler.run_monitor_pass().await.unwrap();

    store.create(task_params("client-a")).await.unwrap();
    store.create(task_params("client-b")).await.unwrap();

    let before = store.queue_status().await.unwrap();
    assert_eq!(before.waiting, 2);
    assert_eq!(before.assigned, 0);
    assert_eq!(before.resources_available, 1);
    assert_eq!(before.resources_busy, 0);
    assert_eq!(before.max_active_tasks, 50);

    scheduler.run_assignment_pass().await.unwrap();

    let after = store.queue_status().await.unwrap();
    assert_eq!(after.waiting, 1);
    assert_eq!(after.assigned, 1);
    assert_eq!(after.resources_available, 0);
    assert_eq!(after.resources_busy, 1);
}
