//! Durable task pipeline example with the in-memory store.
//!
//! This example demonstrates the task lifecycle end to end: admission,
//! priority scheduling onto resources, progress, completion, retry, and
//! the timeout sweep, with lifecycle events streaming alongside.
//!
//! The in-memory store comes from polyglot-testkit; swap in
//! `PostgresTaskStore` (behind the `postgres` feature) for durability.
//! For the translation routing side, see `basic_routing.rs`.

use std::sync::Arc;
use std::time::Duration;

use polyglot::*;
use polyglot_testkit::{telemetry, InMemoryTaskStore, MockProbe};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Polyglot Task Pipeline Example ===\n");
    println!("This example demonstrates:");
    println!("- Task admission with an active-task ceiling");
    println!("- Priority scheduling onto probed resources");
    println!("- Progress, completion, retry, and timeout sweeps");
    println!("- Lifecycle events on the broadcast bus\n");

    // Store, probe, and scheduler with fast intervals for the demo.
    println!("1. Starting the scheduler...");
    let store = Arc::new(InMemoryTaskStore::new(
        TaskPolicy::default().with_max_active_tasks(10),
    ));
    let probe = MockProbe::new()
        .with_device(telemetry("gpu-0", 16_000_000_000, 2_000_000_000))
        .with_device(telemetry("gpu-1", 16_000_000_000, 4_000_000_000));
    let bus = Arc::new(TaskEventBus::new(256));

    let mut events = bus.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let line = match &event.payload {
                        TaskEventPayload::Created { priority } => {
                            format!("created ({priority})")
                        }
                        TaskEventPayload::StatusChanged { from, to } => {
                            format!("{from} -> {to}")
                        }
                        TaskEventPayload::Progress { progress, .. } => {
                            format!("progress {progress:.0}%")
                        }
                        TaskEventPayload::ResourceBound { resource_id } => {
                            format!("bound to {resource_id}")
                        }
                        TaskEventPayload::ResourceReleased { resource_id } => {
                            format!("released {resource_id}")
                        }
                        TaskEventPayload::TimedOut => "timed out".to_string(),
                        _ => continue,
                    };
                    println!("   [events] task {}: {line}", event.meta.task_id);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let scheduler = Arc::new(
        QueueScheduler::new(
            SchedulerConfig::default()
                .with_assign_interval_ms(200)
                .with_monitor_interval_ms(500)
                .with_sweep_interval_ms(1_000),
            Arc::clone(&store),
            Arc::new(probe),
        )
        .with_events(Arc::clone(&bus) as Arc<dyn TaskEventPublisher>),
    );
    scheduler.start().await;
    println!("   two resources probed, loops running");

    // Mixed priorities; the urgent task is assigned first even though
    // it arrived last.
    println!("\n2. Submitting tasks...");
    let submissions = [
        ("client-alpha", "zh", "en", TaskPriority::Normal),
        ("client-beta", "mn", "zh", TaskPriority::Low),
        ("client-gamma", "en", "zh-TW", TaskPriority::Normal),
        ("client-delta", "zh", "mn", TaskPriority::Urgent),
    ];
    for (client, source, target, priority) in submissions {
        let task = store
            .create(
                TaskParams::new(client, source, target)
                    .with_priority(priority)
                    .with_files(2, 8_192),
            )
            .await?;
        // The scheduler publishes assignment events; creation events are
        // the submitter's to announce.
        bus.publish(TaskEvent::new(
            task.task_id,
            TaskEventPayload::Created { priority },
        ));
        println!(
            "   task {} ({client}, {source} -> {target}, {priority})",
            task.task_id
        );
    }

    // Drain the queue: the scheduler assigns, we play the worker.
    println!("\n3. Processing until the queue drains...");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let processing = store.list(Some(TaskStatus::Processing), None).await?;
        for task in &processing {
            store
                .update_progress(task.task_id, 60.0, Some("second file".into()))
                .await?;
            bus.publish(TaskEvent::new(
                task.task_id,
                TaskEventPayload::Progress {
                    progress: 60.0,
                    message: Some("second file".into()),
                },
            ));
            store
                .transition(task.task_id, TaskStatus::Completed, None, None)
                .await?;
            println!("   completed task {}", task.task_id);
        }
        if store.active_count().await? == 0 {
            break;
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "queue did not drain in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // A failed task goes back to the queue until its retries run out.
    println!("\n4. Failing and retrying a task...");
    let flaky = store
        .create(TaskParams::new("client-flaky", "mn", "en").with_max_retries(2))
        .await?;
    wait_for_status(&store, flaky.task_id, TaskStatus::Processing).await?;
    store
        .transition(
            flaky.task_id,
            TaskStatus::Failed,
            None,
            Some("device fault".into()),
        )
        .await?;
    let retried = store.retry(flaky.task_id).await?;
    println!(
        "   re-enqueued (attempt {}/{})",
        retried.retry_count, retried.max_retries
    );
    wait_for_status(&store, flaky.task_id, TaskStatus::Processing).await?;
    store
        .transition(flaky.task_id, TaskStatus::Completed, None, None)
        .await?;
    println!("   completed on the second attempt");

    // A task that outlives its budget is flipped by the sweep loop.
    println!("\n5. Letting a task time out (1s budget)...");
    let doomed = store
        .create(TaskParams::new("client-slow", "zh", "en").with_timeout_seconds(1))
        .await?;
    wait_for_status(&store, doomed.task_id, TaskStatus::Timeout).await?;
    let fetched = store.get(doomed.task_id).await?;
    println!(
        "   task {} timed out: {}",
        doomed.task_id,
        fetched.error_message.as_deref().unwrap_or("-")
    );

    println!("\n6. Final accounting:");
    let metrics = store.metrics().await?;
    println!(
        "   completed={} failed={} timeout={} cancelled={}",
        metrics.completed, metrics.failed, metrics.timeout, metrics.cancelled
    );
    println!("   success rate: {:.0}%", metrics.success_rate() * 100.0);
    let queue = store.queue_status().await?;
    println!(
        "   queue: waiting={} assigned={} resources {}/{} available",
        queue.waiting, queue.assigned, queue.resources_available, queue.resources_total
    );

    scheduler.shutdown().await;
    printer.abort();

    println!("\n=== Example Complete ===");
    println!("\nKey takeaways:");
    println!("- The store owns the state machine; illegal transitions are rejected");
    println!("- Completing a task frees its resource for the next assignment pass");
    println!("- Retry re-enqueues a failed task until max_retries is spent");
    println!("- The sweep loop times out overdue tasks and purges old terminal ones");
    println!("- The in-memory store is perfect for demos and tests (via polyglot-testkit)");
    println!("- For production, use PostgresTaskStore behind the `postgres` feature");

    Ok(())
}

/// Poll until the task reaches `status` or a 10s deadline passes.
async fn wait_for_status(
    store: &InMemoryTaskStore,
    task_id: TaskId,
    status: TaskStatus,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if store.get(task_id).await?.status == status {
            return Ok(());
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} never reached {status}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
