//! Task lifecycle events.
//!
//! The scheduler publishes an event for every externally visible state
//! change. [`TaskEventBus`] fans events out over a tokio broadcast
//! channel; publishing never blocks, and a subscriber that falls behind
//! sees `RecvError::Lagged` instead of stalling the publisher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::task::{TaskId, TaskPriority, TaskStatus};

/// Metadata envelope attached to every task event.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_id: Uuid,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            task_id,
            timestamp: Utc::now(),
        }
    }
}

/// A task lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEvent {
    pub meta: EventMeta,
    pub payload: TaskEventPayload,
}

impl TaskEvent {
    pub fn new(task_id: TaskId, payload: TaskEventPayload) -> Self {
        Self {
            meta: EventMeta::new(task_id),
            payload,
        }
    }
}

/// Payload emitted for task lifecycle changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TaskEventPayload {
    /// Task was created and enqueued.
    Created { priority: TaskPriority },
    /// Task moved between lifecycle states.
    StatusChanged { from: TaskStatus, to: TaskStatus },
    /// Progress report from the worker processing the task.
    Progress {
        progress: f32,
        message: Option<String>,
    },
    /// A resource was bound to the task for processing.
    ResourceBound { resource_id: String },
    /// The task's resource binding was released.
    ResourceReleased { resource_id: String },
    /// Task exceeded its timeout and was flipped to Timeout.
    TimedOut,
}

/// Publisher side of the event stream.
///
/// The scheduler takes this as a trait object so callers can bridge
/// events to an external system instead of the in-process bus.
#[async_trait]
pub trait TaskEventPublisher: Send + Sync {
    /// Publish an event to all subscribers. Must not block on slow
    /// consumers.
    async fn publish(&self, event: TaskEvent) -> anyhow::Result<()>;
}

/// In-process event bus over a tokio broadcast channel.
///
/// Fan-out: every active subscriber receives a clone of each event
/// published after it subscribed. Bounded: once `capacity` is exceeded
/// the oldest events are dropped and lagging subscribers observe
/// `RecvError::Lagged`.
pub struct TaskEventBus {
    sender: broadcast::Sender<TaskEvent>,
    capacity: usize,
}

impl std::fmt::Debug for TaskEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl TaskEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Configured channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event. With no subscribers the event is dropped.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for TaskEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl TaskEventPublisher for TaskEventBus {
    async fn publish(&self, event: TaskEvent) -> anyhow::Result<()> {
        TaskEventBus::publish(self, event);
        Ok(())
    }
}
