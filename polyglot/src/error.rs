//! Error taxonomy for routing, translation, and task lifecycle failures.
//!
//! Three enums split the surface by subsystem so callers can match on the
//! failure kind instead of parsing strings:
//!
//! - [`PoolError`] - instance admission failures
//! - [`TranslateError`] - orchestration and engine failures
//! - [`TaskError`] - durable task lifecycle failures
//!
//! Collaborator and storage internals stay on `anyhow`; they are wrapped
//! into these types at the module boundary.

use std::time::Duration;

use thiserror::Error;

use crate::pool::InstanceKind;
use crate::task::{TaskId, TaskStatus};

/// Failures raised by [`InstancePool::acquire`](crate::pool::InstancePool::acquire).
#[derive(Debug, Error)]
pub enum PoolError {
    /// No instance of the requested kind exists in the pool.
    #[error("no {kind} instance available in the pool")]
    ResourceExhausted {
        /// The instance kind that was requested.
        kind: InstanceKind,
    },

    /// Admission did not succeed within the configured wait bound.
    #[error("timed out after {waited:?} waiting for a free {kind} slot")]
    AcquisitionTimeout {
        /// The instance kind that was requested.
        kind: InstanceKind,
        /// How long the caller waited before giving up.
        waited: Duration,
    },
}

/// Failures raised by the translation orchestrator.
///
/// Engine-level failures are wrapped rather than retried; the caller owns
/// the retry decision. The instance involved is always released before one
/// of these is returned.
#[derive(Debug, Error)]
pub enum TranslateError {
    /// Source and target resolve to the same canonical language.
    #[error("source and target are both {lang}; nothing to translate")]
    SameLanguage {
        /// The shared canonical language tag.
        lang: String,
    },

    /// No usable tokenizer for the source language.
    #[error("tokenizer unavailable for {lang}")]
    Tokenizer {
        /// The language whose tokenizer failed to resolve.
        lang: String,
        /// Registry-level cause.
        #[source]
        source: anyhow::Error,
    },

    /// The translation engine failed mid-call.
    #[error("translation engine failure")]
    Engine(#[source] anyhow::Error),

    /// Could not obtain an instance to run the call on.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Failures raised by [`TaskStore`](crate::store::TaskStore) operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task id does not exist in the store.
    #[error("task {task_id} not found")]
    NotFound {
        /// The missing task.
        task_id: TaskId,
    },

    /// The requested status change is not legal from the current status.
    ///
    /// Schedulers log this and move on; it never crashes a background loop.
    #[error("task {task_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// The task whose transition was rejected.
        task_id: TaskId,
        /// Status the task currently holds.
        from: TaskStatus,
        /// Status that was requested.
        to: TaskStatus,
    },

    /// `retry` called on a task that already used all its attempts.
    #[error("task {task_id} exhausted its retries ({retry_count}/{max_retries})")]
    RetryExhausted {
        /// The task that cannot be retried.
        task_id: TaskId,
        /// Attempts consumed so far.
        retry_count: u32,
        /// Configured attempt ceiling.
        max_retries: u32,
    },

    /// Too many non-terminal tasks already exist.
    #[error("active task limit reached ({active}/{limit})")]
    CapacityExceeded {
        /// Current number of pending + processing tasks.
        active: u64,
        /// Configured ceiling.
        limit: u64,
    },

    /// Backend failure (connection loss, constraint violation, poisoned row).
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl TaskError {
    /// Whether this error reflects caller misuse rather than store trouble.
    ///
    /// Misuse errors are recorded and ignored by background loops; storage
    /// errors are surfaced so the loop can log and back off.
    pub fn is_lifecycle_misuse(&self) -> bool {
        matches!(
            self,
            TaskError::InvalidTransition { .. } | TaskError::RetryExhausted { .. }
        )
    }
}
