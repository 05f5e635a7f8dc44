//! Polyglot - Translation request routing and task orchestration.
//!
//! A foundational crate for serving machine translation over a pool of
//! engine instances, with admission control, weighted instance scoring,
//! pivot routing, and a durable task lifecycle backed by a queue scheduler.
//!
//! # Core Concepts
//!
//! - **Pool**: [`InstancePool`] owns the engine instances and admits calls
//!   onto the best-scoring one via [`score_instance`], a documented
//!   weighted sum over capacity, affinity, latency, success rate, and
//!   free memory.
//!
//! - **Engines**: The [`TranslationEngine`] trait abstracts translation
//!   backends, [`EngineFactory`] constructs them per device, and
//!   [`Tokenizer`] / [`TokenizerRegistry`] fix the token counting contract
//!   shared by every instance of a language pair.
//!
//! - **Orchestration**: [`TranslationOrchestrator`] canonicalizes language
//!   tags (see [`lang`]), tokenizes, and routes a batch either directly or
//!   as two pivot legs through [`PIVOT_LANG`].
//!
//! - **Tasks**: [`Task`] carries the durable lifecycle; [`TaskStatus`]
//!   defines the legal transitions and [`TaskStore`] persists them with
//!   admission control against [`TaskPolicy`].
//!
//! - **Scheduling**: [`QueueScheduler`] runs the assignment, monitor, and
//!   sweep loops over a [`TaskStore`] + [`TaskSweeper`] backend and a
//!   [`ResourceProbe`], stopping on a shared [`ShutdownToken`].
//!
//! - **Events**: [`TaskEventBus`] broadcasts [`TaskEvent`]s describing
//!   lifecycle changes to any number of subscribers.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use polyglot::*;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(InstancePool::initialize(PoolConfig::default(), &factory).await?);
//! let orchestrator =
//!     TranslationOrchestrator::new(pool, tokenizers, OrchestratorConfig::default());
//!
//! let outputs = orchestrator
//!     .translate_batch(&texts, "de", "fr", WorkloadAffinity::Interactive, false)
//!     .await?;
//! ```

/// Configuration structures for persistence and task policy.
///
/// The `config` module defines [`PersistenceConfig`] for the database
/// connection and [`TaskPolicy`] for retry, timeout, and admission limits.
pub mod config;

/// Engine, tokenizer, and probe abstractions.
///
/// The `engine` module defines the seams a backend plugs into:
/// - [`TranslationEngine`] - one loaded engine instance
/// - [`EngineFactory`] - constructs engines per kind and device index
/// - [`Tokenizer`] and [`TokenizerRegistry`] - the token counting contract
/// - [`ResourceProbe`] - device telemetry for the scheduler's monitor loop
/// - [`DeviceMemory`] - a probe's memory reading
pub mod engine;

/// Error types for the pool, translation, and task layers.
///
/// The `error` module defines [`PoolError`], [`TranslateError`], and
/// [`TaskError`], each carrying enough context to act on programmatically.
pub mod error;

/// Task lifecycle event publishing.
///
/// The `events` module provides [`TaskEvent`] and [`TaskEventPayload`] for
/// event data, the [`TaskEventPublisher`] trait for pub/sub seams, and
/// [`TaskEventBus`] for in-process broadcasting.
pub mod events;

/// Language tag canonicalization.
///
/// The `lang` module folds aliases and regional variants onto canonical
/// tags via [`canonicalize`], and names the pivot language [`PIVOT_LANG`].
pub mod lang;

/// Translation routing over the instance pool.
///
/// The `orchestrator` module provides [`TranslationOrchestrator`], which
/// turns text in into text out: canonicalize, tokenize, acquire, run the
/// engine, decode, release. Pivot pairs run as two legs.
pub mod orchestrator;

/// Instance pool with admission control and weighted scoring.
///
/// The `pool` module provides [`InstancePool`] and its supporting types:
/// - [`InstanceKind`] and [`WorkloadAffinity`] - what a caller asks for
/// - [`PoolConfig`] and [`ScoreWeights`] - tuning
/// - [`score_instance`] - the selection function, exposed for benchmarks
/// - [`InstancePermit`] - an admitted slot, returned through `release`
pub mod pool;

/// Queue scheduling loops.
///
/// The `scheduler` module provides [`QueueScheduler`] with its assignment,
/// monitor, and sweep passes, [`SchedulerConfig`] for intervals and batch
/// limits, and [`ShutdownToken`] for graceful shutdown signaling.
pub mod scheduler;

/// Task persistence traits and row types.
///
/// The `store` module defines [`TaskStore`] for the task lifecycle and
/// [`TaskSweeper`] for maintenance passes, plus the types they exchange:
/// [`QueueEntry`], [`Resource`], [`ResourceTelemetry`], [`TaskMetrics`],
/// [`QueueSummary`], and [`ReleasedBinding`].
pub mod store;

/// Core task definitions.
///
/// The `task` module defines [`Task`], [`TaskId`], [`TaskPriority`],
/// [`TaskStatus`] with its transition rules, and [`TaskParams`] for
/// creation requests.
pub mod task;

/// Tracing spans and measurement recording.
///
/// The `telemetry` module provides span constructors and `record_*`
/// helpers that log through `tracing` and, when the `metrics` feature is
/// enabled, feed the Prometheus collectors.
pub mod telemetry;

/// Prometheus metrics collectors.
///
/// The `metrics` module compiles to nothing unless the `metrics` feature
/// is enabled; see its documentation for the exported metric names.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides the PostgreSQL-backed task store
/// when the `postgres` feature is enabled.
pub mod persistence;

pub use config::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use lang::*;
pub use orchestrator::*;
pub use pool::*;
pub use scheduler::*;
pub use store::*;
pub use task::*;
