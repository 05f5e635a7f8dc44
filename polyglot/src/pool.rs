//! Instance pool with per-instance admission control and weighted scoring.
//!
//! Each instance wraps one engine handle and admits at most
//! `concurrency_limit` concurrent calls through its own semaphore.
//! [`InstancePool::acquire`] ranks the instances of the requested kind with
//! a pure weighted sum over free capacity, affinity, response history,
//! success history, and device memory, then admits on the best free one,
//! parking on a saturated pool up to the configured timeout. Callers hand
//! the permit back through [`InstancePool::release`] together with the call
//! outcome, which is what feeds the history factors.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::engine::{DeviceMemory, EngineFactory, TranslationEngine};
use crate::error::PoolError;

/// Response-time samples retained per instance.
pub const RESPONSE_SAMPLE_WINDOW: usize = 10;

/// Default weight of the free-slot fraction.
pub const CAPACITY_WEIGHT: f64 = 40.0;
/// Default weight of the affinity term.
pub const AFFINITY_WEIGHT: f64 = 20.0;
/// Default weight of the response-time term.
pub const LATENCY_WEIGHT: f64 = 25.0;
/// Default weight of the historical success rate.
pub const SUCCESS_WEIGHT: f64 = 10.0;
/// Default weight of the free-memory term.
pub const MEMORY_WEIGHT: f64 = 5.0;
/// Default affinity factor applied when the instance tag does not match.
pub const AFFINITY_MISMATCH_FACTOR: f64 = -0.5;

/// The compute backing of a pool instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Cpu,
    Accelerator,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Cpu => "cpu",
            InstanceKind::Accelerator => "accelerator",
        }
    }
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workload class an instance is reserved for.
///
/// `Any` instances serve every caller. Tagged instances prefer callers of
/// the same class; the preference is a scoring penalty rather than a hard
/// wall, so a saturated class can still spill onto the other tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadAffinity {
    Any,
    Interactive,
    Batch,
}

impl WorkloadAffinity {
    /// Whether an instance tagged `self` matches a request for `wanted`.
    pub fn matches(self, wanted: WorkloadAffinity) -> bool {
        self == WorkloadAffinity::Any || wanted == WorkloadAffinity::Any || self == wanted
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadAffinity::Any => "any",
            WorkloadAffinity::Interactive => "interactive",
            WorkloadAffinity::Batch => "batch",
        }
    }
}

impl std::fmt::Display for WorkloadAffinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one instance within its pool.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct InstanceId(pub u32);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Weights of the instance scoring formula.
///
/// An instance's score is a weighted sum of five factors, each kept in
/// `[0, 1]` except the affinity term:
///
/// ```text
/// score = capacity * (free_slots / limit)
///       + affinity * (match ? 1.0 : mismatch_factor)
///       + latency  * (1 - avg_response / max_avg_response)
///       + success  * success_rate
///       + memory   * (1 - used / total)
/// ```
///
/// Higher is better. `mismatch_factor` turns the affinity term into a
/// penalty for cross-class admission and is tunable separately from the
/// weight itself.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub capacity: f64,
    pub affinity: f64,
    pub latency: f64,
    pub success: f64,
    pub memory: f64,
    /// Affinity factor for a mismatched instance, usually negative.
    pub mismatch_factor: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            capacity: CAPACITY_WEIGHT,
            affinity: AFFINITY_WEIGHT,
            latency: LATENCY_WEIGHT,
            success: SUCCESS_WEIGHT,
            memory: MEMORY_WEIGHT,
            mismatch_factor: AFFINITY_MISMATCH_FACTOR,
        }
    }
}

/// Pool construction parameters.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// CPU-backed instances to create.
    pub cpu_instances: u32,
    /// Accelerator-backed instances to attempt; failed devices are
    /// substituted with extra CPU instances.
    pub accelerator_instances: u32,
    /// Concurrent calls admitted per CPU instance.
    pub cpu_concurrency: usize,
    /// Concurrent calls admitted per accelerator instance.
    pub accelerator_concurrency: usize,
    /// Fraction of accelerator instances tagged
    /// [`WorkloadAffinity::Interactive`]; the rest are tagged `Batch`.
    pub interactive_share: f64,
    /// How long `acquire` may park on a saturated pool.
    pub acquire_timeout: Duration,
    pub weights: ScoreWeights,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cpu_instances: 1,
            accelerator_instances: 0,
            cpu_concurrency: 4,
            accelerator_concurrency: 2,
            interactive_share: 0.6,
            acquire_timeout: Duration::from_secs(30),
            weights: ScoreWeights::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_cpu_instances(mut self, count: u32) -> Self {
        self.cpu_instances = count;
        self
    }

    pub fn with_accelerator_instances(mut self, count: u32) -> Self {
        self.accelerator_instances = count;
        self
    }

    pub fn with_cpu_concurrency(mut self, limit: usize) -> Self {
        self.cpu_concurrency = limit;
        self
    }

    pub fn with_accelerator_concurrency(mut self, limit: usize) -> Self {
        self.accelerator_concurrency = limit;
        self
    }

    pub fn with_interactive_share(mut self, share: f64) -> Self {
        self.interactive_share = share;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }
}

/// Point-in-time view of one instance, used for scoring and diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub kind: InstanceKind,
    pub device_index: u32,
    pub affinity: WorkloadAffinity,
    pub concurrency_limit: usize,
    pub in_flight: usize,
    /// Mean of the retained response-time samples, in seconds.
    pub avg_response_secs: Option<f64>,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub last_used_at: DateTime<Utc>,
    pub memory: Option<DeviceMemory>,
}

impl InstanceSnapshot {
    /// Free admission slots right now.
    pub fn free_slots(&self) -> usize {
        self.concurrency_limit.saturating_sub(self.in_flight)
    }

    /// Successful fraction of admitted calls; `1.0` with no history so a
    /// fresh instance is not penalized.
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            1.0
        } else {
            self.successful_tasks as f64 / self.total_tasks as f64
        }
    }
}

/// Score one instance for a request with the given affinity.
///
/// Pure so the ranking is unit-testable; see [`ScoreWeights`] for the
/// formula. `max_avg_response_secs` is the largest average among the
/// candidate set and normalizes the latency factor into `[0, 1]`;
/// instances without samples take the best latency factor.
pub fn score_instance(
    snapshot: &InstanceSnapshot,
    wanted: WorkloadAffinity,
    max_avg_response_secs: f64,
    weights: &ScoreWeights,
) -> f64 {
    let capacity_factor = if snapshot.concurrency_limit == 0 {
        0.0
    } else {
        snapshot.free_slots() as f64 / snapshot.concurrency_limit as f64
    };
    let affinity_factor = if snapshot.affinity.matches(wanted) {
        1.0
    } else {
        weights.mismatch_factor
    };
    let latency_factor = match snapshot.avg_response_secs {
        Some(avg) if max_avg_response_secs > 0.0 => {
            1.0 - (avg / max_avg_response_secs).clamp(0.0, 1.0)
        }
        _ => 1.0,
    };
    let memory_factor = match snapshot.memory {
        Some(mem) => 1.0 - mem.used_fraction(),
        None => 1.0,
    };

    weights.capacity * capacity_factor
        + weights.affinity * affinity_factor
        + weights.latency * latency_factor
        + weights.success * snapshot.success_rate()
        + weights.memory * memory_factor
}

/// Admission to one instance, returned by [`InstancePool::acquire`].
///
/// Exposes the engine handle of the instance that admitted the call. Pass
/// the permit back through [`InstancePool::release`] so the outcome and
/// elapsed time feed future scoring; merely dropping it frees the slot but
/// records nothing.
pub struct InstancePermit {
    instance_id: InstanceId,
    kind: InstanceKind,
    engine: Arc<dyn TranslationEngine>,
    _permit: OwnedSemaphorePermit,
}

impl InstancePermit {
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    /// Engine handle of the admitting instance.
    pub fn engine(&self) -> Arc<dyn TranslationEngine> {
        Arc::clone(&self.engine)
    }
}

impl std::fmt::Debug for InstancePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePermit")
            .field("instance_id", &self.instance_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

struct InstanceState {
    id: InstanceId,
    kind: InstanceKind,
    device_index: u32,
    affinity: WorkloadAffinity,
    concurrency_limit: usize,
    semaphore: Arc<Semaphore>,
    engine: Arc<dyn TranslationEngine>,
    samples: VecDeque<Duration>,
    total_tasks: u64,
    successful_tasks: u64,
    last_used_at: DateTime<Utc>,
    memory: Option<DeviceMemory>,
}

impl InstanceState {
    fn new(
        id: InstanceId,
        kind: InstanceKind,
        device_index: u32,
        affinity: WorkloadAffinity,
        concurrency_limit: usize,
        engine: Arc<dyn TranslationEngine>,
    ) -> Self {
        Self {
            id,
            kind,
            device_index,
            affinity,
            concurrency_limit,
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            engine,
            samples: VecDeque::with_capacity(RESPONSE_SAMPLE_WINDOW),
            total_tasks: 0,
            successful_tasks: 0,
            last_used_at: Utc::now(),
            memory: None,
        }
    }

    // Derived from the semaphore so a dropped permit can never leak a slot.
    fn in_flight(&self) -> usize {
        self.concurrency_limit
            .saturating_sub(self.semaphore.available_permits())
    }

    fn snapshot(&self) -> InstanceSnapshot {
        let avg_response_secs = if self.samples.is_empty() {
            None
        } else {
            let total: f64 = self.samples.iter().map(|d| d.as_secs_f64()).sum();
            Some(total / self.samples.len() as f64)
        };
        InstanceSnapshot {
            id: self.id,
            kind: self.kind,
            device_index: self.device_index,
            affinity: self.affinity,
            concurrency_limit: self.concurrency_limit,
            in_flight: self.in_flight(),
            avg_response_secs,
            total_tasks: self.total_tasks,
            successful_tasks: self.successful_tasks,
            last_used_at: self.last_used_at,
            memory: self.memory,
        }
    }

    fn note_admitted(&mut self) {
        self.total_tasks += 1;
        self.last_used_at = Utc::now();
    }

    fn record_outcome(&mut self, success: bool, elapsed: Duration) {
        if self.samples.len() == RESPONSE_SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
        if success {
            self.successful_tasks += 1;
        }
    }
}

/// Pool of translation instances with per-instance admission control.
///
/// All bookkeeping lives in one instance list behind a `tokio::sync::Mutex`;
/// the lock guards selection and counters only and is never held across an
/// engine call or while parked waiting for capacity.
pub struct InstancePool {
    config: PoolConfig,
    instances: Mutex<Vec<InstanceState>>,
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InstancePool {
    /// Build the pool, creating one engine handle per instance.
    ///
    /// Accelerator devices the factory cannot open are replaced with extra
    /// CPU instances so the configured capacity survives on machines
    /// without the hardware; `acquire(Accelerator, ..)` then reports the
    /// kind as exhausted. A CPU handle failure is fatal.
    ///
    /// The first `ceil(interactive_share * n)` accelerator instances are
    /// tagged [`WorkloadAffinity::Interactive`], the rest `Batch`; CPU
    /// instances are untagged.
    pub async fn initialize(
        config: PoolConfig,
        factory: &dyn EngineFactory,
    ) -> anyhow::Result<Self> {
        let mut instances = Vec::new();
        let mut next_id = 0u32;

        let interactive_count =
            (f64::from(config.accelerator_instances) * config.interactive_share).ceil() as u32;
        let mut substituted = 0u32;

        for device_index in 0..config.accelerator_instances {
            match factory.create(InstanceKind::Accelerator, device_index).await {
                Ok(engine) => {
                    let affinity = if device_index < interactive_count {
                        WorkloadAffinity::Interactive
                    } else {
                        WorkloadAffinity::Batch
                    };
                    instances.push(InstanceState::new(
                        InstanceId(next_id),
                        InstanceKind::Accelerator,
                        device_index,
                        affinity,
                        config.accelerator_concurrency,
                        engine,
                    ));
                    next_id += 1;
                }
                Err(err) => {
                    warn!(
                        device_index,
                        error = %err,
                        "accelerator unavailable, substituting a cpu instance"
                    );
                    substituted += 1;
                }
            }
        }

        for device_index in 0..config.cpu_instances + substituted {
            let engine = factory
                .create(InstanceKind::Cpu, device_index)
                .await
                .context("cpu engine creation failed")?;
            instances.push(InstanceState::new(
                InstanceId(next_id),
                InstanceKind::Cpu,
                device_index,
                WorkloadAffinity::Any,
                config.cpu_concurrency,
                engine,
            ));
            next_id += 1;
        }

        if instances.is_empty() {
            anyhow::bail!("pool configured with zero instances");
        }

        info!(
            total = instances.len(),
            accelerators = instances
                .iter()
                .filter(|inst| inst.kind == InstanceKind::Accelerator)
                .count(),
            "instance pool initialized"
        );

        Ok(Self {
            config,
            instances: Mutex::new(instances),
        })
    }

    /// The configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Admit one call onto the best-scoring instance of `kind`.
    ///
    /// Selection prefers instances whose affinity tag matches `affinity`;
    /// when none of those has a free slot the search widens to every
    /// instance of the kind, where the mismatch shows up as a scoring
    /// penalty. Ties break on the least recently used instance. With every
    /// candidate saturated the caller parks on the best one's semaphore up
    /// to [`PoolConfig::acquire_timeout`].
    ///
    /// # Errors
    ///
    /// [`PoolError::ResourceExhausted`] when the pool holds no instance of
    /// `kind`; [`PoolError::AcquisitionTimeout`] when no slot opened
    /// within the timeout.
    pub async fn acquire(
        &self,
        kind: InstanceKind,
        affinity: WorkloadAffinity,
    ) -> Result<InstancePermit, PoolError> {
        let (wait_id, wait_kind, semaphore, engine) = {
            let mut instances = self.instances.lock().await;

            let of_kind: Vec<usize> = instances
                .iter()
                .enumerate()
                .filter(|(_, inst)| inst.kind == kind)
                .map(|(idx, _)| idx)
                .collect();
            if of_kind.is_empty() {
                return Err(PoolError::ResourceExhausted { kind });
            }

            let matching: Vec<usize> = of_kind
                .iter()
                .copied()
                .filter(|&idx| instances[idx].affinity.matches(affinity))
                .collect();
            let matching_has_slot = matching
                .iter()
                .any(|&idx| instances[idx].semaphore.available_permits() > 0);
            let candidates = if matching.is_empty() {
                debug!(kind = %kind, affinity = %affinity, "no instance tagged for affinity");
                of_kind
            } else if matching_has_slot {
                matching
            } else {
                warn!(
                    kind = %kind,
                    affinity = %affinity,
                    "affinity-matched instances saturated, widening selection"
                );
                of_kind
            };

            let snapshots: Vec<(usize, InstanceSnapshot)> = candidates
                .into_iter()
                .map(|idx| (idx, instances[idx].snapshot()))
                .collect();
            let max_avg = snapshots
                .iter()
                .filter_map(|(_, snap)| snap.avg_response_secs)
                .fold(0.0_f64, f64::max);

            let mut ranked: Vec<(usize, f64)> = snapshots
                .iter()
                .map(|(idx, snap)| {
                    (
                        *idx,
                        score_instance(snap, affinity, max_avg, &self.config.weights),
                    )
                })
                .collect();
            ranked.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| instances[a.0].last_used_at.cmp(&instances[b.0].last_used_at))
            });

            for (idx, _) in &ranked {
                let semaphore = Arc::clone(&instances[*idx].semaphore);
                if let Ok(permit) = semaphore.try_acquire_owned() {
                    let inst = &mut instances[*idx];
                    inst.note_admitted();
                    if !inst.affinity.matches(affinity) {
                        debug!(
                            instance = %inst.id,
                            affinity = %affinity,
                            "admitted on a mismatched-affinity instance"
                        );
                    }
                    return Ok(InstancePermit {
                        instance_id: inst.id,
                        kind: inst.kind,
                        engine: Arc::clone(&inst.engine),
                        _permit: permit,
                    });
                }
            }

            // Every candidate is saturated; park on the best-ranked one.
            let &(best_idx, _) = ranked
                .first()
                .ok_or(PoolError::ResourceExhausted { kind })?;
            let best = &instances[best_idx];
            (
                best.id,
                best.kind,
                Arc::clone(&best.semaphore),
                Arc::clone(&best.engine),
            )
        };

        debug!(kind = %wait_kind, instance = %wait_id, "pool saturated, waiting for a slot");
        match tokio::time::timeout(self.config.acquire_timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => {
                let mut instances = self.instances.lock().await;
                if let Some(inst) = instances.iter_mut().find(|inst| inst.id == wait_id) {
                    inst.note_admitted();
                }
                Ok(InstancePermit {
                    instance_id: wait_id,
                    kind: wait_kind,
                    engine,
                    _permit: permit,
                })
            }
            Ok(Err(_)) => Err(PoolError::ResourceExhausted { kind }),
            Err(_) => Err(PoolError::AcquisitionTimeout {
                kind,
                waited: self.config.acquire_timeout,
            }),
        }
    }

    /// Return a permit, recording the call outcome for future scoring.
    ///
    /// Appends `elapsed` to the instance's response-time window, counts
    /// `success`, and refreshes the cached device memory reading. The
    /// admission slot itself is freed when the permit drops.
    pub async fn release(&self, permit: InstancePermit, success: bool, elapsed: Duration) {
        // Memory probe runs outside the list lock.
        let memory = match permit.engine.memory_info().await {
            Ok(reading) => reading,
            Err(err) => {
                debug!(
                    instance = %permit.instance_id,
                    error = %err,
                    "memory probe failed on release"
                );
                None
            }
        };

        let mut instances = self.instances.lock().await;
        if let Some(inst) = instances
            .iter_mut()
            .find(|inst| inst.id == permit.instance_id)
        {
            inst.record_outcome(success, elapsed);
            if memory.is_some() {
                inst.memory = memory;
            }
        }
    }

    /// Current view of every instance.
    pub async fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let instances = self.instances.lock().await;
        instances.iter().map(|inst| inst.snapshot()).collect()
    }
}
