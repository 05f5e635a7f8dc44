//! End-to-end routing tests: orchestrator over a real pool, with mock
//! engines and tokenizers from the testkit.
//!
//! The mock engine echoes each token prefixed with the target tag, so
//! pivot legs leave a visible trail in the output text.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use polyglot::{
    DeviceMemory, EngineFactory, InstanceKind, InstancePool, OrchestratorConfig, PoolConfig,
    PoolError, TranslateError, TranslationEngine, TranslationOrchestrator, WorkloadAffinity,
};
use polyglot_testkit::{MockEngine, MockEngineFactory, StaticTokenizers};
use tokio::time::timeout;

async fn build_orchestrator(
    factory: &MockEngineFactory,
    config: PoolConfig,
) -> TranslationOrchestrator {
    let pool = Arc::new(InstancePool::initialize(config, factory).await.unwrap());
    TranslationOrchestrator::new(
        pool,
        Arc::new(StaticTokenizers::new()),
        OrchestratorConfig::default(),
    )
}

fn accelerator_engine(factory: &MockEngineFactory, device_index: u32) -> MockEngine {
    factory
        .engines()
        .into_iter()
        .find(|(kind, index, _)| *kind == InstanceKind::Accelerator && *index == device_index)
        .map(|(_, _, engine)| engine)
        .expect("accelerator engine was created")
}

#[tokio::test]
async fn direct_translation_prefixes_tokens_with_the_target_tag() {
    let factory = MockEngineFactory::new();
    let config = PoolConfig::default()
        .with_cpu_instances(1)
        .with_accelerator_instances(1);
    let orchestrator = build_orchestrator(&factory, config).await;

    let out = orchestrator
        .translate_one("hello world", "en", "zh", WorkloadAffinity::Interactive, false)
        .await
        .unwrap();
    assert_eq!(out, "zho_Hans:hello zho_Hans:world");

    let engine = accelerator_engine(&factory, 0);
    let calls = engine.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].target_tag, "zho_Hans");
    assert_eq!(calls[0].batch_len, 1);
}

#[tokio::test]
async fn pivot_translation_chains_both_legs() {
    let factory = MockEngineFactory::new();
    let config = PoolConfig::default()
        .with_cpu_instances(1)
        .with_accelerator_instances(1);
    let orchestrator = build_orchestrator(&factory, config).await;

    let out = orchestrator
        .translate_one("sain baina uu", "mn", "zh", WorkloadAffinity::Batch, true)
        .await
        .unwrap();
    assert_eq!(
        out,
        "zho_Hans:eng_Latn:sain zho_Hans:eng_Latn:baina zho_Hans:eng_Latn:uu"
    );

    // Both legs land on the sole accelerator, in pivot order.
    let engine = accelerator_engine(&factory, 0);
    let targets: Vec<String> = engine.calls().into_iter().map(|c| c.target_tag).collect();
    assert_eq!(targets, ["eng_Latn", "zho_Hans"]);
}

#[tokio::test]
async fn batch_outputs_keep_their_input_order() {
    let factory = MockEngineFactory::new();
    let config = PoolConfig::default()
        .with_cpu_instances(0)
        .with_accelerator_instances(1);
    let orchestrator = build_orchestrator(&factory, config).await;

    let texts = vec![
        "one two".to_string(),
        "three".to_string(),
        "four five six".to_string(),
    ];
    let out = orchestrator
        .translate_batch(&texts, "en", "zh", WorkloadAffinity::Batch, false)
        .await
        .unwrap();
    assert_eq!(
        out,
        [
            "zho_Hans:one zho_Hans:two",
            "zho_Hans:three",
            "zho_Hans:four zho_Hans:five zho_Hans:six"
        ]
    );

    let engine = accelerator_engine(&factory, 0);
    let calls = engine.calls();
    assert_eq!(calls.len(), 1, "a batch is one engine call");
    assert_eq!(calls[0].batch_len, 3);
}

#[tokio::test]
async fn accelerator_instances_are_preferred_over_cpu() {
    let factory = MockEngineFactory::new();
    let config = PoolConfig::default()
        .with_cpu_instances(1)
        .with_accelerator_instances(1);
    let orchestrator = build_orchestrator(&factory, config).await;

    for _ in 0..3 {
        orchestrator
            .translate_one("hello", "en", "zh", WorkloadAffinity::Interactive, false)
            .await
            .unwrap();
    }

    for (kind, _, engine) in factory.engines() {
        match kind {
            InstanceKind::Accelerator => assert_eq!(engine.call_count(), 3),
            InstanceKind::Cpu => assert_eq!(engine.call_count(), 0),
        }
    }
}

#[tokio::test]
async fn workload_classes_land_on_their_tagged_instances() {
    let factory = MockEngineFactory::new();
    // Two accelerators at a 0.5 share: device 0 interactive, device 1 batch.
    let config = PoolConfig::default()
        .with_cpu_instances(0)
        .with_accelerator_instances(2)
        .with_interactive_share(0.5);
    let orchestrator = build_orchestrator(&factory, config).await;

    orchestrator
        .translate_one("hi", "en", "zh", WorkloadAffinity::Interactive, false)
        .await
        .unwrap();
    orchestrator
        .translate_one("bulk", "en", "zh", WorkloadAffinity::Batch, false)
        .await
        .unwrap();

    assert_eq!(accelerator_engine(&factory, 0).call_count(), 1);
    assert_eq!(accelerator_engine(&factory, 1).call_count(), 1);
}

#[tokio::test]
async fn missing_accelerators_are_substituted_and_cpu_serves_the_calls() {
    let factory = MockEngineFactory::new()
        .without_accelerator(0)
        .without_accelerator(1);
    let config = PoolConfig::default()
        .with_cpu_instances(1)
        .with_accelerator_instances(2);
    let orchestrator = build_orchestrator(&factory, config).await;

    let snaps = orchestrator.pool().snapshot().await;
    assert_eq!(snaps.len(), 3, "two substitutes plus the configured cpu");
    assert!(snaps.iter().all(|snap| snap.kind == InstanceKind::Cpu));

    let out = orchestrator
        .translate_one("hello", "en", "zh", WorkloadAffinity::Interactive, false)
        .await
        .unwrap();
    assert_eq!(out, "zho_Hans:hello");

    let err = orchestrator
        .pool()
        .acquire(InstanceKind::Accelerator, WorkloadAffinity::Any)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ResourceExhausted { .. }));
}

#[tokio::test]
async fn engine_failure_surfaces_and_the_pool_recovers() {
    let factory = MockEngineFactory::new();
    let config = PoolConfig::default()
        .with_cpu_instances(0)
        .with_accelerator_instances(1);
    let orchestrator = build_orchestrator(&factory, config).await;
    let engine = accelerator_engine(&factory, 0);

    engine.set_failure(Some("device reset"));
    let err = orchestrator
        .translate_one("hello", "en", "zh", WorkloadAffinity::Batch, false)
        .await
        .unwrap_err();
    assert!(matches!(err, TranslateError::Engine(_)));

    engine.set_failure(None);
    let out = orchestrator
        .translate_one("hello", "en", "zh", WorkloadAffinity::Batch, false)
        .await
        .unwrap();
    assert_eq!(out, "zho_Hans:hello");

    let snaps = orchestrator.pool().snapshot().await;
    assert_eq!(snaps[0].total_tasks, 2);
    assert_eq!(snaps[0].successful_tasks, 1);
    assert_eq!(snaps[0].in_flight, 0);
}

#[tokio::test]
async fn saturated_accelerators_time_out_instead_of_spilling_to_cpu() {
    let factory = MockEngineFactory::new();
    let config = PoolConfig::default()
        .with_cpu_instances(1)
        .with_accelerator_instances(1)
        .with_accelerator_concurrency(1)
        .with_acquire_timeout(Duration::from_millis(50));
    let orchestrator = build_orchestrator(&factory, config).await;

    let held = orchestrator
        .pool()
        .acquire(InstanceKind::Accelerator, WorkloadAffinity::Any)
        .await
        .unwrap();

    let err = orchestrator
        .translate_one("hello", "en", "zh", WorkloadAffinity::Interactive, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TranslateError::Pool(PoolError::AcquisitionTimeout { .. })
    ));
    for (kind, _, engine) in factory.engines() {
        if kind == InstanceKind::Cpu {
            assert_eq!(engine.call_count(), 0, "saturation must not shift to cpu");
        }
    }

    drop(held);
    orchestrator
        .translate_one("hello", "en", "zh", WorkloadAffinity::Interactive, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_language_codes_pass_through_to_the_engine() {
    let factory = MockEngineFactory::new();
    let config = PoolConfig::default()
        .with_cpu_instances(0)
        .with_accelerator_instances(1);
    let orchestrator = build_orchestrator(&factory, config).await;

    let out = orchestrator
        .translate_one("hei verden", "nor_Latn", "en", WorkloadAffinity::Batch, false)
        .await
        .unwrap();
    assert_eq!(out, "eng_Latn:hei eng_Latn:verden");

    orchestrator
        .translate_one("hello", "en", "nor_Latn", WorkloadAffinity::Batch, false)
        .await
        .unwrap();
    let engine = accelerator_engine(&factory, 0);
    assert_eq!(engine.calls()[1].target_tag, "nor_Latn");
}

/// Echo engine that tracks how many calls run at once.
struct CountingEngine {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl TranslationEngine for CountingEngine {
    async fn translate(
        &self,
        batch: Vec<Vec<String>>,
        _target_tag: &str,
    ) -> anyhow::Result<Vec<Vec<String>>> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(batch)
    }

    async fn memory_info(&self) -> anyhow::Result<Option<DeviceMemory>> {
        Ok(None)
    }
}

struct CountingFactory {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl EngineFactory for CountingFactory {
    async fn create(
        &self,
        _kind: InstanceKind,
        _device_index: u32,
    ) -> anyhow::Result<Arc<dyn TranslationEngine>> {
        Ok(Arc::new(CountingEngine {
            active: Arc::clone(&self.active),
            peak: Arc::clone(&self.peak),
        }))
    }
}

#[tokio::test]
async fn concurrent_calls_respect_the_instance_concurrency_limit() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let factory = CountingFactory {
        active: Arc::clone(&active),
        peak: Arc::clone(&peak),
    };
    let config = PoolConfig::default()
        .with_cpu_instances(0)
        .with_accelerator_instances(1)
        .with_accelerator_concurrency(2);
    let pool = Arc::new(InstancePool::initialize(config, &factory).await.unwrap());
    let orchestrator = Arc::new(TranslationOrchestrator::new(
        pool,
        Arc::new(StaticTokenizers::new()),
        OrchestratorConfig::default(),
    ));

    let wait = timeout(Duration::from_secs(10), async {
        let mut handles = Vec::new();
        for idx in 0..6 {
            let orchestrator = Arc::clone(&orchestrator);
            handles.push(tokio::spawn(async move {
                orchestrator
                    .translate_one(
                        &format!("text {idx}"),
                        "en",
                        "zh",
                        WorkloadAffinity::Batch,
                        false,
                    )
                    .await
            }));
        }
        for result in join_all(handles).await {
            result.unwrap().unwrap();
        }
    })
    .await;
    assert!(wait.is_ok(), "timed out waiting for concurrent translations");

    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "admission exceeded the per-instance limit: {}",
        peak.load(Ordering::SeqCst)
    );
    assert_eq!(active.load(Ordering::SeqCst), 0);
}
